//! Registry Adapter (C2, spec §4.2): stack listing + env resolution for the
//! external stack-registry service (e.g. Portainer), with retries and a
//! TTL cache.

pub mod portainer;

use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

/// The capability the core consumes to resolve stack env for credential
/// extraction. Implementations must be internally thread-safe: the backup
/// manager calls this concurrently from worker threads.
pub trait StackRegistry: Send + Sync {
    /// `{name -> id}`. Never fails with "not found" -- an empty map is a
    /// valid (if surprising) answer; only connectivity failures propagate.
    fn list_stacks(&self) -> Result<HashMap<String, String>>;

    /// Resolved environment variables for `stack_name`. Returns `Ok(None)`
    /// for a stack that doesn't exist -- spec §4.2: "never raises for a
    /// missing stack".
    fn get_stack_env(&self, stack_name: &str) -> Result<Option<HashMap<String, String>>>;
}

/// One raw env entry as it can appear in a stack's definition: either a
/// `"K=V"` string or a `{name, value}` object (spec §4.2).
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(untagged)]
pub enum RawEnvEntry {
    Pair(String),
    Object { name: String, value: String },
}

/// Parses a list of raw env entries into a `K -> V` map, then resolves
/// `${K}`/`$K` references up to 3 passes (spec §4.2). A reference that still
/// can't be resolved is left as-is.
pub fn resolve_stack_env(entries: &[RawEnvEntry]) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for entry in entries {
        match entry {
            RawEnvEntry::Pair(pair) => {
                if let Some((k, v)) = pair.split_once('=') {
                    env.insert(k.to_string(), v.to_string());
                }
            }
            RawEnvEntry::Object { name, value } => {
                env.insert(name.clone(), value.clone());
            }
        }
    }

    for _ in 0..3 {
        let mut changed = false;
        let snapshot = env.clone();
        for (_, value) in env.iter_mut() {
            let resolved = substitute_references(value, &snapshot);
            if &resolved != value {
                *value = resolved;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    env
}

/// Replaces every `${VAR}` or `$VAR` occurrence in `value` using `env`;
/// unresolved references are left untouched.
fn substitute_references(value: &str, env: &HashMap<String, String>) -> String {
    static BRACED: OnceLock<regex::Regex> = OnceLock::new();
    static BARE: OnceLock<regex::Regex> = OnceLock::new();
    let braced = BRACED.get_or_init(|| regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());
    let bare = BARE.get_or_init(|| regex::Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)").unwrap());

    let after_braced = braced.replace_all(value, |caps: &regex::Captures| {
        env.get(&caps[1]).cloned().unwrap_or_else(|| caps[0].to_string())
    });
    let after_bare = bare.replace_all(&after_braced, |caps: &regex::Captures| {
        env.get(&caps[1]).cloned().unwrap_or_else(|| caps[0].to_string())
    });
    after_bare.into_owned()
}

struct CacheEntry<T> {
    value: T,
    fetched_at: Instant,
}

/// A single-writer/multiple-reader TTL cache wrapping any fallible fetch
/// (spec §4.2, §5: "registry cache must be concurrency-safe"). Stale
/// entries are permitted to be returned while a refresh happens only on
/// next access, never eagerly.
pub struct TtlCache<T: Clone> {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry<T>>>,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: Mutex::new(HashMap::new()) }
    }

    pub fn get_or_fetch<F>(&self, key: &str, fetch: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        {
            let entries = self.entries.lock().unwrap();
            if let Some(entry) = entries.get(key) {
                if entry.fetched_at.elapsed() < self.ttl {
                    return Ok(entry.value.clone());
                }
            }
        }

        let value = fetch()?;
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key.to_string(), CacheEntry { value: value.clone(), fetched_at: Instant::now() });
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_braced_and_bare_references() {
        let entries = vec![
            RawEnvEntry::Pair("HOST=db.internal".to_string()),
            RawEnvEntry::Pair("URL=postgres://${HOST}/app".to_string()),
            RawEnvEntry::Pair("ALIAS=$HOST".to_string()),
        ];
        let env = resolve_stack_env(&entries);
        assert_eq!(env.get("URL").unwrap(), "postgres://db.internal/app");
        assert_eq!(env.get("ALIAS").unwrap(), "db.internal");
    }

    #[test]
    fn unresolvable_reference_left_as_is() {
        let entries = vec![RawEnvEntry::Pair("URL=postgres://${MISSING}/app".to_string())];
        let env = resolve_stack_env(&entries);
        assert_eq!(env.get("URL").unwrap(), "postgres://${MISSING}/app");
    }

    #[test]
    fn resolution_is_idempotent_fixpoint() {
        let entries = vec![
            RawEnvEntry::Pair("A=1".to_string()),
            RawEnvEntry::Pair("B=$A".to_string()),
            RawEnvEntry::Pair("C=$B".to_string()),
        ];
        let once = resolve_stack_env(&entries);
        let as_entries: Vec<RawEnvEntry> =
            once.iter().map(|(k, v)| RawEnvEntry::Pair(format!("{k}={v}"))).collect();
        let twice = resolve_stack_env(&as_entries);
        assert_eq!(once.get("C"), twice.get("C"));
    }

    #[test]
    fn object_shaped_entries_are_supported() {
        let entries = vec![RawEnvEntry::Object { name: "FOO".to_string(), value: "bar".to_string() }];
        let env = resolve_stack_env(&entries);
        assert_eq!(env.get("FOO").unwrap(), "bar");
    }

    #[test]
    fn cache_serves_fresh_within_ttl() {
        let cache = TtlCache::new(Duration::from_secs(60));
        let calls = std::sync::atomic::AtomicUsize::new(0);
        for _ in 0..3 {
            let _ = cache.get_or_fetch("k", || {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(42)
            });
        }
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
