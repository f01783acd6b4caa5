//! File Dumper (C6, spec §4.6): snapshots declared or detected persistent
//! paths from a container into a per-path compressed file under a
//! scratch directory, for C4 to assemble.

use crate::errors::OrchestratorError;
use crate::runtime::{ContainerRuntime, MountType};
use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use glob::Pattern;
use std::io::Read as _;
use std::path::{Path, PathBuf};

/// Paths that are never backed up regardless of configuration (spec §4.6).
const SYSTEM_PATHS: &[&str] = &[
    "/proc",
    "/sys",
    "/dev",
    "/run",
    "/var/run",
    "/var/lock",
    "/tmp",
    "/var/tmp",
    "/var/cache",
    "/etc/hostname",
    "/etc/hosts",
    "/etc/resolv.conf",
];

/// Common persistent-data locations probed when no explicit paths are
/// configured (spec §4.6).
const COMMON_PATHS: &[&str] = &[
    "/data",
    "/config",
    "/app/data",
    "/var/lib/mysql",
    "/var/lib/postgresql/data",
    "/var/www",
    "/app/config",
    "/home/appuser/data",
    "/opt/app/data",
];

pub fn is_system_path(path: &str) -> bool {
    SYSTEM_PATHS.iter().any(|system| path == *system || path.starts_with(&format!("{system}/")))
}

fn is_host_excluded(path: &str, host_exclusions: &[String]) -> bool {
    host_exclusions.iter().any(|excluded| path.contains(excluded.as_str()))
}

/// Detects the paths to back up when none are explicitly configured: the
/// common-paths list intersected with what the container actually has
/// mounted, plus every non-system mount destination.
pub fn detect_paths(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    mounts: &[crate::runtime::Mount],
    host_exclusions: &[String],
) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();

    for candidate in COMMON_PATHS {
        if is_host_excluded(candidate, host_exclusions) {
            continue;
        }
        let check = runtime.exec(container_id, &["test", "-e", candidate], &Default::default(), std::time::Duration::from_secs(10));
        if matches!(check, Ok(result) if result.exit_code == 0) {
            paths.push(candidate.to_string());
        }
    }

    for mount in mounts {
        if is_system_path(&mount.destination) || is_host_excluded(&mount.destination, host_exclusions) {
            continue;
        }
        paths.push(mount.destination.clone());
    }

    paths.sort();
    paths.dedup();
    paths
}

/// Snapshots `paths` from `container_id` into one
/// `scratch_dir/files/<container>.tar.gz`, tarring+gzipping in-process as it
/// goes (spec §4.6, end-to-end scenario 2). Reads bind-mount sources
/// directly from the host side; everything else is pulled via
/// `stream_archive` and re-packed under the path's sanitized name. Publishes
/// atomically via a `.tmp` file, matching the Archive Builder's pattern.
pub fn backup_paths(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    container_name: &str,
    paths: &[String],
    exclusions: &[String],
    mounts: &[crate::runtime::Mount],
    scratch_dir: &Path,
) -> Result<PathBuf> {
    let files_dir = scratch_dir.join("files");
    std::fs::create_dir_all(&files_dir).context("failed to create file-dump scratch directory")?;
    let out_path = files_dir.join(format!("{}.tar.gz", sanitize_name(container_name)));
    let tmp_path = tmp_path_for(&out_path);

    let result = write_archive(runtime, container_id, container_name, paths, exclusions, mounts, &tmp_path);
    match result {
        Ok(()) => {
            std::fs::rename(&tmp_path, &out_path).context("failed to publish file dump archive")?;
            Ok(out_path)
        }
        Err(e) => {
            let _ = std::fs::remove_file(&tmp_path);
            Err(OrchestratorError::ArchiveWriteError(e.to_string()).into())
        }
    }
}

fn write_archive(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    container_name: &str,
    paths: &[String],
    exclusions: &[String],
    mounts: &[crate::runtime::Mount],
    tmp_path: &Path,
) -> Result<()> {
    let exclusion_patterns: Vec<Pattern> = exclusions.iter().filter_map(|p| Pattern::new(p).ok()).collect();

    let file = std::fs::File::create(tmp_path).context("failed to create temp file-dump archive")?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for path in paths {
        if exclusion_patterns.iter().any(|pattern| pattern.matches(path)) {
            continue;
        }

        let prefix = PathBuf::from(sanitize_name(path));
        let bind_source = mounts
            .iter()
            .find(|m| m.destination == *path && matches!(m.mount_type, MountType::Bind))
            .map(|m| m.source.clone());

        match bind_source {
            Some(host_path) => {
                append_host_dir(&mut builder, Path::new(&host_path), &prefix)?;
            }
            None => match runtime.stream_archive(container_id, path) {
                Ok(bytes) => append_streamed_tar(&mut builder, &bytes, &prefix)?,
                Err(e) => tracing::warn!("skipping path {path} on {container_name}: {e}"),
            },
        }
    }

    let encoder = builder.into_inner().context("failed to finalize file-dump tar stream")?;
    encoder.finish().context("failed to finalize file-dump gzip stream")?;
    Ok(())
}

/// Appends a `docker cp`-style tar stream's entries into `builder`, rooted
/// under `prefix` so multiple paths don't collide in the combined archive.
fn append_streamed_tar<W: std::io::Write>(builder: &mut tar::Builder<W>, bytes: &[u8], prefix: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(bytes);
    for entry in archive.entries().context("failed to read streamed archive")? {
        let mut entry = entry.context("failed to read streamed archive entry")?;
        let entry_path = entry.path().context("invalid path in streamed archive")?.into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).context("failed to read streamed archive entry contents")?;
        let mut header = entry.header().clone();
        builder
            .append_data(&mut header, prefix.join(&entry_path), data.as_slice())
            .with_context(|| format!("failed to append {entry_path:?} to file dump archive"))?;
    }
    Ok(())
}

fn append_host_dir<W: std::io::Write>(builder: &mut tar::Builder<W>, source: &Path, prefix: &Path) -> Result<()> {
    if !source.exists() {
        tracing::warn!("bind-mount source {source:?} not visible from host, skipping");
        return Ok(());
    }
    if source.is_dir() {
        builder
            .append_dir_all(prefix, source)
            .with_context(|| format!("failed to append {source:?} to file dump archive"))
    } else {
        let file_name = source.file_name().unwrap_or_default();
        builder
            .append_path_with_name(source, prefix.join(file_name))
            .with_context(|| format!("failed to append {source:?} to file dump archive"))
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

fn sanitize_name(raw: &str) -> String {
    raw.trim_start_matches('/').replace('/', "_")
}
