//! Archive Builder (C4, spec §4.4): streams a tar+gzip archive of a
//! directory to a temp file, then renames it into place atomically.

use crate::errors::OrchestratorError;
use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use glob::Pattern;
use std::fs::File;
use std::path::{Path, PathBuf};

const LARGE_INPUT_THRESHOLD_BYTES: u64 = 100 * 1024 * 1024;

fn total_size(dir: &Path) -> u64 {
    let mut total = 0u64;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if let Ok(meta) = entry.metadata() {
                if meta.is_dir() {
                    stack.push(path);
                } else {
                    total += meta.len();
                }
            }
        }
    }
    total
}

fn matches_any_exclusion(relative: &Path, exclusions: &[Pattern]) -> bool {
    let as_str = relative.to_string_lossy();
    exclusions.iter().any(|pattern| pattern.matches(&as_str) || pattern.matches_path(relative))
}

fn compile_exclusions(exclusions: &[String]) -> Vec<Pattern> {
    exclusions.iter().filter_map(|pattern| Pattern::new(pattern).ok()).collect()
}

/// Walks `src_dir`, tars+gzips everything not matching `exclusions`
/// (globs, relative or absolute), and atomically publishes the result at
/// `out_path`. Compression level trades CPU for I/O on large inputs: level
/// 1 above 100 MiB, else level 6 (spec §4.4).
pub fn create_archive(src_dir: &Path, out_path: &Path, exclusions: &[String]) -> Result<()> {
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create archive output directory")?;
    }

    let tmp_path = path_with_suffix(out_path, ".tmp");
    let result = write_archive(src_dir, &tmp_path, exclusions);

    match result {
        Ok(()) => {
            std::fs::rename(&tmp_path, out_path)
                .with_context(|| format!("failed to publish archive at {out_path:?}"))?;
            Ok(())
        }
        Err(e) => {
            let _ = std::fs::remove_file(&tmp_path);
            Err(OrchestratorError::ArchiveWriteError(e.to_string()).into())
        }
    }
}

fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn write_archive(src_dir: &Path, tmp_path: &Path, exclusions: &[String]) -> Result<()> {
    let size = total_size(src_dir);
    let level = if size > LARGE_INPUT_THRESHOLD_BYTES { 1 } else { 6 };
    let compiled_exclusions = compile_exclusions(exclusions);

    let file = File::create(tmp_path).context("failed to create temp archive file")?;
    let encoder = GzEncoder::new(file, Compression::new(level));
    let mut builder = tar::Builder::new(encoder);

    add_dir_recursive(&mut builder, src_dir, src_dir, &compiled_exclusions)?;

    let encoder = builder.into_inner().context("failed to finalize tar stream")?;
    encoder.finish().context("failed to finalize gzip stream")?;
    Ok(())
}

fn add_dir_recursive<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    root: &Path,
    current: &Path,
    exclusions: &[Pattern],
) -> Result<()> {
    let entries = std::fs::read_dir(current).with_context(|| format!("failed to read {current:?}"))?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(&path);

        if matches_any_exclusion(relative, exclusions) {
            continue;
        }

        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            add_dir_recursive(builder, root, &path, exclusions)?;
        } else if metadata.is_file() {
            builder
                .append_path_with_name(&path, relative)
                .with_context(|| format!("failed to add {path:?} to archive"))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_archive_with_relative_filenames() {
        let src = tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), b"hello").unwrap();
        std::fs::create_dir(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("sub/b.txt"), b"world").unwrap();

        let out_dir = tempdir().unwrap();
        let out_path = out_dir.path().join("archive.tar.gz");

        create_archive(src.path(), &out_path, &[]).unwrap();
        assert!(out_path.exists());
        assert!(!path_with_suffix(&out_path, ".tmp").exists());

        let file = File::open(&out_path).unwrap();
        let decoder = flate2::read::GzDecoder::new(file);
        let mut archive = tar::Archive::new(decoder);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.contains(&"a.txt".to_string()));
        assert!(names.contains(&"sub/b.txt".to_string()));
    }

    #[test]
    fn excludes_matching_globs() {
        let src = tempdir().unwrap();
        std::fs::write(src.path().join("keep.txt"), b"keep").unwrap();
        std::fs::write(src.path().join("drop.log"), b"drop").unwrap();

        let out_path = src.path().join("out.tar.gz");
        create_archive(src.path(), &out_path, &["*.log".to_string()]).unwrap();

        let file = File::open(&out_path).unwrap();
        let decoder = flate2::read::GzDecoder::new(file);
        let mut archive = tar::Archive::new(decoder);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.contains(&"keep.txt".to_string()));
        assert!(!names.iter().any(|n| n.ends_with(".log")));
    }

    #[test]
    fn no_tmp_file_left_behind_on_failure() {
        let missing_src = Path::new("/nonexistent/source/path");
        let out_dir = tempdir().unwrap();
        let out_path = out_dir.path().join("archive.tar.gz");

        let result = create_archive(missing_src, &out_path, &[]);
        assert!(result.is_err());
        assert!(!path_with_suffix(&out_path, ".tmp").exists());
    }
}
