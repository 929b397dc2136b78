//! `debug download`: a gzipped tarball of the working tree.
//!
//! Dot files (secrets, VCS metadata, the restart marker), virtual envs,
//! bytecode caches and build output never leave the host.

use anyhow::Context;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::{KernelError, Result};

const EXCLUDED_NAMES: &[&str] = &["venv", "__pycache__", "target"];

/// Path-component filter applied to every entry.
#[derive(Clone, Debug)]
pub struct ArchiveFilter {
    excluded: Vec<String>,
}

impl ArchiveFilter {
    /// Default exclusions plus the secrets file name.
    pub fn new(secrets_file: &str) -> Self {
        let mut excluded: Vec<String> = EXCLUDED_NAMES.iter().map(|s| s.to_string()).collect();
        excluded.push(secrets_file.to_string());
        Self { excluded }
    }

    pub fn excludes(&self, relative: &Path) -> bool {
        relative.components().any(|component| {
            let name = component.as_os_str().to_string_lossy();
            name.starts_with('.') || self.excluded.iter().any(|e| *e == name)
        })
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ArchiveSummary {
    pub path: PathBuf,
    pub files: usize,
    pub bytes: u64,
}

/// Write `<root>` as a `.tar.gz` at `dest`, entries relative to `root`.
pub fn write_snapshot(root: &Path, dest: &Path, filter: &ArchiveFilter) -> Result<ArchiveSummary> {
    let file = File::create(dest)
        .with_context(|| format!("failed to create archive {}", dest.display()))
        .map_err(KernelError::Storage)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.follow_symlinks(false);

    let dest_abs = dest.canonicalize().unwrap_or_else(|_| dest.to_path_buf());
    let mut files = 0usize;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = std::fs::read_dir(&dir)?.collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let path = entry.path();
            let relative = path
                .strip_prefix(root)
                .map_err(|e| KernelError::Storage(e.into()))?;
            if filter.excludes(relative) || path == dest_abs || path == dest {
                continue;
            }
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                builder.append_dir(relative, &path)?;
                pending.push(path);
            } else if file_type.is_file() || file_type.is_symlink() {
                builder.append_path_with_name(&path, relative)?;
                files += 1;
            }
        }
    }

    let encoder = builder.into_inner()?;
    encoder.finish()?.sync_all()?;
    let bytes = std::fs::metadata(dest)?.len();
    log::info!(
        "wrote {} ({} files, {} bytes) from {}",
        dest.display(),
        files,
        bytes,
        root.display()
    );
    Ok(ArchiveSummary {
        path: dest.to_path_buf(),
        files,
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    fn entry_names(archive: &Path) -> Vec<String> {
        let mut tar = tar::Archive::new(GzDecoder::new(File::open(archive).unwrap()));
        let mut names: Vec<String> = tar
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .map(|n| n.trim_end_matches('/').to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn snapshot_skips_secrets_and_runtime_files() {
        let work = tempfile::tempdir().unwrap();
        let root = work.path();
        std::fs::write(root.join("main.py"), "print('hi')").unwrap();
        std::fs::write(root.join(".env"), "BOT_TOKEN=t").unwrap();
        std::fs::write(root.join("bot.env"), "BOT_TOKEN=t").unwrap();
        std::fs::create_dir_all(root.join(".git/objects")).unwrap();
        std::fs::create_dir_all(root.join("venv/bin")).unwrap();
        std::fs::write(root.join("venv/bin/python"), "").unwrap();
        std::fs::create_dir_all(root.join("extensions/mod/__pycache__")).unwrap();
        std::fs::write(root.join("extensions/mod/main.py"), "").unwrap();
        std::fs::write(root.join("extensions/mod/__pycache__/main.pyc"), "").unwrap();

        let out = tempfile::tempdir().unwrap();
        let dest = out.path().join("snapshot.tar.gz");
        let summary = write_snapshot(root, &dest, &ArchiveFilter::new("bot.env")).unwrap();
        assert_eq!(summary.files, 2);
        assert_eq!(
            entry_names(&dest),
            vec!["extensions", "extensions/mod", "extensions/mod/main.py", "main.py"]
        );
    }

    #[test]
    fn filter_matches_any_component() {
        let filter = ArchiveFilter::new(".env");
        assert!(filter.excludes(Path::new("a/.hidden/b")));
        assert!(filter.excludes(Path::new("target/debug")));
        assert!(!filter.excludes(Path::new("src/targets.py")));
    }
}
