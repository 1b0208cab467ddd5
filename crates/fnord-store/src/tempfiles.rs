// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Process-lifetime temp files and per-file versioned backups.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use tempfile::NamedTempFile;

/// Registry of temp files that live as long as the process.
///
/// Files created here stay on disk until the registry is dropped (normally
/// at process exit), so paths can be handed to tools and subprocesses
/// without lifetime coordination.
#[derive(Default)]
pub struct TempRegistry {
    files: Mutex<Vec<NamedTempFile>>,
}

impl TempRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty temp file and return its path.
    pub fn create(&self, prefix: &str) -> anyhow::Result<PathBuf> {
        let file = tempfile::Builder::new()
            .prefix(prefix)
            .tempfile()
            .context("creating temp file")?;
        let path = file.path().to_path_buf();
        self.files.lock().expect("temp registry poisoned").push(file);
        Ok(path)
    }

    pub fn count(&self) -> usize {
        self.files.lock().expect("temp registry poisoned").len()
    }
}

/// Take a versioned backup of `path` before an edit.
///
/// Backups are written next to the original as `<name>.bak.<n>` with `n`
/// increasing monotonically; existing backups are never overwritten.
/// Returns the backup path, or `None` when the original does not exist yet.
pub fn backup(path: &Path) -> anyhow::Result<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .context("backup target has no file name")?;
    let mut n = 1u32;
    let backup_path = loop {
        let candidate = path.with_file_name(format!("{name}.bak.{n}"));
        if !candidate.exists() {
            break candidate;
        }
        n += 1;
    };
    std::fs::copy(path, &backup_path)
        .with_context(|| format!("backing up {}", path.display()))?;
    Ok(Some(backup_path))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_files_survive_while_registry_lives() {
        let reg = TempRegistry::new();
        let path = reg.create("fnord-test-").unwrap();
        assert!(path.exists());
        assert_eq!(reg.count(), 1);
    }

    #[test]
    fn files_are_removed_when_registry_drops() {
        let reg = TempRegistry::new();
        let path = reg.create("fnord-test-").unwrap();
        drop(reg);
        assert!(!path.exists());
    }

    #[test]
    fn backup_of_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(backup(&dir.path().join("nope.txt")).unwrap().is_none());
    }

    #[test]
    fn backups_version_monotonically() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("file.txt");
        std::fs::write(&target, "v1").unwrap();

        let b1 = backup(&target).unwrap().unwrap();
        assert!(b1.to_string_lossy().ends_with("file.txt.bak.1"));

        std::fs::write(&target, "v2").unwrap();
        let b2 = backup(&target).unwrap().unwrap();
        assert!(b2.to_string_lossy().ends_with("file.txt.bak.2"));

        assert_eq!(std::fs::read_to_string(&b1).unwrap(), "v1");
        assert_eq!(std::fs::read_to_string(&b2).unwrap(), "v2");
    }
}
