// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Advisory file locking tied to a path.
//!
//! Every writer that read-modify-writes a shared document (conversations,
//! project notes) takes this lock first; readers that re-read to avoid torn
//! views take it too.  One locking style per file, flock-style everywhere.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::Context;
use fs4::fs_std::FileExt;

/// An exclusive advisory lock on `<path>.lock`, released on drop.
pub struct PathLock {
    file: File,
}

impl PathLock {
    /// Block until the exclusive lock for `path` is held.
    pub fn acquire(path: &Path) -> anyhow::Result<Self> {
        let lock_path = lock_path_for(path);
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("opening {}", lock_path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("locking {}", lock_path.display()))?;
        Ok(Self { file })
    }
}

impl Drop for PathLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".into());
    name.push_str(".lock");
    path.with_file_name(name)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
