// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Persistent settings stores (project and global scope).
//!
//! Each store is one JSON document.  Persisted approvals live here as
//! `{tag → [subject]}` maps and are flattened into `(tag, subject)` pairs on
//! read.  Writes are atomic (tmp + rename) and serialized under an advisory
//! lock on a sibling `.lock` file so concurrent fnord processes sharing an
//! installation never interleave partial updates.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::Context;
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Approved `(tag, subject)` pairs, keyed by tag.
    #[serde(default)]
    pub approvals: HashMap<String, Vec<String>>,
    /// Free-form settings not modelled by a typed field.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Settings {
    /// Flatten the approvals map into an exact-membership set.
    pub fn approved_pairs(&self) -> HashSet<(String, String)> {
        self.approvals
            .iter()
            .flat_map(|(tag, subjects)| {
                subjects
                    .iter()
                    .map(move |s| (tag.clone(), s.clone()))
            })
            .collect()
    }

    pub fn is_approved(&self, tag: &str, subject: &str) -> bool {
        self.approvals
            .get(tag)
            .map(|subjects| subjects.iter().any(|s| s == subject))
            .unwrap_or(false)
    }

    /// Record an approval; duplicates are ignored.
    pub fn add_approval(&mut self, tag: &str, subject: &str) {
        let subjects = self.approvals.entry(tag.to_string()).or_default();
        if !subjects.iter().any(|s| s == subject) {
            subjects.push(subject.to_string());
        }
    }
}

/// One settings document on disk.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    /// The per-installation global store (`~/.config/fnord/settings.json`).
    pub fn global() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("cannot resolve home directory")?;
        Ok(Self {
            path: home.join(".config/fnord/settings.json"),
        })
    }

    /// The per-project store (`<root>/.fnord/settings.json`).
    pub fn project(root: &Path) -> Self {
        Self {
            path: root.join(".fnord/settings.json"),
        }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the settings under a shared lock.  A missing file is an empty
    /// settings document, not an error.
    pub fn load(&self) -> anyhow::Result<Settings> {
        if !self.path.exists() {
            return Ok(Settings::default());
        }
        let _lock = LockGuard::shared(&self.lock_path())?;
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        let settings = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(settings)
    }

    /// Read-modify-write under an exclusive lock, replacing the file
    /// atomically.  Returns the updated settings.
    pub fn update(&self, f: impl FnOnce(&mut Settings)) -> anyhow::Result<Settings> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let _lock = LockGuard::exclusive(&self.lock_path())?;
        let mut settings = if self.path.exists() {
            let text = std::fs::read_to_string(&self.path)
                .with_context(|| format!("reading {}", self.path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", self.path.display()))?
        } else {
            Settings::default()
        };
        f(&mut settings);

        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(&settings)?;
        std::fs::write(&tmp, body).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(settings)
    }

    pub fn add_approval(&self, tag: &str, subject: &str) -> anyhow::Result<()> {
        self.update(|s| s.add_approval(tag, subject)).map(|_| ())
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "settings.json".into());
        name.push_str(".lock");
        self.path.with_file_name(name)
    }
}

/// Advisory lock held for the guard's lifetime.
struct LockGuard {
    file: File,
}

impl LockGuard {
    fn exclusive(path: &Path) -> anyhow::Result<Self> {
        let file = open_lock_file(path)?;
        file.lock_exclusive()
            .with_context(|| format!("locking {}", path.display()))?;
        Ok(Self { file })
    }

    fn shared(path: &Path) -> anyhow::Result<Self> {
        let file = open_lock_file(path)?;
        file.lock_shared()
            .with_context(|| format!("locking {}", path.display()))?;
        Ok(Self { file })
    }
}

fn open_lock_file(path: &Path) -> anyhow::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
