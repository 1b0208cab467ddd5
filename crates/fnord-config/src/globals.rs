// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Scoped key/value overrides layered over a shared default store.
//!
//! A task tree that wants private overrides calls [`Globals::root`] to become
//! a *root* and passes the returned [`ScopeHandle`] to every task it spawns.
//! Reads resolve the handle's root first and fall back to the default store.
//! When the last handle for a root is dropped all of that root's overrides
//! are swept from the shared table.
//!
//! Every write is an individual table insert under one mutex, so a reader
//! never observes a torn multi-key update; `put_all_env` is semantically a
//! sequence of independent single-key inserts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Inner {
    /// Shared default store: `(app, key) → value`.
    defaults: Mutex<HashMap<(String, String), String>>,
    /// Per-root overrides: `(root, app, key) → value`.
    overrides: Mutex<HashMap<(u64, String, String), String>>,
    next_root: AtomicU64,
}

/// Process-wide globals table.  Cheap to clone; all clones share state.
#[derive(Clone, Default)]
pub struct Globals {
    inner: Arc<Inner>,
}

impl Globals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a value into the shared default store, visible to every scope
    /// that has no override for `(app, key)`.
    pub fn set_default(&self, app: &str, key: &str, val: &str) {
        self.inner
            .defaults
            .lock()
            .expect("globals defaults poisoned")
            .insert((app.to_string(), key.to_string()), val.to_string());
    }

    /// Install the caller as a new root and return its scope handle.
    ///
    /// Children spawned by this caller must capture a clone of the handle at
    /// spawn time; there is no implicit ancestry walk.
    pub fn root(&self) -> ScopeHandle {
        let id = self.inner.next_root.fetch_add(1, Ordering::Relaxed);
        ScopeHandle {
            token: Arc::new(RootToken {
                id,
                inner: Arc::clone(&self.inner),
            }),
        }
    }
}

struct RootToken {
    id: u64,
    inner: Arc<Inner>,
}

impl Drop for RootToken {
    fn drop(&mut self) {
        // Root exit: sweep every override belonging to this root.
        let mut table = match self.inner.overrides.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        table.retain(|(root, _, _), _| *root != self.id);
    }
}

/// Handle identifying one override root.  Clones share the root; the sweep
/// runs when the last clone is dropped.
#[derive(Clone)]
pub struct ScopeHandle {
    token: Arc<RootToken>,
}

impl ScopeHandle {
    /// Set an override for this root.  A single-key insert; readers either
    /// see the previous value or the new one, never a partial state.
    pub fn put_env(&self, app: &str, key: &str, val: &str) {
        self.token
            .inner
            .overrides
            .lock()
            .expect("globals overrides poisoned")
            .insert(
                (self.token.id, app.to_string(), key.to_string()),
                val.to_string(),
            );
    }

    /// Bulk write.  Each pair is an independent single-key insert; there is
    /// no transactional grouping across keys.
    pub fn put_all_env(&self, app: &str, pairs: &[(&str, &str)]) {
        for (key, val) in pairs {
            self.put_env(app, key, val);
        }
    }

    /// Resolve `(app, key)`: this root's override, then the default store,
    /// then `default`.
    pub fn get_env(&self, app: &str, key: &str, default: &str) -> String {
        if let Some(v) = self
            .token
            .inner
            .overrides
            .lock()
            .expect("globals overrides poisoned")
            .get(&(self.token.id, app.to_string(), key.to_string()))
        {
            return v.clone();
        }
        if let Some(v) = self
            .token
            .inner
            .defaults
            .lock()
            .expect("globals defaults poisoned")
            .get(&(app.to_string(), key.to_string()))
        {
            return v.clone();
        }
        default.to_string()
    }

    /// Remove this root's override for `(app, key)`, uncovering the default.
    pub fn delete_env(&self, app: &str, key: &str) {
        self.token
            .inner
            .overrides
            .lock()
            .expect("globals overrides poisoned")
            .remove(&(self.token.id, app.to_string(), key.to_string()));
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
