// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Agent display-name pool.
//!
//! Names are allocated in batches from an external generator and handed out
//! one at a time.  Checkout blocks allocation behind a per-call timeout so a
//! hung generator surfaces as an error instead of stalling the driver.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

/// The default display name.  Never checked out of or into the pool.
pub const SENTINEL_NAME: &str = "Fnord Prefect";

/// External name generator.  Usually a small model call.
#[async_trait]
pub trait NameSource: Send + Sync {
    async fn generate(&self, count: usize) -> anyhow::Result<Vec<String>>;
}

#[derive(Debug, thiserror::Error)]
pub enum NameError {
    #[error("name allocation timed out after {0:?}")]
    AllocationTimeout(Duration),
    #[error("name generator failed: {0}")]
    Generator(String),
    #[error("name generator returned no usable names")]
    Exhausted,
}

struct PoolState {
    free: Vec<String>,
    out: HashSet<String>,
    /// Display name per worker task.
    by_task: HashMap<String, String>,
}

pub struct NamePool {
    state: Mutex<PoolState>,
    source: Arc<dyn NameSource>,
    chunk_size: usize,
    allocation_timeout: Duration,
}

impl NamePool {
    pub fn new(source: Arc<dyn NameSource>, chunk_size: usize, allocation_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(PoolState {
                free: Vec::new(),
                out: HashSet::new(),
                by_task: HashMap::new(),
            }),
            source,
            chunk_size: chunk_size.max(1),
            allocation_timeout,
        }
    }

    /// Take an unused name, allocating a new chunk when the free list is
    /// empty.  A generator that exceeds the allocation timeout is dropped
    /// and the caller gets an error.
    pub async fn checkout(&self) -> Result<String, NameError> {
        let mut state = self.state.lock().await;
        if state.free.is_empty() {
            let generated =
                match tokio::time::timeout(self.allocation_timeout, self.source.generate(self.chunk_size))
                    .await
                {
                    Err(_) => return Err(NameError::AllocationTimeout(self.allocation_timeout)),
                    Ok(Err(e)) => return Err(NameError::Generator(format!("{e:#}"))),
                    Ok(Ok(names)) => names,
                };
            let fresh: Vec<String> = generated
                .into_iter()
                .filter(|n| n != SENTINEL_NAME)
                .filter(|n| !state.out.contains(n) && !state.free.contains(n))
                .collect();
            debug!(count = fresh.len(), "allocated name chunk");
            state.free.extend(fresh);
        }
        let name = state.free.pop().ok_or(NameError::Exhausted)?;
        state.out.insert(name.clone());
        Ok(name)
    }

    /// Return a name to the free list.  The sentinel and names that were
    /// never checked out are ignored.
    pub async fn checkin(&self, name: &str) {
        if name == SENTINEL_NAME {
            return;
        }
        let mut state = self.state.lock().await;
        if state.out.remove(name) {
            state.free.push(name.to_string());
        }
    }

    /// Bind a name to a worker task so it can be recovered later.
    pub async fn associate(&self, name: &str, task_id: &str) {
        self.state
            .lock()
            .await
            .by_task
            .insert(task_id.to_string(), name.to_string());
    }

    pub async fn get_name_by_task(&self, task_id: &str) -> Option<String> {
        self.state.lock().await.by_task.get(task_id).cloned()
    }

    pub async fn free_count(&self) -> usize {
        self.state.lock().await.free.len()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Deterministic source: name-<k> counting upwards per allocation.
    struct CountingSource {
        counter: AtomicUsize,
    }

    impl CountingSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                counter: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl NameSource for CountingSource {
        async fn generate(&self, count: usize) -> anyhow::Result<Vec<String>> {
            let start = self.counter.fetch_add(count, Ordering::SeqCst);
            Ok((start..start + count).map(|k| format!("name-{k}")).collect())
        }
    }

    /// Source that never completes, for timeout tests.
    struct HangingSource;

    #[async_trait]
    impl NameSource for HangingSource {
        async fn generate(&self, _count: usize) -> anyhow::Result<Vec<String>> {
            futures::future::pending().await
        }
    }

    /// Source that always emits the sentinel plus one real name.
    struct SentinelSource;

    #[async_trait]
    impl NameSource for SentinelSource {
        async fn generate(&self, _count: usize) -> anyhow::Result<Vec<String>> {
            Ok(vec![SENTINEL_NAME.to_string(), "Real Name".to_string()])
        }
    }

    fn pool(source: Arc<dyn NameSource>) -> Arc<NamePool> {
        Arc::new(NamePool::new(source, 4, Duration::from_millis(50)))
    }

    #[tokio::test]
    async fn checkout_allocates_when_empty() {
        let p = pool(CountingSource::new());
        let name = p.checkout().await.unwrap();
        assert!(name.starts_with("name-"));
    }

    #[tokio::test]
    async fn concurrent_checkouts_yield_distinct_names() {
        let p = pool(CountingSource::new());
        let mut handles = Vec::new();
        for _ in 0..12 {
            let p = Arc::clone(&p);
            handles.push(tokio::spawn(async move { p.checkout().await.unwrap() }));
        }
        let mut names = HashSet::new();
        for h in handles {
            assert!(names.insert(h.await.unwrap()), "duplicate name issued");
        }
        assert_eq!(names.len(), 12);
    }

    #[tokio::test]
    async fn checkin_returns_names_to_free_list() {
        let p = pool(CountingSource::new());
        let mut names = Vec::new();
        for _ in 0..6 {
            names.push(p.checkout().await.unwrap());
        }
        for name in &names {
            p.checkin(name).await;
        }
        assert!(p.free_count().await >= 6);
    }

    #[tokio::test]
    async fn checked_in_names_are_reissued() {
        let p = pool(CountingSource::new());
        let name = p.checkout().await.unwrap();
        p.checkin(&name).await;
        // The freed name sits on top of the free list.
        assert_eq!(p.checkout().await.unwrap(), name);
    }

    #[tokio::test]
    async fn sentinel_is_never_pooled() {
        let p = pool(Arc::new(SentinelSource));
        assert_eq!(p.checkout().await.unwrap(), "Real Name");
        p.checkin(SENTINEL_NAME).await;
        assert_eq!(p.free_count().await, 0);
    }

    #[tokio::test]
    async fn allocation_timeout_surfaces_as_error() {
        let p = pool(Arc::new(HangingSource));
        match p.checkout().await {
            Err(NameError::AllocationTimeout(_)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn associate_and_recover_by_task() {
        let p = pool(CountingSource::new());
        let name = p.checkout().await.unwrap();
        p.associate(&name, "worker-7").await;
        assert_eq!(p.get_name_by_task("worker-7").await, Some(name));
        assert_eq!(p.get_name_by_task("worker-8").await, None);
    }

    #[tokio::test]
    async fn unknown_checkin_is_ignored() {
        let p = pool(CountingSource::new());
        p.checkin("never issued").await;
        assert_eq!(p.free_count().await, 0);
    }
}
