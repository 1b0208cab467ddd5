// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The background indexer: a per-session one-shot service that walks stale
//! entries and generates summaries, outlines, and embeddings for them.
//!
//! At most one item is in flight at a time.  Each item runs in its own task
//! so a failure is logged and skipped, never propagated.  The service stops
//! itself when the queue drains; `stop()` is cooperative and takes effect
//! before the next item starts.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    File,
    Conversation,
}

/// One stale entry awaiting indexing.
#[derive(Debug, Clone)]
pub struct StaleItem {
    pub kind: ItemKind,
    /// Stable identifier: a path for files, a conversation id otherwise.
    pub id: String,
}

/// What the external indexer produces for one item.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexResult {
    pub summary: String,
    pub outline: String,
    pub embeddings: Vec<f32>,
}

/// Generates summaries, outlines, and embeddings.  Usually model-backed.
#[async_trait]
pub trait Indexer: Send + Sync {
    async fn index(&self, content: &str) -> anyhow::Result<IndexResult>;
}

/// Supplies stale entries and persists their index results.
#[async_trait]
pub trait StaleSource: Send + Sync {
    async fn stale_items(&self) -> anyhow::Result<Vec<StaleItem>>;
    async fn read(&self, item: &StaleItem) -> anyhow::Result<String>;
    async fn store(&self, item: &StaleItem, result: &IndexResult) -> anyhow::Result<()>;
}

pub struct IndexerHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<IndexerStats>,
}

/// What one service run accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexerStats {
    pub indexed: usize,
    pub skipped_errors: usize,
    pub capped_conversations: usize,
}

impl IndexerHandle {
    /// Request a cooperative stop; the current item finishes, no new item
    /// starts.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Wait for the service to finish and return its stats.
    pub async fn wait(self) -> IndexerStats {
        self.join.await.unwrap_or_default()
    }
}

/// Start the one-shot service.  `conversation_cap` bounds how many
/// conversation items one session may index; some finite bound is always
/// enforced.
pub fn start(
    source: Arc<dyn StaleSource>,
    indexer: Arc<dyn Indexer>,
    conversation_cap: usize,
) -> IndexerHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    let join = tokio::spawn(run(source, indexer, conversation_cap, stop_rx));
    IndexerHandle { stop_tx, join }
}

async fn run(
    source: Arc<dyn StaleSource>,
    indexer: Arc<dyn Indexer>,
    conversation_cap: usize,
    stop_rx: watch::Receiver<bool>,
) -> IndexerStats {
    let mut stats = IndexerStats::default();
    let items = match source.stale_items().await {
        Ok(items) => items,
        Err(e) => {
            warn!("stale enumeration failed: {e:#}");
            return stats;
        }
    };
    debug!(count = items.len(), "background indexer starting");

    let mut conversations_done = 0usize;
    for item in items {
        if *stop_rx.borrow() {
            debug!("background indexer stopped on request");
            break;
        }
        if item.kind == ItemKind::Conversation {
            if conversations_done >= conversation_cap {
                stats.capped_conversations += 1;
                continue;
            }
            conversations_done += 1;
        }

        // One task per item so a panic or error is contained.
        let source = Arc::clone(&source);
        let indexer = Arc::clone(&indexer);
        let item_id = item.id.clone();
        let task = tokio::spawn(async move {
            let content = source.read(&item).await?;
            let result = indexer.index(&content).await?;
            source.store(&item, &result).await
        });
        match task.await {
            Ok(Ok(())) => stats.indexed += 1,
            Ok(Err(e)) => {
                warn!(item = %item_id, "indexing failed, skipping: {e:#}");
                stats.skipped_errors += 1;
            }
            Err(e) => {
                warn!(item = %item_id, "indexing task crashed, skipping: {e}");
                stats.skipped_errors += 1;
            }
        }
    }
    debug!(?stats, "background indexer drained");
    stats
}

// ─── Filesystem stale source ──────────────────────────────────────────────────

/// Stale-file source over a project tree: every regular file modified after
/// the stamp file's mtime is stale.  The stamp is refreshed when a result is
/// stored.
pub struct FsStaleSource {
    root: PathBuf,
    stamp: PathBuf,
}

impl FsStaleSource {
    pub fn new(root: impl Into<PathBuf>, stamp: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            stamp: stamp.into(),
        }
    }

    fn stamp_time(&self) -> SystemTime {
        std::fs::metadata(&self.stamp)
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH)
    }
}

#[async_trait]
impl StaleSource for FsStaleSource {
    async fn stale_items(&self) -> anyhow::Result<Vec<StaleItem>> {
        let cutoff = self.stamp_time();
        let mut items = Vec::new();
        for entry in walkdir::WalkDir::new(&self.root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            let modified = entry.metadata()?.modified()?;
            if modified > cutoff {
                items.push(StaleItem {
                    kind: ItemKind::File,
                    id: entry.path().display().to_string(),
                });
            }
        }
        Ok(items)
    }

    async fn read(&self, item: &StaleItem) -> anyhow::Result<String> {
        Ok(std::fs::read_to_string(&item.id)?)
    }

    async fn store(&self, _item: &StaleItem, _result: &IndexResult) -> anyhow::Result<()> {
        // Index storage layout is owned by the embedding side; this source
        // only refreshes the staleness stamp.
        std::fs::write(&self.stamp, b"")?;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// In-memory source with scripted items and stored results.
    struct MemSource {
        items: Vec<StaleItem>,
        content: String,
        stored: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    impl MemSource {
        fn new(items: Vec<StaleItem>) -> Arc<Self> {
            Arc::new(Self {
                items,
                content: "file content".into(),
                stored: Mutex::new(Vec::new()),
                fail_on: None,
            })
        }

        fn failing_on(items: Vec<StaleItem>, id: &str) -> Arc<Self> {
            Arc::new(Self {
                items,
                content: "file content".into(),
                stored: Mutex::new(Vec::new()),
                fail_on: Some(id.into()),
            })
        }
    }

    #[async_trait]
    impl StaleSource for MemSource {
        async fn stale_items(&self) -> anyhow::Result<Vec<StaleItem>> {
            Ok(self.items.clone())
        }
        async fn read(&self, item: &StaleItem) -> anyhow::Result<String> {
            if self.fail_on.as_deref() == Some(item.id.as_str()) {
                anyhow::bail!("unreadable item");
            }
            Ok(self.content.clone())
        }
        async fn store(&self, item: &StaleItem, _result: &IndexResult) -> anyhow::Result<()> {
            self.stored.lock().unwrap().push(item.id.clone());
            Ok(())
        }
    }

    struct FixedIndexer {
        calls: AtomicUsize,
    }

    impl FixedIndexer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Indexer for FixedIndexer {
        async fn index(&self, _content: &str) -> anyhow::Result<IndexResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(IndexResult {
                summary: "s".into(),
                outline: "o".into(),
                embeddings: vec![0.1, 0.2],
            })
        }
    }

    fn file_item(id: &str) -> StaleItem {
        StaleItem {
            kind: ItemKind::File,
            id: id.into(),
        }
    }

    fn conv_item(id: &str) -> StaleItem {
        StaleItem {
            kind: ItemKind::Conversation,
            id: id.into(),
        }
    }

    #[tokio::test]
    async fn drains_queue_and_stops_itself() {
        let source = MemSource::new(vec![file_item("a"), file_item("b")]);
        let stats = start(source.clone(), FixedIndexer::new(), 10).wait().await;
        assert_eq!(stats.indexed, 2);
        assert_eq!(*source.stored.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn failed_items_are_skipped_not_fatal() {
        let source = MemSource::failing_on(
            vec![file_item("a"), file_item("bad"), file_item("c")],
            "bad",
        );
        let stats = start(source.clone(), FixedIndexer::new(), 10).wait().await;
        assert_eq!(stats.indexed, 2);
        assert_eq!(stats.skipped_errors, 1);
        assert_eq!(*source.stored.lock().unwrap(), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn conversation_cap_is_enforced() {
        let items = (0..15).map(|i| conv_item(&format!("c{i}"))).collect();
        let source = MemSource::new(items);
        let stats = start(source, FixedIndexer::new(), 10).wait().await;
        assert_eq!(stats.indexed, 10);
        assert_eq!(stats.capped_conversations, 5);
    }

    #[tokio::test]
    async fn cap_does_not_limit_files() {
        let mut items: Vec<StaleItem> = (0..12).map(|i| file_item(&format!("f{i}"))).collect();
        items.push(conv_item("c1"));
        let source = MemSource::new(items);
        let stats = start(source, FixedIndexer::new(), 10).wait().await;
        assert_eq!(stats.indexed, 13);
    }

    #[tokio::test]
    async fn stop_prevents_further_items() {
        let items = (0..100).map(|i| file_item(&format!("f{i}"))).collect();
        let source = MemSource::new(items);
        let handle = start(source.clone(), FixedIndexer::new(), 10);
        handle.stop();
        let stats = handle.wait().await;
        assert!(
            stats.indexed < 100,
            "stop must interrupt the queue, indexed {}",
            stats.indexed
        );
    }

    #[tokio::test]
    async fn fs_source_reports_files_newer_than_stamp() {
        let dir = tempfile::tempdir().unwrap();
        let stamp = dir.path().join(".fnord-index-stamp");
        std::fs::write(dir.path().join("a.rs"), "fn a() {}").unwrap();

        let source = FsStaleSource::new(dir.path(), &stamp);
        let items = source.stale_items().await.unwrap();
        assert_eq!(items.len(), 1);

        // After storing once, the stamp is fresh and nothing is stale.
        source
            .store(&items[0], &IndexResult {
                summary: String::new(),
                outline: String::new(),
                embeddings: vec![],
            })
            .await
            .unwrap();
        let after = source.stale_items().await.unwrap();
        let non_stamp: Vec<_> = after
            .iter()
            .filter(|i| !i.id.ends_with(".fnord-index-stamp"))
            .collect();
        assert!(non_stamp.is_empty(), "stale after stamp refresh: {non_stamp:?}");
    }
}
