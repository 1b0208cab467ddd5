// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The notes coordinator: ingests candidate facts from the running
//! conversation, commits them to the per-project notes file, and
//! periodically consolidates the whole document.
//!
//! The coordinator is an actor: ingestion events arrive fire-and-forget from
//! the completion driver (via [`FactSink`]), while `commit` and
//! `consolidate` are request-reply.  All file access happens under the notes
//! path's advisory lock, shared with any other process touching the file.

mod document;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use fnord_core::{Accumulator, FactSink};
use fnord_model::{Completion, CompletionRequest, Message, ModelClient, ModelSpec, TokenCounter};
use fnord_store::PathLock;
use fnord_tools::memo_lines;

pub use document::{
    append_unconsolidated, collapse_unconsolidated_sections, empty_document,
    extract_unconsolidated, merge_new_facts, NEW_NOTES_HEADING, SECTIONS,
};

#[derive(Debug, thiserror::Error)]
pub enum NotesError {
    #[error("notes consolidation failed after {attempts} attempts: {message}")]
    ConsolidationFailed { attempts: u32, message: String },
    #[error("notes file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Internal(String),
}

/// Extracts candidate facts via secondary model calls.
#[async_trait]
pub trait FactExtractor: Send + Sync {
    /// Bullets describing the user, from one user message.  Trivial
    /// messages yield an empty list.
    async fn user_traits(&self, message: &str) -> anyhow::Result<Vec<String>>;

    /// Non-transient project facts from one tool call and its result.
    async fn project_facts(
        &self,
        func: &str,
        args_json: &str,
        result: &str,
    ) -> anyhow::Result<Vec<String>>;
}

/// Rewrites the full notes document into the canonical template.
#[async_trait]
pub trait Consolidator: Send + Sync {
    async fn consolidate(&self, document: &str) -> anyhow::Result<String>;
}

enum Command {
    UserMessage(String),
    ToolResult {
        func: String,
        args_json: String,
        result: String,
    },
    Commit(oneshot::Sender<Result<(), NotesError>>),
    Consolidate(oneshot::Sender<Result<(), NotesError>>),
    PendingFacts(oneshot::Sender<Vec<String>>),
}

/// Cloneable handle to the running coordinator.
#[derive(Clone)]
pub struct NotesHandle {
    tx: mpsc::UnboundedSender<Command>,
}

pub struct NotesCoordinator {
    path: PathBuf,
    extractor: Arc<dyn FactExtractor>,
    consolidator: Arc<dyn Consolidator>,
    retries: u32,
    new_facts: Vec<String>,
}

impl NotesCoordinator {
    /// Spawn the coordinator for the notes file at `path`.
    pub fn spawn(
        path: impl Into<PathBuf>,
        extractor: Arc<dyn FactExtractor>,
        consolidator: Arc<dyn Consolidator>,
        retries: u32,
    ) -> NotesHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Self {
            path: path.into(),
            extractor,
            consolidator,
            retries,
            new_facts: Vec::new(),
        };
        tokio::spawn(coordinator.run(rx));
        NotesHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::UserMessage(text) => self.ingest_user_message(&text).await,
                Command::ToolResult {
                    func,
                    args_json,
                    result,
                } => self.ingest_tool_result(&func, &args_json, &result).await,
                Command::Commit(reply) => {
                    let _ = reply.send(self.commit());
                }
                Command::Consolidate(reply) => {
                    let _ = reply.send(self.consolidate().await);
                }
                Command::PendingFacts(reply) => {
                    let _ = reply.send(self.new_facts.clone());
                }
            }
        }
    }

    // ── Ingest ────────────────────────────────────────────────────────────────

    async fn ingest_user_message(&mut self, text: &str) {
        match self.ask(|| self.extractor.user_traits(text)).await {
            Ok(traits) => self.push_facts(traits),
            Err(e) => warn!("user-trait extraction failed: {e:#}"),
        }
    }

    async fn ingest_tool_result(&mut self, func: &str, args_json: &str, result: &str) {
        // Explicit memos in notification messages are recorded verbatim,
        // ahead of anything the extractor produces.
        if func == "notify" {
            if let Some(message) = notify_message(args_json) {
                for memo in memo_lines(&message) {
                    self.new_facts.insert(0, memo);
                }
            }
        }
        match self
            .ask(|| self.extractor.project_facts(func, args_json, result))
            .await
        {
            Ok(facts) => self.push_facts(facts),
            Err(e) => warn!(func, "project-fact extraction failed: {e:#}"),
        }
    }

    fn push_facts(&mut self, facts: Vec<String>) {
        for fact in facts {
            let fact = fact.trim();
            if !fact.is_empty() {
                self.new_facts.push(fact.to_string());
            }
        }
    }

    /// Retry an extraction call up to the configured attempt budget.
    async fn ask<F, Fut, T>(&self, mut call: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        let attempts = self.retries.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    debug!(attempt, "notes call failed: {e:#}");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.expect("at least one attempt"))
    }

    // ── Commit ────────────────────────────────────────────────────────────────

    /// Flush pending facts into the single sentinel section on disk.
    fn commit(&mut self) -> Result<(), NotesError> {
        if self.new_facts.is_empty() {
            return Ok(());
        }
        let _lock =
            PathLock::acquire(&self.path).map_err(|e| NotesError::Internal(format!("{e:#}")))?;
        let doc = self.read_or_default()?;
        let merged = merge_new_facts(&doc, &self.new_facts);
        std::fs::write(&self.path, merged)?;
        self.new_facts.clear();
        Ok(())
    }

    // ── Consolidate ───────────────────────────────────────────────────────────

    /// Collapse the sentinel sections, rewrite the document through the
    /// consolidator, and replace the file.  An empty consolidation result
    /// never overwrites the notes.
    async fn consolidate(&mut self) -> Result<(), NotesError> {
        let _lock =
            PathLock::acquire(&self.path).map_err(|e| NotesError::Internal(format!("{e:#}")))?;
        let doc = self.read_or_default()?;
        let collapsed = collapse_unconsolidated_sections(&doc);

        let attempts = self.retries.max(1);
        let mut last_err = String::new();
        for attempt in 1..=attempts {
            match self.consolidator.consolidate(&collapsed).await {
                Ok(cleaned) if !cleaned.trim().is_empty() => {
                    std::fs::write(&self.path, cleaned)?;
                    return Ok(());
                }
                Ok(_) => {
                    warn!("consolidation returned an empty document; keeping notes as-is");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, "consolidation attempt failed: {e:#}");
                    last_err = format!("{e:#}");
                }
            }
        }
        Err(NotesError::ConsolidationFailed {
            attempts,
            message: last_err,
        })
    }

    fn read_or_default(&self) -> Result<String, NotesError> {
        if self.path.exists() {
            Ok(std::fs::read_to_string(&self.path)?)
        } else {
            Ok(empty_document())
        }
    }
}

/// Pull the `message` argument out of a notify tool call.
fn notify_message(args_json: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(args_json)
        .ok()?
        .get("message")?
        .as_str()
        .map(String::from)
}

impl NotesHandle {
    pub fn ingest_user_message(&self, text: impl Into<String>) {
        let _ = self.tx.send(Command::UserMessage(text.into()));
    }

    pub fn ingest_tool_result(&self, func: &str, args_json: &str, result: &str) {
        let _ = self.tx.send(Command::ToolResult {
            func: func.into(),
            args_json: args_json.into(),
            result: result.into(),
        });
    }

    pub async fn commit(&self) -> Result<(), NotesError> {
        self.request(Command::Commit).await
    }

    pub async fn consolidate(&self) -> Result<(), NotesError> {
        self.request(Command::Consolidate).await
    }

    /// Facts ingested but not yet committed.  Mostly useful in tests.
    pub async fn pending_facts(&self) -> Vec<String> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::PendingFacts(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<(), NotesError>>) -> Command,
    ) -> Result<(), NotesError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .map_err(|_| NotesError::Internal("notes coordinator is gone".into()))?;
        rx.await
            .map_err(|_| NotesError::Internal("notes coordinator dropped the reply".into()))?
    }
}

/// The driver feeds conversation traffic straight into the coordinator.
impl FactSink for NotesHandle {
    fn user_message(&self, text: &str) {
        self.ingest_user_message(text);
    }

    fn tool_result(&self, func: &str, args_json: &str, result: &str) {
        self.ingest_tool_result(func, args_json, result);
    }
}

// ─── Consolidation via the accumulator ────────────────────────────────────────

const CONSOLIDATE_PROMPT: &str = "You maintain a project research-notes document. \
Reorganize the notes you are given into exactly these top-level Markdown \
sections, in this order: # SYNOPSIS, # USER, # LANGUAGES AND TECHNOLOGIES, \
# CONVENTIONS, # LAYOUT, # APPLICATIONS & COMPONENTS, # NOTES. Fold every \
bullet from any NEW NOTES section into the appropriate section, merge \
duplicates, and drop transient or contradicted facts. Never invent facts.";

/// [`Consolidator`] backed by the accumulator, so documents larger than the
/// model's context window fold chunk by chunk.
pub struct AccumulatorConsolidator {
    accumulator: Accumulator,
}

impl AccumulatorConsolidator {
    pub fn new(
        client: Arc<dyn ModelClient>,
        counter: Arc<dyn TokenCounter>,
        model: ModelSpec,
        reduction_factor: f32,
    ) -> Self {
        Self {
            accumulator: Accumulator::new(
                client,
                counter,
                model,
                CONSOLIDATE_PROMPT,
                "produce the reorganized notes document",
                reduction_factor,
            ),
        }
    }
}

#[async_trait]
impl Consolidator for AccumulatorConsolidator {
    async fn consolidate(&self, document: &str) -> anyhow::Result<String> {
        self.accumulator.process(document).await
    }
}

/// [`FactExtractor`] backed by small model calls; replies are parsed as one
/// bullet per line.
pub struct ClientExtractor {
    client: Arc<dyn ModelClient>,
    model: ModelSpec,
}

const USER_TRAITS_PROMPT: &str = "Extract durable facts about the user from their \
message: preferences, expertise, working style. Reply with one fact per \
line, or an empty reply when the message reveals nothing durable.";

const PROJECT_FACTS_PROMPT: &str = "Extract durable, non-transient facts about the \
project from this tool call and its result: architecture, conventions, file \
layout, dependencies. Ignore ephemeral output such as timestamps or test \
noise. Reply with one fact per line, or an empty reply when there is \
nothing durable.";

impl ClientExtractor {
    pub fn new(client: Arc<dyn ModelClient>, model: ModelSpec) -> Self {
        Self { client, model }
    }

    async fn ask(&self, system: &str, user: String) -> anyhow::Result<Vec<String>> {
        let request = CompletionRequest {
            model: self.model.id.clone(),
            messages: vec![Message::system(system.to_string()), Message::user(user)],
            ..Default::default()
        };
        match self.client.complete(request).await? {
            Completion::Message { text, .. } => Ok(text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect()),
            Completion::ToolCalls(_) => anyhow::bail!("extractor call returned tool calls"),
        }
    }
}

#[async_trait]
impl FactExtractor for ClientExtractor {
    async fn user_traits(&self, message: &str) -> anyhow::Result<Vec<String>> {
        self.ask(USER_TRAITS_PROMPT, message.to_string()).await
    }

    async fn project_facts(
        &self,
        func: &str,
        args_json: &str,
        result: &str,
    ) -> anyhow::Result<Vec<String>> {
        self.ask(
            PROJECT_FACTS_PROMPT,
            format!("tool: {func}\narguments: {args_json}\nresult:\n{result}"),
        )
        .await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Extractor with canned replies; counts calls.
    struct FixedExtractor {
        traits: Vec<String>,
        facts: Vec<String>,
    }

    #[async_trait]
    impl FactExtractor for FixedExtractor {
        async fn user_traits(&self, _message: &str) -> anyhow::Result<Vec<String>> {
            Ok(self.traits.clone())
        }
        async fn project_facts(
            &self,
            _func: &str,
            _args_json: &str,
            _result: &str,
        ) -> anyhow::Result<Vec<String>> {
            Ok(self.facts.clone())
        }
    }

    /// Consolidator returning a fixed document, or failing N times first.
    struct FixedConsolidator {
        fail_first: AtomicU32,
        output: Mutex<String>,
    }

    impl FixedConsolidator {
        fn new(output: &str) -> Arc<Self> {
            Arc::new(Self {
                fail_first: AtomicU32::new(0),
                output: Mutex::new(output.to_string()),
            })
        }

        fn failing(times: u32, output: &str) -> Arc<Self> {
            Arc::new(Self {
                fail_first: AtomicU32::new(times),
                output: Mutex::new(output.to_string()),
            })
        }
    }

    #[async_trait]
    impl Consolidator for FixedConsolidator {
        async fn consolidate(&self, _document: &str) -> anyhow::Result<String> {
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("consolidation model unavailable");
            }
            Ok(self.output.lock().unwrap().clone())
        }
    }

    fn extractor(traits: &[&str], facts: &[&str]) -> Arc<FixedExtractor> {
        Arc::new(FixedExtractor {
            traits: traits.iter().map(|s| s.to_string()).collect(),
            facts: facts.iter().map(|s| s.to_string()).collect(),
        })
    }

    fn notes_path() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.md");
        (dir, path)
    }

    #[tokio::test]
    async fn ingested_facts_are_pending_until_commit() {
        let (_dir, path) = notes_path();
        let handle = NotesCoordinator::spawn(
            &path,
            extractor(&["prefers short answers"], &[]),
            FixedConsolidator::new(""),
            2,
        );
        handle.ingest_user_message("keep it brief please");
        let pending = handle.pending_facts().await;
        assert_eq!(pending, vec!["prefers short answers"]);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn commit_writes_facts_into_sentinel_section() {
        let (_dir, path) = notes_path();
        let handle = NotesCoordinator::spawn(
            &path,
            extractor(&[], &["parser lives in src/parse.rs"]),
            FixedConsolidator::new(""),
            2,
        );
        handle.ingest_tool_result("grep", r#"{"pattern":"parse"}"#, "src/parse.rs:10");
        handle.commit().await.unwrap();

        let doc = std::fs::read_to_string(&path).unwrap();
        assert_eq!(doc.matches(NEW_NOTES_HEADING).count(), 1);
        assert!(doc.contains("- parser lives in src/parse.rs"));
        // The template sections exist in the freshly created file.
        assert!(doc.contains("# SYNOPSIS"));
        // Pending facts flushed.
        assert!(handle.pending_facts().await.is_empty());
    }

    #[tokio::test]
    async fn commit_merges_with_existing_sentinel_section() {
        let (_dir, path) = notes_path();
        std::fs::write(
            &path,
            "# NOTES\nold\n\n# NEW NOTES (unconsolidated)\n- existing fact\n",
        )
        .unwrap();
        let handle = NotesCoordinator::spawn(
            &path,
            extractor(&[], &["Existing Fact", "fresh fact"]),
            FixedConsolidator::new(""),
            2,
        );
        handle.ingest_tool_result("grep", "{}", "out");
        handle.commit().await.unwrap();

        let doc = std::fs::read_to_string(&path).unwrap();
        assert_eq!(doc.matches(NEW_NOTES_HEADING).count(), 1);
        let bullets: Vec<&str> = doc.lines().filter(|l| l.starts_with("- ")).collect();
        assert_eq!(bullets, vec!["- existing fact", "- fresh fact"]);
    }

    #[tokio::test]
    async fn notify_memos_are_recorded_verbatim_and_first() {
        let (_dir, path) = notes_path();
        let handle = NotesCoordinator::spawn(
            &path,
            extractor(&[], &["extracted fact"]),
            FixedConsolidator::new(""),
            2,
        );
        handle.ingest_tool_result(
            "notify",
            r#"{"message":"working\nnote to self: check build.rs\nremember: CI uses nightly"}"#,
            "displayed",
        );
        let pending = handle.pending_facts().await;
        assert_eq!(
            pending,
            vec![
                "remember: CI uses nightly",
                "note to self: check build.rs",
                "extracted fact"
            ]
        );
    }

    #[tokio::test]
    async fn consolidate_rewrites_the_document() {
        let (_dir, path) = notes_path();
        std::fs::write(&path, "# NOTES\n\n# NEW NOTES (unconsolidated)\n- a\n").unwrap();
        let handle = NotesCoordinator::spawn(
            &path,
            extractor(&[], &[]),
            FixedConsolidator::new("# SYNOPSIS\nconsolidated\n"),
            2,
        );
        handle.consolidate().await.unwrap();
        let doc = std::fs::read_to_string(&path).unwrap();
        assert_eq!(doc, "# SYNOPSIS\nconsolidated\n");
    }

    #[tokio::test]
    async fn consolidate_retries_then_succeeds() {
        let (_dir, path) = notes_path();
        std::fs::write(&path, "# NOTES\n").unwrap();
        let handle = NotesCoordinator::spawn(
            &path,
            extractor(&[], &[]),
            FixedConsolidator::failing(1, "# SYNOPSIS\nok\n"),
            2,
        );
        handle.consolidate().await.unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("ok"));
    }

    #[tokio::test]
    async fn consolidate_surfaces_terminal_failure() {
        let (_dir, path) = notes_path();
        std::fs::write(&path, "# NOTES\nkeep me\n").unwrap();
        let handle = NotesCoordinator::spawn(
            &path,
            extractor(&[], &[]),
            FixedConsolidator::failing(5, "never reached"),
            2,
        );
        match handle.consolidate().await {
            Err(NotesError::ConsolidationFailed { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("unexpected: {other:?}"),
        }
        // The notes file is untouched.
        assert!(std::fs::read_to_string(&path).unwrap().contains("keep me"));
    }

    #[tokio::test]
    async fn empty_consolidation_never_overwrites() {
        let (_dir, path) = notes_path();
        std::fs::write(&path, "# NOTES\nvaluable\n").unwrap();
        let handle = NotesCoordinator::spawn(
            &path,
            extractor(&[], &[]),
            FixedConsolidator::new("   \n"),
            2,
        );
        handle.consolidate().await.unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("valuable"));
    }

    #[test]
    fn notify_message_reads_the_message_argument() {
        assert_eq!(
            notify_message(r#"{"message":"hello"}"#),
            Some("hello".to_string())
        );
        assert_eq!(notify_message("{not json"), None);
        assert_eq!(notify_message(r#"{"other":"x"}"#), None);
    }
}
