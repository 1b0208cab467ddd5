// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The memory indexer: promotes session-scoped memories from past
//! conversations into project or global long-term memories.
//!
//! Conversations are scanned oldest-first, excluding the one currently
//! active, one at a time.  For each unprocessed session memory the existing
//! long-term memories are offered as candidates to a secondary agent, whose
//! reply is validated into typed add/replace/delete actions before anything
//! is applied.  Processed memories are re-marked and the conversation is
//! rewritten under its file lock.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use fnord_store::{ConversationStore, IndexStatus, MemoryEntry, MemoryScope};

/// A validated promotion action.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryAction {
    pub kind: ActionKind,
    pub scope: MemoryScope,
    pub title: String,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Add,
    Replace,
    Delete,
}

/// Secondary agent deciding what to do with one session memory.  Returns
/// raw JSON: `{"actions": [{action, target: {scope, title}, content?}],
/// "status": "incorporated" | ...}`.
#[async_trait]
pub trait MemoryAgent: Send + Sync {
    async fn plan(
        &self,
        memory: &MemoryEntry,
        candidates: &[MemoryEntry],
    ) -> anyhow::Result<Value>;
}

/// The long-term memory store the actions apply to.
#[async_trait]
pub trait LongTermStore: Send + Sync {
    /// Existing project and global memories offered as candidates.
    async fn candidates(&self) -> anyhow::Result<Vec<MemoryEntry>>;
    async fn apply(&self, action: &MemoryAction) -> anyhow::Result<()>;
}

/// Validate an agent reply into typed actions plus the resulting status for
/// the session memory.
///
/// Rejected shapes: a non-list `actions`, an unknown action verb, a session
/// target scope, an empty title, or a missing `content` on add/replace.
pub fn validate_plan(reply: &Value) -> Result<(Vec<MemoryAction>, IndexStatus), String> {
    let actions_json = reply
        .get("actions")
        .and_then(Value::as_array)
        .ok_or_else(|| "reply has no actions list".to_string())?;

    let mut actions = Vec::with_capacity(actions_json.len());
    for (i, entry) in actions_json.iter().enumerate() {
        let kind = match entry.get("action").and_then(Value::as_str) {
            Some("add") => ActionKind::Add,
            Some("replace") => ActionKind::Replace,
            Some("delete") => ActionKind::Delete,
            Some(other) => return Err(format!("action {i}: unknown verb {other:?}")),
            None => return Err(format!("action {i}: missing verb")),
        };
        let target = entry
            .get("target")
            .ok_or_else(|| format!("action {i}: missing target"))?;
        let scope = match target.get("scope").and_then(Value::as_str) {
            Some("project") => MemoryScope::Project,
            Some("global") => MemoryScope::Global,
            Some(other) => return Err(format!("action {i}: invalid target scope {other:?}")),
            None => return Err(format!("action {i}: missing target scope")),
        };
        let title = target
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        if title.is_empty() {
            return Err(format!("action {i}: empty target title"));
        }
        let content = entry
            .get("content")
            .and_then(Value::as_str)
            .map(String::from);
        if content.is_none() && kind != ActionKind::Delete {
            return Err(format!("action {i}: add/replace requires content"));
        }
        actions.push(MemoryAction {
            kind,
            scope,
            title,
            content,
        });
    }

    let status = match reply.get("status").and_then(Value::as_str) {
        Some("rejected") => IndexStatus::Rejected,
        Some("merged") => IndexStatus::Merged,
        _ => IndexStatus::Incorporated,
    };
    Ok((actions, status))
}

/// Outcome of one indexer run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryIndexStats {
    pub promoted: usize,
    pub invalid_plans: usize,
    pub conversations_scanned: usize,
}

pub struct MemoryIndexer {
    store: ConversationStore,
    agent: std::sync::Arc<dyn MemoryAgent>,
    long_term: std::sync::Arc<dyn LongTermStore>,
}

impl MemoryIndexer {
    pub fn new(
        store: ConversationStore,
        agent: std::sync::Arc<dyn MemoryAgent>,
        long_term: std::sync::Arc<dyn LongTermStore>,
    ) -> Self {
        Self {
            store,
            agent,
            long_term,
        }
    }

    /// One full pass: oldest conversations first, the active one excluded,
    /// strictly one conversation at a time.
    pub async fn run(&self, active: Option<Uuid>) -> anyhow::Result<MemoryIndexStats> {
        let mut stats = MemoryIndexStats::default();
        for id in self.store.list()? {
            if Some(id) == active {
                continue;
            }
            let mut record = match self.store.load(id) {
                Ok(record) => record,
                Err(e) => {
                    warn!(conversation = %id, "skipping unreadable conversation: {e}");
                    continue;
                }
            };
            if !record.memory.iter().any(MemoryEntry::is_unprocessed) {
                continue;
            }
            stats.conversations_scanned += 1;

            let mut changed = false;
            for i in 0..record.memory.len() {
                if !record.memory[i].is_unprocessed()
                    || record.memory[i].scope != MemoryScope::Session
                {
                    continue;
                }
                let candidates = self.long_term.candidates().await?;
                let reply = match self.agent.plan(&record.memory[i], &candidates).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!("memory agent failed: {e:#}");
                        continue;
                    }
                };
                let (actions, status) = match validate_plan(&reply) {
                    Ok(plan) => plan,
                    Err(reason) => {
                        warn!(%reason, "rejecting invalid memory plan");
                        stats.invalid_plans += 1;
                        continue;
                    }
                };
                for action in &actions {
                    self.long_term.apply(action).await?;
                }
                record.memory[i].index_status = status;
                stats.promoted += 1;
                changed = true;
                debug!(title = %record.memory[i].title, ?status, "session memory processed");
            }

            if changed {
                // save() takes the conversation's file lock.
                self.store.save(&record)?;
            }
        }
        Ok(stats)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
