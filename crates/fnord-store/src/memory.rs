// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

/// Where a memory lives once promoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryScope {
    Session,
    Project,
    Global,
}

/// Lifecycle of a session memory through the memory indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexStatus {
    /// Captured but not yet looked at.
    #[default]
    New,
    /// Examined; awaiting a promotion decision.
    Analyzed,
    /// Judged not worth keeping long-term.
    Rejected,
    /// Promoted into a project or global memory.
    Incorporated,
    /// Folded into an existing long-term memory.
    Merged,
}

/// A candidate long-term fact captured during a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub scope: MemoryScope,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub index_status: IndexStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embeddings: Option<Vec<f32>>,
}

impl MemoryEntry {
    pub fn session(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            scope: MemoryScope::Session,
            title: title.into(),
            content: content.into(),
            topics: Vec::new(),
            index_status: IndexStatus::New,
            embeddings: None,
        }
    }

    /// True while the memory indexer has not yet resolved this entry.
    pub fn is_unprocessed(&self) -> bool {
        matches!(self.index_status, IndexStatus::New | IndexStatus::Analyzed)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_constructor_starts_new() {
        let m = MemoryEntry::session("prefers tabs", "user prefers tabs over spaces");
        assert_eq!(m.scope, MemoryScope::Session);
        assert_eq!(m.index_status, IndexStatus::New);
        assert!(m.is_unprocessed());
    }

    #[test]
    fn incorporated_memories_are_processed() {
        let mut m = MemoryEntry::session("t", "c");
        m.index_status = IndexStatus::Incorporated;
        assert!(!m.is_unprocessed());
    }

    #[test]
    fn round_trips_through_json_without_embeddings_field() {
        let m = MemoryEntry::session("t", "c");
        let json = serde_json::to_string(&m).unwrap();
        assert!(!json.contains("embeddings"));
        let back: MemoryEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn status_serialises_lowercase() {
        let json = serde_json::to_string(&IndexStatus::Incorporated).unwrap();
        assert_eq!(json, "\"incorporated\"");
    }
}
