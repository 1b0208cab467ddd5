// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Conversation persistence: one JSON document per conversation.
//!
//! Writers take the path's advisory lock, write to `<path>.tmp`, rename into
//! place, and chmod the result to 0600.  Before anything reaches disk the
//! boilerplate filter runs: transient system messages and reasoning traces
//! never survive a save.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use fnord_model::Message;

use crate::lock::PathLock;
use crate::memory::MemoryEntry;
use crate::tasks::TaskLists;

/// A conversation as held in memory and on disk.  The id doubles as the
/// file name and is not repeated inside the document.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub messages: Vec<Message>,
    pub metadata: HashMap<String, Value>,
    pub memory: Vec<MemoryEntry>,
    pub tasks: TaskLists,
}

impl ConversationRecord {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            messages: Vec::new(),
            metadata: HashMap::new(),
            memory: Vec::new(),
            tasks: TaskLists::new(),
        }
    }
}

impl Default for ConversationRecord {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize, Deserialize)]
struct DiskRecord {
    timestamp: DateTime<Utc>,
    messages: Vec<Message>,
    #[serde(default)]
    metadata: HashMap<String, Value>,
    #[serde(default)]
    memory: Vec<MemoryEntry>,
    #[serde(default)]
    tasks: TaskLists,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conversation {0} not found")]
    NotFound(Uuid),
    #[error("reading conversation store: {0}")]
    Io(#[from] std::io::Error),
    #[error("decoding conversation {id}: {source}")]
    Decode {
        id: Uuid,
        source: serde_json::Error,
    },
    #[error("{0}")]
    Lock(String),
}

/// Directory of conversation documents.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    dir: PathBuf,
}

impl ConversationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_of(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Load a conversation under the path lock.
    pub fn load(&self, id: Uuid) -> Result<ConversationRecord, StoreError> {
        let path = self.path_of(id);
        if !path.exists() {
            return Err(StoreError::NotFound(id));
        }
        let _lock = PathLock::acquire(&path).map_err(|e| StoreError::Lock(format!("{e:#}")))?;
        let text = std::fs::read_to_string(&path)?;
        let disk: DiskRecord =
            serde_json::from_str(&text).map_err(|source| StoreError::Decode { id, source })?;
        Ok(ConversationRecord {
            id,
            timestamp: disk.timestamp,
            messages: disk.messages,
            metadata: disk.metadata,
            memory: disk.memory,
            tasks: disk.tasks,
        })
    }

    /// Persist a conversation: filter boilerplate, write `<path>.tmp`, chmod
    /// 0600, rename over the original.  All under the path lock.
    pub fn save(&self, record: &ConversationRecord) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_of(record.id);
        let _lock = PathLock::acquire(&path).map_err(|e| StoreError::Lock(format!("{e:#}")))?;

        let disk = DiskRecord {
            timestamp: record.timestamp,
            messages: filter_boilerplate(&record.messages),
            metadata: record.metadata.clone(),
            memory: record.memory.clone(),
            tasks: record.tasks.clone(),
        };
        let body = serde_json::to_string_pretty(&disk).expect("conversation serializes");

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, body)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Conversation ids sorted oldest-first by modification time.
    pub fn list(&self) -> Result<Vec<Uuid>, StoreError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries: Vec<(std::time::SystemTime, Uuid)> = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if let Some(id) = parse_conversation_id(&path) {
                let modified = entry.metadata()?.modified()?;
                entries.push((modified, id));
            }
        }
        entries.sort_by_key(|(t, _)| *t);
        Ok(entries.into_iter().map(|(_, id)| id).collect())
    }
}

fn parse_conversation_id(path: &Path) -> Option<Uuid> {
    if path.extension()?.to_str()? != "json" {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

/// Strip boilerplate before persisting.
///
/// Kept: the agent-name system message, any compactor summary system
/// message, and every non-system message that is not a reasoning trace.
/// Dropped: all other system messages, and assistant messages whose content
/// begins with `<think>`.
pub fn filter_boilerplate(messages: &[Message]) -> Vec<Message> {
    messages
        .iter()
        .filter(|m| match m {
            Message::System { .. } => m.is_name_line() || m.is_summary_line(),
            Message::Assistant { content } => !content.trim_start().starts_with("<think>"),
            _ => true,
        })
        .cloned()
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
