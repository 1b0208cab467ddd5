// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub driver: DriverConfig,
    #[serde(default)]
    pub notes: NotesConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub names: NamePoolConfig,
    /// Currently selected project.  Project-scoped approvals and the
    /// per-project notes file are keyed by this name.
    #[serde(default)]
    pub project: Option<String>,
}

/// Reasoning effort hint forwarded to the model API for models that accept
/// one.  `None` means the model has no reasoning control and no effort field
/// is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    #[default]
    None,
    Minimal,
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    /// Wire value for the `reasoning_effort` request field, or `None` when
    /// the model does not take an effort hint.
    pub fn wire_value(&self) -> Option<&'static str> {
        match self {
            ReasoningEffort::None => None,
            ReasoningEffort::Minimal => Some("minimal"),
            ReasoningEffort::Low => Some("low"),
            ReasoningEffort::Medium => Some("medium"),
            ReasoningEffort::High => Some("high"),
        }
    }
}

impl std::fmt::Display for ReasoningEffort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReasoningEffort::None => write!(f, "none"),
            ReasoningEffort::Minimal => write!(f, "minimal"),
            ReasoningEffort::Low => write!(f, "low"),
            ReasoningEffort::Medium => write!(f, "medium"),
            ReasoningEffort::High => write!(f, "high"),
        }
    }
}

/// Output verbosity hint for models that accept one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Low,
    Medium,
    High,
}

impl Verbosity {
    pub fn wire_value(&self) -> &'static str {
        match self {
            Verbosity::Low => "low",
            Verbosity::Medium => "medium",
            Verbosity::High => "high",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model name forwarded to the provider API.
    pub name: String,
    /// Context window in tokens.  Drives compaction thresholds and the
    /// accumulator's chunk budget.
    #[serde(default = "default_context_tokens")]
    pub context_tokens: usize,
    /// Reasoning effort hint; `none` for models without reasoning control.
    #[serde(default)]
    pub reasoning: ReasoningEffort,
    /// Output verbosity hint; omitted from requests when not set.
    pub verbosity: Option<Verbosity>,
    /// API base URL ending before `/chat/completions`.
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

fn default_context_tokens() -> usize {
    128_000
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "gpt-4o".into(),
            context_tokens: default_context_tokens(),
            reasoning: ReasoningEffort::None,
            verbosity: None,
            base_url: default_base_url(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_keep_rounds() -> usize {
    5
}
fn default_compact_pct() -> f32 {
    0.80
}
fn default_workers() -> usize {
    8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Enable proactive context compaction after each completed turn.
    #[serde(default = "default_true")]
    pub compact: bool,
    /// Number of recent non-system messages preserved verbatim by compaction.
    #[serde(default = "default_keep_rounds")]
    pub keep_rounds: usize,
    /// Fraction of the context window that triggers (and targets) compaction.
    #[serde(default = "default_compact_pct")]
    pub target_pct: f32,
    /// Worker budget for concurrent async tool calls and tersification.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Route user messages and tool results into the notes coordinator.
    #[serde(default = "default_true")]
    pub archive_notes: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            compact: true,
            keep_rounds: default_keep_rounds(),
            target_pct: default_compact_pct(),
            workers: default_workers(),
            archive_notes: true,
        }
    }
}

fn default_notes_retries() -> u32 {
    2
}
fn default_reduction_factor() -> f32 {
    0.5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotesConfig {
    /// Retry budget for consolidation and extraction calls.
    #[serde(default = "default_notes_retries")]
    pub retries: u32,
    /// Fraction of the context window the accumulator leaves for each chunk.
    #[serde(default = "default_reduction_factor")]
    pub reduction_factor: f32,
}

impl Default for NotesConfig {
    fn default() -> Self {
        Self {
            retries: default_notes_retries(),
            reduction_factor: default_reduction_factor(),
        }
    }
}

fn default_conversation_cap() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Maximum conversations indexed per session.  Bounds embedding cost on
    /// the first run over a large project; must stay finite.
    #[serde(default = "default_conversation_cap")]
    pub conversation_cap: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            conversation_cap: default_conversation_cap(),
        }
    }
}

fn default_name_chunk() -> usize {
    8
}
fn default_alloc_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamePoolConfig {
    /// Names allocated per generator call.  Defaults to the worker budget.
    #[serde(default = "default_name_chunk")]
    pub chunk_size: usize,
    /// Per-allocation timeout for the external name generator.
    #[serde(default = "default_alloc_timeout_secs")]
    pub allocation_timeout_secs: u64,
}

impl Default for NamePoolConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_name_chunk(),
            allocation_timeout_secs: default_alloc_timeout_secs(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
