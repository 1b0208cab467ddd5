// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The completion driver: the loop that alternates between model calls and
//! tool-call execution until the model produces a text answer.
//!
//! Responsibilities beyond the basic loop:
//! - user interrupts are injected before every model call and after every
//!   round of tool results, never dropped, never preemptive;
//! - duplicate tool calls within one batch run once;
//! - async-declared tools run concurrently within a bounded worker budget,
//!   sync tools strictly one at a time, and every executed call is appended
//!   as an adjacent request/response pair;
//! - context overflow walks an explicit escalation ladder: forced
//!   compaction, then per-message tersification, then a terminal error;
//! - dispatch errors become tool-response messages the model can react to,
//!   and unexpected internal failures surface as completion errors instead
//!   of crashing the conversation server.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tracing::{info, warn};

use fnord_config::DriverConfig;
use fnord_model::{
    ApiError, Completion, CompletionRequest, Message, ModelClient, ModelSpec, TokenCounter,
    ToolCallRequest, NAME_LINE_PREFIX,
};
use fnord_store::ConversationHandle;
use fnord_tools::{ToolError, ToolRegistry};

use crate::compact::{
    compaction_request, serialize_history, split_point, summary_message, tersify_request,
};
use crate::names::{NamePool, SENTINEL_NAME};
use crate::perf::PerfTracker;

/// How many escalation rounds the overflow ladder has taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompactionStage {
    #[default]
    Intact,
    Compacted,
    Tersified,
}

/// Consumes facts extracted from the conversation as it runs.  The notes
/// coordinator implements this; sends are fire-and-forget so tool dispatch
/// never blocks on note-taking.
pub trait FactSink: Send + Sync {
    fn user_message(&self, text: &str);
    fn tool_result(&self, func: &str, args_json: &str, result: &str);
}

/// Transient per-request state.  Built from the conversation server at the
/// start of `get`, discarded when it returns.
#[derive(Debug, Clone)]
pub struct CompletionState {
    pub model: ModelSpec,
    pub messages: Vec<Message>,
    pub usage_tokens: i64,
    pub tool_call_requests: Vec<ToolCallRequest>,
    pub response: Option<String>,
    pub compaction_stage: CompactionStage,
    pub archive_notes: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The loop ended without a usable reply; `state.response` carries the
    /// rendered error.
    #[error("completion failed: {}", .0.response.as_deref().unwrap_or("unknown error"))]
    Terminal(Box<CompletionState>),
    /// Context overflow with compaction disabled; the caller decides.
    #[error("context length exceeded ({used} tokens used)")]
    ContextLength { used: i64 },
}

/// Options for one `get` call.
#[derive(Debug, Clone, Default)]
pub struct CompletionOpts {
    /// Seed messages, used only when no conversation server is attached.
    pub messages: Vec<Message>,
    /// Agent display name; checked out from the name pool when absent.
    pub agent_name: Option<String>,
    pub response_format: Option<Value>,
    pub web_search: bool,
    pub archive_notes: bool,
}

pub struct Driver {
    client: Arc<dyn ModelClient>,
    tools: Arc<ToolRegistry>,
    counter: Arc<dyn TokenCounter>,
    config: DriverConfig,
    model: ModelSpec,
    conversation: Option<ConversationHandle>,
    facts: Option<Arc<dyn FactSink>>,
    names: Option<Arc<NamePool>>,
    perf: Option<Arc<PerfTracker>>,
}

enum LoopEnd {
    Done,
    Terminal,
    ContextOverflow { used: i64 },
}

impl Driver {
    pub fn new(
        client: Arc<dyn ModelClient>,
        tools: Arc<ToolRegistry>,
        counter: Arc<dyn TokenCounter>,
        model: ModelSpec,
        config: DriverConfig,
    ) -> Self {
        Self {
            client,
            tools,
            counter,
            config,
            model,
            conversation: None,
            facts: None,
            names: None,
            perf: None,
        }
    }

    pub fn with_conversation(mut self, handle: ConversationHandle) -> Self {
        self.conversation = Some(handle);
        self
    }

    pub fn with_facts(mut self, sink: Arc<dyn FactSink>) -> Self {
        self.facts = Some(sink);
        self
    }

    pub fn with_names(mut self, pool: Arc<NamePool>) -> Self {
        self.names = Some(pool);
        self
    }

    pub fn with_perf(mut self, perf: Arc<PerfTracker>) -> Self {
        self.perf = Some(perf);
        self
    }

    /// Run the completion loop to a text answer.
    ///
    /// At every suspension point `state.messages` is a valid message
    /// sequence: each tool response is adjacent to its request.
    pub async fn get(&self, opts: CompletionOpts) -> Result<CompletionState, DriverError> {
        let mut state = CompletionState {
            model: self.model.clone(),
            messages: opts.messages,
            usage_tokens: 0,
            tool_call_requests: Vec::new(),
            response: None,
            compaction_stage: CompactionStage::Intact,
            archive_notes: opts.archive_notes,
        };

        if let Some(conversation) = &self.conversation {
            match conversation.get_messages().await {
                Ok(messages) => state.messages = messages,
                Err(e) => {
                    state.response = Some(render_internal_error(&format!("{e:#}")));
                    return Err(DriverError::Terminal(Box::new(state)));
                }
            }
        }

        if let Err(e) = self.ensure_name_line(&mut state, opts.agent_name).await {
            state.response = Some(render_internal_error(&format!("{e:#}")));
            return Err(DriverError::Terminal(Box::new(state)));
        }

        let run = std::panic::AssertUnwindSafe(self.run_loop(
            &mut state,
            opts.response_format,
            opts.web_search,
        ))
        .catch_unwind()
        .await;

        match run {
            Ok(Ok(LoopEnd::Done)) => Ok(state),
            Ok(Ok(LoopEnd::Terminal)) => Err(DriverError::Terminal(Box::new(state))),
            Ok(Ok(LoopEnd::ContextOverflow { used })) => Err(DriverError::ContextLength { used }),
            Ok(Err(e)) => {
                // Unexpected internal failure: surface it as a completion
                // error shaped like an HTTP 500 rather than tearing down the
                // conversation server.
                state.response = Some(render_internal_error(&format!("{e:#}")));
                Err(DriverError::Terminal(Box::new(state)))
            }
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<String>()
                    .map(String::as_str)
                    .or_else(|| panic.downcast_ref::<&str>().copied())
                    .unwrap_or("panic in completion driver");
                state.response = Some(render_internal_error(detail));
                Err(DriverError::Terminal(Box::new(state)))
            }
        }
    }

    async fn run_loop(
        &self,
        state: &mut CompletionState,
        response_format: Option<Value>,
        web_search: bool,
    ) -> anyhow::Result<LoopEnd> {
        loop {
            self.inject_interrupts(state).await?;

            let completion = self
                .call_model(state, response_format.clone(), web_search)
                .await;

            match completion {
                Ok(Completion::Message { text, usage }) => {
                    self.append(state, Message::assistant(&text)).await?;
                    state.usage_tokens = usage.total_tokens as i64;
                    state.response = Some(text);
                    self.maybe_compact(state).await?;
                    return Ok(LoopEnd::Done);
                }
                Ok(Completion::ToolCalls(calls)) => {
                    state.tool_call_requests = calls.clone();
                    self.handle_tool_calls(state, calls).await?;
                    state.tool_call_requests.clear();
                    self.inject_interrupts(state).await?;
                }
                Err(ApiError::ContextLengthExceeded { used }) => {
                    state.usage_tokens = used;
                    if !self.config.compact {
                        return Ok(LoopEnd::ContextOverflow { used });
                    }
                    if let Some(end) = self.escalate(state).await? {
                        return Ok(end);
                    }
                }
                Err(ApiError::ApiUnavailable) => {
                    state.response = Some(
                        "the model API is temporarily unavailable (upstream 502/503/504); \
                         please retry in a moment"
                            .into(),
                    );
                    return Ok(LoopEnd::Terminal);
                }
                Err(e @ ApiError::Http { .. }) | Err(e @ ApiError::Transport(_)) => {
                    state.response = Some(e.to_string());
                    return Ok(LoopEnd::Terminal);
                }
            }
        }
    }

    // ── Model call ────────────────────────────────────────────────────────────

    async fn call_model(
        &self,
        state: &CompletionState,
        response_format: Option<Value>,
        web_search: bool,
    ) -> Result<Completion, ApiError> {
        let req = CompletionRequest {
            model: state.model.id.clone(),
            messages: state.messages.clone(),
            tools: self.tools.specs(),
            response_format,
            reasoning: state.model.reasoning,
            verbosity: state.model.verbosity,
            web_search,
        };
        let perf_id = self.perf.as_ref().map(|p| p.begin(&state.model));
        let result = self.client.complete(req).await;
        if let Some(id) = perf_id {
            let usage = match &result {
                Ok(Completion::Message { usage, .. }) => Some(*usage),
                _ => None,
            };
            self.perf.as_ref().expect("perf id implies tracker").end(id, usage);
        }
        result
    }

    // ── Interrupts ────────────────────────────────────────────────────────────

    /// Drain queued user interrupts into the message list, in order.  Runs
    /// before each model call and after each round of tool results.
    async fn inject_interrupts(&self, state: &mut CompletionState) -> anyhow::Result<()> {
        let Some(conversation) = &self.conversation else {
            return Ok(());
        };
        let drained = conversation.drain_interrupts().await?;
        for msg in drained {
            info!("your message will be seen after the current step completes");
            state.messages.push(msg);
        }
        Ok(())
    }

    // ── Name line ─────────────────────────────────────────────────────────────

    /// Ensure the `"Your name is <name>."` system message sits at position 0.
    /// An existing name line anywhere in the history is retained as-is.
    async fn ensure_name_line(
        &self,
        state: &mut CompletionState,
        supplied: Option<String>,
    ) -> anyhow::Result<()> {
        if state.messages.iter().any(Message::is_name_line) {
            return Ok(());
        }
        let name = match supplied {
            Some(name) => name,
            None => match &self.names {
                Some(pool) => {
                    let name = pool.checkout().await?;
                    if let Some(conversation) = &self.conversation {
                        pool.associate(&name, &conversation.id().to_string()).await;
                    }
                    name
                }
                None => SENTINEL_NAME.to_string(),
            },
        };
        let line = Message::system(format!("{NAME_LINE_PREFIX}{name}."));
        state.messages.insert(0, line.clone());
        if let Some(conversation) = &self.conversation {
            conversation.replace_msgs(state.messages.clone()).await?;
        }
        Ok(())
    }

    // ── Tool-call handling ────────────────────────────────────────────────────

    async fn handle_tool_calls(
        &self,
        state: &mut CompletionState,
        calls: Vec<ToolCallRequest>,
    ) -> anyhow::Result<()> {
        let deduped = dedup_calls(calls);

        let (async_calls, sync_calls): (Vec<_>, Vec<_>) = deduped
            .iter()
            .cloned()
            .partition(|c| self.tools.is_async(&c.name));

        // Async batch: concurrent within the worker budget.  Results land in
        // a map; emission below re-establishes input order.
        let workers = self.config.workers.max(1);
        let mut results: HashMap<String, Result<String, ToolError>> =
            futures::stream::iter(async_calls.into_iter().map(|call| {
                let tools = Arc::clone(&self.tools);
                async move {
                    let result = tools.perform(&call.name, &call.arguments).await;
                    (call.id.clone(), result)
                }
            }))
            .buffer_unordered(workers)
            .collect()
            .await;

        // Sync batch: strictly one at a time.
        for call in sync_calls {
            let result = self.tools.perform(&call.name, &call.arguments).await;
            results.insert(call.id.clone(), result);
        }

        // Emit each executed call as an adjacent request/response pair, in
        // the order the model sent them.
        for call in deduped {
            let outcome = results
                .remove(&call.id)
                .unwrap_or_else(|| Err(ToolError::Failed("tool produced no result".into())));
            let content = match &outcome {
                Ok(text) => text.clone(),
                Err(err) => self.render_tool_error(&call, err),
            };

            self.append(state, Message::tool_calls(vec![call.clone()]))
                .await?;
            self.append(
                state,
                Message::tool_response(&call.id, &call.name, &content),
            )
            .await?;

            if state.archive_notes {
                if let (Some(facts), Ok(text)) = (&self.facts, &outcome) {
                    facts.tool_result(&call.name, &call.arguments, text);
                }
            }
        }
        Ok(())
    }

    /// Render a dispatch error so the model can correct itself: the message
    /// names the parameter, repeats the argument JSON verbatim, and restates
    /// the canonical tool spec.
    fn render_tool_error(&self, call: &ToolCallRequest, err: &ToolError) -> String {
        let args = &call.arguments;
        let reminder = match self.tools.spec_of(&call.name) {
            Some(spec) => format!(
                "The canonical spec for '{}' is:\n{}",
                call.name,
                serde_json::to_string_pretty(&spec).unwrap_or_default()
            ),
            None => format!(
                "Available tools are: {}.",
                self.tools.names().join(", ")
            ),
        };
        match err {
            ToolError::UnknownTool(name) => format!(
                "tool '{name}' was not found. The arguments were: {args}. {reminder}"
            ),
            ToolError::MissingArgument(key) => format!(
                "required argument '{key}' was missing, empty, or null. \
                 The arguments were: {args}. {reminder}"
            ),
            ToolError::InvalidArgument(key) => format!(
                "argument '{key}' was invalid. The arguments were: {args}. {reminder}"
            ),
            ToolError::Exit { code, message } => format!(
                "the tool exited with code {code}: {message}. \
                 The arguments were: {args}. {reminder}"
            ),
            ToolError::Failed(message) => format!(
                "tool execution failed: {message}. The arguments were: {args}."
            ),
        }
    }

    // ── Compaction & the overflow ladder ──────────────────────────────────────

    /// Proactive compaction after a completed turn: fires past 80% of the
    /// context window, targets the same fraction, keeps the most recent
    /// rounds verbatim.  A failed compaction leaves the state untouched.
    async fn maybe_compact(&self, state: &mut CompletionState) -> anyhow::Result<()> {
        if !self.config.compact || state.usage_tokens <= 0 {
            return Ok(());
        }
        let used_pct = state.usage_tokens as f32 / state.model.context_tokens as f32;
        if used_pct <= self.config.target_pct {
            return Ok(());
        }
        if !self.compact_state(state).await? {
            warn!("compaction skipped; keeping original conversation");
        }
        Ok(())
    }

    /// One compaction round: summarise everything but the preserved tail into
    /// a single canonical summary message.  Returns false (state unchanged)
    /// when there is nothing to summarise or the summary call fails.
    async fn compact_state(&self, state: &mut CompletionState) -> anyhow::Result<bool> {
        let name_line = state.messages.iter().find(|m| m.is_name_line()).cloned();
        let prior_summary = state
            .messages
            .iter()
            .find(|m| m.is_summary_line())
            .and_then(|m| m.text())
            .map(String::from);

        let non_system: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| !m.is_system())
            .cloned()
            .collect();
        let split = split_point(&non_system, self.config.keep_rounds);
        if split == 0 {
            return Ok(false);
        }

        let history_text = serialize_history(&non_system[..split]);
        let request = CompletionRequest {
            model: state.model.id.clone(),
            messages: compaction_request(prior_summary.as_deref(), &history_text),
            reasoning: state.model.reasoning,
            ..Default::default()
        };

        let summary = match self.client.complete(request).await {
            Ok(Completion::Message { text, .. }) if !text.is_empty() => text,
            Ok(_) => {
                warn!("compaction call returned no usable summary");
                return Ok(false);
            }
            Err(e) => {
                warn!("compaction call failed: {e}");
                return Ok(false);
            }
        };

        let mut rebuilt = Vec::with_capacity(non_system.len() - split + 2);
        if let Some(line) = name_line {
            rebuilt.push(line);
        }
        rebuilt.push(summary_message(&summary));
        rebuilt.extend_from_slice(&non_system[split..]);

        state.messages = rebuilt;
        state.usage_tokens = self.counter.estimate_messages(&state.messages) as i64;
        if let Some(conversation) = &self.conversation {
            conversation.replace_msgs(state.messages.clone()).await?;
        }
        Ok(true)
    }

    /// Last-ditch pass: paraphrase every non-system textual message shorter,
    /// concurrently, then recompute usage from estimated tokens.
    async fn tersify_state(&self, state: &mut CompletionState) -> anyhow::Result<()> {
        let targets: Vec<(usize, String)> = state
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| !m.is_system())
            .filter_map(|(i, m)| m.text().map(|t| (i, t.to_string())))
            .collect();

        let workers = self.config.workers.max(1);
        let replacements: Vec<(usize, Option<String>)> =
            futures::stream::iter(targets.into_iter().map(|(i, content)| {
                let client = Arc::clone(&self.client);
                let model = state.model.id.clone();
                async move {
                    let request = CompletionRequest {
                        model,
                        messages: tersify_request(&content),
                        ..Default::default()
                    };
                    let shorter = match client.complete(request).await {
                        Ok(Completion::Message { text, .. }) if !text.is_empty() => Some(text),
                        _ => None,
                    };
                    (i, shorter)
                }
            }))
            .buffer_unordered(workers)
            .collect()
            .await;

        for (i, shorter) in replacements {
            let Some(shorter) = shorter else { continue };
            match &mut state.messages[i] {
                Message::User { content }
                | Message::Assistant { content }
                | Message::ToolResponse { content, .. } => *content = shorter,
                _ => {}
            }
        }

        state.usage_tokens = self.counter.estimate_messages(&state.messages) as i64;
        if let Some(conversation) = &self.conversation {
            conversation.replace_msgs(state.messages.clone()).await?;
        }
        Ok(())
    }

    /// Advance the overflow ladder one stage.  Returns `Some(end)` when the
    /// ladder is exhausted.
    async fn escalate(&self, state: &mut CompletionState) -> anyhow::Result<Option<LoopEnd>> {
        match state.compaction_stage {
            CompactionStage::Intact => {
                state.compaction_stage = CompactionStage::Compacted;
                if !self.compact_state(state).await? {
                    warn!("forced compaction made no progress; escalation continues");
                }
                Ok(None)
            }
            CompactionStage::Compacted => {
                state.compaction_stage = CompactionStage::Tersified;
                self.tersify_state(state).await?;
                Ok(None)
            }
            CompactionStage::Tersified => {
                state.response = Some(
                    "conversation is too large to handle even after aggressive \
                     compaction and tersification"
                        .into(),
                );
                Ok(Some(LoopEnd::Terminal))
            }
        }
    }

    // ── Plumbing ──────────────────────────────────────────────────────────────

    /// Append to the local state and mirror into the conversation server.
    async fn append(&self, state: &mut CompletionState, msg: Message) -> anyhow::Result<()> {
        if let Some(conversation) = &self.conversation {
            conversation.append_msg(msg.clone()).await?;
        }
        state.messages.push(msg);
        Ok(())
    }
}

fn render_internal_error(detail: &str) -> String {
    format!("internal error (HTTP 500): {detail}")
}

/// Drop later calls whose `(name, canonical arguments)` duplicate an earlier
/// call in the same batch.  Canonicalization parses the JSON and
/// re-serialises it with sorted keys; unparseable arguments compare as raw
/// strings.
fn dedup_calls(calls: Vec<ToolCallRequest>) -> Vec<ToolCallRequest> {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    calls
        .into_iter()
        .filter(|call| seen.insert(fingerprint(call)))
        .collect()
}

fn fingerprint(call: &ToolCallRequest) -> (String, String) {
    let canonical = serde_json::from_str::<Value>(&call.arguments)
        .map(|v| v.to_string())
        .unwrap_or_else(|_| call.arguments.clone());
    (call.name.clone(), canonical)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
