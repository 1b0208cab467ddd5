// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{ApiError, Completion, CompletionRequest, ModelClient, ToolCallRequest, Usage};

/// A pre-scripted mock client.  Each `complete` call pops the next scripted
/// result from the front of the queue, so tests specify exact completion
/// sequences — tool calls and typed errors included — without network access.
pub struct ScriptedMockClient {
    script: Arc<Mutex<Vec<Result<Completion, ApiError>>>>,
    /// Every request seen, in order, for post-hoc inspection.
    pub requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl ScriptedMockClient {
    pub fn new(script: Vec<Result<Completion, ApiError>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Convenience: a client that always returns one text reply.
    pub fn always_text(text: impl Into<String>, usage_tokens: u64) -> Self {
        Self::new(vec![Ok(Completion::Message {
            text: text.into(),
            usage: Usage {
                prompt_tokens: usage_tokens,
                total_tokens: usage_tokens,
                ..Default::default()
            },
        })])
    }

    /// Convenience: a tool-call round followed by a text reply.
    pub fn tool_then_text(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
        final_text: impl Into<String>,
        usage_tokens: u64,
    ) -> Self {
        Self::new(vec![
            Ok(Completion::ToolCalls(vec![ToolCallRequest {
                id: id.into(),
                name: name.into(),
                arguments: arguments.into(),
            }])),
            Ok(Completion::Message {
                text: final_text.into(),
                usage: Usage {
                    prompt_tokens: usage_tokens,
                    total_tokens: usage_tokens,
                    ..Default::default()
                },
            }),
        ])
    }

    /// Number of completion calls made so far.
    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Messages sent on the `n`-th call (panics when out of range).
    pub fn request_messages(&self, n: usize) -> Vec<crate::Message> {
        self.requests.lock().unwrap()[n].messages.clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedMockClient {
    async fn complete(&self, req: CompletionRequest) -> Result<Completion, ApiError> {
        self.requests.lock().unwrap().push(req);
        let mut script = self.script.lock().unwrap();
        if script.is_empty() {
            // Fallback once the script runs dry, so a test that loops too far
            // fails on content rather than hanging.
            return Ok(Completion::Message {
                text: "[no more scripted responses]".into(),
                usage: Usage::default(),
            });
        }
        script.remove(0)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
