// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI-compatible chat completion client.
//!
//! One call, one answer: the driver sends the full message list plus tool
//! specs and receives either an assistant text reply, a batch of tool-call
//! requests, or a typed [`ApiError`].  Streaming is not used; the completion
//! loop consumes whole responses.
//!
//! Error bodies are decoded but message contents are never logged — only
//! status codes, token counts, and sanitized summaries reach the log.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::types::WireToolCall;
use crate::{ApiError, Completion, CompletionRequest, ToolCallRequest, Usage};

/// Environment variables consulted for the API key, first found wins.
const API_KEY_VARS: [&str; 2] = ["FNORD_OPENAI_API_KEY", "OPENAI_API_KEY"];

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Send one completion request.  Returns the model's reply or a typed
    /// error; never panics on provider garbage.
    async fn complete(&self, req: CompletionRequest) -> Result<Completion, ApiError>;
}

pub struct OpenAiClient {
    http: reqwest::Client,
    chat_url: String,
    api_key: String,
}

impl OpenAiClient {
    /// Construct a client against `base_url` (ending before
    /// `/chat/completions`).  A missing API key is a fatal startup error.
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let api_key = resolve_api_key().context(
            "no API key found; set FNORD_OPENAI_API_KEY or OPENAI_API_KEY",
        )?;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(Duration::from_secs(15))
            .build()
            .context("building HTTP client")?;
        let base = base_url.trim_end_matches('/');
        Ok(Self {
            http,
            chat_url: format!("{base}/chat/completions"),
            api_key,
        })
    }
}

fn resolve_api_key() -> Option<String> {
    API_KEY_VARS
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn complete(&self, req: CompletionRequest) -> Result<Completion, ApiError> {
        let mut body = json!({
            "model": req.model,
            "messages": req.messages,
        });
        if !req.tools.is_empty() {
            body["tools"] = Value::Array(req.tools.clone());
        }
        if let Some(format) = &req.response_format {
            body["response_format"] = format.clone();
        }
        if let Some(effort) = req.reasoning.wire_value() {
            body["reasoning_effort"] = json!(effort);
        }
        if let Some(verbosity) = req.verbosity {
            body["verbosity"] = json!(verbosity.wire_value());
        }
        if req.web_search {
            body["web_search_options"] = json!({});
        }

        debug!(
            model = %req.model,
            message_count = req.messages.len(),
            tool_count = req.tools.len(),
            "sending completion request"
        );

        let resp = self
            .http
            .post(&self.chat_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ApiError::Transport(sanitize_transport_error(&e)))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_http_error(status.as_u16(), &text));
        }

        let decoded: ChatResponse = resp
            .json()
            .await
            .map_err(|e| ApiError::Transport(format!("decoding response body: {e}")))?;
        completion_from_response(decoded)
    }
}

// ─── Response decoding ────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    reasoning_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

fn completion_from_response(resp: ChatResponse) -> Result<Completion, ApiError> {
    let usage = resp.usage.unwrap_or_default();
    let usage = Usage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        reasoning_tokens: usage.reasoning_tokens,
        total_tokens: usage.total_tokens,
    };
    let choice = resp.choices.into_iter().next().ok_or(ApiError::Http {
        status: 200,
        code: None,
        message: "response contained no choices".into(),
    })?;
    match choice.message.tool_calls {
        Some(calls) if !calls.is_empty() => Ok(Completion::ToolCalls(
            calls.into_iter().map(ToolCallRequest::from).collect(),
        )),
        _ => Ok(Completion::Message {
            text: choice.message.content.unwrap_or_default(),
            usage,
        }),
    }
}

// ─── Error classification ─────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    error: ErrorDetail,
}

#[derive(Deserialize, Default)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<String>,
}

/// Map an HTTP failure onto the typed error space.
///
/// 502/503/504 become [`ApiError::ApiUnavailable`]; a context-length error
/// (detected by provider code or message text) becomes
/// [`ApiError::ContextLengthExceeded`] carrying the parsed token count; all
/// other bodies are JSON-decoded into [`ApiError::Http`].
pub(crate) fn classify_http_error(status: u16, body: &str) -> ApiError {
    if matches!(status, 502 | 503 | 504) {
        return ApiError::ApiUnavailable;
    }
    let detail = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.error)
        .unwrap_or_else(|_| ErrorDetail {
            message: body.chars().take(500).collect(),
            code: None,
        });
    let looks_like_overflow = detail.code.as_deref() == Some("context_length_exceeded")
        || detail.message.contains("maximum context length")
        || detail.message.contains("resulted in") && detail.message.contains("tokens");
    if looks_like_overflow {
        return ApiError::ContextLengthExceeded {
            used: parse_used_tokens(&detail.message),
        };
    }
    ApiError::Http {
        status,
        code: detail.code,
        message: detail.message,
    }
}

/// Extract the used-token count from a provider context-length error.
///
/// The provider reports `"Your messages resulted in N tokens"`; the first
/// integer group of that phrase is the count.  Returns -1 when the phrase is
/// absent or malformed.
pub(crate) fn parse_used_tokens(message: &str) -> i64 {
    let re = regex::Regex::new(r"resulted in (\d+) tokens").expect("static regex");
    re.captures(message)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(-1)
}

fn sanitize_transport_error(e: &reqwest::Error) -> String {
    // reqwest errors may embed the full URL; keep only the failure class.
    if e.is_timeout() {
        "request timed out".into()
    } else if e.is_connect() {
        "connection failed".into()
    } else {
        "request failed".into()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
