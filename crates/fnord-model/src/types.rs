use serde::{Deserialize, Serialize};

use fnord_config::{ModelConfig, ReasoningEffort, Verbosity};

/// Prefix of the agent-name system message kept at position 0 of every
/// conversation.
pub const NAME_LINE_PREFIX: &str = "Your name is ";

/// Prefix of the compactor-produced summary system message.  Survives
/// boilerplate filtering on persist.
pub const SUMMARY_PREFIX: &str = "Summary of conversation and research thus far";

// ─── Messages ─────────────────────────────────────────────────────────────────

/// A single tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallRequest {
    /// Opaque identifier from the model, forwarded verbatim.
    pub id: String,
    pub name: String,
    /// JSON-encoded argument object.
    pub arguments: String,
}

/// One message in a conversation.
///
/// Crosses the wire and the disk as OpenAI-shaped JSON; the variant is
/// recovered from `role` plus the presence of `tool_calls` / `tool_call_id`.
/// Unknown wire fields are ignored on input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage", into = "WireMessage")]
pub enum Message {
    System { content: String },
    User { content: String },
    Assistant { content: String },
    ToolCalls { tool_calls: Vec<ToolCallRequest> },
    ToolResponse {
        tool_call_id: String,
        name: String,
        content: String,
    },
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self::System { content: text.into() }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::User { content: text.into() }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Assistant { content: text.into() }
    }

    pub fn tool_calls(calls: Vec<ToolCallRequest>) -> Self {
        Self::ToolCalls { tool_calls: calls }
    }

    pub fn tool_response(
        id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::ToolResponse {
            tool_call_id: id.into(),
            name: name.into(),
            content: content.into(),
        }
    }

    /// Plain text of this message, when it carries any.
    pub fn text(&self) -> Option<&str> {
        match self {
            Message::System { content }
            | Message::User { content }
            | Message::Assistant { content }
            | Message::ToolResponse { content, .. } => Some(content),
            Message::ToolCalls { .. } => None,
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Message::System { .. })
    }

    /// True for the `"Your name is <name>."` system message.
    pub fn is_name_line(&self) -> bool {
        matches!(self, Message::System { content } if content.starts_with(NAME_LINE_PREFIX))
    }

    /// True for a compactor-produced summary system message.
    pub fn is_summary_line(&self) -> bool {
        matches!(self, Message::System { content } if content.starts_with(SUMMARY_PREFIX))
    }

    /// Character count used by the chars/4 token estimate.
    pub fn char_len(&self) -> usize {
        match self {
            Message::System { content }
            | Message::User { content }
            | Message::Assistant { content }
            | Message::ToolResponse { content, .. } => content.len(),
            Message::ToolCalls { tool_calls } => tool_calls
                .iter()
                .map(|c| c.name.len() + c.arguments.len())
                .sum(),
        }
    }
}

// ─── Wire representation ──────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WireToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: WireFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WireFunction {
    pub name: String,
    pub arguments: String,
}

fn function_kind() -> String {
    "function".into()
}

impl From<WireToolCall> for ToolCallRequest {
    fn from(w: WireToolCall) -> Self {
        Self {
            id: w.id,
            name: w.function.name,
            arguments: w.function.arguments,
        }
    }
}

impl From<&ToolCallRequest> for WireToolCall {
    fn from(c: &ToolCallRequest) -> Self {
        Self {
            id: c.id.clone(),
            kind: "function".into(),
            function: WireFunction {
                name: c.name.clone(),
                arguments: c.arguments.clone(),
            },
        }
    }
}

impl From<Message> for WireMessage {
    fn from(m: Message) -> Self {
        match m {
            Message::System { content } => WireMessage {
                role: "system".into(),
                content: Some(content),
                tool_calls: None,
                tool_call_id: None,
                name: None,
            },
            Message::User { content } => WireMessage {
                role: "user".into(),
                content: Some(content),
                tool_calls: None,
                tool_call_id: None,
                name: None,
            },
            Message::Assistant { content } => WireMessage {
                role: "assistant".into(),
                content: Some(content),
                tool_calls: None,
                tool_call_id: None,
                name: None,
            },
            Message::ToolCalls { tool_calls } => WireMessage {
                role: "assistant".into(),
                // Explicit null content: the assistant turn carries only calls.
                content: None,
                tool_calls: Some(tool_calls.iter().map(WireToolCall::from).collect()),
                tool_call_id: None,
                name: None,
            },
            Message::ToolResponse {
                tool_call_id,
                name,
                content,
            } => WireMessage {
                role: "tool".into(),
                content: Some(content),
                tool_calls: None,
                tool_call_id: Some(tool_call_id),
                name: Some(name),
            },
        }
    }
}

impl TryFrom<WireMessage> for Message {
    type Error = String;

    fn try_from(w: WireMessage) -> Result<Self, Self::Error> {
        match w.role.as_str() {
            "system" => Ok(Message::System {
                content: w.content.unwrap_or_default(),
            }),
            "user" => Ok(Message::User {
                content: w.content.unwrap_or_default(),
            }),
            "assistant" => match w.tool_calls {
                Some(calls) if !calls.is_empty() => Ok(Message::ToolCalls {
                    tool_calls: calls.into_iter().map(ToolCallRequest::from).collect(),
                }),
                _ => Ok(Message::Assistant {
                    content: w.content.unwrap_or_default(),
                }),
            },
            "tool" => Ok(Message::ToolResponse {
                tool_call_id: w
                    .tool_call_id
                    .ok_or_else(|| "tool message without tool_call_id".to_string())?,
                name: w.name.unwrap_or_default(),
                content: w.content.unwrap_or_default(),
            }),
            other => Err(format!("unknown message role: {other:?}")),
        }
    }
}

// ─── Model descriptor ─────────────────────────────────────────────────────────

/// Everything the driver needs to know about a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub id: String,
    pub context_tokens: usize,
    #[serde(default)]
    pub reasoning: ReasoningEffort,
    pub verbosity: Option<Verbosity>,
}

impl From<&ModelConfig> for ModelSpec {
    fn from(cfg: &ModelConfig) -> Self {
        Self {
            id: cfg.name.clone(),
            context_tokens: cfg.context_tokens,
            reasoning: cfg.reasoning,
            verbosity: cfg.verbosity,
        }
    }
}

// ─── Completion results ───────────────────────────────────────────────────────

/// Token usage from one completed request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub reasoning_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// Outcome of one model call.
#[derive(Debug, Clone)]
pub enum Completion {
    /// Assistant text reply.
    Message { text: String, usage: Usage },
    /// The model wants tools invoked.
    ToolCalls(Vec<ToolCallRequest>),
}

/// Typed failures from the model API.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// The request exceeded the model's context window.  `used` is the token
    /// count parsed from the provider's error body, or -1 when unparseable.
    #[error("context length exceeded ({used} tokens used)")]
    ContextLengthExceeded { used: i64 },
    /// HTTP 502/503/504 — the caller may retry later.
    #[error("model API temporarily unavailable")]
    ApiUnavailable,
    /// Any other non-2xx response, with the provider's decoded error body.
    #[error("model API error {status}: {message}")]
    Http {
        status: u16,
        code: Option<String>,
        message: String,
    },
    #[error("transport error: {0}")]
    Transport(String),
}

/// One completion request as handed to a [`crate::ModelClient`].
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    /// Tool specs forwarded verbatim (each already in the provider's
    /// `{type: "function", function: {...}}` shape).
    pub tools: Vec<serde_json::Value>,
    pub response_format: Option<serde_json::Value>,
    pub reasoning: ReasoningEffort,
    pub verbosity: Option<Verbosity>,
    pub web_search: bool,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Construction ─────────────────────────────────────────────────────────

    #[test]
    fn user_message_has_text() {
        let m = Message::user("hello");
        assert_eq!(m.text(), Some("hello"));
        assert!(!m.is_system());
    }

    #[test]
    fn tool_calls_message_has_no_text() {
        let m = Message::tool_calls(vec![ToolCallRequest {
            id: "a".into(),
            name: "echo".into(),
            arguments: "{}".into(),
        }]);
        assert!(m.text().is_none());
    }

    #[test]
    fn name_line_is_detected() {
        assert!(Message::system("Your name is Slartibartfast.").is_name_line());
        assert!(!Message::system("You are a research agent.").is_name_line());
        assert!(!Message::user("Your name is nobody.").is_name_line());
    }

    #[test]
    fn summary_line_is_detected() {
        let m = Message::system(format!("{SUMMARY_PREFIX}: we looked at the parser."));
        assert!(m.is_summary_line());
    }

    // ── Wire round-trips ──────────────────────────────────────────────────────

    #[test]
    fn user_round_trips_through_json() {
        let m = Message::user("payload");
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains(r#""role":"user""#));
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn tool_calls_serialise_with_null_content() {
        let m = Message::tool_calls(vec![ToolCallRequest {
            id: "call_1".into(),
            name: "grep".into(),
            arguments: r#"{"pattern":"x"}"#.into(),
        }]);
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains(r#""content":null"#));
        assert!(json.contains(r#""type":"function""#));
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn tool_response_round_trips() {
        let m = Message::tool_response("call_1", "grep", "3 matches");
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains(r#""tool_call_id":"call_1""#));
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn assistant_without_tool_calls_is_text_variant() {
        let json = r#"{"role":"assistant","content":"hi"}"#;
        let m: Message = serde_json::from_str(json).unwrap();
        assert_eq!(m, Message::assistant("hi"));
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let json = r#"{"role":"user","content":"x","refusal":null,"annotations":[]}"#;
        let m: Message = serde_json::from_str(json).unwrap();
        assert_eq!(m, Message::user("x"));
    }

    #[test]
    fn unknown_role_is_rejected() {
        let json = r#"{"role":"narrator","content":"x"}"#;
        assert!(serde_json::from_str::<Message>(json).is_err());
    }

    #[test]
    fn tool_message_without_call_id_is_rejected() {
        let json = r#"{"role":"tool","content":"x"}"#;
        assert!(serde_json::from_str::<Message>(json).is_err());
    }

    // ── char_len ──────────────────────────────────────────────────────────────

    #[test]
    fn char_len_counts_content() {
        assert_eq!(Message::user("12345678").char_len(), 8);
    }

    #[test]
    fn char_len_counts_call_name_and_args() {
        let m = Message::tool_calls(vec![ToolCallRequest {
            id: "i".into(),
            name: "aaaa".into(),
            arguments: "bbbbbbbb".into(),
        }]);
        assert_eq!(m.char_len(), 12);
    }

    // ── ModelSpec ─────────────────────────────────────────────────────────────

    #[test]
    fn model_spec_from_config() {
        let cfg = fnord_config::ModelConfig::default();
        let spec = ModelSpec::from(&cfg);
        assert_eq!(spec.id, cfg.name);
        assert_eq!(spec.context_tokens, cfg.context_tokens);
    }
}
