// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;

/// Typed failures from tool dispatch and execution.
///
/// Dispatch-level errors (`UnknownTool`, `MissingArgument`,
/// `InvalidArgument`) are fed back to the model as tool-response messages so
/// it can correct itself on the next turn; they never abort a conversation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("tool {0:?} was not found")]
    UnknownTool(String),
    #[error("required argument {0:?} is missing or empty")]
    MissingArgument(String),
    #[error("argument {0:?} is invalid")]
    InvalidArgument(String),
    #[error("tool exited with code {code}: {message}")]
    Exit { code: i32, message: String },
    #[error("{0}")]
    Failed(String),
}

pub type ToolResult = Result<String, ToolError>;

/// Contract every tool implements.
///
/// Tools must be pure with respect to their arguments (same args, same
/// externally observable effect) and must not retain references to the
/// completion state across calls.  Tools reporting `is_async() == true` may
/// run concurrently with peer async calls in the same batch; all others run
/// strictly one at a time.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// Opaque JSON schema describing the tool to the model, in the
    /// provider's `{type: "function", function: {...}}` shape.  The registry
    /// reads `function.parameters.required` out of it; everything else is
    /// forwarded verbatim.
    fn spec(&self) -> Value;

    /// Parse and normalize the raw argument JSON.  The default parses the
    /// string as a JSON object; tools override this to coerce or validate
    /// individual fields.
    fn read_args(&self, raw: &str) -> Result<Value, ToolError> {
        serde_json::from_str(raw).map_err(|_| ToolError::InvalidArgument("arguments".into()))
    }

    /// Execute with validated arguments.  The return value is forwarded to
    /// the model verbatim.
    async fn call(&self, args: &Value) -> ToolResult;

    /// Optional note describing the request, surfaced to the user when the
    /// call starts.
    fn on_request(&self, _args: &Value) -> Option<String> {
        None
    }

    /// Optional note derived from the result, surfaced after the call and
    /// offered to the notes coordinator.
    fn on_result(&self, _args: &Value, _result: &str) -> Option<String> {
        None
    }

    /// Whether this tool may run concurrently with peer async tools.
    fn is_async(&self) -> bool {
        false
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
