// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::{Tool, ToolResult};

/// Shows a short status message to the user.
///
/// Messages may carry explicit memos for the project notes: lines beginning
/// with `note to self:` or `remember:` (case-insensitive) are extracted
/// verbatim as high-priority facts via [`Tool::on_result`].
pub struct NotifyTool;

#[async_trait]
impl Tool for NotifyTool {
    fn name(&self) -> &str {
        "notify"
    }

    fn spec(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": "notify",
                "description": "Show a short status message to the user. Lines starting \
                                with 'note to self:' or 'remember:' are saved to the \
                                project notes.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "message": {
                            "type": "string",
                            "description": "The message to display"
                        }
                    },
                    "required": ["message"]
                }
            }
        })
    }

    fn is_async(&self) -> bool {
        true
    }

    async fn call(&self, args: &Value) -> ToolResult {
        let message = args["message"].as_str().unwrap_or_default();
        info!(target: "fnord::notify", "{message}");
        Ok("displayed".into())
    }

    fn on_result(&self, args: &Value, _result: &str) -> Option<String> {
        let message = args["message"].as_str()?;
        let memos = memo_lines(message);
        if memos.is_empty() {
            None
        } else {
            Some(memos.join("\n"))
        }
    }
}

/// Extract memo lines from a notification message, verbatim.
pub fn memo_lines(message: &str) -> Vec<String> {
    message
        .lines()
        .map(str::trim_start)
        .filter(|line| {
            let lower = line.to_lowercase();
            lower.starts_with("note to self:") || lower.starts_with("remember:")
        })
        .map(String::from)
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
