// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::{Tool, ToolError, ToolResult};

/// Central registry holding all available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Specs for all registered tools, sorted by name for a stable request
    /// body across turns.
    pub fn specs(&self) -> Vec<Value> {
        let mut entries: Vec<(String, Value)> = self
            .tools
            .values()
            .map(|t| (t.name().to_string(), t.spec()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.into_iter().map(|(_, spec)| spec).collect()
    }

    /// The spec of a single tool, if registered.
    pub fn spec_of(&self, name: &str) -> Option<Value> {
        self.tools.get(name).map(|t| t.spec())
    }

    /// Whether the named tool may run concurrently with peer async calls.
    /// Unknown tools report `false` so dispatch errors surface serially.
    pub fn is_async(&self, name: &str) -> bool {
        self.tools.get(name).map(|t| t.is_async()).unwrap_or(false)
    }

    /// Dispatch one tool call through the validation pipeline:
    ///
    /// 1. resolve the tool by name;
    /// 2. `read_args` parses and normalizes the raw JSON;
    /// 3. every name in the spec's `required` list must be present, non-null,
    ///    and non-empty;
    /// 4. `call` runs and its result is forwarded verbatim.
    pub async fn perform(&self, name: &str, raw_args: &str) -> ToolResult {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        let args = tool.read_args(raw_args)?;

        for key in required_fields(&tool.spec()) {
            match args.get(&key) {
                None | Some(Value::Null) => return Err(ToolError::MissingArgument(key)),
                Some(Value::String(s)) if s.is_empty() => {
                    return Err(ToolError::MissingArgument(key))
                }
                Some(_) => {}
            }
        }

        tool.call(&args).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract required argument names from a tool spec.
///
/// Looks for `function.parameters.required` first (the provider wire shape),
/// then a top-level `parameters.required`, then a bare `required` array.
pub fn required_fields(spec: &Value) -> Vec<String> {
    let required = spec
        .pointer("/function/parameters/required")
        .or_else(|| spec.pointer("/parameters/required"))
        .or_else(|| spec.get("required"));
    required
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
