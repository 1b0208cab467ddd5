// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod client;
mod mock;
mod tokenizer;
mod types;

pub use client::{ModelClient, OpenAiClient};
pub use mock::ScriptedMockClient;
pub use tokenizer::{chunk_chars, BpeCounter, CharCounter, TokenCounter};
pub use types::{
    ApiError, Completion, CompletionRequest, Message, ModelSpec, ToolCallRequest, Usage,
    NAME_LINE_PREFIX, SUMMARY_PREFIX,
};
