// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod approvals;
pub mod builtin;
pub mod registry;
pub mod tool;

pub use approvals::{
    ApprovalRequest, ApprovalScope, ApprovalsGate, Denial, PromptChoice, PromptOption, Prompter,
};
pub use builtin::notify::{memo_lines, NotifyTool};
pub use registry::{required_fields, ToolRegistry};
pub use tool::{Tool, ToolError, ToolResult};
