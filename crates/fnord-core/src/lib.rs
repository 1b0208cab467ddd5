// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod accumulator;
mod compact;
mod driver;
mod names;
mod perf;

pub use accumulator::Accumulator;
pub use compact::{
    compaction_request, serialize_history, split_point, summary_message, tersify_request,
    COMPACTION_PROMPT, TERSIFY_PROMPT,
};
pub use driver::{
    CompactionStage, CompletionOpts, CompletionState, Driver, DriverError, FactSink,
};
pub use names::{NameError, NamePool, NameSource, SENTINEL_NAME};
pub use perf::PerfTracker;
