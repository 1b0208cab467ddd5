// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod background;
mod memory;

pub use background::{
    start, FsStaleSource, IndexResult, Indexer, IndexerHandle, IndexerStats, ItemKind, StaleItem,
    StaleSource,
};
pub use memory::{
    validate_plan, ActionKind, LongTermStore, MemoryAction, MemoryAgent, MemoryIndexStats,
    MemoryIndexer,
};
