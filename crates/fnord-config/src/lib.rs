// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod globals;
pub mod loader;
pub mod schema;
pub mod settings;

pub use globals::{Globals, ScopeHandle};
pub use loader::load;
pub use schema::{
    Config, DriverConfig, IndexerConfig, ModelConfig, NamePoolConfig, NotesConfig,
    ReasoningEffort, Verbosity,
};
pub use settings::{Settings, SettingsStore};
