// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(
    name = "fnord",
    about = "AI-powered code research assistant",
    version
)]
pub struct Cli {
    /// Explicit config file, merged over the discovered layers
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr (RUST_LOG-style filters via FNORD_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ask a question about the current project
    Ask {
        /// The research question
        question: String,
        /// Continue an existing conversation
        #[arg(long)]
        conversation: Option<Uuid>,
        /// Select the project (notes and project-scoped approvals)
        #[arg(long)]
        project: Option<String>,
        /// Let the model use provider-side web search (asks for approval)
        #[arg(long)]
        web_search: bool,
        /// Print the performance report at exit
        #[arg(long)]
        perf_report: bool,
    },
    /// List stored conversations, oldest first
    Conversations {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Collapse and consolidate the project notes now
    ConsolidateNotes {
        #[arg(long)]
        project: Option<String>,
    },
    /// Print the effective configuration
    ShowConfig,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ask_with_options() {
        let cli = Cli::parse_from([
            "fnord",
            "ask",
            "where is the parser?",
            "--project",
            "demo",
            "--web-search",
        ]);
        match cli.command {
            Commands::Ask {
                question,
                project,
                web_search,
                conversation,
                ..
            } => {
                assert_eq!(question, "where is the parser?");
                assert_eq!(project.as_deref(), Some("demo"));
                assert!(web_search);
                assert!(conversation.is_none());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_conversations_default_limit() {
        let cli = Cli::parse_from(["fnord", "conversations"]);
        match cli.command {
            Commands::Conversations { limit } => assert_eq!(limit, 20),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_conversation_id() {
        let result = Cli::try_parse_from(["fnord", "ask", "q", "--conversation", "not-a-uuid"]);
        assert!(result.is_err());
    }
}
