// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use fnord_config::{Config, SettingsStore};
use fnord_core::{CompletionOpts, Driver, DriverError, NamePool, NameSource, PerfTracker};
use fnord_index::{FsStaleSource, IndexResult, Indexer};
use fnord_model::{
    CharCounter, Completion, CompletionRequest, Message, ModelClient, ModelSpec, OpenAiClient,
    TokenCounter,
};
use fnord_notes::{AccumulatorConsolidator, ClientExtractor, NotesCoordinator, NotesHandle};
use fnord_store::{ConversationRecord, ConversationStore};
use fnord_tools::{
    ApprovalRequest, ApprovalsGate, NotifyTool, PromptChoice, PromptOption, Prompter, ToolRegistry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = fnord_config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Ask {
            question,
            conversation,
            project,
            web_search,
            perf_report,
        } => run_ask(config, question, conversation, project, web_search, perf_report).await,
        Commands::Conversations { limit } => list_conversations(limit),
        Commands::ConsolidateNotes { project } => consolidate_notes(config, project).await,
        Commands::ShowConfig => {
            println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_env("FNORD_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

// ─── ask ──────────────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn run_ask(
    config: Config,
    question: String,
    conversation: Option<uuid::Uuid>,
    project: Option<String>,
    web_search: bool,
    perf_report: bool,
) -> anyhow::Result<()> {
    let project = project.or_else(|| config.project.clone());
    let model_spec = ModelSpec::from(&config.model);
    let client: Arc<dyn ModelClient> = Arc::new(OpenAiClient::new(&config.model.base_url)?);
    let counter: Arc<dyn TokenCounter> = Arc::new(CharCounter);

    let mut registry = ToolRegistry::new();
    registry.register(NotifyTool);
    let registry = Arc::new(registry);

    // Conversation server.
    let store = ConversationStore::new(conversations_dir()?);
    let record = match conversation {
        Some(id) => store
            .load(id)
            .with_context(|| format!("loading conversation {id}"))?,
        None => ConversationRecord::new(),
    };
    let conversation_id = record.id;
    let server = fnord_store::spawn(store.clone(), record);
    server.append_msg(Message::user(&question)).await?;

    // Notes coordinator.
    let notes = spawn_notes(&config, project.as_deref(), &client, &counter, &model_spec)?;
    notes.ingest_user_message(&question);

    // Web search is an outward-facing action; broker consent first.
    let web_search = web_search && confirm_web_search(project.as_deref()).await;

    let perf = Arc::new(PerfTracker::new());
    let names = Arc::new(NamePool::new(
        Arc::new(ModelNameSource {
            client: Arc::clone(&client),
            model: model_spec.clone(),
        }),
        config.names.chunk_size,
        Duration::from_secs(config.names.allocation_timeout_secs),
    ));

    // Background indexer works through stale files while the driver runs.
    let indexer = config.indexer.enabled.then(|| {
        fnord_index::start(
            Arc::new(FsStaleSource::new(".", index_stamp_path(project.as_deref()))),
            Arc::new(ModelIndexer {
                client: Arc::clone(&client),
                model: model_spec.clone(),
            }),
            config.indexer.conversation_cap,
        )
    });

    let driver = Driver::new(
        Arc::clone(&client),
        registry,
        counter,
        model_spec,
        config.driver.clone(),
    )
    .with_conversation(server.clone())
    .with_facts(Arc::new(notes.clone()))
    .with_names(names)
    .with_perf(Arc::clone(&perf));

    let opts = CompletionOpts {
        web_search,
        archive_notes: config.driver.archive_notes,
        ..Default::default()
    };
    let outcome = driver.get(opts).await;

    match &outcome {
        Ok(state) => println!("{}", state.response.as_deref().unwrap_or_default()),
        Err(DriverError::Terminal(state)) => {
            eprintln!(
                "fnord: {}",
                state.response.as_deref().unwrap_or("completion failed")
            );
        }
        Err(e) => eprintln!("fnord: {e}"),
    }

    server.save().await?;
    if let Err(e) = notes.commit().await {
        tracing::warn!("notes commit failed: {e}");
    }
    if let Some(indexer) = indexer {
        indexer.stop();
        indexer.wait().await;
    }
    if perf_report {
        eprintln!("{}", perf.generate_report());
    }

    tracing::info!(%conversation_id, "conversation saved");
    if outcome.is_err() {
        std::process::exit(1);
    }
    Ok(())
}

async fn confirm_web_search(project: Option<&str>) -> bool {
    let project_store = project.map(|_| SettingsStore::project(std::path::Path::new(".")));
    let global_store = SettingsStore::global().ok();
    let gate = ApprovalsGate::new(Arc::new(CliPrompter), project_store, global_store);
    let request = ApprovalRequest {
        tag: "web.search".into(),
        subject: "model-side web search".into(),
        message: "Allow the model to search the web for this question?".into(),
        detail: "Search queries derived from your question will be sent to the provider's \
                 search backend."
            .into(),
        persistent: true,
    };
    match gate.confirm(&request).await {
        Ok(()) => true,
        Err(denial) => {
            eprintln!("fnord: web search disabled: {denial}");
            false
        }
    }
}

// ─── conversations ────────────────────────────────────────────────────────────

fn list_conversations(limit: usize) -> anyhow::Result<()> {
    let store = ConversationStore::new(conversations_dir()?);
    for id in store.list()?.into_iter().rev().take(limit) {
        match store.load(id) {
            Ok(record) => {
                let first_user = record
                    .messages
                    .iter()
                    .find_map(|m| match m {
                        Message::User { content } => Some(content.as_str()),
                        _ => None,
                    })
                    .unwrap_or("(empty)");
                let preview: String = first_user.chars().take(72).collect();
                println!("{}  {}  {}", record.timestamp.format("%Y-%m-%d %H:%M"), id, preview);
            }
            Err(e) => eprintln!("fnord: unreadable conversation {id}: {e}"),
        }
    }
    Ok(())
}

// ─── consolidate-notes ────────────────────────────────────────────────────────

async fn consolidate_notes(config: Config, project: Option<String>) -> anyhow::Result<()> {
    let project = project.or_else(|| config.project.clone());
    let model_spec = ModelSpec::from(&config.model);
    let client: Arc<dyn ModelClient> = Arc::new(OpenAiClient::new(&config.model.base_url)?);
    let counter: Arc<dyn TokenCounter> = Arc::new(CharCounter);
    let notes = spawn_notes(&config, project.as_deref(), &client, &counter, &model_spec)?;
    notes.consolidate().await?;
    println!("notes consolidated");
    Ok(())
}

// ─── Wiring helpers ───────────────────────────────────────────────────────────

fn spawn_notes(
    config: &Config,
    project: Option<&str>,
    client: &Arc<dyn ModelClient>,
    counter: &Arc<dyn TokenCounter>,
    model: &ModelSpec,
) -> anyhow::Result<NotesHandle> {
    Ok(NotesCoordinator::spawn(
        notes_path(project)?,
        Arc::new(ClientExtractor::new(Arc::clone(client), model.clone())),
        Arc::new(AccumulatorConsolidator::new(
            Arc::clone(client),
            Arc::clone(counter),
            model.clone(),
            config.notes.reduction_factor,
        )),
        config.notes.retries,
    ))
}

fn fnord_home() -> anyhow::Result<PathBuf> {
    let home = dirs::home_dir().context("cannot resolve home directory")?;
    Ok(home.join(".fnord"))
}

fn conversations_dir() -> anyhow::Result<PathBuf> {
    Ok(fnord_home()?.join("conversations"))
}

fn notes_path(project: Option<&str>) -> anyhow::Result<PathBuf> {
    match project {
        Some(name) => Ok(fnord_home()?.join("projects").join(name).join("notes.md")),
        None => Ok(PathBuf::from(".fnord/notes.md")),
    }
}

fn index_stamp_path(project: Option<&str>) -> PathBuf {
    match notes_path(project) {
        Ok(notes) => notes.with_file_name(".index-stamp"),
        Err(_) => PathBuf::from(".fnord/.index-stamp"),
    }
}

// ─── Interactive approval prompt ──────────────────────────────────────────────

struct CliPrompter;

#[async_trait]
impl Prompter for CliPrompter {
    fn interactive(&self) -> bool {
        std::io::stdin().is_terminal()
    }

    async fn ask(
        &self,
        req: &ApprovalRequest,
        options: &[PromptOption],
    ) -> anyhow::Result<PromptChoice> {
        let message = req.message.clone();
        let detail = req.detail.clone();
        let options = options.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut err = std::io::stderr();
            writeln!(err, "\n{message}")?;
            if !detail.is_empty() {
                writeln!(err, "{detail}")?;
            }
            for (i, option) in options.iter().enumerate() {
                writeln!(err, "  {}. {}", i + 1, option.label())?;
            }
            write!(err, "> ")?;
            err.flush()?;

            let mut line = String::new();
            std::io::stdin().read_line(&mut line)?;
            let choice = line
                .trim()
                .parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .and_then(|i| options.get(i))
                .copied();
            match choice {
                Some(PromptOption::Once) => Ok(PromptChoice::Once),
                Some(PromptOption::Session) => Ok(PromptChoice::Session),
                Some(PromptOption::Project) => Ok(PromptChoice::Project),
                Some(PromptOption::Global) => Ok(PromptChoice::Global),
                Some(PromptOption::Deny) | None => Ok(PromptChoice::Deny),
                Some(PromptOption::DenyWithFeedback) => {
                    write!(err, "feedback> ")?;
                    err.flush()?;
                    let mut feedback = String::new();
                    std::io::stdin().read_line(&mut feedback)?;
                    Ok(PromptChoice::DenyWithFeedback(feedback.trim().to_string()))
                }
            }
        })
        .await?
    }
}

// ─── Model-backed name generation ─────────────────────────────────────────────

struct ModelNameSource {
    client: Arc<dyn ModelClient>,
    model: ModelSpec,
}

#[async_trait]
impl NameSource for ModelNameSource {
    async fn generate(&self, count: usize) -> anyhow::Result<Vec<String>> {
        let request = CompletionRequest {
            model: self.model.id.clone(),
            messages: vec![
                Message::system(
                    "You generate whimsical two-word agent display names, one per line. \
                     No numbering, no commentary.",
                ),
                Message::user(format!("Generate {count} names.")),
            ],
            ..Default::default()
        };
        match self.client.complete(request).await? {
            Completion::Message { text, .. } => Ok(text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect()),
            Completion::ToolCalls(_) => anyhow::bail!("name generator returned tool calls"),
        }
    }
}

// ─── Model-backed indexing ────────────────────────────────────────────────────

struct ModelIndexer {
    client: Arc<dyn ModelClient>,
    model: ModelSpec,
}

impl ModelIndexer {
    async fn ask(&self, system: &str, content: &str) -> anyhow::Result<String> {
        let request = CompletionRequest {
            model: self.model.id.clone(),
            messages: vec![
                Message::system(system.to_string()),
                Message::user(content.to_string()),
            ],
            ..Default::default()
        };
        match self.client.complete(request).await? {
            Completion::Message { text, .. } => Ok(text),
            Completion::ToolCalls(_) => anyhow::bail!("indexer call returned tool calls"),
        }
    }
}

#[async_trait]
impl Indexer for ModelIndexer {
    async fn index(&self, content: &str) -> anyhow::Result<IndexResult> {
        let summary = self
            .ask("Summarise this file in a short paragraph.", content)
            .await?;
        let outline = self
            .ask(
                "Produce a structural outline of this file: one line per \
                 top-level definition or section.",
                content,
            )
            .await?;
        // Embeddings come from a dedicated backend when one is configured;
        // without one the entry is indexed with summary and outline only.
        Ok(IndexResult {
            summary,
            outline,
            embeddings: Vec::new(),
        })
    }
}
