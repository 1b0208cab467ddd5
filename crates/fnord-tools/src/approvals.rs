// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-`(tag, subject)` user consent with four persistence scopes.
//!
//! Lookup order is session set, then project settings, then global settings;
//! any hit approves without prompting.  Otherwise the user is prompted
//! through a [`Prompter`], which tests replace with a scripted
//! implementation.  Prompting is serialised: the gate's state lock is held
//! across the prompt so two tool calls can never interleave their dialogs.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use fnord_config::SettingsStore;

/// One consent question.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    /// Action class, e.g. `"fs.write"` or `"shell"`.
    pub tag: String,
    /// The specific object of the action, e.g. a path or command line.
    pub subject: String,
    /// Short user-facing question.
    pub message: String,
    /// Longer context shown beneath the question.
    pub detail: String,
    /// Whether persistent scopes (project/global) are offered.
    pub persistent: bool,
}

/// Options offered in the interactive prompt.  Labels are distinct and
/// stable for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptOption {
    Once,
    Session,
    Project,
    Global,
    Deny,
    DenyWithFeedback,
}

impl PromptOption {
    pub fn label(&self) -> &'static str {
        match self {
            PromptOption::Once => "approve once",
            PromptOption::Session => "approve for this session",
            PromptOption::Project => "approve for this project",
            PromptOption::Global => "approve globally",
            PromptOption::Deny => "deny",
            PromptOption::DenyWithFeedback => "deny with feedback",
        }
    }
}

/// The user's answer.
#[derive(Debug, Clone)]
pub enum PromptChoice {
    Once,
    Session,
    Project,
    Global,
    Deny,
    DenyWithFeedback(String),
}

/// Persistence scope for a recorded approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalScope {
    Session,
    Project,
    Global,
}

/// Why a confirmation was refused.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Denial {
    #[error("user denied {tag} on {subject:?}")]
    Denied { tag: String, subject: String },
    #[error("user denied with feedback: {feedback}")]
    WithFeedback { feedback: String },
    #[error("cannot prompt for {tag} on {subject:?}: no interactive terminal")]
    NonInteractive { tag: String, subject: String },
}

/// Presents approval questions to the user.
#[async_trait]
pub trait Prompter: Send + Sync {
    /// False when no TTY is attached; the gate then auto-denies.
    fn interactive(&self) -> bool;

    async fn ask(
        &self,
        req: &ApprovalRequest,
        options: &[PromptOption],
    ) -> anyhow::Result<PromptChoice>;
}

struct GateState {
    session: HashSet<(String, String)>,
    /// Process-lifetime bypasses recorded via `enable_auto_approval`.
    auto: HashSet<(String, String)>,
}

/// The approvals gate.  One per process; shared via `Arc`.
pub struct ApprovalsGate {
    state: Mutex<GateState>,
    prompter: Arc<dyn Prompter>,
    project_store: Option<SettingsStore>,
    global_store: Option<SettingsStore>,
}

impl ApprovalsGate {
    pub fn new(
        prompter: Arc<dyn Prompter>,
        project_store: Option<SettingsStore>,
        global_store: Option<SettingsStore>,
    ) -> Self {
        Self {
            state: Mutex::new(GateState {
                session: HashSet::new(),
                auto: HashSet::new(),
            }),
            prompter,
            project_store,
            global_store,
        }
    }

    /// Record a process-lifetime bypass: all later `confirm` calls on this
    /// exact `(tag, subject)` succeed without prompting, TTY or not.
    pub async fn enable_auto_approval(&self, tag: &str, subject: &str) {
        self.state
            .lock()
            .await
            .auto
            .insert((tag.to_string(), subject.to_string()));
    }

    /// Record an approval at the given scope.  Project and global scopes are
    /// written through to their settings stores before returning.
    pub async fn approve(
        &self,
        scope: ApprovalScope,
        tag: &str,
        subject: &str,
    ) -> anyhow::Result<()> {
        match scope {
            ApprovalScope::Session => {
                self.state
                    .lock()
                    .await
                    .session
                    .insert((tag.to_string(), subject.to_string()));
                Ok(())
            }
            ApprovalScope::Project => match &self.project_store {
                Some(store) => store.add_approval(tag, subject),
                None => anyhow::bail!("no project selected; cannot record a project approval"),
            },
            ApprovalScope::Global => match &self.global_store {
                Some(store) => store.add_approval(tag, subject),
                None => anyhow::bail!("no global settings store configured"),
            },
        }
    }

    /// Membership test across all scopes, without prompting.
    pub async fn is_approved(&self, tag: &str, subject: &str) -> bool {
        let key = (tag.to_string(), subject.to_string());
        {
            let state = self.state.lock().await;
            if state.auto.contains(&key) || state.session.contains(&key) {
                return true;
            }
        }
        self.store_approved(tag, subject)
    }

    fn store_approved(&self, tag: &str, subject: &str) -> bool {
        for store in [self.project_store.as_ref(), self.global_store.as_ref()]
            .into_iter()
            .flatten()
        {
            match store.load() {
                Ok(settings) if settings.is_approved(tag, subject) => return true,
                Ok(_) => {}
                Err(e) => warn!(path = %store.path().display(), "unreadable settings store: {e:#}"),
            }
        }
        false
    }

    /// Broker one consent question.
    ///
    /// Pre-approved keys short-circuit.  Without a TTY the answer is a
    /// descriptive denial.  Otherwise the prompt options depend on
    /// `persistent` and on whether a project is selected; `project` and
    /// `global` answers are persisted before this returns.
    pub async fn confirm(&self, req: &ApprovalRequest) -> Result<(), Denial> {
        let key = (req.tag.clone(), req.subject.clone());

        // Hold the lock across the prompt so concurrent confirms serialise.
        let mut state = self.state.lock().await;
        if state.auto.contains(&key) || state.session.contains(&key) {
            return Ok(());
        }
        if self.store_approved(&req.tag, &req.subject) {
            return Ok(());
        }

        if !self.prompter.interactive() {
            return Err(Denial::NonInteractive {
                tag: req.tag.clone(),
                subject: req.subject.clone(),
            });
        }

        let mut options = vec![PromptOption::Once, PromptOption::Session];
        if req.persistent {
            if self.project_store.is_some() {
                options.push(PromptOption::Project);
            }
            options.push(PromptOption::Global);
        }
        options.push(PromptOption::Deny);
        options.push(PromptOption::DenyWithFeedback);

        let choice = match self.prompter.ask(req, &options).await {
            Ok(c) => c,
            Err(e) => {
                warn!(tag = %req.tag, "approval prompt failed: {e:#}");
                return Err(Denial::Denied {
                    tag: req.tag.clone(),
                    subject: req.subject.clone(),
                });
            }
        };

        match choice {
            PromptChoice::Once => Ok(()),
            PromptChoice::Session => {
                state.session.insert(key);
                Ok(())
            }
            PromptChoice::Project => {
                let store = self.project_store.as_ref().ok_or_else(|| Denial::Denied {
                    tag: req.tag.clone(),
                    subject: req.subject.clone(),
                })?;
                store.add_approval(&req.tag, &req.subject).map_err(|e| {
                    warn!("recording project approval failed: {e:#}");
                    Denial::Denied {
                        tag: req.tag.clone(),
                        subject: req.subject.clone(),
                    }
                })?;
                Ok(())
            }
            PromptChoice::Global => {
                let store = self.global_store.as_ref().ok_or_else(|| Denial::Denied {
                    tag: req.tag.clone(),
                    subject: req.subject.clone(),
                })?;
                store.add_approval(&req.tag, &req.subject).map_err(|e| {
                    warn!("recording global approval failed: {e:#}");
                    Denial::Denied {
                        tag: req.tag.clone(),
                        subject: req.subject.clone(),
                    }
                })?;
                Ok(())
            }
            PromptChoice::Deny => Err(Denial::Denied {
                tag: req.tag.clone(),
                subject: req.subject.clone(),
            }),
            PromptChoice::DenyWithFeedback(feedback) => Err(Denial::WithFeedback { feedback }),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
