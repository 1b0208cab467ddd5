// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Left fold over inputs too large for a model's context window.
//!
//! The input is consumed strictly left to right in budget-sized chunks.
//! Each step shows the model the running accumulated buffer plus the next
//! chunk and takes the reply as the updated buffer; a final clean-up call
//! turns the last buffer into the deliverable.  Inputs that fit one chunk
//! take the same path with a single fold step.

use std::sync::Arc;

use anyhow::{bail, Context};

use fnord_model::{
    chunk_chars, Completion, CompletionRequest, Message, ModelClient, ModelSpec, TokenCounter,
};

pub struct Accumulator {
    client: Arc<dyn ModelClient>,
    counter: Arc<dyn TokenCounter>,
    model: ModelSpec,
    /// Task framing sent as the system message of every step.
    prompt: String,
    /// The question the accumulated response must eventually answer.
    question: String,
    /// Fraction of the per-step budget actually used for chunk text.
    reduction_factor: f32,
    /// Instruction for the final clean-up call.
    final_prompt: String,
}

const DEFAULT_FINAL_PROMPT: &str = "The input has been fully processed. Rewrite the \
accumulated response below into its final form: coherent, deduplicated, and \
complete. Reply with the final text only.";

impl Accumulator {
    pub fn new(
        client: Arc<dyn ModelClient>,
        counter: Arc<dyn TokenCounter>,
        model: ModelSpec,
        prompt: impl Into<String>,
        question: impl Into<String>,
        reduction_factor: f32,
    ) -> Self {
        Self {
            client,
            counter,
            model,
            prompt: prompt.into(),
            question: question.into(),
            reduction_factor,
            final_prompt: DEFAULT_FINAL_PROMPT.into(),
        }
    }

    pub fn with_final_prompt(mut self, final_prompt: impl Into<String>) -> Self {
        self.final_prompt = final_prompt.into();
        self
    }

    /// Fold `input` through the model and return the deliverable.
    pub async fn process(&self, input: &str) -> anyhow::Result<String> {
        let mut buffer = String::new();
        let mut remaining = input;

        while !remaining.is_empty() {
            let chunk_len = self.chunk_budget_chars(&buffer)?;
            let (chunk, rest) = split_chars(remaining, chunk_len);
            remaining = rest;

            let step = self.step_message(&buffer, chunk);
            buffer = self
                .ask(step)
                .await
                .context("accumulator fold step failed")?;
        }

        let done = format!(
            "{final_prompt}\n\nQuestion:\n{question}\n\nAccumulated response:\n{buffer}",
            final_prompt = self.final_prompt,
            question = self.question,
        );
        self.ask(done).await.context("accumulator clean-up failed")
    }

    /// Per-step chunk budget in characters: the context window minus the
    /// running buffer, the question, and the prompt prefix.
    fn chunk_budget_chars(&self, buffer: &str) -> anyhow::Result<usize> {
        let overhead = self.counter.estimate_tokens(buffer)
            + self.counter.estimate_tokens(&self.question)
            + self.counter.estimate_tokens(&self.prompt);
        let budget_tokens = self.model.context_tokens.saturating_sub(overhead);
        let chars = chunk_chars(budget_tokens, self.reduction_factor);
        if chars == 0 {
            bail!(
                "accumulated response leaves no room for input chunks \
                 (context {} tokens, overhead {} tokens)",
                self.model.context_tokens,
                overhead
            );
        }
        Ok(chars)
    }

    fn step_message(&self, buffer: &str, chunk: &str) -> String {
        format!(
            "You are processing a large input one chunk at a time.\n\n\
             Question:\n{question}\n\n\
             Accumulated response so far:\n{buffer}\n\n\
             Next chunk of input:\n{chunk}\n\n\
             Reply with the updated accumulated response, folding in anything \
             relevant from this chunk. Reply with the accumulated response only.",
            question = self.question,
        )
    }

    async fn ask(&self, user_text: String) -> anyhow::Result<String> {
        let request = CompletionRequest {
            model: self.model.id.clone(),
            messages: vec![
                Message::system(self.prompt.clone()),
                Message::user(user_text),
            ],
            reasoning: self.model.reasoning,
            ..Default::default()
        };
        match self.client.complete(request).await? {
            Completion::Message { text, .. } => Ok(text),
            Completion::ToolCalls(_) => bail!("model requested tools during accumulation"),
        }
    }
}

/// Split at most `n` characters off the front, on a char boundary.
fn split_chars(s: &str, n: usize) -> (&str, &str) {
    match s.char_indices().nth(n) {
        Some((byte, _)) => s.split_at(byte),
        None => (s, ""),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
