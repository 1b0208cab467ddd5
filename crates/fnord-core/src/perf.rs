// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-request model-call timing and token accounting.
//!
//! Wrap each call in `begin` / `end`; `generate_report` groups requests by
//! `(model, reasoning)` and summarises counts, wall time, token totals,
//! throughput, and how response time scales with input size.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Mutex;
use std::time::Instant;

use fnord_config::ReasoningEffort;
use fnord_model::{ModelSpec, Usage};

#[derive(Debug, Clone)]
struct RequestRecord {
    model: String,
    reasoning: ReasoningEffort,
    wall_ms: u64,
    usage: Usage,
}

struct OpenRequest {
    model: String,
    reasoning: ReasoningEffort,
    start: Instant,
}

#[derive(Default)]
struct TrackerState {
    next_id: u64,
    open: HashMap<u64, OpenRequest>,
    done: Vec<RequestRecord>,
}

#[derive(Default)]
pub struct PerfTracker {
    state: Mutex<TrackerState>,
}

impl PerfTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start timing one model call.
    pub fn begin(&self, model: &ModelSpec) -> u64 {
        let mut state = self.state.lock().expect("perf tracker poisoned");
        let id = state.next_id;
        state.next_id += 1;
        state.open.insert(
            id,
            OpenRequest {
                model: model.id.clone(),
                reasoning: model.reasoning,
                start: Instant::now(),
            },
        );
        id
    }

    /// Finish timing.  `usage: None` records the request with zero tokens
    /// (tool-call turns carry no usage payload).
    pub fn end(&self, id: u64, usage: Option<Usage>) {
        let mut state = self.state.lock().expect("perf tracker poisoned");
        let Some(open) = state.open.remove(&id) else {
            return;
        };
        state.done.push(RequestRecord {
            model: open.model,
            reasoning: open.reasoning,
            wall_ms: open.start.elapsed().as_millis() as u64,
            usage: usage.unwrap_or_default(),
        });
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().expect("perf tracker poisoned").done.len()
    }

    /// Session-end report, one section per `(model, reasoning)` group.
    pub fn generate_report(&self) -> String {
        let state = self.state.lock().expect("perf tracker poisoned");
        if state.done.is_empty() {
            return "no model requests recorded".into();
        }

        let mut groups: HashMap<(String, ReasoningEffort), Vec<&RequestRecord>> = HashMap::new();
        for record in &state.done {
            groups
                .entry((record.model.clone(), record.reasoning))
                .or_default()
                .push(record);
        }

        let mut keys: Vec<_> = groups.keys().cloned().collect();
        keys.sort_by(|a, b| (format!("{}/{}", a.0, a.1)).cmp(&format!("{}/{}", b.0, b.1)));

        let mut out = String::from("model performance report\n");
        for key in keys {
            let records = &groups[&key];
            let (model, reasoning) = &key;
            let count = records.len();
            let total_ms: u64 = records.iter().map(|r| r.wall_ms).sum();
            let avg_ms = total_ms as f64 / count as f64;
            let input: u64 = records.iter().map(|r| r.usage.prompt_tokens).sum();
            let output: u64 = records.iter().map(|r| r.usage.completion_tokens).sum();
            let reasoning_tokens: u64 = records.iter().map(|r| r.usage.reasoning_tokens).sum();
            let throughput = if total_ms > 0 {
                output as f64 / (total_ms as f64 / 1000.0)
            } else {
                0.0
            };

            let _ = writeln!(out, "\n{model} (reasoning: {reasoning})");
            let _ = writeln!(out, "  requests:          {count}");
            let _ = writeln!(out, "  total wall time:   {:.1}s", total_ms as f64 / 1000.0);
            let _ = writeln!(out, "  avg response time: {avg_ms:.0}ms");
            let _ = writeln!(
                out,
                "  tokens:            {input} in / {output} out / {reasoning_tokens} reasoning"
            );
            let _ = writeln!(out, "  throughput:        {throughput:.1} tok/s");

            // Input-size scaling: <2k / 2-10k / >10k prompt tokens.
            let bucket_avg = |lo: u64, hi: u64| -> Option<(usize, f64)> {
                let in_bucket: Vec<&&RequestRecord> = records
                    .iter()
                    .filter(|r| r.usage.prompt_tokens >= lo && r.usage.prompt_tokens < hi)
                    .collect();
                if in_bucket.is_empty() {
                    return None;
                }
                let avg = in_bucket.iter().map(|r| r.wall_ms as f64).sum::<f64>()
                    / in_bucket.len() as f64;
                Some((in_bucket.len(), avg))
            };
            let buckets = [
                ("<2k", bucket_avg(0, 2_000)),
                ("2-10k", bucket_avg(2_000, 10_000)),
                (">10k", bucket_avg(10_000, u64::MAX)),
            ];
            let _ = writeln!(out, "  input-size scaling:");
            for (label, bucket) in &buckets {
                match bucket {
                    Some((n, avg)) => {
                        let _ = writeln!(out, "    {label:>6}: {n} requests, avg {avg:.0}ms");
                    }
                    None => {
                        let _ = writeln!(out, "    {label:>6}: no requests");
                    }
                }
            }
            for (i, j) in [(0, 1), (1, 2), (0, 2)] {
                if let (Some((_, a)), Some((_, b))) = (&buckets[i].1, &buckets[j].1) {
                    if *a > 0.0 {
                        let _ = writeln!(
                            out,
                            "    {} -> {}: {:.2}x",
                            buckets[i].0,
                            buckets[j].0,
                            b / a
                        );
                    }
                }
            }

            let points: Vec<(f64, f64)> = records
                .iter()
                .map(|r| (r.usage.prompt_tokens as f64, r.wall_ms as f64))
                .collect();
            match pearson(&points) {
                Some(r) => {
                    let _ = writeln!(out, "  input/time correlation: r = {r:.3}");
                }
                None => {
                    let _ = writeln!(out, "  input/time correlation: insufficient data");
                }
            }
        }
        out
    }
}

/// Pearson correlation over `(x, y)` points; `None` with fewer than two
/// points or zero variance in either axis.
fn pearson(points: &[(f64, f64)]) -> Option<f64> {
    let n = points.len() as f64;
    if points.len() < 2 {
        return None;
    }
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in points {
        let dx = x - mean_x;
        let dy = y - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x == 0.0 || var_y == 0.0 {
        return None;
    }
    Some(cov / (var_x.sqrt() * var_y.sqrt()))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
