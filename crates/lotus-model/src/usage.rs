// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Token and cost accounting, aggregated per provider for one session.
//!
//! The tracker is per-agent and updated by the router on every successful
//! completion.  On shutdown the session is appended to a JSON file with the
//! schema `{ "sessions": [...], "cumulative": {...} }`.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::Usage;

// Flat per-token estimate; scaled by the provider's cost_score.
const INPUT_COST_PER_MTOK: f64 = 0.05;
const OUTPUT_COST_PER_MTOK: f64 = 0.10;

/// Aggregated usage for one provider (or the session total).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub provider: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub requests: u64,
    pub estimated_cost: f64,
}

impl UsageRecord {
    fn add(&mut self, usage: Usage, cost_score: f32) {
        self.input_tokens += usage.prompt_tokens;
        self.output_tokens += usage.completion_tokens;
        self.requests += 1;
        self.estimated_cost += estimate_cost(usage, cost_score);
    }
}

fn estimate_cost(usage: Usage, cost_score: f32) -> f64 {
    let base = usage.prompt_tokens as f64 * INPUT_COST_PER_MTOK / 1_000_000.0
        + usage.completion_tokens as f64 * OUTPUT_COST_PER_MTOK / 1_000_000.0;
    base * cost_score as f64
}

#[derive(Debug)]
pub struct UsageTracker {
    enabled: bool,
    session_start: DateTime<Utc>,
    per_provider: BTreeMap<String, UsageRecord>,
}

impl UsageTracker {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            session_start: Utc::now(),
            per_provider: BTreeMap::new(),
        }
    }

    /// Attribute one successful completion to `provider`.
    pub fn record(&mut self, provider: &str, cost_score: f32, usage: Usage) {
        if !self.enabled {
            return;
        }
        self.per_provider
            .entry(provider.to_string())
            .or_insert_with(|| UsageRecord {
                provider: provider.to_string(),
                ..Default::default()
            })
            .add(usage, cost_score);
    }

    pub fn records(&self) -> impl Iterator<Item = &UsageRecord> {
        self.per_provider.values()
    }

    pub fn totals(&self) -> UsageRecord {
        let mut total = UsageRecord {
            provider: "all".into(),
            ..Default::default()
        };
        for r in self.per_provider.values() {
            total.input_tokens += r.input_tokens;
            total.output_tokens += r.output_tokens;
            total.requests += r.requests;
            total.estimated_cost += r.estimated_cost;
        }
        total
    }

    /// One-line human summary for shutdown output.
    pub fn summary(&self) -> String {
        let t = self.totals();
        let providers: Vec<String> = self
            .per_provider
            .values()
            .map(|r| format!("{}: {} req", r.provider, r.requests))
            .collect();
        format!(
            "usage: {} requests, {} in / {} out tokens, ~${:.4} ({})",
            t.requests,
            t.input_tokens,
            t.output_tokens,
            t.estimated_cost,
            providers.join(", ")
        )
    }

    /// Append this session to the usage file.  A no-op when tracking is
    /// disabled or nothing was recorded.  An unreadable existing file is
    /// replaced rather than failing the shutdown path.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if !self.enabled || self.per_provider.is_empty() {
            return Ok(());
        }

        let mut file: UsageFile = match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "usage file unreadable; starting fresh");
                UsageFile::default()
            }),
            Err(_) => UsageFile::default(),
        };

        let session = SessionRecord {
            start_ts: self.session_start,
            per_provider: self.per_provider.clone(),
            totals: self.totals(),
        };
        file.cumulative.provider = "all".into();
        file.cumulative.input_tokens += session.totals.input_tokens;
        file.cumulative.output_tokens += session.totals.output_tokens;
        file.cumulative.requests += session.totals.requests;
        file.cumulative.estimated_cost += session.totals.estimated_cost;
        file.sessions.push(session);

        let text = serde_json::to_string_pretty(&file)?;
        std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UsageFile {
    #[serde(default)]
    sessions: Vec<SessionRecord>,
    #[serde(default)]
    cumulative: UsageRecord,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionRecord {
    start_ts: DateTime<Utc>,
    per_provider: BTreeMap<String, UsageRecord>,
    totals: UsageRecord,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
