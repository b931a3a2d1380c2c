// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Bounded conversation memory with deduplication and cost-aware
//! summarization.
//!
//! Three size controls, cheapest first:
//! - **Dedup** at add-time drops a message identical to its predecessor.
//! - **Emergency truncation** fires when the log exceeds twice the hard cap;
//!   deterministic, no model call, always succeeds.
//! - **Summarization** runs opportunistically before each think step once the
//!   soft threshold is crossed: system messages and the recent tail survive
//!   verbatim, everything between collapses into one synthetic summary
//!   message produced by a cheap tool-free model call.

use lotus_config::MemorySettings;
use lotus_model::{sanitize, Message, Role, Router};
use tracing::{debug, warn};

/// Output cap requested for the summarization call.
const SUMMARY_MAX_TOKENS: u32 = 200;
/// Hard cap on the summary text kept in memory.
const SUMMARY_MAX_CHARS: usize = 500;
/// Per-message content prefix included in the summarization request.
const SUMMARY_SOURCE_PREFIX: usize = 200;

const SUMMARIZE_PROMPT: &str = "\
Summarise the following conversation history in a concise, information-dense \
way. Preserve goals, decisions, tool results, and constraints that matter for \
continuing the task. The summary replaces the original history.";

/// Stable prefix on the synthetic summary message, so later compactions and
/// readers can recognize it.
const SUMMARY_LABEL: &str = "[Conversation summary]";

#[derive(Debug)]
pub struct Memory {
    pub messages: Vec<Message>,
    max_messages: usize,
    summary_threshold: usize,
    keep_recent: usize,
}

impl Memory {
    pub fn new(settings: &MemorySettings) -> Self {
        Self {
            messages: Vec::new(),
            max_messages: settings.max_messages.max(1),
            summary_threshold: settings.summary_threshold.max(1),
            keep_recent: settings.keep_recent.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Append a message.
    ///
    /// A message equal to its predecessor in role and content — both free of
    /// tool calls — is dropped.  Tool-role messages are exempt so that every
    /// tool call keeps exactly one paired response.  If the log then exceeds
    /// twice the hard cap, it is emergency-truncated to all system messages
    /// plus the most recent `max_messages` others.
    pub fn add(&mut self, msg: Message) {
        if msg.role != Role::Tool {
            if let Some(last) = self.messages.last() {
                if last.role == msg.role
                    && last.content == msg.content
                    && !last.has_tool_calls()
                    && !msg.has_tool_calls()
                {
                    debug!(role = ?msg.role, "dropping duplicate adjacent message");
                    return;
                }
            }
        }
        self.messages.push(msg);

        if self.messages.len() > 2 * self.max_messages {
            self.emergency_truncate();
        }
    }

    fn emergency_truncate(&mut self) {
        let before = self.messages.len();
        let systems: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .cloned()
            .collect();
        let non_system: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned()
            .collect();
        let keep = self.max_messages.min(non_system.len());
        let tail = non_system[non_system.len() - keep..].to_vec();
        self.messages = systems;
        self.messages.extend(tail);
        warn!(before, after = self.messages.len(), "memory emergency-truncated");
    }

    /// Collapse old history into a single synthetic summary message.
    ///
    /// No-op until the log crosses `summary_threshold`.  On summarization
    /// failure the caller is never failed: the log falls back to a sliding
    /// window of system messages plus the recent tail.
    pub async fn summarize(&mut self, router: &Router) {
        if self.messages.len() <= self.summary_threshold {
            return;
        }

        let systems: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .cloned()
            .collect();
        let non_system: Vec<Message> = self
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned()
            .collect();
        if non_system.len() <= self.keep_recent {
            return;
        }

        // Walk the split point back so the preserved tail never begins with
        // an orphaned tool response: the whole call/response group must stay
        // on one side, or the serialized history references tool_call_ids
        // that no longer exist and strict providers reject it.
        let mut split = non_system.len() - self.keep_recent;
        while split > 0 && non_system[split].role == Role::Tool {
            split -= 1;
        }
        if split == 0 {
            return;
        }

        let prefix = &non_system[..split];
        let tail = non_system[split..].to_vec();
        let request = build_summary_request(prefix);

        match router
            .quick_ask(vec![Message::user(request)], Some(SUMMARY_MAX_TOKENS))
            .await
        {
            Ok(summary) if !summary.trim().is_empty() => {
                let capped: String = summary.trim().chars().take(SUMMARY_MAX_CHARS).collect();
                let before = self.messages.len();
                self.messages = systems;
                self.messages
                    .push(Message::assistant(format!("{SUMMARY_LABEL} {capped}")));
                self.messages.extend(tail);
                debug!(before, after = self.messages.len(), "memory summarized");
            }
            outcome => {
                if let Err(e) = outcome {
                    warn!(error = %e, "summarization failed; falling back to sliding window");
                } else {
                    warn!("summarization returned empty text; falling back to sliding window");
                }
                let keep = self.keep_recent.min(non_system.len());
                let tail = non_system[non_system.len() - keep..].to_vec();
                self.messages = systems;
                self.messages.extend(tail);
            }
        }
    }

    /// Provider-ready snapshot: a sanitized clone of the log.
    pub fn serialize(&self) -> Vec<Message> {
        self.messages
            .iter()
            .cloned()
            .map(sanitize::clean_message)
            .collect()
    }
}

/// Render the prefix into a compact text block for the summarization call:
/// content truncated to a modest prefix, tool-call turns replaced by their
/// tool names.
fn build_summary_request(prefix: &[Message]) -> String {
    let mut lines = Vec::with_capacity(prefix.len());
    for m in prefix {
        let role = match m.role {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
        };
        let body = if let Some(calls) = &m.tool_calls {
            let names: Vec<&str> = calls.iter().map(|c| c.function.name.as_str()).collect();
            format!("[tool_call: {}]", names.join(", "))
        } else {
            m.text().chars().take(SUMMARY_SOURCE_PREFIX).collect()
        };
        lines.push(format!("{role}: {body}"));
    }
    format!("{SUMMARIZE_PROMPT}\n\n---\n\n{}", lines.join("\n"))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
