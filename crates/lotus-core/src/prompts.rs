// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Prompt assembly for the agent loop.
//!
//! The texts here are deliberately minimal defaults; deployments override
//! the system prompt through configuration and the loop treats the
//! next-step prompt as opaque.

const DEFAULT_SYSTEM_PROMPT: &str = "\
You are an autonomous agent that completes tasks by calling tools.

Rules:
1. Work step by step. Use tools to gather facts instead of guessing.
2. If a tool fails, read the error and try a different approach.
3. When the task is complete (or impossible), call `terminate` with the
   final answer as its `output` argument. Do not stop without terminating.
4. Keep chat output short; deliver results, not commentary.";

/// Corrective nudge injected when the loop detects repetition.
pub const STUCK_NUDGE: &str =
    "Reflection: You are repeating yourself. Try a different approach or tool.";

/// Synthetic tool response substituted for a premature `terminate` when the
/// browser was opened but never interacted with.
pub const INTERACTION_NUDGE: &str = "\
You opened a browser but have not interacted with the page yet. Before \
terminating, use an interaction action (click, read, extract, input, or \
scroll) to confirm the page content supports your answer.";

/// Content-only critic request appended after non-simple tool steps.
pub const CRITIC_PROMPT: &str = "\
CRITIC: Analyze the latest tool output. Is it enough to make progress? \
Answer ONLY with 'PROCEED' or a short 'FEEDBACK: <what is missing>'. \
Do NOT output code, JSON, or tool calls.";

/// One-shot request used by the post-run knowledge hook.
pub const KNOWLEDGE_PROMPT: &str = "\
In 2-3 sentences, state the reusable facts or techniques learned while \
completing this task, suitable for a knowledge base. Plain text only.";

/// Build the system prompt: configured override (or the default), followed
/// by the instruction blocks that registered tools publish.
pub fn system_prompt(custom: Option<&str>, instruction_blocks: &[(String, String)]) -> String {
    let mut prompt = custom.unwrap_or(DEFAULT_SYSTEM_PROMPT).to_string();
    for (name, text) in instruction_blocks {
        prompt.push_str("\n\n## Tool guidance: ");
        prompt.push_str(name);
        prompt.push('\n');
        prompt.push_str(text);
    }
    prompt
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
