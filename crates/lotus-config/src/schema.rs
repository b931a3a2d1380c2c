// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be on unless explicitly disabled
/// need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentSettings,
    /// Primary provider. Always consulted first.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Ordered backup providers, used when the primary fails transiently.
    /// Sorted by ascending `cost_score` at router construction so failover
    /// prefers the cheapest viable fallback.
    #[serde(default)]
    pub backups: Vec<ProviderConfig>,
    #[serde(default)]
    pub tools: ToolsSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub memory: MemorySettings,
    #[serde(default)]
    pub usage: UsageSettings,
}

fn default_max_steps() -> u32 {
    20
}
fn default_agent_name() -> String {
    "lotus".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_agent_name")]
    pub name: String,
    /// Maximum number of think steps per `run` invocation.
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    /// System prompt override. When unset a minimal built-in prompt is used;
    /// tool instruction blocks are appended either way.
    pub system_prompt: Option<String>,
    /// Prompt prepended as a user message before each think step.
    /// Treated as opaque text; never duplicated when already last in memory.
    pub next_step_prompt: Option<String>,
    /// Run the critic pass after non-simple tool steps.
    #[serde(default = "default_true")]
    pub critic_enabled: bool,
    /// Run the post-hoc knowledge-save hook after the loop finishes.
    /// Requires a `save_knowledge` tool in the registry; one quick model
    /// call of its own budget, never counted against `max_steps`.
    #[serde(default)]
    pub save_knowledge: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            max_steps: default_max_steps(),
            system_prompt: None,
            next_step_prompt: None,
            critic_enabled: true,
            save_knowledge: false,
        }
    }
}

fn default_base_url() -> String {
    "https://api.groq.com/openai/v1".into()
}
fn default_model_name() -> String {
    "meta-llama/llama-4-scout-17b-16e-instruct".into()
}
fn default_cost_score() -> f32 {
    1.0
}
fn default_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Stable provider id used for usage attribution and log output.
    #[serde(default)]
    pub name: String,
    /// API base that ends before `/chat/completions`.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Model identifier forwarded to the API.
    #[serde(default = "default_model_name")]
    pub model: String,
    /// Explicit API key; prefer `api_key_env` in version-controlled files.
    pub api_key: Option<String>,
    /// Environment variable that holds the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Providers that cannot take a `tools` array are skipped for tool calls.
    #[serde(default = "default_true")]
    pub supports_tools: bool,
    /// Explicit vision capability. When unset, a model-name heuristic
    /// (known vision families) decides whether image parts are sent.
    pub supports_vision: Option<bool>,
    /// Relative cost weight. Orders backups (ascending) and scales the
    /// estimated cost recorded by the usage tracker.
    #[serde(default = "default_cost_score")]
    pub cost_score: f32,
    /// Maximum tokens to request in a single completion.
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0).
    pub temperature: Option<f32>,
    /// Per-request HTTP timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Some providers reject `content: null` on assistant tool-call turns;
    /// setting this sends `""` instead.
    #[serde(default)]
    pub empty_content_as_string: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: "primary".into(),
            base_url: default_base_url(),
            model: default_model_name(),
            api_key: None,
            api_key_env: None,
            supports_tools: true,
            supports_vision: None,
            cost_score: default_cost_score(),
            max_tokens: None,
            temperature: None,
            timeout_secs: default_timeout_secs(),
            empty_content_as_string: false,
        }
    }
}

impl ProviderConfig {
    /// Resolve the API key: explicit value wins, then the named env var.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(k) = &self.api_key {
            if !k.is_empty() {
                return Some(k.clone());
            }
        }
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty())
    }
}

fn default_enabled_tools() -> Vec<String> {
    vec!["calculator".into()]
}
fn default_max_result_len() -> usize {
    10_000
}
fn default_result_keep() -> usize {
    4_000
}
fn default_tool_timeout_secs() -> u64 {
    120
}
fn default_tool_retries() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsSettings {
    /// Tools registered at startup. `terminate` is always registered.
    #[serde(default = "default_enabled_tools")]
    pub enabled: Vec<String>,
    /// Hard cap on a tool result committed to memory (characters).
    #[serde(default = "default_max_result_len")]
    pub max_result_len: usize,
    /// Characters preserved at each end when a result is truncated.
    #[serde(default = "default_result_keep")]
    pub result_keep: usize,
    /// Per-execution timeout for tool handlers.
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries for handler-level failures (not error results).
    #[serde(default = "default_tool_retries")]
    pub retries: u32,
}

impl Default for ToolsSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled_tools(),
            max_result_len: default_max_result_len(),
            result_keep: default_result_keep(),
            timeout_secs: default_tool_timeout_secs(),
            retries: default_tool_retries(),
        }
    }
}

fn default_cache_capacity() -> usize {
    128
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Enables both the router response cache and the tool result cache.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Router response cache capacity (entries, FIFO eviction).
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: default_cache_capacity(),
        }
    }
}

fn default_max_messages() -> usize {
    100
}
fn default_summary_threshold() -> usize {
    30
}
fn default_keep_recent() -> usize {
    8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySettings {
    /// Hard cap on retained messages.
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    /// Soft cap that triggers summarization before the next think step.
    #[serde(default = "default_summary_threshold")]
    pub summary_threshold: usize,
    /// Non-system messages kept verbatim at the tail across compactions.
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            summary_threshold: default_summary_threshold(),
            keep_recent: default_keep_recent(),
        }
    }
}

fn default_usage_file() -> String {
    "usage.json".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Session records are appended here on shutdown.
    #[serde(default = "default_usage_file")]
    pub file_path: String,
}

impl Default for UsageSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            file_path: default_usage_file(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
