// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Tool dispatch: registry lookup, argument parsing, bounded retry, result
//! normalization, truncation, and opt-in result caching.
//!
//! The dispatcher never throws on tool failure — every failure mode becomes
//! a [`ToolResult`] value the agent records as a tool-role message.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use lotus_config::ToolsSettings;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    tool::{Tool, ToolResult},
    truncate::truncate_middle,
};

/// A tool schema — mirrors `lotus_model::ToolSchema` but keeps the tools
/// crate independent from the model crate.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

pub struct Dispatcher {
    tools: HashMap<String, Arc<dyn Tool>>,
    /// `(name, arguments_json)` → successful result, for repeated read-only
    /// calls within one session.
    cache: HashMap<String, ToolResult>,
    cache_enabled: bool,
    max_result_len: usize,
    result_keep: usize,
    timeout: Duration,
    retries: u32,
    retry_backoff: Duration,
}

impl Dispatcher {
    pub fn new(settings: &ToolsSettings, cache_enabled: bool) -> Self {
        Self {
            tools: HashMap::new(),
            cache: HashMap::new(),
            cache_enabled,
            max_result_len: settings.max_result_len,
            result_keep: settings.result_keep,
            timeout: Duration::from_secs(settings.timeout_secs),
            retries: settings.retries,
            retry_backoff: Duration::from_secs(1),
        }
    }

    /// Shrink the retry backoff (tests).
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Schemas for all registered tools, sorted by name for a stable wire
    /// order (also keeps the router cache key stable across identical steps).
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// `(tool name, instruction text)` for every tool that publishes expert
    /// guidelines, sorted by name.  Merged into the system prompt at loop
    /// start.
    pub fn instruction_blocks(&self) -> Vec<(String, String)> {
        let mut blocks: Vec<(String, String)> = self
            .tools
            .values()
            .filter_map(|t| {
                t.instructions()
                    .map(|i| (t.name().to_string(), i.to_string()))
            })
            .collect();
        blocks.sort_by(|a, b| a.0.cmp(&b.0));
        blocks
    }

    /// Resolve and execute one tool call.  Infallible by contract: lookup
    /// misses, argument syntax errors, handler faults, and timeouts all come
    /// back as error results.
    pub async fn execute(&mut self, name: &str, arguments_json: &str) -> ToolResult {
        let Some(tool) = self.tools.get(name).cloned() else {
            return ToolResult::err(format!("tool '{name}' not found"));
        };

        let args: Value = match serde_json::from_str(arguments_json) {
            Ok(v) => v,
            Err(e) => {
                return ToolResult::err(format!("invalid JSON arguments for {name}: {e}"));
            }
        };

        let use_cache = self.cache_enabled && tool.cacheable();
        let cache_key = format!("{name}:{arguments_json}");
        if use_cache {
            if let Some(hit) = self.cache.get(&cache_key) {
                debug!(tool = name, "tool cache hit");
                return hit.clone();
            }
        }

        let mut result = self.invoke_with_retry(&*tool, name, args).await;

        if let Some(out) = result.output.take() {
            result.output = Some(truncate_middle(&out, self.max_result_len, self.result_keep));
        }
        if let Some(err) = result.error.take() {
            result.error = Some(truncate_middle(&err, self.max_result_len, self.result_keep));
        }

        // Only successful results are cached; an error served from cache
        // would mask a later recovery.
        if use_cache && !result.is_error() {
            self.cache.insert(cache_key, result.clone());
        }
        result
    }

    /// Invoke the handler with a bounded retry for execution faults.
    /// Error *results* are returned as-is — they are answers, not faults.
    async fn invoke_with_retry(&self, tool: &dyn Tool, name: &str, args: Value) -> ToolResult {
        let mut attempt = 0u32;
        loop {
            match tokio::time::timeout(self.timeout, tool.execute(args.clone())).await {
                Ok(Ok(result)) => return result,
                Ok(Err(e)) => {
                    if attempt < self.retries {
                        attempt += 1;
                        warn!(tool = name, attempt, error = %e, "tool failed; retrying");
                        tokio::time::sleep(self.retry_backoff).await;
                        continue;
                    }
                    return ToolResult::err(format!(
                        "executing {name} after {} retries: {e}",
                        self.retries
                    ));
                }
                Err(_) => {
                    if attempt < self.retries {
                        attempt += 1;
                        warn!(tool = name, attempt, "tool timed out; retrying");
                        continue;
                    }
                    return ToolResult::err(format!(
                        "{name} timed out after {}s",
                        self.timeout.as_secs()
                    ));
                }
            }
        }
    }

    /// Run every tool's `cleanup` hook; failures are logged, not propagated.
    pub async fn cleanup_all(&self) {
        for tool in self.tools.values() {
            if let Err(e) = tool.cleanup().await {
                warn!(tool = tool.name(), error = %e, "tool cleanup failed");
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
