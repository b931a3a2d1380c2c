// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;

/// The normalized result of executing a tool.
///
/// A tool communicates failure by returning `error` — that is a *result*,
/// recorded into conversation memory so the model can self-correct, and is
/// never retried.  A handler that returns `Err(..)` instead signals an
/// execution fault, which the dispatcher retries with backoff.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolResult {
    pub output: Option<String>,
    pub error: Option<String>,
    /// Raw image bytes (e.g. a screenshot) to attach to the tool message.
    pub image: Option<Vec<u8>>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: Some(output.into()),
            ..Default::default()
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_image(mut self, image: Vec<u8>) -> Self {
        self.image = Some(image);
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Text representation committed to conversation memory.
    pub fn render(&self) -> String {
        match &self.error {
            Some(e) => format!("Error: {e}"),
            None => self.output.clone().unwrap_or_default(),
        }
    }
}

impl std::fmt::Display for ToolResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.render())
    }
}

impl From<String> for ToolResult {
    fn from(s: String) -> Self {
        Self::ok(s)
    }
}

impl From<&str> for ToolResult {
    fn from(s: &str) -> Self {
        Self::ok(s)
    }
}

/// Trait that every tool must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the parameters object.
    fn parameters_schema(&self) -> Value;
    /// Optional expert guidelines merged into the system prompt at loop start.
    fn instructions(&self) -> Option<&str> {
        None
    }
    /// Side-effectful tools must return `false` so their results are never
    /// served from the dispatcher cache.
    fn cacheable(&self) -> bool {
        true
    }
    /// Execute the tool with parsed JSON arguments.
    ///
    /// Return `Ok(ToolResult::err(..))` for failures the model should see;
    /// return `Err(..)` only for execution faults worth retrying.
    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult>;
    /// Release held resources (subprocesses, sessions) at shutdown.
    async fn cleanup(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
