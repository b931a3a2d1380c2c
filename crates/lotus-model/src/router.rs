// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Multi-provider LLM router with failover, retry, caching, and usage
//! accounting.
//!
//! One primary backend plus zero-or-more backups, the backups sorted by
//! ascending cost score so failover prefers the cheapest viable fallback.
//! A provider error classified as *transient* (rate limit, timeout,
//! connection) is retried on the same provider with capped exponential
//! backoff, then the walk moves to the next provider.  Anything else —
//! bad request, auth, schema violation — aborts immediately so semantic
//! errors reach the caller intact.

use std::cmp::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use lotus_config::{CacheSettings, ProviderConfig};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    backend::{ChatBackend, EventStream},
    cache::{fingerprint, ResponseCache},
    openai::OpenAiCompatBackend,
    sanitize::clean_message,
    types::{ChatRequest, ChatResponse, Message, StreamEvent, ToolChoice, ToolSchema, Usage},
    usage::UsageTracker,
};

/// Default output cap for reflection / summarization calls.
const QUICK_ASK_MAX_TOKENS: u32 = 200;

#[derive(Debug, Error)]
pub enum RouterError {
    /// Non-transient provider error; failover was not attempted.
    #[error("provider rejected the request: {0}")]
    Fatal(anyhow::Error),
    /// Every configured provider failed transiently.
    #[error("all providers failed; last error: {0}")]
    Exhausted(anyhow::Error),
}

/// Classify a provider error as transient (retriable / failoverable).
///
/// The classification works on the rendered error text because provider
/// errors arrive as HTTP status + body strings from heterogeneous gateways.
pub fn is_transient_error(err: &anyhow::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    ["429", "rate limit", "timeout", "timed out", "connection"]
        .iter()
        .any(|p| msg.contains(p))
}

/// Capped exponential backoff applied per provider before failing over.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(8);
        (self.base_delay * factor).min(self.max_delay)
    }
}

/// A configured provider: its settings plus the backend that talks to it.
pub struct ProviderHandle {
    pub cfg: ProviderConfig,
    pub backend: Arc<dyn ChatBackend>,
}

impl ProviderHandle {
    pub fn new(cfg: ProviderConfig, backend: Arc<dyn ChatBackend>) -> Self {
        Self { cfg, backend }
    }

    /// Build the standard OpenAI-compatible backend for this configuration.
    pub fn from_config(cfg: &ProviderConfig) -> anyhow::Result<Self> {
        let backend = Arc::new(OpenAiCompatBackend::from_config(cfg)?);
        Ok(Self {
            cfg: cfg.clone(),
            backend,
        })
    }
}

pub struct Router {
    /// Primary first, then backups in ascending cost-score order.
    providers: Vec<ProviderHandle>,
    retry: RetryPolicy,
    cache: Option<ResponseCache>,
    usage: Arc<Mutex<UsageTracker>>,
}

impl Router {
    pub fn new(
        primary: ProviderHandle,
        mut backups: Vec<ProviderHandle>,
        cache: &CacheSettings,
        usage_enabled: bool,
    ) -> Self {
        backups.sort_by(|a, b| {
            a.cfg
                .cost_score
                .partial_cmp(&b.cfg.cost_score)
                .unwrap_or(Ordering::Equal)
        });
        let mut providers = Vec::with_capacity(1 + backups.len());
        providers.push(primary);
        providers.extend(backups);
        Self {
            providers,
            retry: RetryPolicy::default(),
            cache: cache.enabled.then(|| ResponseCache::new(cache.capacity)),
            usage: Arc::new(Mutex::new(UsageTracker::new(usage_enabled))),
        }
    }

    /// Override the retry policy (tests use millisecond delays).
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Provider names in failover order.
    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.cfg.name.clone()).collect()
    }

    /// Shared handle to the session usage tracker.
    pub fn usage(&self) -> Arc<Mutex<UsageTracker>> {
        Arc::clone(&self.usage)
    }

    pub fn usage_summary(&self) -> String {
        self.usage.lock().unwrap().summary()
    }

    pub fn save_usage(&self, path: &std::path::Path) -> anyhow::Result<()> {
        self.usage.lock().unwrap().save(path)
    }

    /// Non-streaming tool-capable completion.
    ///
    /// Consults the response cache first; on a hit the provider is never
    /// called.  On success the cache is populated and usage recorded against
    /// the provider that answered.
    pub async fn ask_tool(
        &mut self,
        messages: Vec<Message>,
        tools: &[ToolSchema],
        choice: ToolChoice,
    ) -> Result<Message, RouterError> {
        let messages: Vec<Message> = messages.into_iter().map(clean_message).collect();
        let key = self
            .cache
            .as_ref()
            .map(|_| fingerprint(&messages, tools.len()));
        if let (Some(cache), Some(k)) = (self.cache.as_ref(), key.as_deref()) {
            if let Some(hit) = cache.get(k) {
                debug!("response cache hit; skipping provider call");
                return Ok(hit);
            }
        }

        let req = ChatRequest {
            messages,
            tools: tools.to_vec(),
            tool_choice: choice,
            max_tokens: None,
        };
        let resp = self.failover_chat(&req).await?;
        if let (Some(cache), Some(k)) = (self.cache.as_mut(), key) {
            cache.insert(k, resp.message.clone());
        }
        Ok(resp.message)
    }

    /// Streaming tool-capable completion.  Same failover policy as
    /// [`ask_tool`], applied before the first chunk; no caching.
    pub async fn ask_tool_stream(
        &self,
        messages: Vec<Message>,
        tools: &[ToolSchema],
    ) -> Result<EventStream, RouterError> {
        let messages: Vec<Message> = messages.into_iter().map(clean_message).collect();
        let req = ChatRequest {
            messages,
            tools: tools.to_vec(),
            tool_choice: ToolChoice::Auto,
            max_tokens: None,
        };

        let mut last_err: Option<anyhow::Error> = None;
        for provider in &self.providers {
            if !req.tools.is_empty() && !provider.cfg.supports_tools {
                debug!(provider = %provider.cfg.name, "skipping provider without tool support");
                continue;
            }
            match stream_with_retry(provider, &req, &self.retry).await {
                Ok(stream) => {
                    // Usage arrives as a stream event; attribute it to this
                    // provider as the chunks flow past.
                    let usage = Arc::clone(&self.usage);
                    let name = provider.cfg.name.clone();
                    let score = provider.cfg.cost_score;
                    let tapped = stream.map(move |ev| {
                        if let Ok(StreamEvent::Usage {
                            prompt_tokens,
                            completion_tokens,
                        }) = &ev
                        {
                            usage.lock().unwrap().record(
                                &name,
                                score,
                                Usage {
                                    prompt_tokens: *prompt_tokens,
                                    completion_tokens: *completion_tokens,
                                },
                            );
                        }
                        ev
                    });
                    return Ok(Box::pin(tapped));
                }
                Err(e) if is_transient_error(&e) => {
                    warn!(provider = %provider.cfg.name, error = %e, "stream failed transiently; trying next provider");
                    last_err = Some(e);
                }
                Err(e) => return Err(RouterError::Fatal(e)),
            }
        }
        Err(exhausted(last_err))
    }

    /// Tool-free completion used for reflection and summarization.
    pub async fn quick_ask(
        &self,
        messages: Vec<Message>,
        max_tokens: Option<u32>,
    ) -> Result<String, RouterError> {
        let messages: Vec<Message> = messages.into_iter().map(clean_message).collect();
        let req = ChatRequest {
            messages,
            tools: vec![],
            tool_choice: ToolChoice::None,
            max_tokens: max_tokens.or(Some(QUICK_ASK_MAX_TOKENS)),
        };
        let resp = self.failover_chat(&req).await?;
        Ok(resp.message.content.unwrap_or_default())
    }

    /// Walk the provider list until one succeeds.  Transient errors continue
    /// to the next provider; anything else aborts.
    async fn failover_chat(&self, req: &ChatRequest) -> Result<ChatResponse, RouterError> {
        let mut last_err: Option<anyhow::Error> = None;
        for provider in &self.providers {
            if !req.tools.is_empty() && !provider.cfg.supports_tools {
                debug!(provider = %provider.cfg.name, "skipping provider without tool support");
                continue;
            }
            match chat_with_retry(provider, req, &self.retry).await {
                Ok(resp) => {
                    self.usage.lock().unwrap().record(
                        &provider.cfg.name,
                        provider.cfg.cost_score,
                        resp.usage,
                    );
                    return Ok(resp);
                }
                Err(e) if is_transient_error(&e) => {
                    warn!(provider = %provider.cfg.name, error = %e, "provider failed transiently; trying next");
                    last_err = Some(e);
                }
                Err(e) => return Err(RouterError::Fatal(e)),
            }
        }
        Err(exhausted(last_err))
    }
}

fn exhausted(last_err: Option<anyhow::Error>) -> RouterError {
    RouterError::Exhausted(
        last_err.unwrap_or_else(|| anyhow::anyhow!("no configured provider accepts this request")),
    )
}

async fn chat_with_retry(
    provider: &ProviderHandle,
    req: &ChatRequest,
    retry: &RetryPolicy,
) -> anyhow::Result<ChatResponse> {
    let mut attempt = 0;
    loop {
        match provider.backend.chat(req.clone()).await {
            Ok(resp) => return Ok(resp),
            Err(e) => {
                attempt += 1;
                if attempt >= retry.attempts || !is_transient_error(&e) {
                    return Err(e);
                }
                let delay = retry.delay_for(attempt - 1);
                warn!(
                    provider = %provider.cfg.name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient provider error; backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn stream_with_retry(
    provider: &ProviderHandle,
    req: &ChatRequest,
    retry: &RetryPolicy,
) -> anyhow::Result<EventStream> {
    let mut attempt = 0;
    loop {
        match provider.backend.chat_stream(req.clone()).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                attempt += 1;
                if attempt >= retry.attempts || !is_transient_error(&e) {
                    return Err(e);
                }
                let delay = retry.delay_for(attempt - 1);
                warn!(
                    provider = %provider.cfg.name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient stream error; backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
