// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI-compatible chat completions driver.
//!
//! Every hosted gateway and local server the router talks to speaks the same
//! `/chat/completions` wire format (SSE for streaming), so a single backend
//! configured from [`ProviderConfig`] covers them all.

use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use lotus_config::ProviderConfig;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    backend::{ChatBackend, EventStream},
    sanitize::{model_supports_vision, to_wire, WireOptions},
    types::{ChatRequest, ChatResponse, Message, StreamEvent, ToolCall, Usage},
};

pub struct OpenAiCompatBackend {
    cfg: ProviderConfig,
    chat_url: String,
    api_key: Option<String>,
    vision: bool,
    client: reqwest::Client,
}

impl OpenAiCompatBackend {
    pub fn from_config(cfg: &ProviderConfig) -> anyhow::Result<Self> {
        let base = cfg.base_url.trim_end_matches('/');
        let chat_url = format!("{base}/chat/completions");
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            api_key: cfg.resolve_api_key(),
            vision: cfg
                .supports_vision
                .unwrap_or_else(|| model_supports_vision(&cfg.model)),
            chat_url,
            client,
            cfg: cfg.clone(),
        })
    }

    fn wire_options(&self) -> WireOptions {
        WireOptions {
            vision: self.vision,
            empty_content_as_string: self.cfg.empty_content_as_string,
        }
    }

    fn build_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages = to_wire(&req.messages, self.wire_options());
        let mut body = json!({
            "model": self.cfg.model,
            "messages": messages,
            "stream": stream,
        });
        if let Some(mt) = req.max_tokens.or(self.cfg.max_tokens) {
            body["max_tokens"] = json!(mt);
        }
        if let Some(t) = self.cfg.temperature {
            body["temperature"] = json!(t);
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
            body["tool_choice"] = json!(req.tool_choice.as_str());
        }
        if stream {
            body["stream_options"] = json!({ "include_usage": true });
        }
        body
    }

    async fn post(&self, body: &Value) -> anyhow::Result<reqwest::Response> {
        debug!(
            provider = %self.cfg.name,
            model = %self.cfg.model,
            message_count = body["messages"].as_array().map(|a| a.len()).unwrap_or(0),
            "sending completion request"
        );
        let mut http_req = self.client.post(&self.chat_url).json(body);
        if let Some(key) = &self.api_key {
            http_req = http_req.bearer_auth(key);
        }
        let resp = http_req
            .send()
            .await
            .with_context(|| format!("{} request failed", self.cfg.name))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("{} error {status}: {text}", self.cfg.name);
        }
        Ok(resp)
    }
}

#[async_trait]
impl ChatBackend for OpenAiCompatBackend {
    fn name(&self) -> &str {
        &self.cfg.name
    }

    fn model_name(&self) -> &str {
        &self.cfg.model
    }

    async fn chat(&self, req: ChatRequest) -> anyhow::Result<ChatResponse> {
        let body = self.build_body(&req, false);
        let resp = self.post(&body).await?;
        let v: Value = resp.json().await.context("decoding completion response")?;
        parse_completion(&v)
    }

    async fn chat_stream(&self, req: ChatRequest) -> anyhow::Result<EventStream> {
        let body = self.build_body(&req, true);
        let resp = self.post(&body).await?;

        let byte_stream = resp.bytes_stream();
        // SSE events can be split across TCP packets.  Maintain a line buffer
        // across chunks; emit events only for complete lines.
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let events: Vec<anyhow::Result<StreamEvent>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_sse_lines(buf)
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Parse a non-streaming `/chat/completions` body into a [`ChatResponse`].
fn parse_completion(v: &Value) -> anyhow::Result<ChatResponse> {
    let msg = &v["choices"][0]["message"];
    if msg.is_null() {
        bail!("malformed completion response: no choices[0].message");
    }
    let content = msg["content"].as_str().map(str::to_string);
    let tool_calls = parse_tool_calls(&msg["tool_calls"]);
    let message = match tool_calls {
        Some(calls) => Message::assistant_with_tools(content, calls),
        None => Message::assistant(content.unwrap_or_default()),
    };
    // Usage fields are best-effort; absent values count as zero.
    let usage = Usage {
        prompt_tokens: v["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
        completion_tokens: v["usage"]["completion_tokens"].as_u64().unwrap_or(0),
    };
    Ok(ChatResponse { message, usage })
}

fn parse_tool_calls(v: &Value) -> Option<Vec<ToolCall>> {
    let arr = v.as_array()?;
    if arr.is_empty() {
        return None;
    }
    let calls = arr
        .iter()
        .map(|tc| {
            ToolCall::function(
                tc["id"].as_str().unwrap_or(""),
                tc["function"]["name"].as_str().unwrap_or(""),
                tc["function"]["arguments"].as_str().unwrap_or("{}"),
            )
        })
        .collect();
    Some(calls)
}

/// Drain all complete `\n`-terminated SSE lines from `buf`.
///
/// Any trailing incomplete line is left in `buf` so it can be extended by the
/// next TCP chunk.
fn drain_complete_sse_lines(buf: &mut String) -> Vec<anyhow::Result<StreamEvent>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(ev) = parse_sse_data_line(&line) {
            events.push(ev);
        }
    }
    events
}

/// Parse a single complete SSE `data:` line into a [`StreamEvent`].
///
/// Returns `None` for empty lines, comment lines, or unparseable data.
fn parse_sse_data_line(line: &str) -> Option<anyhow::Result<StreamEvent>> {
    let data = line.strip_prefix("data: ")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(StreamEvent::Done));
    }
    let v: Value = serde_json::from_str(data).ok()?;
    parse_sse_chunk(&v)
}

fn parse_sse_chunk(v: &Value) -> Option<anyhow::Result<StreamEvent>> {
    // Usage-only chunk (emitted when stream_options.include_usage = true).
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        return Some(Ok(StreamEvent::Usage {
            prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
            completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
        }));
    }

    let delta = &v["choices"][0]["delta"];

    // Each SSE chunk carries at most one tool-call delta in practice; the
    // index routes accumulation for parallel calls in the consumer.
    if let Some(tc) = delta.get("tool_calls").and_then(|t| t.get(0)) {
        return Some(Ok(StreamEvent::ToolCallDelta {
            index: tc["index"].as_u64().unwrap_or(0) as u32,
            id: tc["id"].as_str().unwrap_or("").to_string(),
            name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
            arguments: tc["function"]["arguments"]
                .as_str()
                .unwrap_or("")
                .to_string(),
        }));
    }

    if let Some(content) = delta["content"].as_str() {
        if !content.is_empty() {
            return Some(Ok(StreamEvent::ContentDelta(content.to_string())));
        }
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
