// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Deterministic mock backends for tests.  No network access involved.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream;

use crate::{
    backend::{ChatBackend, EventStream},
    types::{ChatRequest, ChatResponse, Message, StreamEvent, ToolCall, Usage},
};

/// One scripted backend turn: a canned response or a canned failure.
pub enum ScriptStep {
    Reply(ChatResponse),
    Fail(String),
}

impl ScriptStep {
    /// Plain text assistant reply with token usage attached.
    pub fn text(reply: impl Into<String>) -> Self {
        Self::Reply(ChatResponse {
            message: Message::assistant(reply.into()),
            usage: Usage {
                prompt_tokens: 5,
                completion_tokens: 5,
            },
        })
    }

    /// Assistant turn containing a single tool call and no text.
    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        args_json: impl Into<String>,
    ) -> Self {
        Self::Reply(ChatResponse {
            message: Message::assistant_with_tools(
                None,
                vec![ToolCall::function(id, name, args_json)],
            ),
            usage: Usage {
                prompt_tokens: 5,
                completion_tokens: 5,
            },
        })
    }

    /// Assistant turn with several parallel tool calls.
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self::Reply(ChatResponse {
            message: Message::assistant_with_tools(None, calls),
            usage: Usage::default(),
        })
    }

    /// Provider error whose rendered form is exactly `message`.
    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail(message.into())
    }
}

/// A pre-scripted backend.  Each `chat` / `chat_stream` call pops the next
/// step from the front of the queue; when the queue runs dry a fallback text
/// reply is returned so tests fail visibly instead of hanging.
pub struct ScriptedBackend {
    name: String,
    scripts: Mutex<VecDeque<ScriptStep>>,
    calls: AtomicUsize,
    /// The last request seen, for tests that inspect what was sent.
    pub last_request: Mutex<Option<ChatRequest>>,
}

impl ScriptedBackend {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            name: "scripted-mock".into(),
            scripts: Mutex::new(steps.into()),
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Convenience: backend whose every scripted turn is the same text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![ScriptStep::text(reply)])
    }

    /// Number of completed `chat` / `chat_stream` calls.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self, req: ChatRequest) -> ScriptStep {
        *self.last_request.lock().unwrap() = Some(req);
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ScriptStep::text("[no more scripts]"))
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    async fn chat(&self, req: ChatRequest) -> anyhow::Result<ChatResponse> {
        match self.next_step(req) {
            ScriptStep::Reply(r) => Ok(r),
            ScriptStep::Fail(msg) => Err(anyhow::anyhow!(msg)),
        }
    }

    async fn chat_stream(&self, req: ChatRequest) -> anyhow::Result<EventStream> {
        match self.next_step(req) {
            ScriptStep::Reply(r) => {
                let mut events: Vec<anyhow::Result<StreamEvent>> = Vec::new();
                if let Some(calls) = &r.message.tool_calls {
                    for (i, tc) in calls.iter().enumerate() {
                        events.push(Ok(StreamEvent::ToolCallDelta {
                            index: i as u32,
                            id: tc.id.clone(),
                            name: tc.function.name.clone(),
                            arguments: tc.function.arguments.clone(),
                        }));
                    }
                }
                if let Some(c) = &r.message.content {
                    if !c.is_empty() {
                        events.push(Ok(StreamEvent::ContentDelta(c.clone())));
                    }
                }
                events.push(Ok(StreamEvent::Usage {
                    prompt_tokens: r.usage.prompt_tokens,
                    completion_tokens: r.usage.completion_tokens,
                }));
                events.push(Ok(StreamEvent::Done));
                Ok(Box::pin(stream::iter(events)))
            }
            ScriptStep::Fail(msg) => Err(anyhow::anyhow!(msg)),
        }
    }
}

/// A backend that fails every call with the same error message.
pub struct FailingBackend {
    name: String,
    message: String,
    calls: AtomicUsize,
}

impl FailingBackend {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatBackend for FailingBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn model_name(&self) -> &str {
        "failing-mock-model"
    }

    async fn chat(&self, _req: ChatRequest) -> anyhow::Result<ChatResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(anyhow::anyhow!(self.message.clone()))
    }

    async fn chat_stream(&self, _req: ChatRequest) -> anyhow::Result<EventStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(anyhow::anyhow!(self.message.clone()))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
