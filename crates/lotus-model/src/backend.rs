// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::types::{ChatRequest, ChatResponse, StreamEvent};

pub type EventStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamEvent>> + Send>>;

/// One configured model endpoint.
///
/// The router owns an ordered list of these and walks it on transient
/// failures; implementations must not retry internally.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Stable provider id for usage attribution and log output.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Send a completion request and wait for the full response.
    async fn chat(&self, req: ChatRequest) -> anyhow::Result<ChatResponse>;

    /// Send a completion request and return a stream of incremental chunks.
    async fn chat_stream(&self, req: ChatRequest) -> anyhow::Result<EventStream>;
}
