// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod sanitize;
mod backend;
mod cache;
mod mock;
mod openai;
mod router;
mod types;
mod usage;

pub use backend::{ChatBackend, EventStream};
pub use cache::{fingerprint, ResponseCache};
pub use mock::{FailingBackend, ScriptStep, ScriptedBackend};
pub use openai::OpenAiCompatBackend;
pub use router::{is_transient_error, ProviderHandle, RetryPolicy, Router, RouterError};
pub use types::*;
pub use usage::{UsageRecord, UsageTracker};
