// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Response cache for non-streaming router calls.
//!
//! Keys are a fingerprint of the recent conversation tail plus the tool-set
//! size, so a repeated think step with identical context skips the provider
//! call entirely.  Eviction is FIFO; the cache is per-agent and accessed from
//! a single task, so no locking is involved.

use std::collections::{HashMap, VecDeque};

use sha2::{Digest, Sha256};

use crate::types::Message;

/// Per-message content prefix included in the fingerprint.  Bounding the
/// prefix keeps hashing cheap when huge tool outputs sit in the tail.
const FINGERPRINT_PREFIX_CHARS: usize = 256;
/// Number of trailing messages that contribute to the fingerprint.
const FINGERPRINT_TAIL: usize = 3;

/// Compute the cache key for a request: a hash over the last three messages'
/// content prefixes and the tool-set cardinality.
pub fn fingerprint(messages: &[Message], tool_count: usize) -> String {
    let mut hasher = Sha256::new();
    let tail_start = messages.len().saturating_sub(FINGERPRINT_TAIL);
    for msg in &messages[tail_start..] {
        let prefix: String = msg.text().chars().take(FINGERPRINT_PREFIX_CHARS).collect();
        hasher.update(prefix.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(tool_count.to_le_bytes());
    hex::encode(hasher.finalize())
}

pub struct ResponseCache {
    capacity: usize,
    map: HashMap<String, Message>,
    order: VecDeque<String>,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<Message> {
        self.map.get(key).cloned()
    }

    pub fn insert(&mut self, key: String, response: Message) {
        if self.map.insert(key.clone(), response).is_none() {
            self.order.push_back(key);
        }
        while self.map.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
