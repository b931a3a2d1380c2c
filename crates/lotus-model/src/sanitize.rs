// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Content sanitization and provider wire shaping.
//!
//! Model output occasionally leaks chat-template control tokens
//! (`<|im_end|>`, `[INST]`, `<<SYS>>`, header markers).  Feeding those back
//! to a provider on the next turn causes 400 Bad Request errors on strict
//! endpoints, so every textual field is scrubbed before serialization.
//!
//! [`to_wire`] turns [`Message`]s into the minimal OpenAI-compatible JSON
//! shape: tool-call-only assistant turns get `content: null` (configurable),
//! tool calls are reduced to `{id, type, function{name, arguments}}`, and
//! attached images become multimodal content arrays for vision models.

use std::sync::OnceLock;

use base64::Engine;
use regex::Regex;
use serde_json::{json, Value};

use crate::types::{Message, Role};

fn control_token_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"<\|.*?\|>",  // ChatML / Llama-3 specials: <|im_start|>, <|eot_id|>, …
            r"\[/?INST\]", // Llama-2 instruction markers
            r"<<SYS>>",    // Llama-2 system marker
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static pattern"))
        .collect()
    })
}

/// Strip chat-template control tokens from `text` and trim the result.
pub fn strip_control_tokens(text: &str) -> String {
    let mut cleaned = text.to_string();
    for re in control_token_patterns() {
        cleaned = re.replace_all(&cleaned, "").into_owned();
    }
    cleaned.trim().to_string()
}

/// Sanitize the textual content of a message in place; everything else is
/// left untouched.
pub fn clean_message(mut msg: Message) -> Message {
    if let Some(c) = msg.content.take() {
        msg.content = Some(strip_control_tokens(&c));
    }
    msg
}

/// Model families known to accept image input, matched by name substring.
/// Used only when the provider config does not state the capability
/// explicitly.
const VISION_FAMILIES: &[&str] = &[
    "gpt-4o",
    "gpt-4.1",
    "gpt-5",
    "vision",
    "llava",
    "pixtral",
    "gemini",
    "claude",
    "llama-4",
    "qwen-vl",
    "qwen2-vl",
];

/// Heuristic vision detection by model-name substring.
pub fn model_supports_vision(model: &str) -> bool {
    let lower = model.to_ascii_lowercase();
    VISION_FAMILIES.iter().any(|f| lower.contains(f))
}

/// Options controlling [`to_wire`] serialization.
#[derive(Debug, Clone, Copy, Default)]
pub struct WireOptions {
    /// Render attached images as multimodal content arrays.  When false,
    /// images are dropped silently.
    pub vision: bool,
    /// Emit `content: ""` instead of `content: null` on assistant turns that
    /// carry only tool calls, for providers that reject null.
    pub empty_content_as_string: bool,
}

/// Serialize messages into the minimal OpenAI-compatible wire shape.
pub fn to_wire(messages: &[Message], opts: WireOptions) -> Vec<Value> {
    messages.iter().map(|m| message_to_wire(m, opts)).collect()
}

fn role_str(r: Role) -> &'static str {
    match r {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn message_to_wire(msg: &Message, opts: WireOptions) -> Value {
    let mut out = json!({ "role": role_str(msg.role) });

    let content = msg.content.as_deref().map(strip_control_tokens);

    if msg.role == Role::Assistant && msg.has_tool_calls() {
        // Tool-call turns: most providers require null (not "") when there is
        // no accompanying text.
        match content.as_deref() {
            Some(c) if !c.is_empty() => out["content"] = json!(c),
            _ if opts.empty_content_as_string => out["content"] = json!(""),
            _ => out["content"] = Value::Null,
        }
    } else if opts.vision && msg.image.is_some() {
        let b64 = base64::engine::general_purpose::STANDARD.encode(msg.image.as_ref().unwrap());
        out["content"] = json!([
            { "type": "text", "text": content.unwrap_or_default() },
            { "type": "image_url", "image_url": { "url": format!("data:image/png;base64,{b64}") } },
        ]);
    } else if let Some(c) = content {
        out["content"] = json!(c);
    }

    if let Some(calls) = &msg.tool_calls {
        let serialized: Vec<Value> = calls
            .iter()
            .map(|tc| {
                json!({
                    "id": tc.id,
                    "type": "function",
                    "function": {
                        "name": tc.function.name,
                        "arguments": tc.function.arguments,
                    }
                })
            })
            .collect();
        out["tool_calls"] = json!(serialized);
    }
    if let Some(name) = &msg.name {
        out["name"] = json!(name);
    }
    if let Some(id) = &msg.tool_call_id {
        out["tool_call_id"] = json!(id);
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolCall;

    #[test]
    fn strips_chatml_specials() {
        let s = strip_control_tokens("<|im_start|>assistant<|im_end|> hello <|eot_id|>");
        assert_eq!(s, "assistant hello");
    }

    #[test]
    fn strips_llama2_markers() {
        let s = strip_control_tokens("[INST] do the thing [/INST] <<SYS>> sys");
        assert!(!s.contains("[INST]"));
        assert!(!s.contains("[/INST]"));
        assert!(!s.contains("<<SYS>>"));
        assert!(s.contains("do the thing"));
    }

    #[test]
    fn plain_text_unchanged_apart_from_trim() {
        assert_eq!(strip_control_tokens("  plain answer  "), "plain answer");
    }

    #[test]
    fn tool_call_only_turn_gets_null_content() {
        let m = Message::assistant_with_tools(None, vec![ToolCall::function("a", "t", "{}")]);
        let wire = message_to_wire(&m, WireOptions::default());
        assert!(wire["content"].is_null());
        assert_eq!(wire["tool_calls"][0]["id"], "a");
        assert_eq!(wire["tool_calls"][0]["type"], "function");
    }

    #[test]
    fn empty_string_content_also_becomes_null() {
        let m = Message::assistant_with_tools(
            Some(String::new()),
            vec![ToolCall::function("a", "t", "{}")],
        );
        let wire = message_to_wire(&m, WireOptions::default());
        assert!(wire["content"].is_null());
    }

    #[test]
    fn null_content_configurable_to_empty_string() {
        let m = Message::assistant_with_tools(None, vec![ToolCall::function("a", "t", "{}")]);
        let opts = WireOptions {
            empty_content_as_string: true,
            ..Default::default()
        };
        let wire = message_to_wire(&m, opts);
        assert_eq!(wire["content"], "");
    }

    #[test]
    fn tool_call_with_text_keeps_content() {
        let m = Message::assistant_with_tools(
            Some("checking".into()),
            vec![ToolCall::function("a", "t", "{}")],
        );
        let wire = message_to_wire(&m, WireOptions::default());
        assert_eq!(wire["content"], "checking");
    }

    #[test]
    fn tool_message_carries_name_and_call_id() {
        let wire = message_to_wire(
            &Message::tool("ok", "calculator", "c-9"),
            WireOptions::default(),
        );
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["name"], "calculator");
        assert_eq!(wire["tool_call_id"], "c-9");
    }

    #[test]
    fn image_rendered_as_data_uri_for_vision() {
        let m = Message::user_with_image("what is this", vec![0xAB, 0xCD]);
        let opts = WireOptions {
            vision: true,
            ..Default::default()
        };
        let wire = message_to_wire(&m, opts);
        let parts = wire["content"].as_array().unwrap();
        assert_eq!(parts[0]["text"], "what is this");
        let url = parts[1]["image_url"]["url"].as_str().unwrap();
        assert!(url.starts_with("data:image/png;base64,"));
    }

    #[test]
    fn image_dropped_for_text_only_model() {
        let m = Message::user_with_image("what is this", vec![1, 2, 3]);
        let wire = message_to_wire(&m, WireOptions::default());
        assert_eq!(wire["content"], "what is this");
    }

    #[test]
    fn wire_output_has_no_control_tokens() {
        let messages = vec![
            Message::system("<|im_start|>You are helpful<|im_end|>"),
            Message::user("[INST] question [/INST]"),
            Message::assistant("<<SYS>> answer"),
        ];
        let rendered = serde_json::to_string(&to_wire(&messages, WireOptions::default())).unwrap();
        for pat in ["<|", "|>", "[INST]", "[/INST]", "<<SYS>>"] {
            assert!(!rendered.contains(pat), "found {pat} in {rendered}");
        }
    }

    #[test]
    fn vision_heuristic_matches_known_families() {
        assert!(model_supports_vision("gpt-4o-mini"));
        assert!(model_supports_vision("meta-llama/llama-4-scout-17b-16e-instruct"));
        assert!(model_supports_vision("Qwen2-VL-7B"));
        assert!(!model_supports_vision("deepseek-chat"));
    }
}
