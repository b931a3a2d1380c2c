// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message in the conversation history.
///
/// `content` is optional so that assistant turns carrying only tool calls can
/// be serialized with `content: null` — several providers reject an empty
/// string in that position.  On tool-role messages `name` and `tool_call_id`
/// are always set; they correlate the result back to the originating call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Raw image bytes attached to this message.  Rendered into a provider
    /// multimodal content array only when the target model supports vision;
    /// dropped silently otherwise.  Never serialized as-is.
    #[serde(skip)]
    pub image: Option<Vec<u8>>,
}

impl Message {
    fn base(role: Role) -> Self {
        Self {
            role,
            content: None,
            tool_calls: None,
            name: None,
            tool_call_id: None,
            image: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Self::base(Role::System)
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Self::base(Role::User)
        }
    }

    /// User message with an attached image (screenshot, photo, chart).
    pub fn user_with_image(text: impl Into<String>, image: Vec<u8>) -> Self {
        Self {
            content: Some(text.into()),
            image: Some(image),
            ..Self::base(Role::User)
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Self::base(Role::Assistant)
        }
    }

    /// Assistant turn that requests tool calls.  `content` may be empty; the
    /// wire layer downgrades it to `null` for providers that require that.
    pub fn assistant_with_tools(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content,
            tool_calls: Some(tool_calls),
            ..Self::base(Role::Assistant)
        }
    }

    /// Tool result message, correlated to its originating call.
    pub fn tool(
        content: impl Into<String>,
        name: impl Into<String>,
        tool_call_id: impl Into<String>,
    ) -> Self {
        Self {
            content: Some(content.into()),
            name: Some(name.into()),
            tool_call_id: Some(tool_call_id.into()),
            ..Self::base(Role::Tool)
        }
    }

    /// Tool result message that additionally carries an image.
    pub fn tool_with_image(
        content: impl Into<String>,
        name: impl Into<String>,
        tool_call_id: impl Into<String>,
        image: Vec<u8>,
    ) -> Self {
        Self {
            image: Some(image),
            ..Self::tool(content, name, tool_call_id)
        }
    }

    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|tc| !tc.is_empty())
    }
}

fn function_kind() -> String {
    "function".into()
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionCall,
}

impl ToolCall {
    pub fn function(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: function_kind(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object.
    pub arguments: String,
}

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    None,
    #[default]
    Auto,
    Required,
}

impl ToolChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolChoice::None => "none",
            ToolChoice::Auto => "auto",
            ToolChoice::Required => "required",
        }
    }
}

/// Request sent to a chat backend.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub tool_choice: ToolChoice,
    /// Per-request output cap; `None` uses the provider configuration.
    pub max_tokens: Option<u32>,
}

/// Token usage reported by a provider for one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// A completed (non-streaming) model turn.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// The assistant message: content and/or tool calls.
    pub message: Message,
    pub usage: Usage,
}

/// A single streamed chunk from the model.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A text fragment of the assistant reply.
    ContentDelta(String),
    /// Incremental tool-call assembly.  `index` routes accumulation when the
    /// provider interleaves chunks for parallel calls; `arguments` fragments
    /// are concatenated by the consumer.
    ToolCallDelta {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    /// Final usage statistics for the turn.
    Usage {
        prompt_tokens: u64,
        completion_tokens: u64,
    },
    /// The stream finished normally.
    Done,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
