// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{Tool, ToolResult};

/// The mandatory task-ending tool.  Its successful execution transitions the
/// agent loop to FINISHED and captures `output` as the final answer.
pub struct TerminateTool;

#[async_trait]
impl Tool for TerminateTool {
    fn name(&self) -> &str {
        "terminate"
    }

    fn description(&self) -> &str {
        "Terminate the current task and provide the final answer."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "output": {
                    "type": "string",
                    "description": "The final answer or summary of the completed task."
                }
            },
            "required": ["output"]
        })
    }

    fn cacheable(&self) -> bool {
        false
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        match args["output"].as_str() {
            Some(output) => Ok(ToolResult::ok(output.to_string())),
            None => Ok(ToolResult::err(
                "terminate requires an 'output' string argument",
            )),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
