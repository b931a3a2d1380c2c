// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// Events emitted by the agent while a run is in flight.
/// Consumers (CLI, UI layers) subscribe to these to render progress without
/// polling memory; dropping the receiver silently disables the stream.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Loop phase update: "thinking", "tool: <name>", "critic", …
    Status(String),
    /// Assistant text committed to memory this step.
    Content(String),
    /// A tool call is about to execute.
    ToolStarted { call_id: String, name: String },
    /// A tool call finished; `output` is the rendered result text.
    ToolFinished {
        call_id: String,
        name: String,
        output: String,
        is_error: bool,
    },
    /// The captured final answer, emitted once when the run ends.
    Final(String),
}
