// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use lotus_config::Config;
use lotus_model::{sanitize, Message, Role, Router, RouterError, ToolChoice};
use lotus_tools::Dispatcher;

use crate::{events::AgentEvent, memory::Memory, prompts};

/// Cap on the critic reply kept in memory.
const CRITIC_MAX_CHARS: usize = 500;
/// Messages scanned by stuck detection.
const STUCK_WINDOW: usize = 4;
/// Messages scanned by the anti-laziness terminate interception.
const LAZINESS_WINDOW: usize = 10;

/// Browser actions that count as real page interaction.  A terminate call
/// arriving after browser use without one of these is intercepted.
const INTERACTION_ACTIONS: &[&str] = &["click", "read", "extract", "input", "scroll"];

/// Tools cheap or mechanical enough that the critic pass is skipped after
/// them to save cost.
const SIMPLE_TOOLS: &[&str] = &["search", "calculator", "planner", "terminate"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Running,
    Finished,
    Error,
}

/// The agent: a think–act–critic loop over a router, a dispatcher, and a
/// bounded conversation memory.
///
/// One instance drives one task at a time; all mutable state (memory, cache,
/// usage) is owned here, so separate agents never contend.
pub struct Agent {
    name: String,
    router: Router,
    dispatcher: Dispatcher,
    memory: Memory,
    state: AgentState,
    max_steps: u32,
    current_step: u32,
    final_answer: Option<String>,
    simple_tools: HashSet<String>,
    next_step_prompt: Option<String>,
    critic_enabled: bool,
    save_knowledge: bool,
    system_prompt: String,
}

impl Agent {
    pub fn new(config: &Config, router: Router, dispatcher: Dispatcher) -> Self {
        let system_prompt = prompts::system_prompt(
            config.agent.system_prompt.as_deref(),
            &dispatcher.instruction_blocks(),
        );
        Self {
            name: config.agent.name.clone(),
            router,
            memory: Memory::new(&config.memory),
            state: AgentState::Idle,
            max_steps: config.agent.max_steps,
            current_step: 0,
            final_answer: None,
            simple_tools: SIMPLE_TOOLS.iter().map(|s| s.to_string()).collect(),
            next_step_prompt: config.agent.next_step_prompt.clone(),
            critic_enabled: config.agent.critic_enabled,
            save_knowledge: config.agent.save_knowledge,
            system_prompt,
            dispatcher,
        }
    }

    /// Override the simple-tool set (tools that skip the critic pass).
    pub fn with_simple_tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.simple_tools = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn current_step(&self) -> u32 {
        self.current_step
    }

    pub fn final_answer(&self) -> Option<&str> {
        self.final_answer.as_deref()
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Reset per-run state so the same instance can take the next request.
    /// Conversation memory is kept: follow-up requests continue the session.
    pub fn reset(&mut self) {
        self.current_step = 0;
        self.state = AgentState::Idle;
        self.final_answer = None;
    }

    /// Run tool cleanup hooks.  Call once at shutdown.
    pub async fn cleanup(&self) {
        self.dispatcher.cleanup_all().await;
    }

    /// Run the loop until the task terminates or the step budget is spent.
    /// Returns the captured final answer, if any.
    pub async fn run(
        &mut self,
        request: Option<&str>,
        tx: mpsc::Sender<AgentEvent>,
    ) -> Option<String> {
        // A oneshot that never fires; the guard stays alive for the whole
        // run so the receiver is not treated as a dropped-sender cancel.
        let (guard, cancel) = oneshot::channel::<()>();
        let result = self.run_with_cancel(request, tx, cancel).await;
        drop(guard);
        result
    }

    /// Like [`run`] but cancellable: sending `()` — or dropping the sender —
    /// aborts the current suspension point, marks the state ERROR, and
    /// surfaces whatever final answer was already captured.
    pub async fn run_with_cancel(
        &mut self,
        request: Option<&str>,
        tx: mpsc::Sender<AgentEvent>,
        mut cancel: oneshot::Receiver<()>,
    ) -> Option<String> {
        self.current_step = 0;
        self.state = AgentState::Running;
        self.final_answer = None;

        if !self.memory.messages.iter().any(|m| m.role == Role::System) {
            self.memory
                .messages
                .insert(0, Message::system(self.system_prompt.clone()));
        }
        if let Some(req) = request {
            self.memory.add(Message::user(req));
        }

        while self.current_step < self.max_steps && self.state == AgentState::Running {
            if cancelled(&mut cancel) {
                return self.abort(&tx).await;
            }
            self.current_step += 1;
            debug!(agent = %self.name, step = self.current_step, "think step");
            let _ = tx
                .send(AgentEvent::Status(format!(
                    "thinking (step {}/{})",
                    self.current_step, self.max_steps
                )))
                .await;

            // Cost-bound the context before every think call.
            self.memory.summarize(&self.router).await;
            self.maybe_prepend_prompt();

            let schemas = model_schemas(&self.dispatcher);
            let turn = tokio::select! {
                biased;
                _ = &mut cancel => None,
                r = self.router.ask_tool(self.memory.serialize(), &schemas, ToolChoice::Auto) => Some(r),
            };
            let response = match turn {
                None => return self.abort(&tx).await,
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    self.fail_run(&e);
                    break;
                }
            };

            let content = sanitize::strip_control_tokens(response.text());
            let tool_calls = response.tool_calls.unwrap_or_default();

            if tool_calls.is_empty() {
                // The model produced a final answer (or nothing at all).
                if !content.is_empty() {
                    let _ = tx.send(AgentEvent::Content(content.clone())).await;
                    self.final_answer = Some(content.clone());
                }
                self.memory.add(Message::assistant(content));
                self.state = AgentState::Finished;
                break;
            }

            let content_opt = (!content.is_empty()).then(|| content.clone());
            self.memory
                .add(Message::assistant_with_tools(content_opt, tool_calls.clone()));
            if !content.is_empty() {
                let _ = tx.send(AgentEvent::Content(content)).await;
            }

            // Act phase: calls execute in the order the model emitted them,
            // each response committed before the next call runs.
            let mut last_tool = String::new();
            for call in &tool_calls {
                if cancelled(&mut cancel) {
                    return self.abort(&tx).await;
                }
                let name = call.function.name.clone();
                last_tool = name.clone();

                if name == "terminate" && self.anti_laziness_trips() {
                    warn!("terminate intercepted: browser used without interaction");
                    self.memory.add(Message::tool(
                        prompts::INTERACTION_NUDGE,
                        name.as_str(),
                        call.id.as_str(),
                    ));
                    continue;
                }

                let _ = tx
                    .send(AgentEvent::ToolStarted {
                        call_id: call.id.clone(),
                        name: name.clone(),
                    })
                    .await;
                let _ = tx.send(AgentEvent::Status(format!("tool: {name}"))).await;

                let result = tokio::select! {
                    biased;
                    _ = &mut cancel => None,
                    r = self.dispatcher.execute(&name, &call.function.arguments) => Some(r),
                };
                let Some(result) = result else {
                    return self.abort(&tx).await;
                };

                let rendered = result.render();
                let tool_msg = match &result.image {
                    Some(img) => Message::tool_with_image(
                        rendered.clone(),
                        name.as_str(),
                        call.id.as_str(),
                        img.clone(),
                    ),
                    None => Message::tool(rendered.clone(), name.as_str(), call.id.as_str()),
                };
                self.memory.add(tool_msg);
                let _ = tx
                    .send(AgentEvent::ToolFinished {
                        call_id: call.id.clone(),
                        name: name.clone(),
                        output: rendered,
                        is_error: result.is_error(),
                    })
                    .await;

                if name == "terminate" && !result.is_error() {
                    self.final_answer = result.output.clone();
                    self.state = AgentState::Finished;
                }
            }

            if self.state == AgentState::Running
                && self.critic_enabled
                && !self.simple_tools.contains(&last_tool)
            {
                self.run_critic(&tx).await;
            }

            if self.state == AgentState::Running && self.is_stuck() {
                debug!("stuck loop detected; injecting corrective nudge");
                self.memory.add(Message::system(prompts::STUCK_NUDGE));
            }
        }

        if self.state == AgentState::Running {
            debug!(max_steps = self.max_steps, "step budget exhausted");
            self.state = AgentState::Finished;
        }

        if let Some(answer) = self.final_answer.clone() {
            let _ = tx.send(AgentEvent::Final(answer)).await;
        }

        if self.save_knowledge && self.state == AgentState::Finished {
            self.run_knowledge_hook().await;
        }

        self.final_answer.clone()
    }

    /// Terminal router failure: record it in memory as a value and flip the
    /// state.  Exactly one terminal transition per run.
    fn fail_run(&mut self, err: &RouterError) {
        warn!(error = %err, "model request failed; ending run");
        self.memory
            .add(Message::assistant(format!("Model request failed: {err}")));
        self.state = AgentState::Error;
    }

    async fn abort(&mut self, tx: &mpsc::Sender<AgentEvent>) -> Option<String> {
        warn!(agent = %self.name, "run cancelled");
        self.state = AgentState::Error;
        if let Some(answer) = self.final_answer.clone() {
            let _ = tx.send(AgentEvent::Final(answer)).await;
        }
        self.final_answer.clone()
    }

    /// Prepend the configured next-step prompt as a user message — unless it
    /// is already the last message, which would otherwise duplicate without
    /// bound across steps.
    fn maybe_prepend_prompt(&mut self) {
        if let Some(prompt) = &self.next_step_prompt {
            let already_last = self
                .memory
                .last()
                .is_some_and(|m| m.text() == prompt.as_str());
            if !already_last {
                self.memory.add(Message::user(prompt.clone()));
            }
        }
    }

    /// True iff the last four messages contain at least two assistant
    /// messages with identical non-empty textual content.
    fn is_stuck(&self) -> bool {
        let msgs = &self.memory.messages;
        let window = &msgs[msgs.len().saturating_sub(STUCK_WINDOW)..];
        let contents: Vec<&str> = window
            .iter()
            .filter(|m| m.role == Role::Assistant && !m.text().is_empty())
            .map(|m| m.text())
            .collect();
        contents
            .iter()
            .enumerate()
            .any(|(i, a)| contents[i + 1..].contains(a))
    }

    /// True when a browser tool was called within the recent window but no
    /// interaction-class action (click/read/extract/input/scroll) has been
    /// issued, meaning a terminate now would conclude without having looked
    /// at the page.
    fn anti_laziness_trips(&self) -> bool {
        let msgs = &self.memory.messages;
        let window = &msgs[msgs.len().saturating_sub(LAZINESS_WINDOW)..];
        let mut browser_used = false;
        let mut interacted = false;
        for m in window {
            if m.role != Role::Assistant {
                continue;
            }
            let Some(calls) = &m.tool_calls else { continue };
            for call in calls {
                if !call.function.name.contains("browser") {
                    continue;
                }
                browser_used = true;
                let args = call.function.arguments.to_lowercase();
                if INTERACTION_ACTIONS.iter().any(|a| args.contains(a)) {
                    interacted = true;
                }
            }
        }
        browser_used && !interacted
    }

    /// Critic pass: one cheap content-only call judging whether the last act
    /// made progress.  Anything other than "PROCEED" is appended as user
    /// feedback for the next step.  Failures are logged and ignored.
    async fn run_critic(&mut self, tx: &mpsc::Sender<AgentEvent>) {
        let _ = tx.send(AgentEvent::Status("critic".into())).await;
        let mut msgs = self.memory.serialize();
        msgs.push(Message::user(prompts::CRITIC_PROMPT));
        match self.router.quick_ask(msgs, None).await {
            Ok(raw) => {
                let cleaned = sanitize::strip_control_tokens(&raw);
                let capped: String = cleaned.chars().take(CRITIC_MAX_CHARS).collect();
                if !capped.is_empty() && !capped.to_uppercase().contains("PROCEED") {
                    debug!(feedback = %capped, "critic requested a correction");
                    self.memory
                        .add(Message::user(format!("Critic feedback: {capped}")));
                }
            }
            Err(e) => warn!(error = %e, "critic pass failed; continuing"),
        }
    }

    /// Post-run knowledge hook: one quick model call and one tool call,
    /// outside the main step budget.  Requires a registered `save_knowledge`
    /// tool; silently skipped otherwise.
    async fn run_knowledge_hook(&mut self) {
        if !self.dispatcher.contains("save_knowledge") {
            return;
        }
        let mut msgs = self.memory.serialize();
        msgs.push(Message::user(prompts::KNOWLEDGE_PROMPT));
        match self.router.quick_ask(msgs, Some(300)).await {
            Ok(note) if !note.trim().is_empty() => {
                let args = serde_json::json!({
                    "content": sanitize::strip_control_tokens(&note)
                })
                .to_string();
                let result = self.dispatcher.execute("save_knowledge", &args).await;
                if result.is_error() {
                    warn!(error = %result.render(), "knowledge save failed");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "knowledge hook model call failed"),
        }
    }
}

fn cancelled(cancel: &mut oneshot::Receiver<()>) -> bool {
    // An explicit send(()) and a dropped sender both count as cancellation;
    // only an empty-but-open channel means "keep going".
    !matches!(
        cancel.try_recv(),
        Err(oneshot::error::TryRecvError::Empty)
    )
}

/// Bridge the dispatcher's schema type into the model crate's wire type.
fn model_schemas(dispatcher: &Dispatcher) -> Vec<lotus_model::ToolSchema> {
    dispatcher
        .schemas()
        .into_iter()
        .map(|s| lotus_model::ToolSchema {
            name: s.name,
            description: s.description,
            parameters: s.parameters,
        })
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
