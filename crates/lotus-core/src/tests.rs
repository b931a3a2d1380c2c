// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// End-to-end tests for the agent loop.
///
/// Every scenario runs against scripted mock backends, so the tests are
/// deterministic and need no network access.
#[cfg(test)]
mod agent_loop_tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    use lotus_config::{CacheSettings, Config, ProviderConfig};
    use lotus_model::{
        ChatBackend, ChatResponse, FailingBackend, Message, ProviderHandle, Role, Router,
        ScriptStep, ScriptedBackend, ToolCall, Usage,
    };
    use lotus_tools::{builtin::CalculatorTool, builtin::TerminateTool, Dispatcher, Tool, ToolResult};

    use crate::{Agent, AgentEvent, AgentState};

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn base_config() -> Config {
        let mut cfg = Config::default();
        cfg.agent.critic_enabled = false; // scripted tests control every model call
        cfg
    }

    fn router_for(backend: Arc<dyn ChatBackend>) -> Router {
        Router::new(
            ProviderHandle::new(ProviderConfig::default(), backend),
            vec![],
            &CacheSettings {
                enabled: false,
                capacity: 0,
            },
            true,
        )
    }

    fn dispatcher_for(config: &Config) -> Dispatcher {
        let mut d = Dispatcher::new(&config.tools, false);
        d.register(CalculatorTool);
        d.register(TerminateTool);
        d
    }

    fn agent_for(config: &Config, backend: Arc<dyn ChatBackend>) -> Agent {
        Agent::new(config, router_for(backend), dispatcher_for(config))
    }

    fn content_with_call(text: &str, call: ToolCall) -> ScriptStep {
        ScriptStep::Reply(ChatResponse {
            message: Message::assistant_with_tools(Some(text.into()), vec![call]),
            usage: Usage::default(),
        })
    }

    async fn collect_events(mut rx: mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        events
    }

    /// Fake browser tool for the anti-laziness scenarios.
    struct FakeBrowserTool;

    #[async_trait]
    impl Tool for FakeBrowserTool {
        fn name(&self) -> &str {
            "browser_use"
        }
        fn description(&self) -> &str {
            "drives a browser"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object", "properties": { "action": { "type": "string" } } })
        }
        fn cacheable(&self) -> bool {
            false
        }
        async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
            Ok(ToolResult::ok(format!(
                "browser did: {}",
                args["action"].as_str().unwrap_or("?")
            )))
        }
    }

    /// Tool producing a 20 000-character output for the truncation scenario.
    struct HugeTool;

    #[async_trait]
    impl Tool for HugeTool {
        fn name(&self) -> &str {
            "huge"
        }
        fn description(&self) -> &str {
            "emits a very large output"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, _args: Value) -> anyhow::Result<ToolResult> {
            let s: String = (0..20_000)
                .map(|i| char::from(b'a' + (i % 26) as u8))
                .collect();
            Ok(ToolResult::ok(s))
        }
    }

    /// Records calls; stands in for a knowledge store.
    struct RecordingKnowledgeTool {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for RecordingKnowledgeTool {
        fn name(&self) -> &str {
            "save_knowledge"
        }
        fn description(&self) -> &str {
            "stores a note"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object", "properties": { "content": { "type": "string" } } })
        }
        fn cacheable(&self) -> bool {
            false
        }
        async fn execute(&self, _args: Value) -> anyhow::Result<ToolResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ToolResult::ok("saved"))
        }
    }

    // ── Scenario: single tool then finish ─────────────────────────────────────

    #[tokio::test]
    async fn single_tool_then_finish() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            ScriptStep::tool_call("a", "calculator", r#"{"expression":"2+2"}"#),
            ScriptStep::text("4"),
        ]));
        let config = base_config();
        let mut agent = agent_for(&config, backend);
        let (tx, rx) = mpsc::channel(256);

        let answer = agent.run(Some("What is 2+2?"), tx).await;
        let events = collect_events(rx).await;

        assert_eq!(agent.state(), AgentState::Finished);
        assert_eq!(answer.as_deref(), Some("4"));
        assert_eq!(agent.memory().last().unwrap().text(), "4");
        assert_eq!(agent.memory().last().unwrap().role, Role::Assistant);

        // The calculator result is recorded as a paired tool message.
        let tool_msg = agent
            .memory()
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("a"));
        assert_eq!(tool_msg.name.as_deref(), Some("calculator"));
        assert_eq!(tool_msg.text(), "4");

        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::Status(s) if s.contains("thinking"))));
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::Final(a) if a == "4")));
    }

    // ── Scenario: failover ────────────────────────────────────────────────────

    #[tokio::test]
    async fn failover_then_terminate() {
        let primary = Arc::new(FailingBackend::new("primary", "429 rate limit"));
        let backup = Arc::new(ScriptedBackend::new(vec![ScriptStep::tool_call(
            "t1",
            "terminate",
            r#"{"output":"done"}"#,
        )]));

        let config = base_config();
        let router = Router::new(
            ProviderHandle::new(
                ProviderConfig {
                    name: "primary".into(),
                    ..Default::default()
                },
                primary,
            ),
            vec![ProviderHandle::new(
                ProviderConfig {
                    name: "backup".into(),
                    ..Default::default()
                },
                backup.clone(),
            )],
            &CacheSettings {
                enabled: false,
                capacity: 0,
            },
            true,
        )
        .with_retry_policy(lotus_model::RetryPolicy {
            attempts: 2,
            base_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(2),
        });
        let mut agent = Agent::new(&config, router, dispatcher_for(&config));
        let (tx, _rx) = mpsc::channel(256);

        let answer = agent.run(Some("finish up"), tx).await;

        assert_eq!(agent.state(), AgentState::Finished);
        assert_eq!(answer.as_deref(), Some("done"));

        // Usage recorded against the backup that actually answered.
        let usage = agent.router().usage();
        let usage = usage.lock().unwrap();
        let providers: Vec<String> = usage.records().map(|r| r.provider.clone()).collect();
        assert_eq!(providers, vec!["backup"]);
    }

    // ── Scenario: oversize tool output ────────────────────────────────────────

    #[tokio::test]
    async fn oversize_tool_output_is_truncated_in_memory() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            ScriptStep::tool_call("h1", "huge", "{}"),
            ScriptStep::text("summarised"),
        ]));
        let config = base_config();
        let mut dispatcher = dispatcher_for(&config);
        dispatcher.register(HugeTool);
        let mut agent = Agent::new(&config, router_for(backend), dispatcher)
            .with_simple_tools(["huge", "terminate", "calculator"]);
        let (tx, _rx) = mpsc::channel(256);

        agent.run(Some("go"), tx).await;

        let original: String = (0..20_000)
            .map(|i| char::from(b'a' + (i % 26) as u8))
            .collect();
        let tool_msg = agent
            .memory()
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        let text = tool_msg.text();
        assert!(text.chars().count() <= 10_000);
        let head: String = original.chars().take(4_000).collect();
        let tail: String = original.chars().skip(16_000).collect();
        assert!(text.starts_with(&head), "head must survive verbatim");
        assert!(text.ends_with(&tail), "tail must survive verbatim");
        assert!(text.contains("TRUNCATED"));
    }

    // ── Scenario: stuck loop ──────────────────────────────────────────────────

    #[tokio::test]
    async fn stuck_loop_gets_a_nudge_visible_on_the_next_turn() {
        let calc = |id: &str| ToolCall::function(id, "calculator", r#"{"expression":"1+1"}"#);
        let backend = Arc::new(ScriptedBackend::new(vec![
            content_with_call("I will think.", calc("c1")),
            content_with_call("I will think.", calc("c2")),
            ScriptStep::text("done"),
        ]));
        let config = base_config();
        let mut agent = agent_for(&config, backend.clone());
        let (tx, _rx) = mpsc::channel(256);

        let answer = agent.run(Some("compute"), tx).await;
        assert_eq!(answer.as_deref(), Some("done"));

        // The nudge landed in memory after the repeated turn...
        let nudge = agent
            .memory()
            .messages
            .iter()
            .find(|m| m.role == Role::System && m.text().contains("repeating yourself"));
        assert!(nudge.is_some(), "stuck nudge must be appended");

        // ...and was visible to the model on the third think call.
        let last_req = backend.last_request.lock().unwrap();
        let saw_nudge = last_req
            .as_ref()
            .unwrap()
            .messages
            .iter()
            .any(|m| m.text().contains("repeating yourself"));
        assert!(saw_nudge, "third turn must see the nudge");
    }

    // ── Scenario: anti-laziness interception ──────────────────────────────────

    #[tokio::test]
    async fn premature_terminate_after_browser_is_intercepted() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            ScriptStep::tool_call(
                "b1",
                "browser_use",
                r#"{"action":"go_to_url","url":"https://example.com"}"#,
            ),
            ScriptStep::tool_call("t1", "terminate", r#"{"output":"premature"}"#),
            ScriptStep::text("done after interacting"),
        ]));
        let config = base_config();
        let mut dispatcher = dispatcher_for(&config);
        dispatcher.register(FakeBrowserTool);
        let mut agent = Agent::new(&config, router_for(backend), dispatcher);
        let (tx, _rx) = mpsc::channel(256);

        let answer = agent.run(Some("check the site"), tx).await;

        // The terminate did not end the run; the loop continued to step 3.
        assert_eq!(answer.as_deref(), Some("done after interacting"));
        assert_eq!(agent.current_step(), 3);

        // A synthetic tool response carries the intervention, paired to the
        // intercepted call id.
        let intervention = agent
            .memory()
            .messages
            .iter()
            .find(|m| m.role == Role::Tool && m.text().contains("interacted"))
            .expect("intervention tool message");
        assert_eq!(intervention.tool_call_id.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn terminate_after_interaction_is_allowed() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            ScriptStep::tool_call("b1", "browser_use", r#"{"action":"go_to_url"}"#),
            ScriptStep::tool_call("b2", "browser_use", r#"{"action":"click_element","index":2}"#),
            ScriptStep::tool_call("t1", "terminate", r#"{"output":"verified"}"#),
        ]));
        let config = base_config();
        let mut dispatcher = dispatcher_for(&config);
        dispatcher.register(FakeBrowserTool);
        let mut agent = Agent::new(&config, router_for(backend), dispatcher);
        let (tx, _rx) = mpsc::channel(256);

        let answer = agent.run(Some("check the site"), tx).await;
        assert_eq!(agent.state(), AgentState::Finished);
        assert_eq!(answer.as_deref(), Some("verified"));
    }

    // ── Step budget ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn step_budget_bounds_think_calls() {
        let calc = |id: &str| {
            ScriptStep::tool_call(id, "calculator", r#"{"expression":"1+1"}"#)
        };
        let backend = Arc::new(ScriptedBackend::new(vec![
            calc("a"),
            calc("b"),
            calc("c"),
            calc("d"),
        ]));
        let mut config = base_config();
        config.agent.max_steps = 2;
        let mut agent = agent_for(&config, backend.clone());
        let (tx, _rx) = mpsc::channel(256);

        let answer = agent.run(Some("loop forever"), tx).await;

        assert_eq!(backend.calls(), 2, "exactly max_steps think calls");
        assert_eq!(agent.state(), AgentState::Finished);
        assert!(answer.is_none(), "no final answer was captured");
    }

    // ── Router failure handling ───────────────────────────────────────────────

    #[tokio::test]
    async fn fatal_router_error_ends_run_with_error_state() {
        let backend = Arc::new(FailingBackend::new("primary", "400 Bad Request: nope"));
        let config = base_config();
        let mut agent = agent_for(&config, backend);
        let (tx, _rx) = mpsc::channel(256);

        let answer = agent.run(Some("hello"), tx).await;

        assert_eq!(agent.state(), AgentState::Error);
        assert!(answer.is_none());
        let last = agent.memory().last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert!(last.text().contains("Model request failed"));
    }

    // ── Tool error surfacing ──────────────────────────────────────────────────

    #[tokio::test]
    async fn unknown_tool_call_is_recorded_for_self_correction() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            ScriptStep::tool_call("x1", "time_machine", "{}"),
            ScriptStep::text("understood, no such tool"),
        ]));
        let config = base_config();
        let mut agent = agent_for(&config, backend)
            .with_simple_tools(["time_machine", "terminate", "calculator"]);
        let (tx, _rx) = mpsc::channel(256);

        agent.run(Some("try it"), tx).await;

        let tool_msg = agent
            .memory()
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert!(tool_msg.text().contains("not found"));
        assert_eq!(agent.state(), AgentState::Finished);
    }

    // ── Tool-call/response pairing across a parallel batch ────────────────────

    #[tokio::test]
    async fn parallel_tool_calls_each_get_one_paired_response_in_order() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            ScriptStep::tool_calls(vec![
                ToolCall::function("p1", "calculator", r#"{"expression":"1+1"}"#),
                ToolCall::function("p2", "calculator", r#"{"expression":"2+2"}"#),
            ]),
            ScriptStep::text("both computed"),
        ]));
        let config = base_config();
        let mut agent = agent_for(&config, backend);
        let (tx, _rx) = mpsc::channel(256);

        agent.run(Some("two sums"), tx).await;

        let ids: Vec<&str> = agent
            .memory()
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        assert_eq!(ids, vec!["p1", "p2"], "one response per call, in emit order");

        let outputs: Vec<&str> = agent
            .memory()
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.text())
            .collect();
        assert_eq!(outputs, vec!["2", "4"]);
    }

    // ── Critic pass ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn critic_feedback_is_appended_as_user_message() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            ScriptStep::tool_call("b1", "browser_use", r#"{"action":"read_page"}"#),
            ScriptStep::text("FEEDBACK: the page content is missing"), // critic reply
            ScriptStep::text("let me fix that"),
        ]));
        let mut config = base_config();
        config.agent.critic_enabled = true;
        let mut dispatcher = dispatcher_for(&config);
        dispatcher.register(FakeBrowserTool);
        let mut agent = Agent::new(&config, router_for(backend), dispatcher);
        let (tx, _rx) = mpsc::channel(256);

        agent.run(Some("read the page"), tx).await;

        let feedback = agent
            .memory()
            .messages
            .iter()
            .find(|m| m.role == Role::User && m.text().starts_with("Critic feedback:"));
        assert!(feedback.is_some(), "critic feedback must land in memory");
    }

    #[tokio::test]
    async fn critic_proceed_adds_nothing() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            ScriptStep::tool_call("b1", "browser_use", r#"{"action":"read_page"}"#),
            ScriptStep::text("PROCEED"), // critic reply
            ScriptStep::text("continuing"),
        ]));
        let mut config = base_config();
        config.agent.critic_enabled = true;
        let mut dispatcher = dispatcher_for(&config);
        dispatcher.register(FakeBrowserTool);
        let mut agent = Agent::new(&config, router_for(backend), dispatcher);
        let (tx, _rx) = mpsc::channel(256);

        agent.run(Some("read the page"), tx).await;

        assert!(!agent
            .memory()
            .messages
            .iter()
            .any(|m| m.text().starts_with("Critic feedback:")));
    }

    #[tokio::test]
    async fn critic_skipped_for_simple_tools() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            ScriptStep::tool_call("c1", "calculator", r#"{"expression":"3+3"}"#),
            ScriptStep::text("6"),
        ]));
        let mut config = base_config();
        config.agent.critic_enabled = true;
        let mut agent = agent_for(&config, backend.clone());
        let (tx, _rx) = mpsc::channel(256);

        agent.run(Some("sum"), tx).await;

        // Two think calls only — no critic call in between.
        assert_eq!(backend.calls(), 2);
    }

    // ── Events ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn event_stream_reports_tool_lifecycle() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            ScriptStep::tool_call("a", "calculator", r#"{"expression":"2+2"}"#),
            ScriptStep::text("4"),
        ]));
        let config = base_config();
        let mut agent = agent_for(&config, backend);
        let (tx, rx) = mpsc::channel(256);

        agent.run(Some("sum"), tx).await;
        let events = collect_events(rx).await;

        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::ToolStarted { name, .. } if name == "calculator")));
        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::ToolFinished { name, output, is_error: false, .. }
                if name == "calculator" && output == "4"
        )));
    }

    // ── Cancellation ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn pre_cancelled_run_aborts_with_error_state() {
        let backend = Arc::new(ScriptedBackend::always_text("never reached"));
        let config = base_config();
        let mut agent = agent_for(&config, backend.clone());
        let (tx, _rx) = mpsc::channel(256);

        let (ctx, cancel) = tokio::sync::oneshot::channel();
        ctx.send(()).unwrap();
        let answer = agent.run_with_cancel(Some("hi"), tx, cancel).await;

        assert_eq!(agent.state(), AgentState::Error);
        assert!(answer.is_none());
        assert_eq!(backend.calls(), 0, "no model call after cancellation");
    }

    // ── Post-run knowledge hook ───────────────────────────────────────────────

    #[tokio::test]
    async fn knowledge_hook_runs_once_after_finish() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            ScriptStep::text("the answer"),
            ScriptStep::text("Learned: scripted agents are deterministic."),
        ]));
        let mut config = base_config();
        config.agent.save_knowledge = true;
        let calls = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = dispatcher_for(&config);
        dispatcher.register(RecordingKnowledgeTool {
            calls: calls.clone(),
        });
        let mut agent = Agent::new(&config, router_for(backend.clone()), dispatcher);
        let (tx, _rx) = mpsc::channel(256);

        agent.run(Some("question"), tx).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1, "knowledge saved exactly once");
        assert_eq!(backend.calls(), 2, "one think call + one hook call");
        assert_eq!(agent.state(), AgentState::Finished);
    }

    #[tokio::test]
    async fn knowledge_hook_skipped_without_registered_tool() {
        let backend = Arc::new(ScriptedBackend::new(vec![ScriptStep::text("the answer")]));
        let mut config = base_config();
        config.agent.save_knowledge = true;
        let mut agent = agent_for(&config, backend.clone());
        let (tx, _rx) = mpsc::channel(256);

        agent.run(Some("question"), tx).await;
        assert_eq!(backend.calls(), 1, "no hook call without a knowledge tool");
    }

    // ── Reset between turns ───────────────────────────────────────────────────

    #[tokio::test]
    async fn reset_allows_a_follow_up_run_with_kept_memory() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            ScriptStep::text("first answer"),
            ScriptStep::text("second answer"),
        ]));
        let config = base_config();
        let mut agent = agent_for(&config, backend);

        let (tx, _rx) = mpsc::channel(256);
        let first = agent.run(Some("one"), tx).await;
        assert_eq!(first.as_deref(), Some("first answer"));

        agent.reset();
        assert_eq!(agent.state(), AgentState::Idle);

        let (tx2, _rx2) = mpsc::channel(256);
        let second = agent.run(Some("two"), tx2).await;
        assert_eq!(second.as_deref(), Some("second answer"));

        // The session kept the earlier exchange.
        assert!(agent
            .memory()
            .messages
            .iter()
            .any(|m| m.text() == "first answer"));
    }
}
