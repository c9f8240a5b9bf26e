// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// Scenario tests for the agent loop.
///
/// Uses `ScriptedProvider` so every scenario is deterministic and requires
/// no network access; retry backoff is observed through `RecordingSleeper`
/// instead of wall-clock sleeps.
#[cfg(test)]
mod agent_tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use quill_config::{AgentConfig, CompactionConfig, Config};
    use quill_memory::{InMemoryBackend, MemoryManager};
    use quill_model::{
        Chunk, Completion, CompletionRequest, CompletionResponse, FinishReason, LlmError,
        LlmProvider, Message, ResponseChoice, ResponseMessage, Role, Script, ScriptedProvider,
        ToolCall, Usage,
    };
    use quill_tools::{Tool, ToolContext, ToolRegistry, ToolResult};
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    use crate::{
        Agent, AgentEvent, AgentStatus, AgentError, RecordingSleeper, CODE_MAX_LOOPS,
        CODE_MAX_RETRIES,
    };

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn test_config() -> Config {
        Config {
            agent: AgentConfig {
                max_loops: 10,
                retry_delay_ms: 1_000,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn agent_with(
        provider: Arc<ScriptedProvider>,
        registry: ToolRegistry,
        config: Config,
    ) -> (Agent, Arc<RecordingSleeper>) {
        let sleeper = Arc::new(RecordingSleeper::new());
        let agent = Agent::new(
            provider,
            Arc::new(registry),
            Arc::new(config),
            Arc::new(InMemoryBackend::new()),
            "You are a coding agent.",
        )
        .await
        .unwrap()
        .with_sleeper(Arc::clone(&sleeper) as Arc<dyn crate::Sleeper>);
        (agent, sleeper)
    }

    fn channel() -> (mpsc::Sender<AgentEvent>, mpsc::Receiver<AgentEvent>) {
        mpsc::channel(1024)
    }

    /// Drain everything buffered in the channel after execute() returned.
    fn drain(rx: &mut mpsc::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    fn statuses(events: &[AgentEvent]) -> Vec<AgentStatus> {
        events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Status { status, .. } => Some(*status),
                _ => None,
            })
            .collect()
    }

    struct LookupTool;

    #[async_trait]
    impl Tool for LookupTool {
        fn name(&self) -> &str {
            "lookup"
        }
        fn description(&self) -> &str {
            "looks something up"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object", "properties": { "q": { "type": "string" } } })
        }
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> ToolResult {
            ToolResult::ok(json!("found"))
        }
    }

    /// Provider whose stream never yields: used for timeout and abort tests.
    struct PendingProvider;

    #[async_trait]
    impl LlmProvider for PendingProvider {
        fn name(&self) -> &str {
            "pending"
        }
        fn model_name(&self) -> &str {
            "pending-model"
        }
        fn max_context_tokens(&self) -> u32 {
            128_000
        }
        fn max_output_tokens(&self) -> u32 {
            4096
        }
        async fn generate(&self, _req: CompletionRequest) -> Result<Completion, LlmError> {
            Ok(Completion::Stream(Box::pin(futures::stream::pending())))
        }
    }

    // ── Non-stream completion ────────────────────────────────────────────

    #[tokio::test]
    async fn non_stream_completion_terminates_with_text() {
        let provider = Arc::new(ScriptedProvider::new(vec![Script::Full(
            CompletionResponse {
                choices: vec![ResponseChoice {
                    index: 0,
                    message: ResponseMessage {
                        role: Some(Role::Assistant),
                        content: Some("hello world".into()),
                        ..Default::default()
                    },
                    finish_reason: Some(FinishReason::Stop),
                }],
                usage: Some(Usage {
                    total_tokens: 13,
                    ..Default::default()
                }),
                ..Default::default()
            },
        )]));
        let (mut agent, _) =
            agent_with(Arc::clone(&provider), ToolRegistry::new(), test_config()).await;
        let (tx, mut rx) = channel();

        let outcome = agent.execute("hi", tx).await.unwrap();
        let events = drain(&mut rx);

        assert_eq!(outcome.status, AgentStatus::Completed);
        assert_eq!(outcome.content.as_deref(), Some("hello world"));
        assert_eq!(provider.call_count(), 1);

        let st = statuses(&events);
        assert_eq!(
            st.iter().filter(|s| **s == AgentStatus::Running).count(),
            1,
            "exactly one RUNNING status"
        );
        assert_eq!(
            st.iter().filter(|s| **s == AgentStatus::Completed).count(),
            1,
            "exactly one COMPLETED status"
        );
        // The uniform stream path still emits text events for the UI.
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::TextDelta(t) if t == "hello world")));
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::UsageUpdate(u) if u.total_tokens == 13)));
    }

    // ── Tool round-trip ───────────────────────────────────────────────────

    #[tokio::test]
    async fn tool_round_trip_appends_call_and_result() {
        let provider = Arc::new(ScriptedProvider::tool_then_text(
            "call_1",
            "lookup",
            r#"{"q":"docs"}"#,
            "tool result consumed",
        ));
        let mut registry = ToolRegistry::new();
        registry.register(LookupTool);
        let (mut agent, _) = agent_with(Arc::clone(&provider), registry, test_config()).await;
        let (tx, mut rx) = channel();

        let outcome = agent.execute("look up the docs", tx).await.unwrap();
        let _events = drain(&mut rx);

        assert_eq!(outcome.status, AgentStatus::Completed);
        assert_eq!(outcome.content.as_deref(), Some("tool result consumed"));

        let msgs = agent.messages();
        assert_eq!(msgs.len(), 5, "system, user, assistant, tool, assistant");
        assert_eq!(msgs[0].role, Role::System);
        assert_eq!(msgs[1].role, Role::User);
        assert_eq!(msgs[2].role, Role::Assistant);
        assert_eq!(msgs[2].tool_calls()[0].id, "call_1");
        assert_eq!(msgs[3].role, Role::Tool);
        assert_eq!(msgs[3].tool_call_id.as_deref(), Some("call_1"));
        let result: Value = serde_json::from_str(&msgs[3].as_text()).unwrap();
        assert_eq!(result["success"], true);
        assert_eq!(result["output"], "found");
        assert_eq!(msgs[4].role, Role::Assistant);
        assert_eq!(msgs[4].as_text(), "tool result consumed");
    }

    // ── Argument streaming split ──────────────────────────────────────────

    #[tokio::test]
    async fn split_tool_arguments_reassemble() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Script::Chunks(vec![
                Chunk::tool_call(0, Some("call_split"), Some("lookup"), Some(r#"{"path"#)),
                Chunk::tool_call(0, None, None, Some(r#"": "test.txt""#)),
                Chunk::tool_call(0, None, None, Some("}")),
                Chunk::finish(FinishReason::ToolCalls),
            ]),
            Script::Chunks(vec![
                Chunk::text("read it"),
                Chunk::finish(FinishReason::Stop),
            ]),
        ]));
        let mut registry = ToolRegistry::new();
        registry.register(LookupTool);
        let (mut agent, _) = agent_with(provider, registry, test_config()).await;

        let outcome = agent.execute_with_result("go").await.unwrap();
        assert_eq!(outcome.status, AgentStatus::Completed);

        let msgs = agent.messages();
        let asst = msgs.iter().find(|m| !m.tool_calls().is_empty()).unwrap();
        let args = &asst.tool_calls()[0].function.arguments;
        assert_eq!(args, r#"{"path": "test.txt"}"#);
        assert!(serde_json::from_str::<Value>(args).is_ok());
    }

    // ── Empty-response compensation ────────────────────────────────────────────

    #[tokio::test]
    async fn empty_response_compensation_exhausted() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Script::Chunks(vec![Chunk::finish(FinishReason::Stop)]),
            Script::Chunks(vec![Chunk::finish(FinishReason::Stop)]),
        ]));
        let (mut agent, sleeper) =
            agent_with(provider, ToolRegistry::new(), test_config()).await;
        let (tx, mut rx) = channel();

        let outcome = agent.execute("hello?", tx).await.unwrap();
        let events = drain(&mut rx);

        assert_eq!(outcome.status, AgentStatus::Failed);
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.code, CODE_MAX_RETRIES);
        assert!(
            failure.internal.contains("maximum compensation retries"),
            "internal was: {}",
            failure.internal
        );

        let retrying: Vec<&Option<String>> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Status {
                    status: AgentStatus::Retrying,
                    message,
                } => Some(message),
                _ => None,
            })
            .collect();
        assert_eq!(retrying.len(), 1, "exactly one RETRYING event");
        assert!(retrying[0].as_deref().unwrap().contains("Compensation retry"));
        assert!(sleeper.recorded().is_empty(), "no backoff sleeps recorded");
    }

    #[tokio::test]
    async fn compensation_does_not_consume_generic_retry_credit() {
        // max_retries = 0: any generic retry would fail immediately, so a
        // successful run proves compensation used no credit.
        let provider = Arc::new(ScriptedProvider::empty_then_text(1, "second try worked"));
        let mut config = test_config();
        config.agent.max_retries = 0;
        let (mut agent, sleeper) = agent_with(provider, ToolRegistry::new(), config).await;

        let outcome = agent.execute_with_result("try").await.unwrap();
        assert_eq!(outcome.status, AgentStatus::Completed);
        assert_eq!(outcome.content.as_deref(), Some("second try worked"));
        assert_eq!(agent.retry_count(), 0);
        assert!(sleeper.recorded().is_empty());

        // The empty assistant message stays in history but is excluded.
        let excluded: Vec<&Message> = agent
            .session()
            .get_full_history()
            .iter()
            .filter(|m| m.excluded_from_context)
            .collect();
        assert_eq!(excluded.len(), 1);
        assert_eq!(excluded[0].excluded_reason.as_deref(), Some("empty_response"));
        assert!(agent
            .session()
            .context_for_llm()
            .iter()
            .all(|m| !m.excluded_from_context));
    }

    // ── Retryable errors ────────────────────────────────────────────

    #[tokio::test]
    async fn retryable_error_honours_retry_after() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Script::Fail(LlmError::rate_limited(
                "slow down",
                Some(Duration::from_millis(15_000)),
            )),
            Script::Chunks(vec![
                Chunk::text("recovered"),
                Chunk::finish(FinishReason::Stop),
            ]),
        ]));
        let (mut agent, sleeper) =
            agent_with(provider, ToolRegistry::new(), test_config()).await;
        let (tx, mut rx) = channel();

        let outcome = agent.execute("please", tx).await.unwrap();
        let events = drain(&mut rx);

        assert_eq!(outcome.status, AgentStatus::Completed);
        assert_eq!(outcome.content.as_deref(), Some("recovered"));
        assert_eq!(sleeper.recorded(), vec![Duration::from_millis(15_000)]);
        assert_eq!(agent.retry_count(), 1);

        let retry_reason = events.iter().find_map(|e| match e {
            AgentEvent::Status {
                status: AgentStatus::Retrying,
                message,
            } => message.clone(),
            _ => None,
        });
        assert!(retry_reason.unwrap().contains("[RATE_LIMITED]"));
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_fails_with_last_error() {
        let fail = || Script::Fail(LlmError::Api {
            status: 503,
            code: "UNAVAILABLE".into(),
            message: "overloaded".into(),
            retry_after: None,
        });
        let provider = Arc::new(ScriptedProvider::new(vec![fail(), fail(), fail()]));
        let mut config = test_config();
        config.agent.max_retries = 2;
        let (mut agent, sleeper) = agent_with(provider, ToolRegistry::new(), config).await;

        let outcome = agent.execute_with_result("go").await.unwrap();
        assert_eq!(outcome.status, AgentStatus::Failed);
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.code, CODE_MAX_RETRIES);
        assert!(failure.internal.contains("[UNAVAILABLE]"));
        assert_eq!(sleeper.recorded().len(), 2, "one sleep per consumed credit");
    }

    // ── Interrupted tool-call repair on resume ────────────────────────────

    #[tokio::test]
    async fn resume_repairs_interrupted_tool_call() {
        let memory: Arc<dyn MemoryManager> = Arc::new(InMemoryBackend::new());
        let record = memory.create_session(None).await.unwrap();
        let seeded = vec![
            Message::system("You are a coding agent."),
            Message::user("start the task"),
            Message::assistant_with_tool_calls(
                "",
                vec![ToolCall::new("call_resume_1", "lookup", "{}")],
            ),
        ];
        memory
            .save_current_context(&record.session_id, &seeded)
            .await
            .unwrap();

        let provider = Arc::new(ScriptedProvider::always_text("resumed fine"));
        let mut agent = Agent::resume(
            Arc::clone(&provider) as Arc<dyn LlmProvider>,
            Arc::new(ToolRegistry::new()),
            Arc::new(test_config()),
            memory,
            &record.session_id,
        )
        .await
        .unwrap();

        let outcome = agent.execute_with_result("continue").await.unwrap();
        assert_eq!(outcome.status, AgentStatus::Completed);

        // The request the provider actually saw must contain the synthetic
        // repair directly after the assistant tool-call message.
        let req = provider.last_request.lock().unwrap().take().unwrap();
        let asst_pos = req
            .messages
            .iter()
            .position(|m| !m.tool_calls().is_empty())
            .expect("assistant with tool calls in request");
        let repair = &req.messages[asst_pos + 1];
        assert_eq!(repair.role, Role::Tool);
        assert_eq!(repair.tool_call_id.as_deref(), Some("call_resume_1"));
        let content: Value = serde_json::from_str(&repair.as_text()).unwrap();
        assert_eq!(content["error"], "TOOL_CALL_INTERRUPTED");
        assert_eq!(content["interrupted"], true);
    }

    // ── Sensitive-field redaction ─────────────────────────────────────────

    struct LeakyTool;

    #[async_trait]
    impl Tool for LeakyTool {
        fn name(&self) -> &str {
            "leaky"
        }
        fn description(&self) -> &str {
            "returns credentials"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> ToolResult {
            ToolResult::ok(json!({
                "password": "pwd",
                "token": "tok",
                "secret": "sec",
                "apiKey": "a1",
                "api_key": "a2",
                "authorization": "auth",
                "output": "safe",
            }))
        }
    }

    const SENSITIVE: [&str; 6] = [
        "password",
        "token",
        "secret",
        "apiKey",
        "api_key",
        "authorization",
    ];

    #[tokio::test]
    async fn redaction_in_event_and_persisted_message() {
        let provider = Arc::new(ScriptedProvider::tool_then_text(
            "call_leak",
            "leaky",
            "{}",
            "done",
        ));
        let mut registry = ToolRegistry::new();
        registry.register(LeakyTool);
        let (mut agent, _) = agent_with(provider, registry, test_config()).await;
        let (tx, mut rx) = channel();

        agent.execute("leak", tx).await.unwrap();
        let events = drain(&mut rx);

        let event_payload = events
            .iter()
            .find_map(|e| match e {
                AgentEvent::ToolCallResult { result, .. } => Some(result.clone()),
                _ => None,
            })
            .expect("tool result event");
        for key in SENSITIVE {
            assert_eq!(event_payload["output"][key], "[REDACTED]", "event key {key}");
        }
        assert_eq!(event_payload["output"]["output"], "safe");

        let msgs = agent.messages();
        let tool_msg = msgs.iter().find(|m| m.role == Role::Tool).unwrap();
        let persisted: Value = serde_json::from_str(&tool_msg.as_text()).unwrap();
        for key in SENSITIVE {
            assert_eq!(persisted["output"][key], "[REDACTED]", "persisted key {key}");
        }
        assert_eq!(persisted["output"]["output"], "safe");
    }

    // ── Input validation ─────────────────────────────────────────────────

    #[tokio::test]
    async fn invalid_input_never_reaches_the_provider() {
        let provider = Arc::new(ScriptedProvider::always_text("unreachable"));
        let (mut agent, _) =
            agent_with(Arc::clone(&provider), ToolRegistry::new(), test_config()).await;

        let err = agent.execute_with_result("   ").await.err().unwrap();
        assert!(matches!(err, AgentError::InvalidInput(_)));
        assert_eq!(provider.call_count(), 0);

        let bad_parts = vec![quill_model::ContentPart::File {
            file: Default::default(),
        }];
        let err = agent.execute_with_result(bad_parts).await.err().unwrap();
        assert!(matches!(err, AgentError::InvalidInput(_)));
        assert_eq!(provider.call_count(), 0);
    }

    // ── Loop cap ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn loop_cap_fails_with_max_loops_code() {
        let scripts: Vec<Script> = (0..6)
            .map(|i| {
                let id = format!("call_{i}");
                Script::Chunks(vec![
                    Chunk::tool_call(0, Some(id.as_str()), Some("lookup"), Some("{}")),
                    Chunk::finish(FinishReason::ToolCalls),
                ])
            })
            .collect();
        let provider = Arc::new(ScriptedProvider::new(scripts));
        let mut registry = ToolRegistry::new();
        registry.register(LookupTool);
        let mut config = test_config();
        config.agent.max_loops = 2;
        let (mut agent, _) = agent_with(provider, registry, config).await;

        let outcome = agent.execute_with_result("loop forever").await.unwrap();
        assert_eq!(outcome.status, AgentStatus::Failed);
        assert_eq!(outcome.failure.unwrap().code, CODE_MAX_LOOPS);
        assert_eq!(agent.loop_count(), 3, "two turns ran, the third hit the cap");
    }

    // ── Tool failure folding ──────────────────────────────────────────────────

    #[tokio::test]
    async fn unknown_tool_warns_but_run_continues() {
        let provider = Arc::new(ScriptedProvider::tool_then_text(
            "call_1",
            "no_such_tool",
            "{}",
            "recovered anyway",
        ));
        let (mut agent, _) = agent_with(provider, ToolRegistry::new(), test_config()).await;
        let (tx, mut rx) = channel();

        let outcome = agent.execute("try", tx).await.unwrap();
        let events = drain(&mut rx);

        assert_eq!(outcome.status, AgentStatus::Completed);
        assert_eq!(outcome.content.as_deref(), Some("recovered anyway"));
        let warn_status = events.iter().any(|e| {
            matches!(e, AgentEvent::Status { status: AgentStatus::Running, message: Some(m) }
                if m == "Tool execution partially or fully failed")
        });
        assert!(warn_status, "RUNNING status with the failure note expected");

        let msgs = agent.messages();
        let tool_msg = msgs.iter().find(|m| m.role == Role::Tool).unwrap();
        let result: Value = serde_json::from_str(&tool_msg.as_text()).unwrap();
        assert_eq!(result["success"], false);
        assert_eq!(result["error"], "unknown tool");
        assert_eq!(result["warning"], true);
    }

    // ── Cancellation ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn abort_mid_stream_terminates_with_aborted() {
        let (mut agent, _) = {
            let sleeper = Arc::new(RecordingSleeper::new());
            let agent = Agent::new(
                Arc::new(PendingProvider),
                Arc::new(ToolRegistry::new()),
                Arc::new(test_config()),
                Arc::new(InMemoryBackend::new()),
                "sys",
            )
            .await
            .unwrap()
            .with_sleeper(sleeper.clone() as Arc<dyn crate::Sleeper>);
            (agent, sleeper)
        };
        let handle = agent.abort_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            handle.abort();
        });
        let (tx, mut rx) = channel();

        let outcome = agent.execute("long task", tx).await.unwrap();
        let events = drain(&mut rx);

        assert_eq!(outcome.status, AgentStatus::Aborted);
        assert!(outcome.failure.is_none());
        let st = statuses(&events);
        assert!(st.contains(&AgentStatus::Aborted));
        assert!(!st.contains(&AgentStatus::Failed), "abort is not a failure");
    }

    #[tokio::test]
    async fn abort_before_execute_starts_no_turn() {
        let provider = Arc::new(ScriptedProvider::always_text("should not run"));
        let (mut agent, _) =
            agent_with(Arc::clone(&provider), ToolRegistry::new(), test_config()).await;
        agent.abort();

        let outcome = agent.execute_with_result("hi").await.unwrap();
        assert_eq!(outcome.status, AgentStatus::Aborted);
        assert_eq!(provider.call_count(), 0);
    }

    // ── Timeouts ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn request_timeout_wins_over_longer_idle_timeout() {
        let mut config = test_config();
        config.agent.request_timeout_ms = Some(50);
        config.agent.idle_timeout_ms = 600_000;
        config.agent.max_retries = 0;
        let mut agent = Agent::new(
            Arc::new(PendingProvider),
            Arc::new(ToolRegistry::new()),
            Arc::new(config),
            Arc::new(InMemoryBackend::new()),
            "sys",
        )
        .await
        .unwrap()
        .with_sleeper(Arc::new(RecordingSleeper::new()) as Arc<dyn crate::Sleeper>);

        let started = std::time::Instant::now();
        let outcome = agent.execute_with_result("hang").await.unwrap();
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "request timeout must fire long before the idle timeout"
        );
        assert_eq!(outcome.status, AgentStatus::Failed);
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.code, CODE_MAX_RETRIES);
        assert!(failure.internal.contains("TIMEOUT"));
    }

    // ── Proactive compaction ──────────────────────────────────────────────────

    #[tokio::test]
    async fn token_pressure_triggers_compaction_before_the_turn() {
        // Tiny context window so the second execute crosses the trigger.
        let provider = Arc::new(
            ScriptedProvider::new(vec![
                Script::Chunks(vec![
                    Chunk::text("first reply with a reasonable amount of text"),
                    Chunk::finish(FinishReason::Stop),
                ]),
                // Consumed by the compaction summary request.
                Script::Chunks(vec![
                    Chunk::text("summary of the earlier exchange"),
                    Chunk::finish(FinishReason::Stop),
                ]),
                Script::Chunks(vec![
                    Chunk::text("second reply"),
                    Chunk::finish(FinishReason::Stop),
                ]),
            ])
            .with_context_window(30),
        );
        let mut config = test_config();
        config.compaction = CompactionConfig {
            keep_messages_num: 1,
            ..Default::default()
        };
        let (mut agent, _) = agent_with(provider, ToolRegistry::new(), config).await;

        let first = agent
            .execute_with_result("tell me something fairly long please")
            .await
            .unwrap();
        assert_eq!(first.status, AgentStatus::Completed);
        assert!(agent.session().compaction_records().is_empty());

        let second = agent.execute_with_result("and another thing").await.unwrap();
        assert_eq!(second.status, AgentStatus::Completed);
        assert_eq!(second.content.as_deref(), Some("second reply"));

        let records = agent.session().compaction_records();
        assert_eq!(records.len(), 1);
        assert!(records[0].succeeded);
        assert_eq!(records[0].reason, "token_budget");
        assert!(agent
            .session()
            .get_full_history()
            .iter()
            .any(|m| m.meta.compacted));
    }

    // ── Session isolation ─────────────────────────────────────────────────────

    #[derive(Default)]
    struct SessionRecorder {
        calls: Mutex<Vec<String>>,
    }

    struct RecordingTool {
        seen: Arc<SessionRecorder>,
    }

    #[async_trait]
    impl Tool for RecordingTool {
        fn name(&self) -> &str {
            "record"
        }
        fn description(&self) -> &str {
            "records the session id it was called with"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, _args: Value, ctx: &ToolContext) -> ToolResult {
            self.seen.calls.lock().unwrap().push(ctx.session_id.clone());
            ToolResult::ok(json!("recorded"))
        }
    }

    #[tokio::test]
    async fn concurrent_agents_keep_their_session_ids_apart() {
        let seen = Arc::new(SessionRecorder::default());
        let mut registry = ToolRegistry::new();
        registry.register(RecordingTool {
            seen: Arc::clone(&seen),
        });
        let registry = Arc::new(registry);

        let mut agents = Vec::new();
        for i in 0..2 {
            let provider = Arc::new(ScriptedProvider::tool_then_text(
                format!("call_{i}"),
                "record",
                "{}",
                "done",
            ));
            let agent = Agent::new(
                provider,
                Arc::clone(&registry),
                Arc::new(test_config()),
                Arc::new(InMemoryBackend::new()),
                "sys",
            )
            .await
            .unwrap();
            agents.push(agent);
        }
        let ids: Vec<String> = agents.iter().map(|a| a.session_id().to_string()).collect();
        assert_ne!(ids[0], ids[1]);

        let mut handles = Vec::new();
        for mut agent in agents {
            handles.push(tokio::spawn(async move {
                agent.execute_with_result("go").await.unwrap().status
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), AgentStatus::Completed);
        }

        let mut recorded = seen.calls.lock().unwrap().clone();
        recorded.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(recorded, expected, "each call carried its own session id");
    }

    // ── Terminal accessors ────────────────────────────────────────────────────

    #[tokio::test]
    async fn accessors_reflect_run_state() {
        let provider = Arc::new(ScriptedProvider::always_text("ok"));
        let (mut agent, _) = agent_with(provider, ToolRegistry::new(), test_config()).await;
        assert_eq!(agent.status(), AgentStatus::Idle);
        assert!(agent.task_start_time().is_none());

        let outcome = agent.execute_with_result("q").await.unwrap();
        assert_eq!(outcome.status, AgentStatus::Completed);
        assert_eq!(agent.status(), AgentStatus::Completed);
        assert_eq!(agent.loop_count(), 1);
        assert_eq!(agent.retry_count(), 0);
        assert!(agent.task_start_time().is_some());
        assert!(!agent.session_id().is_empty());
    }
}
