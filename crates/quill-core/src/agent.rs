// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use quill_config::Config;
use quill_memory::MemoryManager;
use quill_model::{
    Completion, CompletionRequest, FinishReason, LlmError, LlmProvider, Message,
};
use quill_tools::{ToolContext, ToolRegistry};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::{
    dispatch::ToolDispatcher,
    error::{
        AgentError, Failure, CODE_MAX_LOOPS, CODE_MAX_RETRIES, CODE_RESPONSE_INVALID,
    },
    events::{AgentEvent, AgentStatus},
    input::{validate_input, UserInput},
    session::Session,
    stream::{SnapshotSink, StreamProcessor},
};

/// Injectable retry clock.  Production uses [`TokioSleeper`]; tests swap in
/// [`RecordingSleeper`] so backoff delays are observable without waiting.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Test-support sleeper: records every requested delay, returns immediately.
#[derive(Default)]
pub struct RecordingSleeper {
    slept: std::sync::Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<Duration> {
        self.slept.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept.lock().unwrap().push(duration);
    }
}

/// Cancellation handle shared with the caller.  `abort()` cancels pending
/// model and tool awaits promptly; the run terminates with status ABORTED
/// and the session is left satisfying its invariants.
#[derive(Clone, Default)]
pub struct AbortHandle {
    aborted: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Resolves once aborted.  The notified future is created before the
    /// flag check so a concurrent `abort()` cannot slip between them.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

/// Terminal result of one `execute` call.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: AgentStatus,
    pub content: Option<String>,
    pub failure: Option<Failure>,
}

/// The agent loop: drives turns against the provider, dispatches tool calls,
/// and applies the layered retry / compensation / compaction policy until a
/// terminal text response is produced or a failure budget is exhausted.
pub struct Agent {
    session: Session,
    registry: Arc<ToolRegistry>,
    provider: Arc<dyn LlmProvider>,
    config: Arc<Config>,
    memory: Arc<dyn MemoryManager>,
    status: AgentStatus,
    loop_count: u32,
    retry_count: u32,
    task_start: Option<DateTime<Utc>>,
    abort: AbortHandle,
    sleeper: Arc<dyn Sleeper>,
    loaded_from_persistence: bool,
    working_directory: Option<String>,
}

impl Agent {
    /// Create an agent with a fresh session seeded from `system_prompt`.
    pub async fn new(
        provider: Arc<dyn LlmProvider>,
        registry: Arc<ToolRegistry>,
        config: Arc<Config>,
        memory: Arc<dyn MemoryManager>,
        system_prompt: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let session = Session::new(
            Arc::clone(&memory),
            system_prompt,
            None,
            config.compaction.clone(),
        )
        .await?;
        Ok(Self::assemble(session, provider, registry, config, memory, false))
    }

    /// Re-open a persisted session.  Interrupted tool calls are repaired
    /// before the first model request of the next `execute`.
    pub async fn resume(
        provider: Arc<dyn LlmProvider>,
        registry: Arc<ToolRegistry>,
        config: Arc<Config>,
        memory: Arc<dyn MemoryManager>,
        session_id: &str,
    ) -> anyhow::Result<Self> {
        let session = Session::load(Arc::clone(&memory), session_id, config.compaction.clone())
            .await?;
        Ok(Self::assemble(session, provider, registry, config, memory, true))
    }

    fn assemble(
        session: Session,
        provider: Arc<dyn LlmProvider>,
        registry: Arc<ToolRegistry>,
        config: Arc<Config>,
        memory: Arc<dyn MemoryManager>,
        loaded_from_persistence: bool,
    ) -> Self {
        Self {
            session,
            registry,
            provider,
            config,
            memory,
            status: AgentStatus::Idle,
            loop_count: 0,
            retry_count: 0,
            task_start: None,
            abort: AbortHandle::new(),
            sleeper: Arc::new(TokioSleeper),
            loaded_from_persistence,
            working_directory: None,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Full message history, exclusions included.
    pub fn messages(&self) -> Vec<Message> {
        self.session.get_full_history().to_vec()
    }

    pub fn status(&self) -> AgentStatus {
        self.status
    }

    pub fn loop_count(&self) -> u32 {
        self.loop_count
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn task_start_time(&self) -> Option<DateTime<Utc>> {
        self.task_start
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn abort(&self) {
        self.abort.abort();
    }

    /// Run the loop to a terminal status, emitting observation events on `tx`.
    ///
    /// Invalid input is the only condition that returns `Err`; every failure
    /// inside the loop terminates with a FAILED outcome carrying a
    /// [`Failure`] record instead.
    pub async fn execute(
        &mut self,
        query: impl Into<UserInput>,
        tx: mpsc::Sender<AgentEvent>,
    ) -> Result<ExecutionOutcome, AgentError> {
        let query = query.into();
        // Reject malformed queries before any model traffic.
        validate_input(&query)?;

        self.task_start = Some(Utc::now());
        self.loop_count = 0;
        self.retry_count = 0;
        let mut compensation_retries: u32 = 0;
        self.set_status(&tx, AgentStatus::Running, None).await;

        self.session.save_current_context().await;
        if self.loaded_from_persistence {
            self.session.repair_on_load().await;
            self.loaded_from_persistence = false;
        }

        let user_msg = match query {
            UserInput::Text(text) => Message::user(text),
            UserInput::Parts(parts) => Message::user_with_parts(parts),
        };
        if let Err(e) = self.session.append(user_msg).await {
            return self
                .fail(&tx, Failure::unexpected(format!("session invariant: {e}")))
                .await;
        }

        loop {
            if self.abort.is_aborted() {
                return self.finish_aborted(&tx).await;
            }
            self.loop_count += 1;
            if self.loop_count > self.config.agent.max_loops {
                let max = self.config.agent.max_loops;
                return self
                    .fail(
                        &tx,
                        Failure::new(
                            CODE_MAX_LOOPS,
                            "The agent stopped before finishing. Please try again.",
                            format!("turn cap of {max} loops reached without a terminal response"),
                        ),
                    )
                    .await;
            }

            // Proactive compaction against the provider's token budget.
            let budget = self.provider.max_context_tokens() as usize;
            if self.session.needs_compaction(budget) {
                debug!(
                    tokens = self.session.token_estimate(),
                    budget, "token estimate reached compaction trigger"
                );
                self.session
                    .compact_before_next_llm_call(self.provider.as_ref(), "token_budget")
                    .await;
            }

            self.set_status(&tx, AgentStatus::Thinking, None).await;
            match self.run_turn(&tx).await {
                Ok(msg) => {
                    let tool_calls = msg.tool_calls().to_vec();
                    if !tool_calls.is_empty() {
                        if let Err(e) = self.session.append(msg).await {
                            return self
                                .fail(&tx, Failure::unexpected(format!("session invariant: {e}")))
                                .await;
                        }
                        if let Some(outcome) = self.run_tools(&tx, &tool_calls).await? {
                            return Ok(outcome);
                        }
                        continue;
                    }

                    let content = msg.as_text();
                    if msg.finish_reason == Some(FinishReason::Stop) && content.trim().is_empty() {
                        compensation_retries += 1;
                        let max = self.config.agent.max_compensation_retries;
                        if compensation_retries > max {
                            return self
                                .fail(
                                    &tx,
                                    Failure::new(
                                        CODE_MAX_RETRIES,
                                        "The model kept returning empty responses. Please try again.",
                                        format!(
                                            "maximum compensation retries ({max}) exceeded after \
                                             repeated empty finish_reason=stop responses"
                                        ),
                                    ),
                                )
                                .await;
                        }
                        // Keep the empty message in history, hide it from the
                        // model, and go again: no sleep, no retry credit.
                        let message_id = msg.message_id.clone();
                        if let Err(e) = self.session.append(msg).await {
                            return self
                                .fail(&tx, Failure::unexpected(format!("session invariant: {e}")))
                                .await;
                        }
                        self.session.mark_excluded(&message_id, "empty_response");
                        self.session.save_current_context().await;
                        self.set_status(
                            &tx,
                            AgentStatus::Retrying,
                            Some(format!("Compensation retry {compensation_retries}/{max}")),
                        )
                        .await;
                        continue;
                    }

                    // Terminal text response.
                    if let Err(e) = self.session.append(msg).await {
                        return self
                            .fail(&tx, Failure::unexpected(format!("session invariant: {e}")))
                            .await;
                    }
                    self.set_status(&tx, AgentStatus::Completed, None).await;
                    return Ok(ExecutionOutcome {
                        status: AgentStatus::Completed,
                        content: Some(content),
                        failure: None,
                    });
                }
                Err(AgentError::ContextCompression(reason)) => {
                    // Compact and retry the turn without consuming a credit.
                    self.set_status(
                        &tx,
                        AgentStatus::Retrying,
                        Some(format!("context compression requested: {reason}")),
                    )
                    .await;
                    self.session
                        .compact_before_next_llm_call(self.provider.as_ref(), "compression_error")
                        .await;
                    continue;
                }
                Err(AgentError::Aborted) => return self.finish_aborted(&tx).await,
                Err(AgentError::Provider(LlmError::Aborted)) => {
                    return self.finish_aborted(&tx).await
                }
                Err(AgentError::ResponseInvalid(internal)) => {
                    return self
                        .fail(
                            &tx,
                            Failure::new(
                                CODE_RESPONSE_INVALID,
                                "The model returned an invalid response.",
                                internal,
                            ),
                        )
                        .await;
                }
                Err(AgentError::Provider(e)) if e.is_retryable() => {
                    self.retry_count += 1;
                    if self.retry_count > self.config.agent.max_retries {
                        return self
                            .fail(
                                &tx,
                                Failure::new(
                                    CODE_MAX_RETRIES,
                                    "The model provider kept failing. Please try again later.",
                                    e.to_string(),
                                ),
                            )
                            .await;
                    }
                    self.set_status(&tx, AgentStatus::Retrying, Some(e.to_string()))
                        .await;
                    let base = Duration::from_millis(self.config.agent.retry_delay_ms);
                    let delay = e.retry_after().map(|ra| ra.max(base)).unwrap_or(base);
                    let abort = self.abort.clone();
                    let sleeper = Arc::clone(&self.sleeper);
                    let aborted_during_sleep = tokio::select! {
                        biased;
                        _ = abort.cancelled() => true,
                        _ = sleeper.sleep(delay) => false,
                    };
                    if aborted_during_sleep {
                        return self.finish_aborted(&tx).await;
                    }
                    continue;
                }
                Err(AgentError::Provider(LlmError::InvalidResponse(internal))) => {
                    return self
                        .fail(
                            &tx,
                            Failure::new(
                                CODE_RESPONSE_INVALID,
                                "The model returned an invalid response.",
                                internal,
                            ),
                        )
                        .await;
                }
                Err(err) => {
                    return self.fail(&tx, Failure::unexpected(err.to_string())).await;
                }
            }
        }
    }

    /// Like [`Agent::execute`], draining events internally and returning only
    /// the terminal outcome.
    pub async fn execute_with_result(
        &mut self,
        query: impl Into<UserInput>,
    ) -> Result<ExecutionOutcome, AgentError> {
        let (tx, mut rx) = mpsc::channel(256);
        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let outcome = self.execute(query, tx).await;
        let _ = drain.await;
        outcome
    }

    /// Dispatch one batch of tool calls and append the results in index
    /// order.  Returns `Some(outcome)` only when a session invariant breaks.
    async fn run_tools(
        &mut self,
        tx: &mpsc::Sender<AgentEvent>,
        tool_calls: &[quill_model::ToolCall],
    ) -> Result<Option<ExecutionOutcome>, AgentError> {
        let ctx = ToolContext {
            session_id: self.session.id().to_string(),
            working_directory: self.working_directory.clone(),
        };
        let dispatcher = ToolDispatcher::new(
            Arc::clone(&self.registry),
            Duration::from_secs(self.config.tools.timeout_secs),
        );
        let results = dispatcher.dispatch(tool_calls, &ctx).await;

        let mut any_failed = false;
        for r in &results {
            any_failed |= r.is_failure();
            let result_json = r.result.to_json();
            let _ = tx
                .send(AgentEvent::ToolCallResult {
                    tool_call_id: r.tool_call_id.clone(),
                    tool_name: r.name.clone(),
                    result: result_json.clone(),
                })
                .await;
            let tool_msg = Message::tool_result(&r.tool_call_id, result_json.to_string());
            if let Err(e) = self.session.append(tool_msg).await {
                let outcome = self
                    .fail(tx, Failure::unexpected(format!("session invariant: {e}")))
                    .await?;
                return Ok(Some(outcome));
            }
        }
        if any_failed {
            // Tool failures never fail the turn; the next model turn decides.
            self.set_status(
                tx,
                AgentStatus::Running,
                Some("Tool execution partially or fully failed".into()),
            )
            .await;
        }
        Ok(None)
    }

    /// Issue one model request and fold the response into a turn message.
    async fn run_turn(&mut self, tx: &mpsc::Sender<AgentEvent>) -> Result<Message, AgentError> {
        let req = CompletionRequest {
            messages: self.session.context_for_llm(),
            tools: self.registry.to_llm_tools(),
            stream: true,
            include_usage: true,
            max_output_tokens: None,
        };
        let request_timeout = Duration::from_millis(
            self.config
                .agent
                .request_timeout_ms
                .unwrap_or_else(|| self.provider.time_timeout_ms()),
        );
        let idle_timeout = Duration::from_millis(self.config.agent.idle_timeout_ms);
        let deadline = Instant::now() + request_timeout;

        let mut processor = StreamProcessor::new(
            &self.config.validator,
            tx.clone(),
            Some(SnapshotSink::new(
                Arc::clone(&self.memory),
                self.session.id(),
            )),
        );
        let budget = self.provider.max_context_tokens() as usize;
        let half_trigger = (self.config.compaction.trigger_ratio * budget as f32 / 2.0) as usize;
        processor.set_compaction_pressure(
            half_trigger > 0 && self.session.token_estimate() >= half_trigger,
        );

        let completion = tokio::select! {
            biased;
            _ = self.abort.cancelled() => return Err(AgentError::Aborted),
            result = tokio::time::timeout(request_timeout, self.provider.generate(req)) => {
                match result {
                    Err(_) => return Err(AgentError::Provider(LlmError::Timeout)),
                    Ok(Err(e)) => return Err(AgentError::Provider(e)),
                    Ok(Ok(completion)) => completion,
                }
            }
        };

        let mut chunks_seen = 0usize;
        match completion {
            Completion::Full(resp) => {
                if !resp.has_choices() {
                    return Err(AgentError::ResponseInvalid(
                        "response carried no choices".into(),
                    ));
                }
                chunks_seen += 1;
                processor.process_chunk(&resp.into_chunk()).await?;
            }
            Completion::Stream(mut chunks) => {
                loop {
                    // Whichever of the total deadline and the idle window is
                    // shorter governs this read.
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let wait = remaining.min(idle_timeout);
                    let next = tokio::select! {
                        biased;
                        _ = self.abort.cancelled() => return Err(AgentError::Aborted),
                        next = tokio::time::timeout(wait, chunks.next()) => next,
                    };
                    match next {
                        Err(_) => return Err(AgentError::Provider(LlmError::Timeout)),
                        Ok(None) => break,
                        Ok(Some(Err(e))) => return Err(AgentError::Provider(e)),
                        Ok(Some(Ok(chunk))) => {
                            chunks_seen += 1;
                            processor.process_chunk(&chunk).await?;
                            if processor.aborted() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        if chunks_seen == 0 {
            return Err(AgentError::ResponseInvalid("stream produced no chunks".into()));
        }
        if processor.aborted() {
            let reason = processor.abort_reason().unwrap_or("aborted");
            return Err(AgentError::Unexpected(format!("stream aborted: {reason}")));
        }
        processor.finalize().await;
        Ok(processor.build_response())
    }

    async fn set_status(
        &mut self,
        tx: &mpsc::Sender<AgentEvent>,
        status: AgentStatus,
        message: Option<String>,
    ) {
        self.status = status;
        let _ = tx.send(AgentEvent::Status { status, message }).await;
    }

    async fn fail(
        &mut self,
        tx: &mpsc::Sender<AgentEvent>,
        failure: Failure,
    ) -> Result<ExecutionOutcome, AgentError> {
        warn!(code = %failure.code, internal = %failure.internal, "agent run failed");
        self.set_status(tx, AgentStatus::Failed, Some(failure.message.clone()))
            .await;
        Ok(ExecutionOutcome {
            status: AgentStatus::Failed,
            content: None,
            failure: Some(failure),
        })
    }

    async fn finish_aborted(
        &mut self,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> Result<ExecutionOutcome, AgentError> {
        self.set_status(tx, AgentStatus::Aborted, None).await;
        Ok(ExecutionOutcome {
            status: AgentStatus::Aborted,
            content: None,
            failure: None,
        })
    }
}
