//! The loop itself: prompt, parse, act, observe, and the resume path.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::types::error_kind_metadata;
use crate::agent::{Agent, AgentInput, AgentOutput, ReasoningStep, RunStatus};
use crate::checkpoint::{Checkpoint, CheckpointError};
use crate::error::{AgentError, ErrorKind};
use crate::executor::{CallEnv, ToolCall, ToolCallRecord};
use crate::interrupt::{
    DecisionPhase, DecisionPoint, Interrupt, InterruptStatus, Resolution, WaitOutcome,
};
use crate::llm::{CompletionRequest, TokenUsage};
use crate::message::Message;
use crate::parser::{self, ParsedStep, ProposedAction};
use crate::prompts;
use crate::state::SessionState;
use crate::stream::{MessageChunk, StreamEmitter, StreamEvent, StreamMode, StreamMultiplexer};

/// Reserved keys carrying loop bookkeeping inside a checkpoint snapshot.
/// Stripped back out before the session state is rebuilt on resume.
const KEY_TASK: &str = "__axon.task";
const KEY_INSTRUCTION: &str = "__axon.instruction";
const KEY_CONTEXT: &str = "__axon.context";
const KEY_SCRATCHPAD: &str = "__axon.scratchpad";
const KEY_THOUGHT: &str = "__axon.thought";
const KEY_PLANNED: &str = "__axon.planned";

/// Where a resumed run re-enters the loop.
pub(crate) struct ResumePoint {
    session_id: String,
    state: Arc<SessionState>,
    scratchpad: String,
    turn: usize,
    thought: String,
    planned: Vec<ProposedAction>,
}

/// Result of evaluating interrupt rules at one decision point.
enum ParkOutcome {
    Continue,
    Terminal {
        status: RunStatus,
        message: String,
        error_kind: Option<ErrorKind>,
    },
}

/// Everything a rule evaluation needs to snapshot and park.
struct RuleScope<'a> {
    session_id: &'a str,
    state: &'a Arc<SessionState>,
    input: &'a AgentInput,
    scratchpad: &'a str,
    thought: &'a str,
    planned: &'a [ProposedAction],
    emitter: Option<&'a StreamEmitter>,
    turn: usize,
}

impl Agent {
    /// Runs one session to its terminal output.
    ///
    /// Errors are values: tool failures become observations, LLM/parse
    /// failures a `failed` status, cancellation a `cancelled` status. The
    /// returned `Err` is reserved for `Internal` defects.
    pub async fn invoke(
        &self,
        cancel: &CancellationToken,
        input: AgentInput,
    ) -> Result<AgentOutput, AgentError> {
        self.execute(cancel, input, None).await
    }

    /// Like [`Agent::invoke`] but events stream incrementally for the
    /// subscribed `modes`. The final event (mode `values`) carries the
    /// terminal output — subscribe to [`StreamMode::Values`] to receive it.
    pub fn stream(
        self: Arc<Self>,
        cancel: CancellationToken,
        input: AgentInput,
        modes: HashSet<StreamMode>,
    ) -> mpsc::Receiver<StreamEvent> {
        let (emitter, rx) = StreamMultiplexer::start(modes, cancel.clone());
        tokio::spawn(async move {
            let output = match self.execute(&cancel, input, Some(&emitter)).await {
                Ok(output) => output,
                Err(error) => self.minimal_output(
                    RunStatus::Failed,
                    format!("internal failure: {error}"),
                    Some(error.kind()),
                ),
            };
            emitter.emit(StreamEvent::final_output(output));
            // Dropping the emitter lets the merge loop drain and close.
        });
        rx
    }

    /// Resolves a pending interrupt and produces a terminal output.
    ///
    /// When the interrupted run is still parked in-process, the resolution
    /// is delivered to it and that run continues toward its own output;
    /// the value returned here then only acknowledges delivery. Otherwise
    /// the checkpoint saved at park time (`interrupt_<id>`) is loaded and
    /// the loop continues from it: `approve` re-enters at the parked
    /// dispatch, `reject` terminates with status `cancelled`. The
    /// checkpoint is deleted once the interrupt is resolved.
    pub async fn resume(
        &self,
        cancel: &CancellationToken,
        session_id: &str,
        interrupt_id: &str,
        resolution: Resolution,
    ) -> Result<AgentOutput, AgentError> {
        if let Some(existing) = self.interrupts.get(interrupt_id) {
            if existing.status == InterruptStatus::Pending {
                self.interrupts.resolve(interrupt_id, resolution.clone())?;
                let status = if resolution.is_approve() {
                    RunStatus::Success
                } else {
                    RunStatus::Cancelled
                };
                let mut output = self.minimal_output(
                    status,
                    format!("resolution delivered to parked run for interrupt {interrupt_id}"),
                    None,
                );
                output.metadata.insert("resolved_in_flight".into(), json!(true));
                return Ok(output);
            }
        }

        let name = format!("interrupt_{interrupt_id}");
        let checkpoint = self
            .checkpointer
            .load(session_id, &name)
            .await
            .map_err(|e| match e {
                CheckpointError::NotFound { .. } => {
                    AgentError::NotFound(format!("interrupt {interrupt_id}"))
                }
                other => AgentError::Transient(other.to_string()),
            })?;

        for interrupt in &checkpoint.pending_interrupts {
            if self.interrupts.get(&interrupt.id).is_none() {
                self.interrupts.restore(interrupt.clone());
            }
        }
        let _ = self.interrupts.resolve(interrupt_id, resolution.clone());
        if let Err(e) = self.checkpointer.delete(session_id, &name).await {
            tracing::warn!(session_id, interrupt_id, error = %e, "checkpoint delete failed");
        }
        self.interrupts.remove(interrupt_id);

        if !resolution.is_approve() {
            return Ok(self.minimal_output(
                RunStatus::Cancelled,
                format!("interrupt {interrupt_id} rejected"),
                None,
            ));
        }

        let (point, task, instruction, context) = unpack_checkpoint(session_id, checkpoint)?;
        let input = AgentInput {
            task,
            instruction,
            context,
        };
        self.run(cancel, input, None, Some(point)).await
    }

    /// Cache consult, then the loop. Shared by invoke and stream.
    async fn execute(
        &self,
        cancel: &CancellationToken,
        input: AgentInput,
        emitter: Option<&StreamEmitter>,
    ) -> Result<AgentOutput, AgentError> {
        let Some(cache) = &self.cache else {
            return self.run(cancel, input, emitter, None).await;
        };

        let fingerprint = input.fingerprint();
        if let Some(hit) = cache.get(&fingerprint) {
            let mut output = (*hit).clone();
            output.timestamp = Utc::now();
            output.metadata.insert("cache_hit".into(), json!(true));
            if let Some(emitter) = emitter {
                emitter.emit(
                    StreamEvent::snapshot(HashMap::new())
                        .with_metadata("cache_hit", json!(true))
                        .with_metadata("result", output.result.clone()),
                );
            }
            return Ok(output);
        }

        // A cancelled run must not be stored; it escapes the coalescing
        // cell as an error, with the real output smuggled alongside.
        let cancelled_slot: Arc<StdMutex<Option<AgentOutput>>> = Arc::new(StdMutex::new(None));
        let result = cache
            .coalesce_compute(&fingerprint, || {
                let slot = Arc::clone(&cancelled_slot);
                async move {
                    let output = self.run(cancel, input, emitter, None).await?;
                    if output.status == RunStatus::Cancelled {
                        *slot.lock().expect("slot lock") = Some(output);
                        Err(AgentError::Cancelled)
                    } else {
                        Ok(Arc::new(output))
                    }
                }
            })
            .await;

        match result {
            Ok(shared) => Ok((*shared).clone()),
            Err(AgentError::Cancelled) => {
                let own = cancelled_slot.lock().expect("slot lock").take();
                Ok(own.unwrap_or_else(|| {
                    self.minimal_output(RunStatus::Cancelled, "run cancelled", None)
                }))
            }
            Err(other) => Err(other),
        }
    }

    /// The state machine. `resume` re-enters mid-step with the parked
    /// dispatch already approved.
    pub(crate) async fn run(
        &self,
        cancel: &CancellationToken,
        input: AgentInput,
        emitter: Option<&StreamEmitter>,
        resume: Option<ResumePoint>,
    ) -> Result<AgentOutput, AgentError> {
        let started = Instant::now();
        let (session_id, state, mut scratchpad, mut turn, mut pending, mut skip_dispatch_rules) =
            match resume {
                Some(point) => {
                    let pending = if point.planned.is_empty() {
                        None
                    } else {
                        Some((point.thought, point.planned))
                    };
                    (
                        point.session_id,
                        point.state,
                        point.scratchpad,
                        point.turn,
                        pending,
                        true,
                    )
                }
                None => {
                    let session_id = uuid::Uuid::new_v4().to_string();
                    let state = Arc::new(SessionState::new(session_id.clone()));
                    (session_id, state, String::new(), 0usize, None, false)
                }
            };

        if !self.llm.available() {
            return Ok(self.finish_run(
                RunStatus::Failed,
                Value::Null,
                format!("LLM provider {:?} unavailable", self.llm.provider()),
                Vec::new(),
                Vec::new(),
                &session_id,
                started,
                None,
                Some(ErrorKind::Transient),
                emitter,
            ));
        }

        tracing::debug!(agent = %self.name, session_id = %session_id, task = %input.task, "run start");
        let env = CallEnv::new(
            cancel.clone(),
            Arc::clone(&state),
            self.store.clone(),
            emitter.cloned(),
        );
        let system_prompt = prompts::build_system_prompt(
            self.prompt_prefix.as_deref(),
            &self.description,
            &self.registry.descriptors(),
            &self.registry.names(),
            &self.format_instructions,
            self.prompt_suffix.as_deref(),
        );

        let mut steps: Vec<ReasoningStep> = Vec::new();
        let mut call_records: Vec<ToolCallRecord> = Vec::new();
        let mut usage_total: Option<TokenUsage> = None;

        loop {
            if cancel.is_cancelled() {
                return Ok(self.finish_run(
                    RunStatus::Cancelled,
                    json!(scratchpad),
                    "run cancelled",
                    steps,
                    call_records,
                    &session_id,
                    started,
                    usage_total,
                    Some(ErrorKind::Cancelled),
                    emitter,
                ));
            }

            if pending.is_none() {
                if turn >= self.max_steps {
                    return Ok(self.finish_run(
                        RunStatus::Partial,
                        json!(scratchpad),
                        format!("step bound of {} reached", self.max_steps),
                        steps,
                        call_records,
                        &session_id,
                        started,
                        usage_total,
                        None,
                        emitter,
                    ));
                }

                // Prompt.
                if let Some(emitter) = emitter {
                    emitter.emit(StreamEvent::update(
                        "loop",
                        json!({"phase": "prompt", "turn": turn}),
                    ));
                }
                let user_message = prompts::build_user_message(
                    &input.task,
                    input.instruction.as_deref(),
                    &input.context_lines(),
                    &scratchpad,
                );
                let (content, usage) = match self
                    .call_llm(cancel, emitter, &system_prompt, user_message, turn)
                    .await
                {
                    Ok(done) => done,
                    Err(error) if error.kind() == ErrorKind::Cancelled => {
                        return Ok(self.finish_run(
                            RunStatus::Cancelled,
                            json!(scratchpad),
                            "run cancelled during LLM call",
                            steps,
                            call_records,
                            &session_id,
                            started,
                            usage_total,
                            Some(ErrorKind::Cancelled),
                            emitter,
                        ));
                    }
                    Err(error) => {
                        steps.push(ReasoningStep::failure(steps.len(), &error));
                        return Ok(self.finish_run(
                            RunStatus::Failed,
                            json!(scratchpad),
                            format!("LLM call failed: {error}"),
                            steps,
                            call_records,
                            &session_id,
                            started,
                            usage_total,
                            Some(error.kind()),
                            emitter,
                        ));
                    }
                };
                if let Some(usage) = usage {
                    usage_total = Some(match usage_total {
                        Some(total) => total.add(&usage),
                        None => usage,
                    });
                }
                let content = apply_stop_patterns(content, &self.stop_patterns);

                // ParseStep.
                match parser::parse(&content) {
                    Ok(ParsedStep::Final { thought: _, answer }) => {
                        steps.push(ReasoningStep::final_answer(steps.len(), &answer));
                        return Ok(self.finish_run(
                            RunStatus::Success,
                            json!(answer),
                            "final answer",
                            steps,
                            call_records,
                            &session_id,
                            started,
                            usage_total,
                            None,
                            emitter,
                        ));
                    }
                    Ok(ParsedStep::Action { thought, actions }) => {
                        steps.push(ReasoningStep::thought(steps.len(), &thought));
                        let scope = RuleScope {
                            session_id: &session_id,
                            state: &state,
                            input: &input,
                            scratchpad: &scratchpad,
                            thought: &thought,
                            planned: &actions,
                            emitter,
                            turn,
                        };
                        match self
                            .evaluate_rules(cancel, DecisionPhase::AfterParse, &scope)
                            .await
                        {
                            ParkOutcome::Continue => {}
                            ParkOutcome::Terminal {
                                status,
                                message,
                                error_kind,
                            } => {
                                return Ok(self.finish_run(
                                    status,
                                    json!(scratchpad),
                                    message,
                                    steps,
                                    call_records,
                                    &session_id,
                                    started,
                                    usage_total,
                                    error_kind,
                                    emitter,
                                ));
                            }
                        }
                        pending = Some((thought, actions));
                    }
                    Err(error) => {
                        steps.push(ReasoningStep::failure(steps.len(), &error));
                        return Ok(self.finish_run(
                            RunStatus::Failed,
                            json!(scratchpad),
                            format!("unparseable LLM output: {error}"),
                            steps,
                            call_records,
                            &session_id,
                            started,
                            usage_total,
                            Some(ErrorKind::Parse),
                            emitter,
                        ));
                    }
                }
            }

            // Act.
            let (thought, actions) = match pending.take() {
                Some(planned) => planned,
                None => continue,
            };
            if let Some(missing) = actions.iter().find(|a| !self.registry.contains(&a.tool)) {
                let error = AgentError::NotFound(format!("tool {:?}", missing.tool));
                steps.push(ReasoningStep::failure(steps.len(), &error));
                return Ok(self.finish_run(
                    RunStatus::Failed,
                    json!(scratchpad),
                    error.to_string(),
                    steps,
                    call_records,
                    &session_id,
                    started,
                    usage_total,
                    Some(ErrorKind::NotFound),
                    emitter,
                ));
            }

            if !skip_dispatch_rules {
                let scope = RuleScope {
                    session_id: &session_id,
                    state: &state,
                    input: &input,
                    scratchpad: &scratchpad,
                    thought: &thought,
                    planned: &actions,
                    emitter,
                    turn,
                };
                match self
                    .evaluate_rules(cancel, DecisionPhase::BeforeToolDispatch, &scope)
                    .await
                {
                    ParkOutcome::Continue => {}
                    ParkOutcome::Terminal {
                        status,
                        message,
                        error_kind,
                    } => {
                        return Ok(self.finish_run(
                            status,
                            json!(scratchpad),
                            message,
                            steps,
                            call_records,
                            &session_id,
                            started,
                            usage_total,
                            error_kind,
                            emitter,
                        ));
                    }
                }
            }
            skip_dispatch_rules = false;

            let calls: Vec<ToolCall> = actions
                .iter()
                .map(|a| ToolCall::new(&a.tool, a.input.clone()))
                .collect();
            if let Some(emitter) = emitter {
                let descriptors: Vec<Value> = calls
                    .iter()
                    .map(|c| json!({"id": c.id, "tool": c.name, "input": c.input}))
                    .collect();
                emitter.emit(StreamEvent::update(
                    "loop",
                    json!({"phase": "act", "turn": turn, "calls": descriptors}),
                ));
            }

            let records = self.dispatch_tools(cancel, &env, calls, turn).await;

            // Observe. Results come back index-aligned with the actions.
            for (action, record) in actions.iter().zip(&records) {
                steps.push(ReasoningStep::action(steps.len(), record));
                let entry = parser::format_observation(
                    &thought,
                    &action.tool,
                    &action.input,
                    &record.observation_text(),
                );
                scratchpad.push_str(&entry);
                scratchpad.push('\n');
                if let Some(emitter) = emitter {
                    emitter.emit(StreamEvent::update(
                        "loop",
                        json!({
                            "phase": "observe",
                            "turn": turn,
                            "call_id": record.id,
                            "tool": record.name,
                            "success": record.success,
                            "attempts": record.attempts,
                        }),
                    ));
                }
            }
            call_records.extend(records);
            if let Some(emitter) = emitter {
                emitter.emit(StreamEvent::snapshot(state.snapshot()));
            }

            if cancel.is_cancelled() {
                return Ok(self.finish_run(
                    RunStatus::Cancelled,
                    json!(scratchpad),
                    "run cancelled during tool dispatch",
                    steps,
                    call_records,
                    &session_id,
                    started,
                    usage_total,
                    Some(ErrorKind::Cancelled),
                    emitter,
                ));
            }

            turn += 1;
        }
    }

    /// One chain-wrapped LLM call. The chain sees the user message as its
    /// request input and the completion content as its response output, so
    /// transform middlewares apply to both sides.
    async fn call_llm(
        &self,
        cancel: &CancellationToken,
        emitter: Option<&StreamEmitter>,
        system_prompt: &str,
        user_message: String,
        turn: usize,
    ) -> Result<(String, Option<TokenUsage>), AgentError> {
        let usage_slot: Arc<StdMutex<Option<TokenUsage>>> = Arc::new(StdMutex::new(None));
        let metadata = HashMap::from([
            ("phase".to_string(), json!("llm")),
            ("turn".to_string(), json!(turn)),
        ]);

        let outcome = self
            .chain
            .run(cancel, Value::String(user_message), metadata, {
                let llm = Arc::clone(&self.llm);
                let usage_slot = Arc::clone(&usage_slot);
                let stop = self.stop_patterns.clone();
                let system = system_prompt.to_string();
                let timeout = self.llm_timeout;
                let emitter = emitter.cloned();
                let cancel = cancel.clone();
                move |input| async move {
                    let user = match input {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    let request = CompletionRequest {
                        messages: vec![Message::system(system), Message::user(user)],
                        stop,
                        metadata: HashMap::new(),
                    };
                    let llm_call = async {
                        match &emitter {
                            Some(emitter) => {
                                let (tx, mut rx) = mpsc::channel::<MessageChunk>(64);
                                let forward = async {
                                    while let Some(chunk) = rx.recv().await {
                                        emitter.emit(StreamEvent::token(chunk.content));
                                    }
                                };
                                let (response, ()) =
                                    tokio::join!(llm.complete_stream(request, Some(tx)), forward);
                                response
                            }
                            None => llm.complete(request).await,
                        }
                    };
                    let response = tokio::select! {
                        _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                        result = tokio::time::timeout(timeout, llm_call) => match result {
                            Ok(inner) => inner?,
                            Err(_) => return Err(AgentError::Timeout(timeout)),
                        },
                    };
                    *usage_slot.lock().expect("usage slot") = response.usage;
                    Ok(Value::String(response.content))
                }
            })
            .await;

        let usage = *usage_slot.lock().expect("usage slot");
        let content = outcome.output?;
        let content = match content {
            Value::String(s) => s,
            other => other.to_string(),
        };
        Ok((content, usage))
    }

    /// One chain-wrapped parallel dispatch. A `before` short-circuit fails
    /// every call in the batch with the middleware's error; the loop folds
    /// those into observations like any other tool failure.
    async fn dispatch_tools(
        &self,
        cancel: &CancellationToken,
        env: &CallEnv,
        calls: Vec<ToolCall>,
        turn: usize,
    ) -> Vec<ToolCallRecord> {
        let descriptors: Vec<Value> = calls
            .iter()
            .map(|c| json!({"id": c.id, "tool": c.name, "input": c.input}))
            .collect();
        let metadata = HashMap::from([
            ("phase".to_string(), json!("tools")),
            ("turn".to_string(), json!(turn)),
        ]);
        let backup = calls.clone();
        let slot: Arc<StdMutex<Option<Vec<ToolCallRecord>>>> = Arc::new(StdMutex::new(None));

        let outcome = self
            .chain
            .run(cancel, Value::Array(descriptors), metadata, {
                let slot = Arc::clone(&slot);
                let env = env.clone();
                let executor = &self.executor;
                move |_input| async move {
                    let records = executor.execute_parallel(&env, calls).await;
                    *slot.lock().expect("records slot") = Some(records);
                    Ok(Value::Null)
                }
            })
            .await;

        let stored = slot.lock().expect("records slot").take();
        match stored {
            Some(records) => records,
            None => {
                let error = match outcome.output {
                    Err(error) => error,
                    Ok(_) => AgentError::Internal("tool dispatch produced no records".into()),
                };
                backup
                    .iter()
                    .map(|call| rejected_record(call, error.clone()))
                    .collect()
            }
        }
    }

    /// Evaluates the configured rules at one decision point, parking the
    /// loop when one fires.
    async fn evaluate_rules(
        &self,
        cancel: &CancellationToken,
        phase: DecisionPhase,
        scope: &RuleScope<'_>,
    ) -> ParkOutcome {
        if self.interrupt_rules.is_empty() {
            return ParkOutcome::Continue;
        }
        let detail = json!({
            "thought": scope.thought,
            "calls": scope
                .planned
                .iter()
                .map(|a| json!({"tool": a.tool, "input": a.input}))
                .collect::<Vec<_>>(),
        });

        for rule in &self.interrupt_rules {
            let point = DecisionPoint {
                phase,
                step_index: scope.turn,
                detail: detail.clone(),
            };
            let Some(spec) = rule.evaluate(scope.state, &point) else {
                continue;
            };

            // Snapshot first, then register: on-create hooks observe a
            // saved checkpoint.
            let interrupt = Interrupt::new(scope.session_id, spec, scope.state.snapshot());
            let checkpoint = Checkpoint::new(
                scope.session_id,
                interrupt.checkpoint_name(),
                checkpoint_snapshot(scope),
                scope.turn,
                vec![interrupt.clone()],
            );
            if let Err(error) = self.checkpointer.save(&checkpoint).await {
                tracing::warn!(
                    session_id = scope.session_id,
                    interrupt_id = %interrupt.id,
                    %error,
                    "checkpoint save failed; abandoning interrupt"
                );
                return ParkOutcome::Terminal {
                    status: RunStatus::Failed,
                    message: format!("could not checkpoint before interrupt: {error}"),
                    error_kind: Some(ErrorKind::Transient),
                };
            }
            let rx = self.interrupts.register(interrupt.clone());
            if let Some(emitter) = scope.emitter {
                emitter.emit(StreamEvent::update(
                    "interrupt",
                    json!({
                        "id": interrupt.id,
                        "kind": interrupt.kind,
                        "priority": interrupt.priority,
                        "message": interrupt.message,
                    }),
                ));
            }
            tracing::info!(
                session_id = scope.session_id,
                interrupt_id = %interrupt.id,
                ?phase,
                "loop parked on interrupt"
            );

            let ttl = interrupt.priority.ttl();
            match self.interrupts.wait(&interrupt.id, ttl, cancel, rx).await {
                WaitOutcome::Resolved(resolution) => {
                    if let Err(error) = self
                        .checkpointer
                        .delete(scope.session_id, &interrupt.checkpoint_name())
                        .await
                    {
                        tracing::warn!(%error, "checkpoint delete failed");
                    }
                    self.interrupts.remove(&interrupt.id);
                    if let Some(emitter) = scope.emitter {
                        emitter.emit(StreamEvent::update(
                            "interrupt",
                            json!({"id": interrupt.id, "resolved": resolution.is_approve()}),
                        ));
                    }
                    if !resolution.is_approve() {
                        return ParkOutcome::Terminal {
                            status: RunStatus::Cancelled,
                            message: format!("interrupt {} rejected", interrupt.id),
                            error_kind: None,
                        };
                    }
                    // Approved: fall through to the next rule.
                }
                WaitOutcome::Expired => {
                    return ParkOutcome::Terminal {
                        status: RunStatus::Expired,
                        message: format!("interrupt {} expired after {ttl:?}", interrupt.id),
                        error_kind: None,
                    };
                }
                WaitOutcome::Cancelled => {
                    return ParkOutcome::Terminal {
                        status: RunStatus::Cancelled,
                        message: "run cancelled while parked".into(),
                        error_kind: Some(ErrorKind::Cancelled),
                    };
                }
            }
        }
        ParkOutcome::Continue
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_run(
        &self,
        status: RunStatus,
        result: Value,
        message: impl Into<String>,
        steps: Vec<ReasoningStep>,
        tool_calls: Vec<ToolCallRecord>,
        session_id: &str,
        started: Instant,
        usage: Option<TokenUsage>,
        error_kind: Option<ErrorKind>,
        emitter: Option<&StreamEmitter>,
    ) -> AgentOutput {
        let message = message.into();
        let mut metadata = HashMap::from([
            ("agent".to_string(), json!(self.name)),
            ("session_id".to_string(), json!(session_id)),
            ("provider".to_string(), json!(self.llm.provider())),
        ]);
        if let Some(usage) = usage {
            metadata.insert(
                "token_usage".to_string(),
                json!({
                    "prompt": usage.prompt_tokens,
                    "completion": usage.completion_tokens,
                    "total": usage.total_tokens,
                }),
            );
        }
        if let Some(kind) = error_kind {
            metadata.insert("error_kind".to_string(), error_kind_metadata(kind));
        }
        if let Some(emitter) = emitter {
            emitter.emit(StreamEvent::update(
                "loop",
                json!({"phase": "end", "status": status.as_str()}),
            ));
        }
        tracing::debug!(
            agent = %self.name,
            session_id,
            status = status.as_str(),
            steps = steps.len(),
            calls = tool_calls.len(),
            "run end"
        );
        AgentOutput {
            status,
            result,
            message,
            reasoning_steps: steps,
            tool_calls,
            timestamp: Utc::now(),
            latency: started.elapsed(),
            metadata,
        }
    }

    /// Output for terminal conditions outside a live run (cache waiters,
    /// resume acknowledgements, internal failures in stream tasks).
    fn minimal_output(
        &self,
        status: RunStatus,
        message: impl Into<String>,
        error_kind: Option<ErrorKind>,
    ) -> AgentOutput {
        self.finish_run(
            status,
            Value::Null,
            message,
            Vec::new(),
            Vec::new(),
            "",
            Instant::now(),
            None,
            error_kind,
            None,
        )
    }
}

/// Truncates at the earliest occurrence of any stop pattern.
fn apply_stop_patterns(content: String, patterns: &[String]) -> String {
    let earliest = patterns
        .iter()
        .filter(|p| !p.is_empty())
        .filter_map(|p| content.find(p.as_str()))
        .min();
    match earliest {
        Some(index) => content[..index].to_string(),
        None => content,
    }
}

/// State snapshot plus the loop bookkeeping a resumed run needs.
fn checkpoint_snapshot(scope: &RuleScope<'_>) -> HashMap<String, Value> {
    let mut snapshot = scope.state.snapshot();
    snapshot.insert(KEY_TASK.into(), json!(scope.input.task));
    if let Some(instruction) = &scope.input.instruction {
        snapshot.insert(KEY_INSTRUCTION.into(), json!(instruction));
    }
    snapshot.insert(KEY_CONTEXT.into(), json!(scope.input.context));
    snapshot.insert(KEY_SCRATCHPAD.into(), json!(scope.scratchpad));
    snapshot.insert(KEY_THOUGHT.into(), json!(scope.thought));
    snapshot.insert(
        KEY_PLANNED.into(),
        json!(scope
            .planned
            .iter()
            .map(|a| json!({"tool": a.tool, "input": a.input}))
            .collect::<Vec<_>>()),
    );
    snapshot
}

type UnpackedCheckpoint = (
    ResumePoint,
    String,
    Option<String>,
    BTreeMap<String, Value>,
);

/// Splits a parked checkpoint back into a resume point and the original
/// input. The reserved keys never reach the rebuilt session state.
fn unpack_checkpoint(
    session_id: &str,
    checkpoint: Checkpoint,
) -> Result<UnpackedCheckpoint, AgentError> {
    let mut snapshot = checkpoint.state_snapshot;
    let task = snapshot
        .remove(KEY_TASK)
        .and_then(|v| v.as_str().map(String::from))
        .ok_or_else(|| AgentError::Internal("checkpoint lacks the task".into()))?;
    let instruction = snapshot
        .remove(KEY_INSTRUCTION)
        .and_then(|v| v.as_str().map(String::from));
    let context: BTreeMap<String, Value> = snapshot
        .remove(KEY_CONTEXT)
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    let scratchpad = snapshot
        .remove(KEY_SCRATCHPAD)
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_default();
    let thought = snapshot
        .remove(KEY_THOUGHT)
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_default();
    let planned: Vec<ProposedAction> = snapshot
        .remove(KEY_PLANNED)
        .and_then(|v| v.as_array().cloned())
        .unwrap_or_default()
        .into_iter()
        .filter_map(|entry| {
            let tool = entry.get("tool")?.as_str()?.to_string();
            let input = entry.get("input").cloned().unwrap_or(json!({}));
            Some(ProposedAction { tool, input })
        })
        .collect();

    let state = Arc::new(SessionState::from_snapshot(session_id, snapshot));
    Ok((
        ResumePoint {
            session_id: session_id.to_string(),
            state,
            scratchpad,
            turn: checkpoint.step_cursor,
            thought,
            planned,
        },
        task,
        instruction,
        context,
    ))
}

fn rejected_record(call: &ToolCall, error: AgentError) -> ToolCallRecord {
    let now = Utc::now();
    ToolCallRecord {
        id: call.id.clone(),
        name: call.name.clone(),
        input: call.input.clone(),
        started_at: now,
        ended_at: now,
        duration: std::time::Duration::ZERO,
        success: false,
        output: None,
        error: Some(error),
        attempts: 0,
    }
}
