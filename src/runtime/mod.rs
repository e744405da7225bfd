//! Session runtime: the turn loop.
//!
//! One [`SessionRuntime`] owns a conversation. [`SessionRuntime::run`]
//! appends the user's prompt, then alternates model calls and tool batches
//! until the model answers without tools, the iteration cap is hit, the run
//! is cancelled or the transport fails. Every path ends with exactly one
//! [`RunEvent::Done`].
//!
//! Each requested call goes through, in order:
//! 1. permission (always-allow cache, static policy, or an operator question),
//! 2. `PreToolUse` hooks, which may veto,
//! 3. the tool itself,
//! 4. `PostToolUse` hooks, which only observe.
//!
//! Every call gets exactly one tool-result message in history, whatever its
//! fate, so the model always sees an answer for each call it made.

mod events;
mod turn;

pub use events::{RunEvent, RunOutcome, RunSummary, ToolCallRecord, ToolCallStatus};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::api::ModelClient;
use crate::config::Config;
use crate::context::{ContextManager, ProviderCount};
use crate::error::{ApiError, RuntimeError};
use crate::hooks::{HookContext, HookPipeline};
use crate::permission::{
    PermissionAction, PermissionArbiter, PermissionHandle, PermissionPolicy, PermissionResponse,
};
use crate::stream::decode_stream;
use crate::tokens::TokenUsage;
use crate::tools::{is_error_result, ToolContext, ToolRegistry, ERROR_MARKER};
use crate::types::{Message, ModelRequest, Role, ToolCallRequest};
use crate::wal::ConversationLog;
use turn::{dedupe_call_ids, TurnOutput};

/// Bound on decoded events buffered between the decoder and the loop.
const STREAM_CHANNEL_CAPACITY: usize = 64;
/// Result recorded for calls that never ran because the run was cancelled.
const CANCELLED_TOOL_RESULT: &str = "Error: operation cancelled by user";

/// Sink for run progress events.
pub type EventSink = mpsc::UnboundedSender<RunEvent>;

/// Per-run bookkeeping.
#[derive(Default)]
struct RunState {
    iterations: usize,
    usage: TokenUsage,
    tool_calls: Vec<ToolCallRecord>,
    seen_call_ids: HashSet<String>,
}

enum TurnError {
    Api(ApiError),
    Cancelled,
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Cancelled,
}

/// Conversation state plus everything needed to drive it.
pub struct SessionRuntime {
    client: Arc<dyn ModelClient>,
    tools: ToolRegistry,
    hooks: HookPipeline,
    permissions: PermissionArbiter,
    context: ContextManager,
    log: Option<ConversationLog>,
    messages: Vec<Message>,
    system_prompt: String,
    model: String,
    max_tokens: u32,
    max_iterations: usize,
    usage: TokenUsage,
    last_provider_count: Option<ProviderCount>,
    cancel_rx: Option<watch::Receiver<bool>>,
}

impl SessionRuntime {
    /// Build a runtime from resolved configuration.
    ///
    /// Command hooks, the permission policy, the context budget and (when
    /// enabled) the conversation log all come from `config`.
    pub fn new(config: &Config, client: Arc<dyn ModelClient>, tools: ToolRegistry) -> Self {
        let log = config
            .wal
            .enabled
            .then(|| ConversationLog::new(&config.wal.dir));
        let system_prompt = config.agent.system_prompt.trim().to_string();
        Self {
            client,
            tools,
            hooks: HookPipeline::from_config(&config.hooks),
            permissions: PermissionArbiter::new(PermissionPolicy::from_config(
                &config.permissions,
            )),
            context: ContextManager::new(config.context.clone()),
            log,
            messages: initial_messages(&system_prompt),
            system_prompt,
            model: config.api.model.clone(),
            max_tokens: config.api.max_tokens,
            max_iterations: config.agent.max_iterations.max(1),
            usage: TokenUsage::default(),
            last_provider_count: None,
            cancel_rx: None,
        }
    }

    /// Attach (or replace) the conversation log.
    pub fn with_log(mut self, log: ConversationLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn hooks_mut(&mut self) -> &mut HookPipeline {
        &mut self.hooks
    }

    pub fn set_permission_policy(&mut self, policy: PermissionPolicy) {
        self.permissions.set_policy(policy);
    }

    /// Install the cancellation signal observed by model calls, permission
    /// questions and tool execution. Sending `true` cancels the current run.
    pub fn set_cancellation_receiver(&mut self, cancel_rx: Option<watch::Receiver<bool>>) {
        self.cancel_rx = cancel_rx;
    }

    /// Handle for answering `permission_request` events.
    pub fn permission_handle(&self) -> PermissionHandle {
        self.permissions.handle()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Usage accumulated since construction or the last reset.
    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    pub fn log(&self) -> Option<&ConversationLog> {
        self.log.as_ref()
    }

    pub fn log_mut(&mut self) -> Option<&mut ConversationLog> {
        self.log.as_mut()
    }

    /// Clear history back to the system prompt. Cached approvals and any
    /// outstanding permission question go with it.
    pub fn reset(&mut self) {
        self.messages = initial_messages(&self.system_prompt);
        self.permissions.reset();
        self.usage = TokenUsage::default();
        self.last_provider_count = None;
        info!("session reset");
    }

    /// Rebuild history from the conversation log on disk.
    ///
    /// Returns `false` (leaving history untouched) when there is no log or
    /// recovery fails.
    pub fn reload_from_log(&mut self) -> bool {
        let Some(log) = self.log.as_mut() else {
            return false;
        };
        if !log.recover() {
            return false;
        }
        let mut messages = initial_messages(&self.system_prompt);
        messages.extend(
            log.messages()
                .into_iter()
                .filter(|message| message.role != Role::System),
        );
        self.messages = messages;
        self.permissions.reset();
        self.last_provider_count = None;
        info!(messages = self.messages.len(), "session reloaded from log");
        true
    }

    /// Run one prompt to completion.
    ///
    /// Progress goes to `events`; the summary is also returned. A transport
    /// failure still emits a failed `done` before the error is returned.
    pub async fn run(
        &mut self,
        prompt: &str,
        events: &EventSink,
    ) -> Result<RunSummary, RuntimeError> {
        let started = Instant::now();
        let mut cancel = self.cancel_rx.clone();
        let mut run = RunState::default();
        info!(model = %self.model, tools = self.tools.len(), "run started");

        self.push_message(Message::user(prompt));
        let verdict = self.hooks.run(&HookContext::session_start(prompt)).await;
        if verdict.is_blocking() {
            warn!(message = ?verdict.message, "SessionStart hooks cannot block a run");
        }

        let mut answer = None;
        let mut failure = None;
        let outcome = loop {
            if is_cancelled(&cancel) {
                break RunOutcome::Cancelled;
            }
            if run.iterations >= self.max_iterations {
                warn!(max_iterations = self.max_iterations, "iteration cap reached");
                break RunOutcome::MaxIterations;
            }
            run.iterations += 1;
            emit(events, RunEvent::Thinking {
                iteration: run.iterations,
            });

            let message_count = self.messages.len();
            let mut turn = match self.stream_turn(&mut cancel).await {
                Ok(turn) => turn,
                Err(TurnError::Cancelled) => break RunOutcome::Cancelled,
                Err(TurnError::Api(err)) => {
                    warn!(error = %err, "model call failed");
                    let error = err.to_string();
                    failure = Some(err);
                    break RunOutcome::Failed { error };
                }
            };
            if !turn.stopped {
                warn!("model stream ended without message_stop");
            }

            let call_usage = turn.usage.finish();
            run.usage.merge(call_usage);
            self.usage.merge(call_usage);
            if let Some(input_tokens) = turn.usage.reported_input() {
                self.last_provider_count = Some(ProviderCount {
                    input_tokens,
                    message_count,
                });
            }

            if turn.calls.is_empty() {
                if !turn.text.is_empty() {
                    self.push_message(Message::assistant(turn.text.clone()));
                }
                emit(events, RunEvent::AnswerStart);
                for text in std::mem::take(&mut turn.fragments) {
                    emit(events, RunEvent::AnswerDelta { text });
                }
                answer = Some(turn.text);
                break RunOutcome::Completed;
            }

            dedupe_call_ids(&mut turn.calls, &mut run.seen_call_ids, run.iterations);
            debug!(calls = turn.calls.len(), iteration = run.iterations, "tool batch");
            self.push_message(Message::assistant_tool_calls(
                turn.text,
                turn.calls.clone(),
            ));
            if self
                .process_batch(&turn.calls, events, &mut run, &mut cancel)
                .await
                == Flow::Cancelled
            {
                break RunOutcome::Cancelled;
            }

            if let Some(report) = self
                .context
                .prune(&mut self.messages, self.last_provider_count)
            {
                self.last_provider_count = None;
                info!(
                    removed_messages = report.removed_messages,
                    estimated_after = report.estimated_after,
                    "context pruned"
                );
                emit(events, RunEvent::ContextCleared(report));
            }
        };

        let verdict = self.hooks.run(&HookContext::stop(answer.as_deref())).await;
        if verdict.is_blocking() {
            warn!(message = ?verdict.message, "Stop hooks cannot block a run");
        }
        if let Some(log) = self.log.as_mut() {
            let written = log.flush();
            debug!(written, "conversation log flushed");
        }

        let summary = RunSummary {
            answer,
            tool_calls: run.tool_calls,
            iterations: run.iterations,
            elapsed_ms: started.elapsed().as_millis() as u64,
            usage: run.usage,
            outcome,
        };
        info!(
            outcome = ?summary.outcome,
            iterations = summary.iterations,
            elapsed_ms = summary.elapsed_ms,
            "run finished"
        );
        emit(events, RunEvent::Done(summary.clone()));

        match failure {
            Some(err) => Err(RuntimeError::Api(err)),
            None => Ok(summary),
        }
    }

    fn push_message(&mut self, message: Message) {
        if let Some(log) = self.log.as_mut() {
            log.append_message(&message);
        }
        self.messages.push(message);
    }

    /// One streaming model call: the decoder feeds a bounded channel that
    /// the accumulator drains concurrently.
    async fn stream_turn(
        &self,
        cancel: &mut Option<watch::Receiver<bool>>,
    ) -> Result<TurnOutput, TurnError> {
        let request = ModelRequest {
            model: self.model.clone(),
            messages: self.messages.clone(),
            tools: self.tools.specs(),
            max_tokens: self.max_tokens,
        };

        let opened = match cancel.as_mut() {
            Some(rx) => tokio::select! {
                _ = wait_for_cancellation(rx) => return Err(TurnError::Cancelled),
                opened = self.client.stream(&request) => opened,
            },
            None => self.client.stream(&request).await,
        };
        let bytes = opened.map_err(TurnError::Api)?;

        let (tx, mut rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let decode = async move {
            let consume = async move {
                let mut turn = TurnOutput::default();
                while let Some(event) = rx.recv().await {
                    turn.apply(event);
                }
                turn
            };
            let (decoded, turn) = tokio::join!(decode_stream(bytes, tx), consume);
            decoded.map(|_| turn)
        };

        let decoded = match cancel.as_mut() {
            Some(rx) => tokio::select! {
                _ = wait_for_cancellation(rx) => return Err(TurnError::Cancelled),
                decoded = decode => decoded,
            },
            None => decode.await,
        };
        decoded.map_err(TurnError::Api)
    }

    /// Process a batch sequentially, in model order.
    async fn process_batch(
        &mut self,
        calls: &[ToolCallRequest],
        events: &EventSink,
        run: &mut RunState,
        cancel: &mut Option<watch::Receiver<bool>>,
    ) -> Flow {
        for (index, call) in calls.iter().enumerate() {
            if is_cancelled(cancel) {
                self.cancel_remaining(&calls[index..], run);
                return Flow::Cancelled;
            }
            if self.process_call(call, events, run, cancel).await == Flow::Cancelled {
                self.cancel_remaining(&calls[index + 1..], run);
                return Flow::Cancelled;
            }
        }
        Flow::Continue
    }

    async fn process_call(
        &mut self,
        call: &ToolCallRequest,
        events: &EventSink,
        run: &mut RunState,
        cancel: &mut Option<watch::Receiver<bool>>,
    ) -> Flow {
        let arguments = call.arguments_json();

        match self.permissions.check(&call.tool_id, &arguments) {
            PermissionAction::Allow => {}
            PermissionAction::Deny => {
                let reason = format!("Permission denied: `{}` is not allowed", call.tool_id);
                self.reject(call, reason, ToolCallStatus::PermissionDenied, events, run);
                return Flow::Continue;
            }
            PermissionAction::Ask => {
                let answer = self.permissions.ask(&call.tool_id);
                emit(events, RunEvent::PermissionRequest {
                    call_id: call.call_id.clone(),
                    tool_id: call.tool_id.clone(),
                    arguments: call.arguments.clone(),
                });
                let answered = match cancel.as_mut() {
                    Some(rx) => tokio::select! {
                        _ = wait_for_cancellation(rx) => None,
                        answered = answer => Some(answered),
                    },
                    None => Some(answer.await),
                };
                let Some(answered) = answered else {
                    self.permissions.withdraw();
                    self.settle(
                        call,
                        CANCELLED_TOOL_RESULT.to_string(),
                        ToolCallStatus::Cancelled,
                        run,
                    );
                    return Flow::Cancelled;
                };
                let response = answered.unwrap_or_else(|_| {
                    debug!(tool_id = %call.tool_id, "permission question dropped unanswered");
                    PermissionResponse::deny()
                });
                self.permissions.record(&call.tool_id, response);
                if !response.allowed {
                    let reason = format!("Permission denied: `{}` was declined", call.tool_id);
                    self.reject(call, reason, ToolCallStatus::PermissionDenied, events, run);
                    return Flow::Continue;
                }
            }
        }

        let verdict = self
            .hooks
            .run(&HookContext::pre_tool_use(
                &call.tool_id,
                &call.call_id,
                arguments.clone(),
            ))
            .await;
        if verdict.is_blocking() {
            let reason = format!(
                "Blocked by hook: {}",
                verdict.message.as_deref().unwrap_or("no reason given")
            );
            self.reject(call, reason, ToolCallStatus::HookBlocked, events, run);
            return Flow::Continue;
        }

        emit(events, RunEvent::ToolStart {
            call_id: call.call_id.clone(),
            tool_id: call.tool_id.clone(),
            arguments: call.arguments.clone(),
        });
        let context = ToolContext::new(call.call_id.clone(), cancel.clone());
        let execution = self.tools.execute(&call.tool_id, &call.arguments, &context);
        let executed = match cancel.as_mut() {
            Some(rx) => tokio::select! {
                _ = wait_for_cancellation(rx) => None,
                executed = execution => Some(executed),
            },
            None => Some(execution.await),
        };
        let Some(executed) = executed else {
            emit(events, RunEvent::ToolError {
                call_id: call.call_id.clone(),
                tool_id: call.tool_id.clone(),
                error: CANCELLED_TOOL_RESULT.to_string(),
                status: ToolCallStatus::Cancelled,
            });
            self.settle(
                call,
                CANCELLED_TOOL_RESULT.to_string(),
                ToolCallStatus::Cancelled,
                run,
            );
            return Flow::Cancelled;
        };

        let (output, status) = match executed {
            Ok(output) if is_error_result(&output) => (output, ToolCallStatus::Failed),
            Ok(output) => (output, ToolCallStatus::Succeeded),
            Err(err) => (format!("{ERROR_MARKER} {err}"), ToolCallStatus::Failed),
        };
        if status == ToolCallStatus::Succeeded {
            debug!(tool_id = %call.tool_id, call_id = %call.call_id, "tool succeeded");
            emit(events, RunEvent::ToolEnd {
                call_id: call.call_id.clone(),
                tool_id: call.tool_id.clone(),
                output: output.clone(),
            });
        } else {
            debug!(tool_id = %call.tool_id, call_id = %call.call_id, "tool failed");
            emit(events, RunEvent::ToolError {
                call_id: call.call_id.clone(),
                tool_id: call.tool_id.clone(),
                error: output.clone(),
                status,
            });
        }
        self.settle(call, output.clone(), status, run);

        let verdict = self
            .hooks
            .run(&HookContext::post_tool_use(
                &call.tool_id,
                &call.call_id,
                arguments,
                &output,
                status != ToolCallStatus::Succeeded,
            ))
            .await;
        if verdict.is_blocking() {
            warn!(
                tool_id = %call.tool_id,
                message = ?verdict.message,
                "PostToolUse hook objected after the fact"
            );
        }
        Flow::Continue
    }

    /// Record a call that never reached the executor.
    fn reject(
        &mut self,
        call: &ToolCallRequest,
        reason: String,
        status: ToolCallStatus,
        events: &EventSink,
        run: &mut RunState,
    ) {
        debug!(tool_id = %call.tool_id, ?status, "tool call rejected");
        emit(events, RunEvent::ToolError {
            call_id: call.call_id.clone(),
            tool_id: call.tool_id.clone(),
            error: reason.clone(),
            status,
        });
        self.settle(call, reason, status, run);
    }

    /// Synthetic results for calls left unprocessed by a cancellation.
    fn cancel_remaining(&mut self, calls: &[ToolCallRequest], run: &mut RunState) {
        for call in calls {
            self.settle(
                call,
                CANCELLED_TOOL_RESULT.to_string(),
                ToolCallStatus::Cancelled,
                run,
            );
        }
    }

    /// Append the call's result message and trace record.
    fn settle(
        &mut self,
        call: &ToolCallRequest,
        output: String,
        status: ToolCallStatus,
        run: &mut RunState,
    ) {
        let is_error = status != ToolCallStatus::Succeeded;
        self.push_message(Message::tool_result(call, output.clone(), is_error));
        run.tool_calls.push(ToolCallRecord {
            call_id: call.call_id.clone(),
            tool_id: call.tool_id.clone(),
            arguments: call.arguments.clone(),
            output,
            status,
        });
    }
}

fn initial_messages(system_prompt: &str) -> Vec<Message> {
    if system_prompt.is_empty() {
        Vec::new()
    } else {
        vec![Message::system(system_prompt)]
    }
}

fn emit(events: &EventSink, event: RunEvent) {
    // A caller that stopped listening doesn't stop the run.
    let _ = events.send(event);
}

fn is_cancelled(cancel: &Option<watch::Receiver<bool>>) -> bool {
    cancel.as_ref().is_some_and(|rx| *rx.borrow())
}

/// Resolve once cancellation is requested. A dropped sender can never
/// cancel, so this then waits forever.
async fn wait_for_cancellation(cancel_rx: &mut watch::Receiver<bool>) {
    loop {
        if *cancel_rx.borrow_and_update() {
            return;
        }
        if cancel_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
