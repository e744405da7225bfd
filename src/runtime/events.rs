//! Public run event schema.
//!
//! A run reports progress as a sequence of [`RunEvent`]s and always ends
//! with exactly one [`RunEvent::Done`].

use serde::Serialize;

use crate::context::PruneReport;
use crate::tokens::TokenUsage;

/// Progress events emitted during a run.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// A model call is starting.
    Thinking { iteration: usize },
    /// The model answered without tool calls; deltas follow.
    AnswerStart,
    AnswerDelta { text: String },
    ToolStart {
        call_id: String,
        tool_id: String,
        arguments: String,
    },
    ToolEnd {
        call_id: String,
        tool_id: String,
        output: String,
    },
    ToolError {
        call_id: String,
        tool_id: String,
        error: String,
        status: ToolCallStatus,
    },
    /// The run is suspended until the question is answered through a
    /// `PermissionHandle`.
    PermissionRequest {
        call_id: String,
        tool_id: String,
        arguments: String,
    },
    ContextCleared(PruneReport),
    Done(RunSummary),
}

/// How one tool call ended.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Succeeded,
    /// The tool ran and reported an error.
    Failed,
    PermissionDenied,
    HookBlocked,
    Cancelled,
}

/// One entry of the run's tool-call trace.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ToolCallRecord {
    pub call_id: String,
    pub tool_id: String,
    pub arguments: String,
    /// Content appended to history as the call's result.
    pub output: String,
    pub status: ToolCallStatus,
}

/// Why a run ended.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    /// The iteration cap was hit while the model still wanted tools.
    MaxIterations,
    Cancelled,
    Failed { error: String },
}

/// Payload of the terminal `done` event.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunSummary {
    pub answer: Option<String>,
    pub tool_calls: Vec<ToolCallRecord>,
    /// Model calls made.
    pub iterations: usize,
    pub elapsed_ms: u64,
    pub usage: TokenUsage,
    pub outcome: RunOutcome,
}

impl RunSummary {
    pub fn is_completed(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }
}
