//! Accumulation of one model call's decoded events.

use std::collections::HashSet;

use crate::stream::StreamEvent;
use crate::tokens::CallUsage;
use crate::types::ToolCallRequest;

/// Everything one streamed model call produced.
#[derive(Debug, Default)]
pub(super) struct TurnOutput {
    /// Visible text, concatenated.
    pub text: String,
    /// Visible text as streamed, replayed as `answer_delta` events.
    pub fragments: Vec<String>,
    pub calls: Vec<ToolCallRequest>,
    pub usage: CallUsage,
    /// True once `message_stop` was seen.
    pub stopped: bool,
}

impl TurnOutput {
    pub fn apply(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::TextDelta(text) => {
                self.text.push_str(&text);
                self.fragments.push(text);
            }
            StreamEvent::ToolUseStart { .. } | StreamEvent::ToolInputDelta(_) => {}
            StreamEvent::ToolUseComplete {
                call_id,
                tool_name,
                arguments,
            } => {
                // Tools without parameters stream no input at all.
                let arguments = if arguments.trim().is_empty() {
                    "{}".to_string()
                } else {
                    arguments
                };
                self.calls.push(ToolCallRequest {
                    call_id,
                    tool_id: tool_name,
                    arguments,
                });
            }
            StreamEvent::Usage(report) => self.usage.observe(report),
            StreamEvent::MessageStop => self.stopped = true,
        }
    }
}

/// Make call ids unique within a run. Providers that omit ids get
/// decoder-generated ones, which restart at `call_1` on every call.
pub(super) fn dedupe_call_ids(
    calls: &mut [ToolCallRequest],
    seen: &mut HashSet<String>,
    iteration: usize,
) {
    for call in calls.iter_mut() {
        if seen.insert(call.call_id.clone()) {
            continue;
        }
        let mut suffix = iteration;
        let mut candidate = format!("{}_{suffix}", call.call_id);
        while !seen.insert(candidate.clone()) {
            suffix += 1;
            candidate = format!("{}_{suffix}", call.call_id);
        }
        call.call_id = candidate;
    }
}
