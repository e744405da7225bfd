//! Token usage accounting and crude size estimation.
//!
//! Providers report usage under different field names and at different points
//! of a stream. [`UsageReport`] normalizes one report, [`CallUsage`] folds the
//! reports of a single model call, and [`TokenUsage`] is the merged shape that
//! accumulates across the turns of a run.
//!
//! Estimation uses the usual ~1 token per 4 characters heuristic plus a fixed
//! per-message overhead.

use crate::types::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Characters of framing overhead charged per message (~4 tokens).
const MESSAGE_OVERHEAD_CHARS: usize = 16;

const INPUT_KEYS: &[&str] = &["input_tokens", "prompt_tokens", "inputTokens", "promptTokens"];
const OUTPUT_KEYS: &[&str] = &[
    "output_tokens",
    "completion_tokens",
    "outputTokens",
    "completionTokens",
];
const TOTAL_KEYS: &[&str] = &["total_tokens", "totalTokens"];

/// Merged token usage for one call or one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Build usage from input/output counts with a derived total.
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens.saturating_add(output_tokens),
        }
    }

    /// Accumulate another call's usage into this one.
    pub fn merge(&mut self, other: TokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0 && self.total_tokens == 0
    }
}

/// One usage report as found in a provider event, fields normalized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageReport {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

impl UsageReport {
    /// Extract usage fields from a JSON object, accepting both the
    /// `input/output` and `prompt/completion` conventions in snake or camel
    /// case. Returns `None` when no recognized field is present.
    pub fn from_json(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let pick = |keys: &[&str]| keys.iter().find_map(|key| obj.get(*key).and_then(Value::as_u64));
        let report = Self {
            input_tokens: pick(INPUT_KEYS),
            output_tokens: pick(OUTPUT_KEYS),
            total_tokens: pick(TOTAL_KEYS),
        };
        (report != Self::default()).then_some(report)
    }
}

/// Folds the usage reports seen during a single model call.
///
/// Providers repeat counters as a stream progresses (`message_start` carries
/// the prompt size, `message_delta` the final completion size), so later
/// values for a field replace earlier ones instead of adding up.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallUsage {
    latest: UsageReport,
}

impl CallUsage {
    pub fn observe(&mut self, report: UsageReport) {
        if report.input_tokens.is_some() {
            self.latest.input_tokens = report.input_tokens;
        }
        if report.output_tokens.is_some() {
            self.latest.output_tokens = report.output_tokens;
        }
        if report.total_tokens.is_some() {
            self.latest.total_tokens = report.total_tokens;
        }
    }

    /// Input tokens reported for this call, if the provider sent any.
    pub fn reported_input(&self) -> Option<u64> {
        self.latest.input_tokens
    }

    /// Final usage for the call. A provider-reported total is trusted over
    /// the derived sum.
    pub fn finish(&self) -> TokenUsage {
        let input_tokens = self.latest.input_tokens.unwrap_or(0);
        let output_tokens = self.latest.output_tokens.unwrap_or(0);
        TokenUsage {
            input_tokens,
            output_tokens,
            total_tokens: self
                .latest
                .total_tokens
                .unwrap_or_else(|| input_tokens.saturating_add(output_tokens)),
        }
    }
}

/// Estimate tokens for a piece of text.
pub fn estimate_text(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Estimate how many tokens a set of messages would consume.
pub fn estimate_messages(messages: &[Message]) -> u64 {
    let chars: usize = messages.iter().map(message_chars).sum();
    (chars / 4) as u64
}

fn message_chars(msg: &Message) -> usize {
    let mut chars = MESSAGE_OVERHEAD_CHARS + msg.content.chars().count();
    if let Some(calls) = &msg.tool_calls {
        for call in calls {
            chars += call.tool_id.len() + call.arguments.len();
        }
    }
    chars
}
