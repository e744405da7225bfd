//! Context window management.
//!
//! After each tool batch the runtime asks [`ContextManager::prune`] whether
//! the history still fits the configured budget. When it doesn't, history is
//! removed oldest first until the estimate drops under the target. Earlier
//! exchanges go whole, from one user message up to the next. Inside the
//! current exchange each model call with its tool results is a unit of its
//! own, so a long run can shed its early iterations. Leading system
//! messages, the current user message and the newest units are never
//! touched, and a call is never separated from its results.

use crate::config::ContextConfig;
use crate::tokens::estimate_messages;
use crate::types::{Message, Role};
use serde::Serialize;

pub(crate) const SUMMARY_PREFIX: &str = "[relay context summary]";
const MAX_SUMMARY_LINES: usize = 12;
const MAX_PREVIEW_CHARS: usize = 80;

/// Provider-reported input size of the last model call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderCount {
    /// Input tokens the provider charged for the call.
    pub input_tokens: u64,
    /// History length when that call was made.
    pub message_count: usize,
}

/// What one pruning pass removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub estimated_before: u64,
    pub estimated_after: u64,
    pub removed_messages: usize,
    pub removed_turns: usize,
    /// True when a synthetic summary replaced the removed span.
    pub summarized: bool,
}

#[derive(Debug, Clone)]
pub struct ContextManager {
    config: ContextConfig,
}

impl ContextManager {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    fn trigger_tokens(&self) -> u64 {
        fraction_of(self.config.budget_tokens, self.config.trigger_fraction)
    }

    fn target_tokens(&self) -> u64 {
        fraction_of(self.config.budget_tokens, self.config.target_fraction)
    }

    /// Estimated token cost of `messages`.
    ///
    /// With a provider count, the exact figure covers the prefix it was
    /// measured on and only later messages are estimated.
    pub fn estimate(&self, messages: &[Message], known: Option<ProviderCount>) -> u64 {
        match known {
            Some(count) if count.message_count <= messages.len() => count
                .input_tokens
                .saturating_add(estimate_messages(&messages[count.message_count..])),
            _ => estimate_messages(messages),
        }
    }

    /// Prune `messages` if they exceed the trigger threshold.
    ///
    /// Returns `None` when nothing was removed.
    pub fn prune(
        &self,
        messages: &mut Vec<Message>,
        known: Option<ProviderCount>,
    ) -> Option<PruneReport> {
        if messages.is_empty() {
            return None;
        }
        let estimated_before = self.estimate(messages, known);
        if estimated_before <= self.trigger_tokens() {
            return None;
        }

        // Provider counts include overhead the heuristic can't see (tool
        // schemas, framing); carry it as a constant while removing turns.
        let heuristic_before = estimate_messages(messages);
        let overhead = estimated_before.saturating_sub(heuristic_before);
        let target = self.target_tokens();
        let keep = self.config.keep_recent_turns.max(1);

        let mut insertion_index = leading_system_count(messages);
        let mut previous_summary = None;
        if self.config.summarize
            && insertion_index > 0
            && is_summary_message(&messages[insertion_index - 1])
        {
            previous_summary = Some(messages.remove(insertion_index - 1).content);
            insertion_index -= 1;
        }

        let mut removed = Vec::new();
        let mut removed_turns = 0usize;
        loop {
            let summary_cost = if self.config.summarize && !removed.is_empty() {
                summary_tokens(previous_summary.as_deref(), &removed)
            } else {
                0
            };
            let estimated_now = estimate_messages(messages)
                .saturating_add(overhead)
                .saturating_add(summary_cost);
            if estimated_now <= target {
                break;
            }
            let turns = collect_turn_ranges(messages, insertion_index);
            if turns.len() <= keep {
                break;
            }
            let turn = turns[0];
            removed.extend(messages.drain(turn.start..turn.end));
            removed_turns += 1;
        }

        if removed.is_empty() {
            if let Some(summary) = previous_summary {
                messages.insert(insertion_index, Message::system(summary));
            }
            return None;
        }

        let mut summarized = false;
        if self.config.summarize {
            let summary = build_summary(previous_summary.as_deref(), &removed);
            messages.insert(insertion_index, Message::system(summary));
            summarized = true;
            if estimate_messages(messages).saturating_add(overhead) >= estimated_before {
                messages.remove(insertion_index);
                summarized = false;
            }
        }

        Some(PruneReport {
            estimated_before,
            estimated_after: estimate_messages(messages).saturating_add(overhead),
            removed_messages: removed.len(),
            removed_turns,
            summarized,
        })
    }
}

fn fraction_of(budget: u64, fraction: f64) -> u64 {
    ((budget as f64) * fraction).floor().max(1.0) as u64
}

#[derive(Clone, Copy)]
struct TurnRange {
    start: usize,
    end: usize,
}

fn leading_system_count(messages: &[Message]) -> usize {
    messages
        .iter()
        .take_while(|message| message.role == Role::System)
        .count()
}

/// Removable units after `start_index`, oldest first.
fn collect_turn_ranges(messages: &[Message], start_index: usize) -> Vec<TurnRange> {
    let last_user = messages
        .iter()
        .enumerate()
        .skip(start_index)
        .rev()
        .find(|(_, message)| message.role == Role::User)
        .map(|(idx, _)| idx);
    let current_start = last_user.unwrap_or(start_index);

    let mut turns = Vec::new();
    let mut open: Option<usize> = None;
    for (idx, message) in messages
        .iter()
        .enumerate()
        .take(current_start)
        .skip(start_index)
    {
        if message.role == Role::User {
            if let Some(start) = open {
                turns.push(TurnRange { start, end: idx });
            }
            open = Some(idx);
        } else if open.is_none() {
            open = Some(idx);
        }
    }
    if let Some(start) = open {
        turns.push(TurnRange {
            start,
            end: current_start,
        });
    }

    // The current user message (and any reply text before the first
    // call) stays; each tool call group after it is a unit.
    let mut open: Option<usize> = None;
    for (idx, message) in messages.iter().enumerate().skip(current_start) {
        if message.role == Role::Assistant && message.has_tool_calls() {
            if let Some(start) = open {
                turns.push(TurnRange { start, end: idx });
            }
            open = Some(idx);
        }
    }
    if let Some(start) = open {
        turns.push(TurnRange {
            start,
            end: messages.len(),
        });
    }
    turns
}

fn summary_tokens(previous: Option<&str>, removed: &[Message]) -> u64 {
    estimate_messages(&[Message::system(build_summary(previous, removed))])
}

fn is_summary_message(message: &Message) -> bool {
    message.role == Role::System && message.content.starts_with(SUMMARY_PREFIX)
}

fn build_summary(previous: Option<&str>, removed: &[Message]) -> String {
    let mut lines = vec![
        SUMMARY_PREFIX.to_string(),
        "Earlier turns were removed to stay within the context budget.".to_string(),
    ];
    if let Some(body) = previous.and_then(summary_body) {
        lines.push(format!("Earlier summary: {body}"));
    }

    let mut added = 0usize;
    for line in removed.iter().filter_map(summary_line) {
        if added >= MAX_SUMMARY_LINES {
            break;
        }
        lines.push(line);
        added += 1;
    }
    let describable = removed.iter().filter(|m| m.role != Role::System).count();
    if describable > added {
        lines.push(format!("... {} more message(s) omitted", describable - added));
    }
    lines.join("\n")
}

fn summary_body(summary: &str) -> Option<String> {
    let mut lines = summary.lines();
    if lines.next()?.trim() != SUMMARY_PREFIX {
        return None;
    }
    // Skip the fixed explanation line.
    let body = lines.skip(1).collect::<Vec<_>>().join(" ");
    let body = body.trim();
    (!body.is_empty()).then(|| preview(body))
}

fn summary_line(message: &Message) -> Option<String> {
    match message.role {
        Role::System => None,
        Role::User => Some(format!("user: {}", preview(&message.content))),
        Role::Assistant => {
            let mut parts = Vec::new();
            if !message.content.trim().is_empty() {
                parts.push(format!("assistant: {}", preview(&message.content)));
            }
            let names = message
                .tool_calls
                .iter()
                .flatten()
                .map(|call| call.tool_id.as_str())
                .collect::<Vec<_>>();
            if !names.is_empty() {
                parts.push(format!("called: {}", names.join(", ")));
            }
            (!parts.is_empty()).then(|| parts.join(" | "))
        }
        Role::Tool => {
            let tool = message
                .tool_result
                .as_ref()
                .map(|r| r.tool_id.as_str())
                .unwrap_or("<unknown>");
            Some(format!("tool {tool}: {}", preview(&message.content)))
        }
    }
}

fn preview(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= MAX_PREVIEW_CHARS {
        return trimmed.to_string();
    }
    let prefix: String = trimmed.chars().take(MAX_PREVIEW_CHARS - 3).collect();
    format!("{prefix}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolCallRequest;

    fn manager(budget: u64, summarize: bool) -> ContextManager {
        ContextManager::new(ContextConfig {
            budget_tokens: budget,
            trigger_fraction: 1.0,
            target_fraction: 0.8,
            keep_recent_turns: 1,
            summarize,
        })
    }

    fn history(turns: usize) -> Vec<Message> {
        let mut messages = vec![Message::system("system prompt")];
        for i in 0..turns {
            let call = ToolCallRequest {
                call_id: format!("call_{i}"),
                tool_id: "quote".into(),
                arguments: "{}".into(),
            };
            messages.push(Message::user(format!("question {i} {}", "x".repeat(200))));
            messages.push(Message::assistant_tool_calls("", vec![call.clone()]));
            messages.push(Message::tool_result(&call, "y".repeat(2000), false));
            messages.push(Message::assistant(format!("answer {i}")));
        }
        messages
    }

    #[test]
    fn under_budget_is_untouched() {
        let mut messages = history(2);
        let before = messages.clone();
        assert!(manager(100_000, true).prune(&mut messages, None).is_none());
        assert_eq!(messages, before);
    }

    #[test]
    fn prunes_oldest_turns_and_keeps_system_and_latest_turn() {
        let mut messages = history(6);
        let ctx = manager(2_000, false);
        let report = ctx.prune(&mut messages, None).expect("pruned");

        assert!(report.removed_turns > 0);
        assert!(!report.summarized);
        assert!(report.estimated_after < report.estimated_before);
        assert_eq!(messages[0], Message::system("system prompt"));
        assert_eq!(
            messages.last().map(|m| m.content.as_str()),
            Some("answer 5")
        );
        assert!(messages
            .iter()
            .any(|m| m.role == Role::User && m.content.starts_with("question 5")));
        assert!(!messages.iter().any(|m| m.content.starts_with("question 0")));
    }

    #[test]
    fn summary_replaces_removed_span() {
        let mut messages = history(6);
        let report = manager(2_000, true)
            .prune(&mut messages, None)
            .expect("pruned");
        assert!(report.summarized);
        assert!(is_summary_message(&messages[1]));
        assert!(messages[1].content.contains("user: question 0"));
        assert!(messages[1].content.contains("called: quote"));
    }

    #[test]
    fn repeated_pruning_folds_previous_summary() {
        let mut messages = history(6);
        let ctx = manager(2_000, true);
        ctx.prune(&mut messages, None).expect("first");
        messages.extend(history(3).into_iter().skip(1));
        ctx.prune(&mut messages, None).expect("second");
        let summaries = messages.iter().filter(|m| is_summary_message(m)).count();
        assert_eq!(summaries, 1);
        assert!(messages[1].content.contains("Earlier summary:"));
    }

    #[test]
    fn single_in_flight_turn_is_never_removed() {
        let mut messages = vec![Message::system("s"), Message::user("z".repeat(4000))];
        assert!(manager(100, true).prune(&mut messages, None).is_none());
        assert_eq!(messages.len(), 2);
    }

    fn single_run(iterations: usize) -> Vec<Message> {
        let mut messages = vec![Message::system("system prompt"), Message::user("q")];
        for i in 0..iterations {
            let call = ToolCallRequest {
                call_id: format!("call_{i}"),
                tool_id: "quote".into(),
                arguments: "{}".into(),
            };
            messages.push(Message::assistant_tool_calls("", vec![call.clone()]));
            messages.push(Message::tool_result(&call, "y".repeat(4000), false));
        }
        messages
    }

    #[test]
    fn long_single_run_sheds_early_iterations() {
        let mut messages = single_run(6);
        let ctx = manager(2_000, false);
        let report = ctx.prune(&mut messages, None).expect("pruned");

        assert_eq!(report.removed_turns, 5);
        assert_eq!(report.removed_messages, 10);
        assert!(report.estimated_after <= 1_600);
        assert_eq!(messages[0], Message::system("system prompt"));
        assert_eq!(messages[1], Message::user("q"));
        assert!(messages[2].has_tool_calls());
        assert_eq!(
            messages[3].tool_result.as_ref().map(|r| r.call_id.as_str()),
            Some("call_5")
        );
        assert_eq!(messages.len(), 4);
    }

    #[test]
    fn every_surviving_result_keeps_its_call() {
        let mut messages = single_run(4);
        messages.extend(single_run(5).into_iter().skip(1));
        manager(3_000, true).prune(&mut messages, None).expect("pruned");

        for (idx, message) in messages.iter().enumerate() {
            let Some(result) = &message.tool_result else {
                continue;
            };
            let has_call = messages[..idx].iter().any(|m| {
                m.tool_calls
                    .iter()
                    .flatten()
                    .any(|call| call.call_id == result.call_id)
            });
            assert!(has_call, "orphaned result {}", result.call_id);
        }
        assert!(messages.iter().any(|m| m.role == Role::User));
    }

    #[test]
    fn provider_count_drives_the_trigger() {
        let messages = history(1);
        let ctx = manager(1_000, false);
        let heuristic = ctx.estimate(&messages, None);
        assert!(heuristic < 1_000);

        let known = ProviderCount {
            input_tokens: 5_000,
            message_count: messages.len() - 1,
        };
        assert!(ctx.estimate(&messages, Some(known)) > 5_000);

        let mut pruned = history(3);
        let known = ProviderCount {
            input_tokens: 5_000,
            message_count: pruned.len(),
        };
        // Overhead the heuristic can't see keeps the target out of reach,
        // so everything but the latest turn goes.
        let report = ctx.prune(&mut pruned, Some(known)).expect("pruned");
        assert_eq!(report.removed_turns, 2);
    }

    #[test]
    fn stale_provider_count_falls_back_to_heuristic() {
        let messages = history(1);
        let ctx = manager(1_000, false);
        let known = ProviderCount {
            input_tokens: 5_000,
            message_count: messages.len() + 10,
        };
        assert_eq!(ctx.estimate(&messages, Some(known)), ctx.estimate(&messages, None));
    }
}
