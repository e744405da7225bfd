//! Permission arbitration for tool calls.
//!
//! Every call is classified before it runs: a per-session always-allow cache
//! is consulted first, then the static [`PermissionPolicy`]. An `ask`
//! suspends the run on a single-slot mailbox that only
//! [`PermissionHandle::respond`] can resolve.
//!
//! Slot rules:
//! - at most one question is outstanding per runtime;
//! - the first matching response resolves it and empties the slot, so a
//!   second delivery is a no-op that returns `false`;
//! - a response naming a different tool than the one asked about is ignored;
//! - installing a new question while one is pending drops the stale one,
//!   which its waiter observes as a denial.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::PermissionsConfig;

/// Outcome of classifying a tool call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionAction {
    /// Execute without asking.
    Allow,
    /// Reject without asking.
    Deny,
    /// Suspend and ask the operator.
    #[default]
    Ask,
}

impl PermissionAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Ask => "ask",
        }
    }
}

// ---------------------------------------------------------------------------
// Static policy
// ---------------------------------------------------------------------------

/// A rule matching a tool id and an argument pattern.
///
/// `tool` is an exact id or `"*"`. `pattern` is a glob (`*`, `?`) matched
/// against every string value of the call's JSON arguments; `"*"` matches
/// any call, including one without arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRule {
    pub tool: String,
    #[serde(default = "default_pattern")]
    pub pattern: String,
    pub action: PermissionAction,
}

fn default_pattern() -> String {
    "*".into()
}

impl PermissionRule {
    pub fn new(tool: impl Into<String>, action: PermissionAction) -> Self {
        Self {
            tool: tool.into(),
            pattern: default_pattern(),
            action,
        }
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = pattern.into();
        self
    }

    fn matches(&self, tool_id: &str, arguments: &Value) -> bool {
        if self.tool != "*" && self.tool != tool_id {
            return false;
        }
        if self.pattern == "*" {
            return true;
        }
        match arguments {
            Value::Object(map) => map.values().any(|value| match value {
                Value::String(s) => glob_match(&self.pattern, s),
                _ => false,
            }),
            _ => false,
        }
    }
}

/// Ordered rules plus a fallback action. First match wins.
#[derive(Debug, Clone, Default)]
pub struct PermissionPolicy {
    rules: Vec<PermissionRule>,
    default: PermissionAction,
}

impl PermissionPolicy {
    pub fn new(rules: Vec<PermissionRule>, default: PermissionAction) -> Self {
        Self { rules, default }
    }

    /// A policy that never asks.
    pub fn allow_all() -> Self {
        Self::new(Vec::new(), PermissionAction::Allow)
    }

    pub fn from_config(config: &PermissionsConfig) -> Self {
        Self::new(config.rules.clone(), config.default)
    }

    /// Classify a call by the static rules alone.
    pub fn classify(&self, tool_id: &str, arguments: &Value) -> PermissionAction {
        self.rules
            .iter()
            .find(|rule| rule.matches(tool_id, arguments))
            .map(|rule| rule.action)
            .unwrap_or(self.default)
    }
}

/// Minimal glob matcher: `*` is any run of characters, `?` exactly one.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((star_pi, star_ti)) = star {
            pi = star_pi + 1;
            ti = star_ti + 1;
            star = Some((star_pi, star_ti + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

// ---------------------------------------------------------------------------
// Pending question slot
// ---------------------------------------------------------------------------

/// Operator's answer to a permission question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionResponse {
    pub allowed: bool,
    /// Only meaningful together with `allowed`.
    pub always_allow: bool,
}

impl PermissionResponse {
    pub fn deny() -> Self {
        Self {
            allowed: false,
            always_allow: false,
        }
    }
}

#[derive(Debug)]
struct PendingAsk {
    tool_id: String,
    sender: oneshot::Sender<PermissionResponse>,
}

/// Cloneable handle for answering the runtime's permission questions from
/// another task (a terminal prompt, a UI, a test).
#[derive(Clone, Debug, Default)]
pub struct PermissionHandle {
    slot: Arc<Mutex<Option<PendingAsk>>>,
}

impl PermissionHandle {
    fn lock(&self) -> MutexGuard<'_, Option<PendingAsk>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Resolve the outstanding question about `tool_id`.
    ///
    /// Returns `true` when a waiting run received the answer. With nothing
    /// pending, or a pending question about another tool, this is a no-op.
    pub fn respond(&self, tool_id: &str, allowed: bool, always_allow: bool) -> bool {
        let mut slot = self.lock();
        let pending_tool = match slot.as_ref() {
            Some(pending) => pending.tool_id.clone(),
            None => {
                debug!(tool_id, "permission response with no pending question");
                return false;
            }
        };
        if pending_tool != tool_id {
            warn!(
                tool_id,
                pending = %pending_tool,
                "permission response for a tool that is not being asked about"
            );
            return false;
        }
        let Some(pending) = slot.take() else {
            return false;
        };
        pending
            .sender
            .send(PermissionResponse {
                allowed,
                always_allow,
            })
            .is_ok()
    }

    /// Tool id of the outstanding question, if any.
    pub fn pending_tool(&self) -> Option<String> {
        self.lock().as_ref().map(|pending| pending.tool_id.clone())
    }

    pub fn has_pending(&self) -> bool {
        self.lock().is_some()
    }

    fn install(&self, tool_id: &str) -> oneshot::Receiver<PermissionResponse> {
        let (sender, receiver) = oneshot::channel();
        let stale = self.lock().replace(PendingAsk {
            tool_id: tool_id.to_string(),
            sender,
        });
        if let Some(stale) = stale {
            warn!(tool_id = %stale.tool_id, "dropping unanswered permission question");
        }
        receiver
    }

    fn clear(&self) -> bool {
        self.lock().take().is_some()
    }
}

// ---------------------------------------------------------------------------
// Arbiter
// ---------------------------------------------------------------------------

/// Per-runtime permission state: policy, always-allow cache and the
/// question slot.
#[derive(Debug, Default)]
pub struct PermissionArbiter {
    policy: PermissionPolicy,
    always_allowed: HashSet<String>,
    handle: PermissionHandle,
}

impl PermissionArbiter {
    pub fn new(policy: PermissionPolicy) -> Self {
        Self {
            policy,
            always_allowed: HashSet::new(),
            handle: PermissionHandle::default(),
        }
    }

    /// Swap the static policy. Cached approvals and outstanding handles
    /// stay valid.
    pub fn set_policy(&mut self, policy: PermissionPolicy) {
        self.policy = policy;
    }

    /// Classify a call. Cached tools are allowed without consulting rules.
    pub fn check(&self, tool_id: &str, arguments: &Value) -> PermissionAction {
        if self.always_allowed.contains(tool_id) {
            return PermissionAction::Allow;
        }
        self.policy.classify(tool_id, arguments)
    }

    /// Open the question slot for `tool_id` and return the receiver the run
    /// suspends on. A dropped receiver error means "deny".
    pub fn ask(&self, tool_id: &str) -> oneshot::Receiver<PermissionResponse> {
        self.handle.install(tool_id)
    }

    /// Drop the outstanding question unanswered (the run was cancelled).
    pub fn withdraw(&self) -> bool {
        self.handle.clear()
    }

    /// Apply an operator answer to the cache.
    pub fn record(&mut self, tool_id: &str, response: PermissionResponse) {
        if response.allowed && response.always_allow {
            self.always_allowed.insert(tool_id.to_string());
        }
    }

    pub fn is_always_allowed(&self, tool_id: &str) -> bool {
        self.always_allowed.contains(tool_id)
    }

    /// Forget cached approvals and drop any outstanding question.
    pub fn reset(&mut self) {
        self.always_allowed.clear();
        if self.handle.clear() {
            debug!("pending permission question dropped by reset");
        }
    }

    pub fn handle(&self) -> PermissionHandle {
        self.handle.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn glob_basics() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("/etc/*", "/etc/passwd"));
        assert!(!glob_match("/etc/*", "/var/etc/passwd"));
        assert!(glob_match("rm ?f *", "rm -f build"));
        assert!(glob_match("*.csv", "prices.csv"));
        assert!(!glob_match("*.csv", "prices.csv.bak"));
        assert!(glob_match("a*b*c", "aXXbYYc"));
        assert!(glob_match("", ""));
        assert!(!glob_match("", "x"));
    }

    #[test]
    fn first_matching_rule_wins_then_default() {
        let policy = PermissionPolicy::new(
            vec![
                PermissionRule::new("*", PermissionAction::Deny).with_pattern("/etc/*"),
                PermissionRule::new("read_file", PermissionAction::Allow),
            ],
            PermissionAction::Ask,
        );
        assert_eq!(
            policy.classify("read_file", &json!({"path": "/etc/shadow"})),
            PermissionAction::Deny
        );
        assert_eq!(
            policy.classify("read_file", &json!({"path": "notes.txt"})),
            PermissionAction::Allow
        );
        assert_eq!(
            policy.classify("write_file", &json!({"path": "notes.txt"})),
            PermissionAction::Ask
        );
    }

    #[test]
    fn pattern_ignores_non_string_values() {
        let rule = PermissionRule::new("*", PermissionAction::Deny).with_pattern("4*");
        assert!(!rule.matches("sma", &json!({"window": 42})));
        assert!(rule.matches("sma", &json!({"window": "42"})));
        assert!(!rule.matches("sma", &json!("42")));
    }

    #[test]
    fn rule_deserializes_with_default_pattern() {
        let rule: PermissionRule =
            toml::from_str("tool = \"quote\"\naction = \"allow\"").expect("parse");
        assert_eq!(rule.pattern, "*");
        assert_eq!(rule.action, PermissionAction::Allow);
    }

    #[tokio::test]
    async fn respond_resolves_pending_question_once() {
        let arbiter = PermissionArbiter::new(PermissionPolicy::default());
        let handle = arbiter.handle();
        let rx = arbiter.ask("quote");
        assert_eq!(handle.pending_tool().as_deref(), Some("quote"));

        assert!(handle.respond("quote", true, false));
        assert!(!handle.respond("quote", false, false));
        assert!(!handle.has_pending());

        let response = rx.await.expect("answer");
        assert!(response.allowed);
    }

    #[tokio::test]
    async fn respond_for_other_tool_is_ignored() {
        let arbiter = PermissionArbiter::new(PermissionPolicy::default());
        let handle = arbiter.handle();
        let mut rx = arbiter.ask("quote");
        assert!(!handle.respond("sma", true, true));
        assert!(handle.has_pending());
        assert!(rx.try_recv().is_err());
        assert!(handle.respond("quote", false, false));
        assert_eq!(rx.await.expect("answer"), PermissionResponse::deny());
    }

    #[tokio::test]
    async fn new_question_drops_stale_waiter() {
        let arbiter = PermissionArbiter::new(PermissionPolicy::default());
        let stale = arbiter.ask("quote");
        let _fresh = arbiter.ask("sma");
        assert!(stale.await.is_err());
        assert_eq!(arbiter.handle().pending_tool().as_deref(), Some("sma"));
    }

    #[test]
    fn always_allow_is_cached_only_when_allowed() {
        let mut arbiter = PermissionArbiter::new(PermissionPolicy::default());
        arbiter.record(
            "quote",
            PermissionResponse {
                allowed: false,
                always_allow: true,
            },
        );
        assert!(!arbiter.is_always_allowed("quote"));

        arbiter.record(
            "quote",
            PermissionResponse {
                allowed: true,
                always_allow: true,
            },
        );
        assert_eq!(arbiter.check("quote", &json!({})), PermissionAction::Allow);
        assert_eq!(arbiter.check("sma", &json!({})), PermissionAction::Ask);
    }

    #[tokio::test]
    async fn reset_clears_cache_and_pending_question() {
        let mut arbiter = PermissionArbiter::new(PermissionPolicy::default());
        arbiter.record(
            "quote",
            PermissionResponse {
                allowed: true,
                always_allow: true,
            },
        );
        let rx = arbiter.ask("sma");
        arbiter.reset();
        assert!(!arbiter.is_always_allowed("quote"));
        assert!(!arbiter.handle().has_pending());
        assert!(rx.await.is_err());
    }
}
