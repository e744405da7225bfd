//! Configuration data model.
//!
//! Every section deserializes with `#[serde(default)]`, so a partial
//! `relay.toml` (or an empty one) yields a complete [`Config`].

use serde::Deserialize;
use std::path::PathBuf;

use super::defaults::{
    DEFAULT_API_BASE_URL, DEFAULT_API_KEY_ENV, DEFAULT_API_TIMEOUT_SECS,
    DEFAULT_CONTEXT_BUDGET_TOKENS, DEFAULT_HOOK_TIMEOUT_SECS, DEFAULT_MAX_ITERATIONS,
    DEFAULT_MAX_TOKENS, DEFAULT_MODEL, DEFAULT_SYSTEM_PROMPT, DEFAULT_WAL_DIR,
};
use crate::hooks::HookEvent;
use crate::permission::{PermissionAction, PermissionRule};

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub agent: AgentConfig,
    pub context: ContextConfig,
    pub permissions: PermissionsConfig,
    pub hooks: Vec<HookConfig>,
    pub wal: WalConfig,
}

/// Model provider connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub model: String,
    /// Inline key. Prefer `api_key_env` for anything checked in.
    pub api_key: String,
    /// Name of an env var holding the key.
    pub api_key_env: Option<String>,
    pub max_tokens: u32,
    /// Connect timeout; streaming bodies have no total timeout.
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.into(),
            model: DEFAULT_MODEL.into(),
            api_key: String::new(),
            api_key_env: Some(DEFAULT_API_KEY_ENV.into()),
            max_tokens: DEFAULT_MAX_TOKENS,
            timeout_secs: DEFAULT_API_TIMEOUT_SECS,
        }
    }
}

/// Turn-loop behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub system_prompt: String,
    /// Model calls allowed per run before the loop gives up.
    pub max_iterations: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

/// Context window management.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Token budget for the whole history.
    pub budget_tokens: u64,
    /// Prune when usage exceeds `budget_tokens * trigger_fraction`.
    pub trigger_fraction: f64,
    /// Prune down to `budget_tokens * target_fraction`.
    pub target_fraction: f64,
    /// Most recent user turns that are never removed.
    pub keep_recent_turns: usize,
    /// Replace the removed span with a short synthetic summary.
    pub summarize: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            budget_tokens: DEFAULT_CONTEXT_BUDGET_TOKENS,
            trigger_fraction: 1.0,
            target_fraction: 0.8,
            keep_recent_turns: 1,
            summarize: true,
        }
    }
}

/// Static permission policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    /// Action when no rule matches.
    pub default: PermissionAction,
    /// Ordered rules; first match wins.
    #[serde(rename = "rule")]
    pub rules: Vec<PermissionRule>,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            default: PermissionAction::Ask,
            rules: Vec::new(),
        }
    }
}

/// How a configured hook is invoked.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HookKind {
    /// In-process callable registered by the embedding program.
    #[default]
    Function,
    /// External command receiving JSON on stdin.
    Command,
}

/// One `[[hooks]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct HookConfig {
    pub event: HookEvent,
    #[serde(rename = "type", default)]
    pub kind: HookKind,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default = "default_hook_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_hook_timeout_secs() -> u64 {
    DEFAULT_HOOK_TIMEOUT_SECS
}

/// Conversation log settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    pub enabled: bool,
    pub dir: PathBuf,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: PathBuf::from(DEFAULT_WAL_DIR),
        }
    }
}
