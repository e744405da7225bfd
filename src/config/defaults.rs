//! Default configuration constants.

/// Default Anthropic-compatible API base URL.
pub(super) const DEFAULT_API_BASE_URL: &str = "https://api.anthropic.com";
/// Default provider model id.
pub(super) const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
/// Default env var consulted for the API key when none is configured inline.
pub(super) const DEFAULT_API_KEY_ENV: &str = "ANTHROPIC_API_KEY";
/// Default per-call output token cap.
pub(super) const DEFAULT_MAX_TOKENS: u32 = 4096;
/// Default connect timeout for model API requests.
pub(super) const DEFAULT_API_TIMEOUT_SECS: u64 = 60;
/// Default cap on model calls per run.
pub(super) const DEFAULT_MAX_ITERATIONS: usize = 10;
/// Default context budget in estimated tokens.
pub(super) const DEFAULT_CONTEXT_BUDGET_TOKENS: u64 = 100_000;
/// Default timeout for command hooks.
pub(super) const DEFAULT_HOOK_TIMEOUT_SECS: u64 = 10;
/// Default WAL directory, relative to the working directory.
pub(super) const DEFAULT_WAL_DIR: &str = ".relay/wal";
/// Default system prompt used when `agent.system_prompt` is unset.
pub(super) const DEFAULT_SYSTEM_PROMPT: &str = "You are a careful assistant. Use the available tools when they help answer the request, and say plainly when they fail.";
