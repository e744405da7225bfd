//! Hook pipeline.
//!
//! Hooks observe (and before execution, veto) tool calls and run lifecycle
//! points. A hook is either an in-process callable or an external command
//! that reads the invocation context as JSON on stdin and prints one
//! `{"allow": bool, "message": string}` object on stdout.
//!
//! Evaluation is sequential in registration order and stops at the first
//! `allow: false`. A hook that fails to run, times out or prints something
//! unparsable is logged and skipped.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::{HookConfig, HookKind};
use crate::error::HookError;

/// Lifecycle point a hook is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookEvent {
    /// Before a tool call executes. May veto it.
    PreToolUse,
    /// After a tool call produced its result. Observational.
    PostToolUse,
    /// Once, when a run starts.
    SessionStart,
    /// Once, when a run ends.
    Stop,
}

impl HookEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreToolUse => "PreToolUse",
            Self::PostToolUse => "PostToolUse",
            Self::SessionStart => "SessionStart",
            Self::Stop => "Stop",
        }
    }
}

/// A hook's verdict. Only an explicit `allow: false` blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HookResult {
    pub fn allow() -> Self {
        Self {
            allow: Some(true),
            message: None,
        }
    }

    pub fn block(message: impl Into<String>) -> Self {
        Self {
            allow: Some(false),
            message: Some(message.into()),
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.allow == Some(false)
    }
}

/// Invocation context passed to every hook.
#[derive(Debug, Clone, Serialize)]
pub struct HookContext {
    pub event: HookEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    /// Tool output, for `PostToolUse`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    /// Prompt that started the run, for `SessionStart`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Final answer, for `Stop`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
}

impl HookContext {
    fn bare(event: HookEvent) -> Self {
        Self {
            event,
            tool_id: None,
            call_id: None,
            arguments: None,
            output: None,
            is_error: None,
            prompt: None,
            answer: None,
        }
    }

    pub fn pre_tool_use(tool_id: &str, call_id: &str, arguments: Value) -> Self {
        Self {
            tool_id: Some(tool_id.to_string()),
            call_id: Some(call_id.to_string()),
            arguments: Some(arguments),
            ..Self::bare(HookEvent::PreToolUse)
        }
    }

    pub fn post_tool_use(
        tool_id: &str,
        call_id: &str,
        arguments: Value,
        output: &str,
        is_error: bool,
    ) -> Self {
        Self {
            tool_id: Some(tool_id.to_string()),
            call_id: Some(call_id.to_string()),
            arguments: Some(arguments),
            output: Some(output.to_string()),
            is_error: Some(is_error),
            ..Self::bare(HookEvent::PostToolUse)
        }
    }

    pub fn session_start(prompt: &str) -> Self {
        Self {
            prompt: Some(prompt.to_string()),
            ..Self::bare(HookEvent::SessionStart)
        }
    }

    pub fn stop(answer: Option<&str>) -> Self {
        Self {
            answer: answer.map(str::to_string),
            ..Self::bare(HookEvent::Stop)
        }
    }
}

// ---------------------------------------------------------------------------
// Hook implementations
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Hook: Send + Sync {
    async fn invoke(&self, context: &HookContext) -> Result<HookResult, HookError>;
}

/// In-process hook backed by a closure.
pub struct FnHook<F> {
    f: F,
}

impl<F> FnHook<F>
where
    F: Fn(&HookContext) -> HookResult + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Hook for FnHook<F>
where
    F: Fn(&HookContext) -> HookResult + Send + Sync,
{
    async fn invoke(&self, context: &HookContext) -> Result<HookResult, HookError> {
        panic::catch_unwind(AssertUnwindSafe(|| (self.f)(context)))
            .map_err(|payload| HookError::Panicked(panic_message(payload.as_ref())))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// External command run through `sh -c`.
#[derive(Debug, Clone)]
pub struct CommandHook {
    command: String,
    timeout: Duration,
}

impl CommandHook {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    async fn run(&self, input: &[u8]) -> Result<std::process::Output, HookError> {
        let mut cmd = Command::new("sh");
        // Timeouts drop the future; the child must go with it.
        cmd.kill_on_drop(true);
        cmd.arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(HookError::Spawn)?;
        if let Some(mut stdin) = child.stdin.take() {
            // A hook may exit without reading stdin; a broken pipe is fine.
            if let Err(e) = stdin.write_all(input).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(HookError::Io(e));
                }
            }
        }
        child.wait_with_output().await.map_err(HookError::Io)
    }
}

#[async_trait]
impl Hook for CommandHook {
    async fn invoke(&self, context: &HookContext) -> Result<HookResult, HookError> {
        let input = serde_json::to_vec(context)
            .map_err(|e| HookError::InvalidOutput(format!("context encode: {e}")))?;
        let output = tokio::time::timeout(self.timeout, self.run(&input))
            .await
            .map_err(|_| HookError::Timeout(self.timeout.as_secs()))??;
        if !output.status.success() {
            debug!(
                command = %self.command,
                status = ?output.status.code(),
                "hook exited unsuccessfully"
            );
        }
        parse_hook_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse hook stdout: the whole output, or failing that its last non-empty
/// line, must be one JSON object.
fn parse_hook_output(stdout: &str) -> Result<HookResult, HookError> {
    let trimmed = stdout.trim();
    if let Ok(result) = serde_json::from_str::<HookResult>(trimmed) {
        return Ok(result);
    }
    let last = trimmed.lines().rev().find(|line| !line.trim().is_empty());
    match last {
        Some(line) => serde_json::from_str::<HookResult>(line.trim())
            .map_err(|e| HookError::InvalidOutput(format!("{e}: {line}"))),
        None => Err(HookError::InvalidOutput("empty output".into())),
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Ordered hooks, each scoped to one event.
#[derive(Default)]
pub struct HookPipeline {
    hooks: Vec<(HookEvent, Box<dyn Hook>)>,
}

impl HookPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build command hooks from config. Entries without a command, and
    /// `function` entries (which have no callable in a file), are no-ops.
    pub fn from_config(configs: &[HookConfig]) -> Self {
        let mut pipeline = Self::new();
        for config in configs {
            let command = config
                .command
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty());
            match (config.kind, command) {
                (HookKind::Command, Some(command)) => pipeline.register(
                    config.event,
                    CommandHook::new(command, Duration::from_secs(config.timeout_secs)),
                ),
                _ => debug!(event = config.event.as_str(), "skipping hook with nothing to run"),
            }
        }
        pipeline
    }

    pub fn register(&mut self, event: HookEvent, hook: impl Hook + 'static) {
        self.hooks.push((event, Box::new(hook)));
    }

    pub fn register_fn<F>(&mut self, event: HookEvent, f: F)
    where
        F: Fn(&HookContext) -> HookResult + Send + Sync + 'static,
    {
        self.register(event, FnHook::new(f));
    }

    /// Number of hooks attached to `event`.
    pub fn count(&self, event: HookEvent) -> usize {
        self.hooks.iter().filter(|(e, _)| *e == event).count()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run every hook for `context.event` in order, stopping at the first
    /// block. Returns the blocking result, or a non-blocking default.
    pub async fn run(&self, context: &HookContext) -> HookResult {
        for (index, (event, hook)) in self.hooks.iter().enumerate() {
            if *event != context.event {
                continue;
            }
            match hook.invoke(context).await {
                Ok(result) if result.is_blocking() => {
                    debug!(event = event.as_str(), index, "hook blocked");
                    return result;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(event = event.as_str(), index, error = %err, "hook failed; continuing");
                }
            }
        }
        HookResult::default()
    }
}
