//! Pluggable tool system.
//!
//! Tools are async trait objects the model can invoke during a run. Each one
//! publishes a [`ToolSpec`] and executes against raw JSON arguments. The
//! runtime reaches them only through [`ToolRegistry`], which validates
//! registrations up front so a broken tool never makes it into a request.

pub mod clock;

use crate::error::{RegistryError, ToolError};
use crate::types::ToolSpec;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::watch;

/// Prefix marking a tool result as a tool-level failure.
pub const ERROR_MARKER: &str = "Error:";

/// True when a tool result string reports a failure.
pub fn is_error_result(output: &str) -> bool {
    output.trim_start().starts_with(ERROR_MARKER)
}

// ---------------------------------------------------------------------------
// Tool context
// ---------------------------------------------------------------------------

/// Per-call context handed to [`Tool::execute`].
#[derive(Clone, Debug, Default)]
pub struct ToolContext {
    /// Id the model assigned to this call.
    pub call_id: String,
    cancellation: Option<watch::Receiver<bool>>,
}

impl ToolContext {
    pub fn new(call_id: impl Into<String>, cancellation: Option<watch::Receiver<bool>>) -> Self {
        Self {
            call_id: call_id.into(),
            cancellation,
        }
    }

    /// True once the run's cancellation signal has fired.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(|rx| *rx.borrow())
    }

    /// Cancellation receiver for tools that want to `select!` on it.
    pub fn cancellation(&self) -> Option<watch::Receiver<bool>> {
        self.cancellation.clone()
    }
}

// ---------------------------------------------------------------------------
// Tool trait
// ---------------------------------------------------------------------------

/// A tool that can be invoked by the model.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique id matching what the model will call.
    fn id(&self) -> &str;

    /// Human-readable description sent with the schema.
    fn description(&self) -> &str;

    /// JSON schema for the tool's input. Must be an object.
    fn schema(&self) -> Value;

    /// Execute the tool with the model's raw JSON argument string.
    async fn execute(&self, arguments: &str, context: &ToolContext) -> Result<String, ToolError>;
}

// ---------------------------------------------------------------------------
// Tool registry
// ---------------------------------------------------------------------------

/// Lookup table of available tools, in registration order.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, rejecting duplicate ids and non-object schemas.
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), RegistryError> {
        let id = tool.id().to_string();
        if self.index.contains_key(&id) {
            return Err(RegistryError::DuplicateTool(id));
        }
        if !tool.schema().is_object() {
            return Err(RegistryError::MissingSchema(id));
        }
        self.index.insert(id, self.tools.len());
        self.tools.push(Box::new(tool));
        Ok(())
    }

    /// Tool specs for the model request.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .map(|tool| ToolSpec {
                name: tool.id().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.schema(),
            })
            .collect()
    }

    pub fn contains(&self, tool_id: &str) -> bool {
        self.index.contains_key(tool_id)
    }

    /// Find a tool by id and execute it.
    pub async fn execute(
        &self,
        tool_id: &str,
        arguments: &str,
        context: &ToolContext,
    ) -> Result<String, ToolError> {
        let tool = self
            .index
            .get(tool_id)
            .and_then(|&i| self.tools.get(i))
            .ok_or_else(|| ToolError::ExecutionFailed(format!("unknown tool: {tool_id}")))?;
        tool.execute(arguments, context).await
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool {
        id: &'static str,
        schema: Value,
    }

    impl EchoTool {
        fn new(id: &'static str) -> Self {
            Self {
                id,
                schema: json!({"type": "object"}),
            }
        }
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn id(&self) -> &str {
            self.id
        }
        fn description(&self) -> &str {
            "echoes arguments back"
        }
        fn schema(&self) -> Value {
            self.schema.clone()
        }
        async fn execute(&self, arguments: &str, _context: &ToolContext) -> Result<String, ToolError> {
            Ok(arguments.to_string())
        }
    }

    #[test]
    fn new_registry_is_empty() {
        assert!(ToolRegistry::new().is_empty());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut r = ToolRegistry::new();
        r.register(EchoTool::new("echo")).expect("first");
        assert_eq!(
            r.register(EchoTool::new("echo")),
            Err(RegistryError::DuplicateTool("echo".into()))
        );
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn non_object_schema_is_rejected() {
        let mut r = ToolRegistry::new();
        let tool = EchoTool {
            id: "broken",
            schema: Value::Null,
        };
        assert_eq!(
            r.register(tool),
            Err(RegistryError::MissingSchema("broken".into()))
        );
        assert!(r.is_empty());
    }

    #[test]
    fn specs_keep_registration_order() {
        let mut r = ToolRegistry::new();
        r.register(EchoTool::new("b")).expect("b");
        r.register(EchoTool::new("a")).expect("a");
        let names: Vec<_> = r.specs().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn execute_known_tool_returns_output() {
        let mut r = ToolRegistry::new();
        r.register(EchoTool::new("echo")).expect("register");
        let out = r
            .execute("echo", r#"{"x":1}"#, &ToolContext::default())
            .await
            .expect("execute");
        assert_eq!(out, r#"{"x":1}"#);
    }

    #[tokio::test]
    async fn execute_unknown_tool_errors() {
        let r = ToolRegistry::new();
        let err = r
            .execute("missing", "{}", &ToolContext::default())
            .await
            .expect_err("unknown");
        assert!(err.to_string().contains("unknown tool: missing"));
    }

    #[test]
    fn error_marker_detection() {
        assert!(is_error_result("Error: boom"));
        assert!(is_error_result("  Error: indented"));
        assert!(!is_error_result("no Error: here"));
    }

    #[test]
    fn context_reports_cancellation() {
        let (tx, rx) = watch::channel(false);
        let ctx = ToolContext::new("call_1", Some(rx));
        assert!(!ctx.is_cancelled());
        tx.send(true).expect("send");
        assert!(ctx.is_cancelled());
        assert!(!ToolContext::default().is_cancelled());
    }
}
