//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use relay::api::{ByteStream, ModelClient};
use relay::error::{ApiError, ToolError};
use relay::tools::{Tool, ToolContext};
use relay::types::ModelRequest;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Temp directory removed on drop.
pub struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub fn new(prefix: &str) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = std::env::temp_dir().join(format!(
            "{prefix}-{}-{nanos}",
            std::process::id()
        ));
        std::fs::create_dir_all(&path).expect("create temp dir");
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

fn line(value: Value) -> String {
    format!("data: {value}\n")
}

pub fn text_delta(text: &str) -> String {
    line(json!({
        "type": "content_block_delta",
        "delta": {"type": "text_delta", "text": text}
    }))
}

pub fn message_stop() -> String {
    line(json!({"type": "message_stop"}))
}

pub fn answer(text: &str) -> String {
    format!("{}{}", text_delta(text), message_stop())
}

/// One response requesting `(call_id, tool, arguments)` calls.
pub fn tool_calls(calls: &[(&str, &str, &str)]) -> String {
    let mut body = String::new();
    for (call_id, tool, arguments) in calls {
        body.push_str(&line(json!({
            "type": "content_block_start",
            "content_block": {"type": "tool_use", "id": call_id, "name": tool, "input": {}}
        })));
        body.push_str(&line(json!({
            "type": "content_block_delta",
            "delta": {"type": "input_json_delta", "partial_json": arguments}
        })));
        body.push_str(&line(json!({"type": "content_block_stop"})));
    }
    body.push_str(&message_stop());
    body
}

/// Replays canned bodies, then repeats `fallback` (if any) forever.
pub struct CannedClient {
    bodies: Mutex<VecDeque<String>>,
    fallback: Option<String>,
    calls: AtomicUsize,
}

impl CannedClient {
    pub fn new(bodies: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            bodies: Mutex::new(bodies.into()),
            fallback: None,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn always(body: String) -> Arc<Self> {
        Arc::new(Self {
            bodies: Mutex::new(VecDeque::new()),
            fallback: Some(body),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelClient for CannedClient {
    async fn stream(&self, _request: &ModelRequest) -> Result<ByteStream, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.bodies.lock().expect("bodies lock").pop_front();
        let body = next
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| ApiError::InvalidResponse("no more canned responses".into()))?;
        // Split mid-record to exercise reassembly.
        let chunks = body
            .into_bytes()
            .chunks(11)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect::<Vec<_>>();
        Ok(Box::pin(stream::iter(chunks)))
    }
}

/// Tool that echoes its arguments and counts executions.
pub struct CountingTool {
    id: String,
    runs: Arc<AtomicUsize>,
}

impl CountingTool {
    pub fn new(id: &str) -> (Self, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        (
            Self {
                id: id.to_string(),
                runs: Arc::clone(&runs),
            },
            runs,
        )
    }
}

#[async_trait]
impl Tool for CountingTool {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> &str {
        "echoes its arguments"
    }

    fn schema(&self) -> Value {
        json!({"type": "object"})
    }

    async fn execute(&self, arguments: &str, _context: &ToolContext) -> Result<String, ToolError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{} ran with {arguments}", self.id))
    }
}
