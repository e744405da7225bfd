//! Shared test fixtures: temp directories, provider stream builders and a
//! scripted model client.

use crate::api::{ByteStream, ModelClient};
use crate::error::ApiError;
use crate::types::ModelRequest;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use futures_util::StreamExt;
use serde_json::json;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Temporary directory removed on drop.
#[derive(Debug)]
pub struct TestTempDir {
    path: PathBuf,
}

impl TestTempDir {
    pub fn new(prefix: &str) -> Self {
        let suffix = TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let dir = std::env::temp_dir().join(format!(
            "relay-{prefix}-{}-{millis}-{suffix}",
            std::process::id()
        ));
        fs::create_dir_all(&dir).expect("failed to create temporary fixture directory");
        Self { path: dir }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn child(&self, relative: &str) -> PathBuf {
        self.path.join(relative)
    }

    /// Write UTF-8 text to a child path, creating parents as needed.
    pub fn write_text(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.child(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("failed to create fixture parent directories");
        }
        fs::write(&path, content).expect("failed to write fixture file");
        path
    }
}

impl Drop for TestTempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

// ---------------------------------------------------------------------------
// Provider stream builders
// ---------------------------------------------------------------------------

/// One `data:` record line.
pub fn data_line(json: &str) -> String {
    format!("data: {json}\n")
}

fn text_delta_line(text: &str) -> String {
    data_line(
        &json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "text_delta", "text": text}
        })
        .to_string(),
    )
}

fn tool_block_lines(call_id: &str, name: &str, fragments: &[&str]) -> String {
    let mut out = data_line(
        &json!({
            "type": "content_block_start",
            "content_block": {"type": "tool_use", "id": call_id, "name": name, "input": {}}
        })
        .to_string(),
    );
    for fragment in fragments {
        out.push_str(&data_line(
            &json!({
                "type": "content_block_delta",
                "delta": {"type": "input_json_delta", "partial_json": fragment}
            })
            .to_string(),
        ));
    }
    out.push_str(&data_line(r#"{"type":"content_block_stop"}"#));
    out
}

fn message_stop_line() -> String {
    data_line(r#"{"type":"message_stop"}"#)
}

/// Text-only response: one delta per fragment, then `message_stop`.
pub fn text_stream(fragments: &[&str]) -> String {
    let mut out = String::new();
    for fragment in fragments {
        out.push_str(&text_delta_line(fragment));
    }
    out.push_str(&message_stop_line());
    out
}

/// Single tool-use response with the arguments split into fragments.
pub fn tool_stream(call_id: &str, name: &str, fragments: &[&str]) -> String {
    let mut out = tool_block_lines(call_id, name, fragments);
    out.push_str(&message_stop_line());
    out
}

/// Response with leading text and a batch of `(call_id, tool, arguments)`.
pub fn tool_batch_stream(text: &str, calls: &[(&str, &str, &str)]) -> String {
    let mut out = String::new();
    if !text.is_empty() {
        out.push_str(&text_delta_line(text));
    }
    for (call_id, name, arguments) in calls {
        out.push_str(&tool_block_lines(call_id, name, &[arguments]));
    }
    out.push_str(&message_stop_line());
    out
}

/// `message_start` plus `message_delta` usage records.
pub fn usage_lines(input_tokens: u64, output_tokens: u64) -> String {
    let mut out = data_line(
        &json!({
            "type": "message_start",
            "message": {"usage": {"input_tokens": input_tokens, "output_tokens": 1}}
        })
        .to_string(),
    );
    out.push_str(&data_line(
        &json!({
            "type": "message_delta",
            "delta": {"stop_reason": "end_turn"},
            "usage": {"output_tokens": output_tokens}
        })
        .to_string(),
    ));
    out
}

// ---------------------------------------------------------------------------
// Scripted model client
// ---------------------------------------------------------------------------

/// One scripted model call.
pub enum Scripted {
    /// Full response body.
    Body(String),
    /// The call fails before any bytes arrive.
    OpenError(ApiError),
    /// Some bytes, then a transport error.
    Broken(String),
    /// Some bytes, then the stream never yields again.
    Stall(String),
}

type ScriptFn = Box<dyn Fn(usize) -> String + Send + Sync>;

/// Model client replaying canned responses in small chunks.
///
/// Once the queue is empty, the fallback (if any) builds a body from the
/// zero-based call index.
pub struct ScriptedClient {
    steps: Mutex<VecDeque<Scripted>>,
    fallback: Option<ScriptFn>,
    requests: Mutex<Vec<ModelRequest>>,
    chunk_size: usize,
}

impl ScriptedClient {
    pub fn new(steps: Vec<Scripted>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
            chunk_size: 7,
        }
    }

    pub fn bodies(bodies: Vec<String>) -> Self {
        Self::new(bodies.into_iter().map(Scripted::Body).collect())
    }

    pub fn repeating(f: impl Fn(usize) -> String + Send + Sync + 'static) -> Self {
        let mut client = Self::new(Vec::new());
        client.fallback = Some(Box::new(f));
        client
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    fn chunked(&self, body: String) -> Vec<Result<Bytes, ApiError>> {
        body.into_bytes()
            .chunks(self.chunk_size)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect()
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    async fn stream(&self, request: &ModelRequest) -> Result<ByteStream, ApiError> {
        let call_index = {
            let mut requests = self.requests.lock().expect("requests lock");
            requests.push(request.clone());
            requests.len() - 1
        };
        let step = self.steps.lock().expect("steps lock").pop_front();
        let step = match (step, &self.fallback) {
            (Some(step), _) => step,
            (None, Some(f)) => Scripted::Body(f(call_index)),
            (None, None) => {
                return Err(ApiError::InvalidResponse("script exhausted".into()));
            }
        };
        match step {
            Scripted::Body(body) => Ok(Box::pin(stream::iter(self.chunked(body)))),
            Scripted::OpenError(err) => Err(err),
            Scripted::Broken(partial) => {
                let mut chunks = self.chunked(partial);
                chunks.push(Err(ApiError::InvalidResponse("connection reset".into())));
                Ok(Box::pin(stream::iter(chunks)))
            }
            Scripted::Stall(partial) => Ok(Box::pin(
                stream::iter(self.chunked(partial)).chain(stream::pending()),
            )),
        }
    }
}
