//! Incremental decoder for the provider's streaming wire format.
//!
//! The provider frames its response as newline-delimited `data: {json}`
//! records. [`StreamDecoder`] keeps a byte buffer across network chunks,
//! decodes every complete line and turns the recognized record types into
//! [`StreamEvent`]s:
//!
//! - `message_start` / `message_delta`: usage counters
//! - `content_block_start` (tool use): start of a tool call
//! - `content_block_delta`: `text_delta` or `input_json_delta` fragments
//! - `content_block_stop`: completes an active tool call
//! - `message_stop`: end of the response
//!
//! A record that fails to parse is dropped and decoding continues. The
//! decoder never retries; transport failures belong to the caller.

use crate::api::ByteStream;
use crate::error::ApiError;
use crate::tokens::UsageReport;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Typed event produced from one decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Visible assistant text fragment.
    TextDelta(String),
    /// The model opened a tool-use block.
    ToolUseStart { call_id: String, tool_name: String },
    /// One fragment of the tool's JSON argument string.
    ToolInputDelta(String),
    /// The tool-use block closed; `arguments` is the full accumulated string.
    ToolUseComplete {
        call_id: String,
        tool_name: String,
        arguments: String,
    },
    /// Usage counters reported by the provider.
    Usage(UsageReport),
    /// End of the model's response.
    MessageStop,
}

/// Tool-use block currently receiving argument fragments.
#[derive(Debug)]
struct ActiveToolUse {
    call_id: String,
    tool_name: String,
    arguments: String,
}

/// Line-buffered state machine over the provider's record stream.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    /// Bytes of the trailing, not yet newline-terminated line.
    buffer: Vec<u8>,
    active_tool: Option<ActiveToolUse>,
    /// Counter used to name tool blocks that arrive without an id.
    anonymous_calls: u64,
    finished: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once `message_stop` has been decoded; later input is ignored.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed one network chunk and return the events of every line it
    /// completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        self.buffer.extend_from_slice(chunk);

        // Split on newline and keep the trailing partial line buffered. The
        // split happens on bytes so multi-byte characters cut across chunks
        // are reassembled before decoding.
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.decode_line(&String::from_utf8_lossy(&line), &mut events);
            if self.finished {
                self.buffer.clear();
                break;
            }
        }
        events
    }

    /// Signal end of input: the trailing buffered line gets one final parse
    /// attempt, then is discarded.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        let rest = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&rest);
        if !line.trim().is_empty() {
            self.decode_line(&line, &mut events);
        }
        events
    }

    fn decode_line(&mut self, raw: &str, events: &mut Vec<StreamEvent>) {
        let line = raw.trim_end_matches(|c: char| c == '\r' || c == '\n');
        let Some(payload) = line.strip_prefix("data:") else {
            // `event:` lines, comments and blank separators carry nothing we
            // need: the record type is repeated inside the JSON payload.
            return;
        };
        let payload = payload.trim_start();
        if payload.is_empty() || payload == "[DONE]" {
            return;
        }
        let record: Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "dropping malformed stream record");
                return;
            }
        };
        self.decode_record(&record, events);
    }

    fn decode_record(&mut self, record: &Value, events: &mut Vec<StreamEvent>) {
        let kind = record
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default();
        match kind {
            "message_start" => {
                let usage = record.get("message").and_then(|message| message.get("usage"));
                if let Some(report) = usage.and_then(UsageReport::from_json) {
                    events.push(StreamEvent::Usage(report));
                }
            }
            "message_delta" => {
                if let Some(report) = record.get("usage").and_then(UsageReport::from_json) {
                    events.push(StreamEvent::Usage(report));
                }
            }
            "content_block_start" => {
                let Some(block) = record.get("content_block") else {
                    return;
                };
                if block.get("type").and_then(Value::as_str) != Some("tool_use") {
                    return;
                }
                let tool_name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let call_id = match block.get("id").and_then(Value::as_str) {
                    Some(id) if !id.is_empty() => id.to_string(),
                    _ => {
                        self.anonymous_calls += 1;
                        format!("call_{}", self.anonymous_calls)
                    }
                };
                self.active_tool = Some(ActiveToolUse {
                    call_id: call_id.clone(),
                    tool_name: tool_name.clone(),
                    arguments: String::new(),
                });
                events.push(StreamEvent::ToolUseStart { call_id, tool_name });
            }
            "content_block_delta" => {
                let Some(delta) = record.get("delta") else {
                    return;
                };
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        if let Some(text) = delta.get("text").and_then(Value::as_str) {
                            events.push(StreamEvent::TextDelta(text.to_string()));
                        }
                    }
                    Some("input_json_delta") => {
                        let fragment = delta
                            .get("partial_json")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        if let Some(active) = self.active_tool.as_mut() {
                            active.arguments.push_str(fragment);
                            events.push(StreamEvent::ToolInputDelta(fragment.to_string()));
                        } else {
                            debug!("argument fragment outside a tool-use block");
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                if let Some(active) = self.active_tool.take() {
                    events.push(StreamEvent::ToolUseComplete {
                        call_id: active.call_id,
                        tool_name: active.tool_name,
                        arguments: active.arguments,
                    });
                }
            }
            "message_stop" => {
                self.finished = true;
                events.push(StreamEvent::MessageStop);
            }
            other => debug!(record_type = other, "ignoring stream record"),
        }
    }
}

/// Drive a provider byte stream through a [`StreamDecoder`], forwarding
/// events on a bounded channel.
///
/// Returns once `message_stop` is decoded, the byte stream ends, or the
/// receiving side hangs up. A chunk-level transport error is returned as-is.
pub async fn decode_stream(
    mut bytes: ByteStream,
    tx: mpsc::Sender<StreamEvent>,
) -> Result<(), ApiError> {
    let mut decoder = StreamDecoder::new();
    while let Some(chunk) = bytes.next().await {
        let chunk = chunk?;
        for event in decoder.push(&chunk) {
            if tx.send(event).await.is_err() {
                return Ok(());
            }
        }
        if decoder.is_finished() {
            return Ok(());
        }
    }
    for event in decoder.finish() {
        if tx.send(event).await.is_err() {
            break;
        }
    }
    Ok(())
}
