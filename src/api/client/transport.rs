//! HTTP transport helpers: request body building and dispatch.

use crate::api::{parse_retry_after_secs, ByteStream};
use crate::error::ApiError;
use crate::types::{Message, ModelRequest, Role};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::time::Duration;

/// Provider API version header value.
const API_VERSION: &str = "2023-06-01";

/// Build an HTTP client with a connect timeout applied.
///
/// No total timeout: a streaming response may legitimately stay open for
/// minutes.
pub(super) fn build_http_client(connect_timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Open one streaming messages request and hand back its body stream.
pub(super) async fn open_stream(
    http: &reqwest::Client,
    base_url: &str,
    api_key: &str,
    body: &Value,
) -> Result<ByteStream, ApiError> {
    let url = format!("{base_url}/v1/messages");
    let response = http
        .post(&url)
        .header("x-api-key", api_key)
        .header("anthropic-version", API_VERSION)
        .header("accept", "text/event-stream")
        .json(body)
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let retry_after_secs = parse_retry_after_secs(response.headers());
        let body = response.text().await.unwrap_or_default();
        return Err(ApiError::status(status, body, retry_after_secs));
    }

    Ok(Box::pin(
        response
            .bytes_stream()
            .map(|chunk| chunk.map_err(ApiError::from)),
    ))
}

/// Serialize a [`ModelRequest`] into the provider's messages payload.
///
/// System messages are hoisted into the top-level `system` field, assistant
/// tool calls become `tool_use` blocks and consecutive tool results are
/// merged into a single user message of `tool_result` blocks.
pub(super) fn build_request_body(request: &ModelRequest) -> Value {
    let system = request
        .messages
        .iter()
        .filter(|message| message.role == Role::System)
        .map(|message| message.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut messages: Vec<Value> = Vec::new();
    for message in request.messages.iter().filter(|m| m.role != Role::System) {
        match message.role {
            Role::System => {}
            Role::User => messages.push(json!({
                "role": "user",
                "content": message.content,
            })),
            Role::Assistant => messages.push(json!({
                "role": "assistant",
                "content": assistant_blocks(message),
            })),
            Role::Tool => {
                let block = tool_result_block(message);
                let merged = messages.last_mut().and_then(|last| {
                    let is_result_batch = last["role"] == "user"
                        && last["content"]
                            .as_array()
                            .and_then(|blocks| blocks.first())
                            .is_some_and(|first| first["type"] == "tool_result");
                    if is_result_batch {
                        last["content"].as_array_mut()
                    } else {
                        None
                    }
                });
                match merged {
                    Some(blocks) => blocks.push(block),
                    None => messages.push(json!({
                        "role": "user",
                        "content": [block],
                    })),
                }
            }
        }
    }

    let mut body = json!({
        "model": request.model,
        "max_tokens": request.max_tokens,
        "stream": true,
        "messages": messages,
    });
    if !system.is_empty() {
        body["system"] = Value::String(system);
    }
    if !request.tools.is_empty() {
        body["tools"] = serde_json::to_value(&request.tools).unwrap_or_default();
    }
    body
}

fn assistant_blocks(message: &Message) -> Vec<Value> {
    let mut blocks = Vec::new();
    if !message.content.trim().is_empty() {
        blocks.push(json!({"type": "text", "text": message.content}));
    }
    for call in message.tool_calls.iter().flatten() {
        blocks.push(json!({
            "type": "tool_use",
            "id": call.call_id,
            "name": call.tool_id,
            "input": call.arguments_json(),
        }));
    }
    blocks
}

fn tool_result_block(message: &Message) -> Value {
    let (call_id, is_error) = message
        .tool_result
        .as_ref()
        .map(|result| (result.call_id.as_str(), result.is_error))
        .unwrap_or(("", false));
    json!({
        "type": "tool_result",
        "tool_use_id": call_id,
        "content": message.content,
        "is_error": is_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ToolCallRequest, ToolSpec};

    fn request(messages: Vec<Message>) -> ModelRequest {
        ModelRequest {
            model: "test-model".into(),
            messages,
            tools: Vec::new(),
            max_tokens: 1024,
        }
    }

    fn call(id: &str, tool: &str) -> ToolCallRequest {
        ToolCallRequest {
            call_id: id.into(),
            tool_id: tool.into(),
            arguments: r#"{"symbol":"AAPL"}"#.into(),
        }
    }

    #[test]
    fn hoists_system_prompt_and_omits_empty_tools() {
        let body = build_request_body(&request(vec![
            Message::system("be brief"),
            Message::user("hi"),
        ]));
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"].as_array().map(Vec::len), Some(1));
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn tool_calls_and_results_use_block_format() {
        let first = call("call_a", "quote");
        let second = call("call_b", "sma");
        let body = build_request_body(&request(vec![
            Message::user("analyze"),
            Message::assistant_tool_calls("checking", vec![first.clone(), second.clone()]),
            Message::tool_result(&first, "189.20", false),
            Message::tool_result(&second, "Error: not enough data", true),
        ]));
        let messages = body["messages"].as_array().expect("messages");
        assert_eq!(messages.len(), 3);

        let assistant = &messages[1]["content"];
        assert_eq!(assistant[0]["type"], "text");
        assert_eq!(assistant[1]["type"], "tool_use");
        assert_eq!(assistant[1]["input"]["symbol"], "AAPL");

        let results = messages[2]["content"].as_array().expect("blocks");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["tool_use_id"], "call_a");
        assert_eq!(results[1]["is_error"], true);
    }

    #[test]
    fn tools_are_published_with_schema() {
        let mut req = request(vec![Message::user("hi")]);
        req.tools.push(ToolSpec {
            name: "quote".into(),
            description: "latest price".into(),
            input_schema: json!({"type": "object"}),
        });
        let body = build_request_body(&req);
        assert_eq!(body["tools"][0]["name"], "quote");
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
    }
}
