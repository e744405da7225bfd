//! Wall-clock tool.
//!
//! Lets the model ask for the current time instead of guessing it.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::{Tool, ToolContext};
use crate::error::ToolError;

/// Returns the host's current time.
pub struct ClockTool;

#[async_trait]
impl Tool for ClockTool {
    fn id(&self) -> &str {
        "clock"
    }

    fn description(&self) -> &str {
        "Return the current wall-clock time of the machine running this agent, as Unix seconds, Unix milliseconds and an HTTP date in UTC."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {},
            "additionalProperties": false
        })
    }

    async fn execute(&self, arguments: &str, _context: &ToolContext) -> Result<String, ToolError> {
        let arguments = if arguments.trim().is_empty() { "{}" } else { arguments };
        let parsed: Value = serde_json::from_str(arguments)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        if !parsed.is_object() {
            return Err(ToolError::InvalidArguments(
                "arguments must be a JSON object".into(),
            ));
        }
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| ToolError::ExecutionFailed(format!("clock before epoch: {e}")))?;
        serde_json::to_string(&reading(since_epoch))
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))
    }
}

#[derive(Debug, Serialize)]
struct ClockReading {
    unix_seconds: u64,
    unix_millis: u64,
    http_date: String,
}

fn reading(since_epoch: Duration) -> ClockReading {
    ClockReading {
        unix_seconds: since_epoch.as_secs(),
        unix_millis: since_epoch.as_millis() as u64,
        http_date: httpdate::fmt_http_date(UNIX_EPOCH + since_epoch),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reading_formats_epoch_start() {
        let r = reading(Duration::from_secs(0));
        assert_eq!(r.unix_seconds, 0);
        assert_eq!(r.http_date, "Thu, 01 Jan 1970 00:00:00 GMT");
    }

    #[test]
    fn reading_handles_known_timestamp() {
        let r = reading(Duration::from_millis(1_709_130_123_456));
        assert_eq!(r.unix_millis, 1_709_130_123_456);
        assert_eq!(r.http_date, "Wed, 28 Feb 2024 14:22:03 GMT");
    }

    #[tokio::test]
    async fn rejects_non_object_arguments() {
        let err = ClockTool
            .execute("[]", &ToolContext::default())
            .await
            .expect_err("array args");
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn blank_arguments_mean_no_arguments() {
        let out = ClockTool
            .execute("", &ToolContext::default())
            .await
            .expect("execute");
        assert!(out.contains("http_date"));
    }

    #[tokio::test]
    async fn returns_json_reading() {
        let out = ClockTool
            .execute("{}", &ToolContext::default())
            .await
            .expect("execute");
        let value: Value = serde_json::from_str(&out).expect("json");
        assert!(value["unix_seconds"].as_u64().is_some());
    }
}
