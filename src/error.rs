//! Unified error types for the runtime.

use std::fmt;

// ---------------------------------------------------------------------------
// ToolError
// ---------------------------------------------------------------------------

/// Errors arising from tool execution.
///
/// These never abort a run: the runtime converts them into a `tool_error`
/// event and an error tool-result message.
#[derive(Debug)]
pub enum ToolError {
    /// The model supplied arguments the tool couldn't parse.
    InvalidArguments(String),
    /// The tool ran but encountered a failure.
    ExecutionFailed(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArguments(msg) => write!(f, "invalid arguments: {msg}"),
            Self::ExecutionFailed(msg) => write!(f, "execution failed: {msg}"),
        }
    }
}

impl std::error::Error for ToolError {}

// ---------------------------------------------------------------------------
// RegistryError
// ---------------------------------------------------------------------------

/// Errors raised when registering a tool.
#[derive(Debug, PartialEq, Eq)]
pub enum RegistryError {
    /// A tool with the same id is already registered.
    DuplicateTool(String),
    /// The tool's input schema is not a JSON object.
    MissingSchema(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateTool(id) => write!(f, "tool `{id}` is already registered"),
            Self::MissingSchema(id) => write!(f, "tool `{id}` has no input schema"),
        }
    }
}

impl std::error::Error for RegistryError {}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors when loading or parsing configuration.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Toml(toml::de::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io: {e}"),
            Self::Toml(e) => write!(f, "toml: {e}"),
            Self::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        Self::Toml(e)
    }
}

// ---------------------------------------------------------------------------
// ApiError
// ---------------------------------------------------------------------------

/// Errors from the model transport layer.
#[derive(Debug)]
pub enum ApiError {
    /// Network / reqwest-level error.
    Http(reqwest::Error),
    /// Non-2xx status from the API.
    Status {
        code: u16,
        body: String,
        retry_after_secs: Option<u64>,
    },
    /// The provider answered with something we could not use.
    InvalidResponse(String),
}

impl ApiError {
    /// Build a status error from response metadata.
    pub fn status(code: u16, body: String, retry_after_secs: Option<u64>) -> Self {
        Self::Status {
            code,
            body,
            retry_after_secs,
        }
    }

    /// HTTP status code when this error came from a non-2xx response.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Server-provided `Retry-After` hint, in seconds.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::Status {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(e) => write!(f, "http: {e}"),
            Self::Status { code, body, .. } => write!(f, "status {code}: {body}"),
            Self::InvalidResponse(msg) => write!(f, "invalid response: {msg}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e)
    }
}

// ---------------------------------------------------------------------------
// HookError
// ---------------------------------------------------------------------------

/// Faults raised while invoking a hook. The pipeline treats all of them as
/// fail-open.
#[derive(Debug)]
pub enum HookError {
    /// The hook command could not be started.
    Spawn(std::io::Error),
    /// Reading or writing the hook's standard streams failed.
    Io(std::io::Error),
    /// The hook did not exit within its timeout.
    Timeout(u64),
    /// The hook printed something that is not a `{allow, message}` object.
    InvalidOutput(String),
    /// An in-process hook panicked.
    Panicked(String),
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn(e) => write!(f, "failed to spawn hook: {e}"),
            Self::Io(e) => write!(f, "hook io: {e}"),
            Self::Timeout(secs) => write!(f, "hook timed out after {secs}s"),
            Self::InvalidOutput(msg) => write!(f, "invalid hook output: {msg}"),
            Self::Panicked(msg) => write!(f, "hook panicked: {msg}"),
        }
    }
}

impl std::error::Error for HookError {}

// ---------------------------------------------------------------------------
// RuntimeError
// ---------------------------------------------------------------------------

/// Errors that terminate a run.
///
/// Tool failures, permission denials, hook faults and cancellation are
/// handled inside the loop and reported through the run's `done` event.
#[derive(Debug)]
pub enum RuntimeError {
    /// Transport failure talking to the model provider.
    Api(ApiError),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Api(e) => write!(f, "api: {e}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<ApiError> for RuntimeError {
    fn from(e: ApiError) -> Self {
        Self::Api(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_error_display() {
        assert_eq!(
            ToolError::InvalidArguments("bad json".into()).to_string(),
            "invalid arguments: bad json"
        );
        assert_eq!(
            ToolError::ExecutionFailed("timeout".into()).to_string(),
            "execution failed: timeout"
        );
    }

    #[test]
    fn registry_error_names_the_tool() {
        assert_eq!(
            RegistryError::DuplicateTool("sma".into()).to_string(),
            "tool `sma` is already registered"
        );
        assert!(RegistryError::MissingSchema("quote".into())
            .to_string()
            .contains("quote"));
    }

    #[test]
    fn config_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let e = ConfigError::from(io_err);
        let s = e.to_string();
        assert!(s.starts_with("io:"), "got: {s}");
        assert!(s.contains("file not found"));
    }

    #[test]
    fn config_error_from_toml() {
        let toml_err: toml::de::Error = toml::from_str::<toml::Value>("x = [unclosed").unwrap_err();
        let e = ConfigError::from(toml_err);
        assert!(e.to_string().starts_with("toml:"));
    }

    #[test]
    fn api_error_status_accessors() {
        let err = ApiError::status(429, "slow down".into(), Some(3));
        assert_eq!(err.status_code(), Some(429));
        assert_eq!(err.retry_after_secs(), Some(3));
        assert_eq!(err.to_string(), "status 429: slow down");

        let other = ApiError::InvalidResponse("empty".into());
        assert_eq!(other.status_code(), None);
        assert_eq!(other.retry_after_secs(), None);
    }

    #[test]
    fn runtime_error_from_api_error() {
        let err = RuntimeError::from(ApiError::InvalidResponse("boom".into()));
        assert!(err.to_string().starts_with("api:"), "got: {err}");
    }

    #[test]
    fn hook_error_display() {
        assert_eq!(
            HookError::Timeout(5).to_string(),
            "hook timed out after 5s"
        );
        assert!(HookError::InvalidOutput("not json".into())
            .to_string()
            .contains("not json"));
    }
}
