//! Error types for the qwenchat client.

use std::fmt;
use thiserror::Error;

/// Top-level error returned by the client and session APIs.
///
/// Storage failures never surface here from the managers; they are logged
/// and degrade to empty results instead.
#[derive(Debug, Error)]
pub enum QwenError {
    /// Missing credentials, malformed settings or an unknown storage tag.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The storage tag names a backend that has no built-in implementation
    /// and no custom override was registered.
    #[error("Unsupported storage kind '{0}': register a custom storage implementation")]
    UnsupportedStorageKind(String),

    /// Caller supplied input that cannot be encoded (missing file, binary document).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Failure talking to the chat completions endpoint.
    #[error(transparent)]
    Api(#[from] ApiError),
}

impl From<config::ConfigError> for QwenError {
    fn from(err: config::ConfigError) -> Self {
        QwenError::Configuration(err.to_string())
    }
}

/// Convenience Result type alias.
pub type Result<T> = std::result::Result<T, QwenError>;

/// Category of an [`ApiError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// Connection, TLS or timeout failure before a response arrived.
    Transport,
    /// Provider answered with a non-success status.
    Status(u16),
    /// Response body (or a stream chunk) could not be decoded.
    Decode,
    /// Provider sent an error object inside a successful response, e.g. an SSE error frame.
    Provider,
}

impl ApiErrorKind {
    /// Short name recorded as `error_type` in error log entries.
    pub fn name(&self) -> &'static str {
        match self {
            ApiErrorKind::Transport => "TransportError",
            ApiErrorKind::Status(_) => "StatusError",
            ApiErrorKind::Decode => "DecodeError",
            ApiErrorKind::Provider => "ProviderError",
        }
    }
}

/// Domain-level wrapper for every failure of the outbound chat call.
#[derive(Debug)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub message: String,
    /// Provider error code, when the error body carried one.
    pub code: Option<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl ApiError {
    pub fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            source: None,
        }
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }

    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// HTTP status for `Status` errors.
    pub fn status(&self) -> Option<u16> {
        match self.kind {
            ApiErrorKind::Status(status) => Some(status),
            _ => None,
        }
    }

    /// Whether the transport may retry this failure.
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            ApiErrorKind::Transport => true,
            ApiErrorKind::Status(status) => status == 429 || status >= 500,
            ApiErrorKind::Decode | ApiErrorKind::Provider => false,
        }
    }

    /// True when the provider rejected the request because of `parameter`.
    pub fn rejects_parameter(&self, parameter: &str) -> bool {
        self.status() == Some(400) && self.message.contains(parameter)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.kind, &self.code) {
            (ApiErrorKind::Status(status), Some(code)) => {
                write!(f, "API call failed ({} {}): {}", status, code, self.message)
            }
            (ApiErrorKind::Status(status), None) => {
                write!(f, "API call failed ({}): {}", status, self.message)
            }
            (kind, Some(code)) => {
                write!(f, "API call failed ({} {}): {}", kind.name(), code, self.message)
            }
            (kind, None) => write!(f, "API call failed ({}): {}", kind.name(), self.message),
        }
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_decode() {
            ApiErrorKind::Decode
        } else if let Some(status) = err.status() {
            ApiErrorKind::Status(status.as_u16())
        } else {
            ApiErrorKind::Transport
        };
        ApiError::new(kind, err.to_string()).with_source(err)
    }
}
