//! Error taxonomy for the tool-call runtime control layer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable string error codes, shared across every language port of this
/// runtime. Callers that bridge to a wire format should serialize on this
/// enum rather than on the Rust variant shape of [`ToolCallError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unauthorized,
    InvalidRequest,
    ValidationError,
    NetworkError,
    NotFound,
    SizeLimitExceeded,
    MaxCapacity,
    UnknownError,
}

impl ErrorCode {
    /// Codes that the retry engine must never retry regardless of classifier input.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorCode::Unauthorized
                | ErrorCode::InvalidRequest
                | ErrorCode::ValidationError
                | ErrorCode::NotFound
                | ErrorCode::SizeLimitExceeded
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::SizeLimitExceeded => "SIZE_LIMIT_EXCEEDED",
            ErrorCode::MaxCapacity => "MAX_CAPACITY",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        };
        f.write_str(s)
    }
}

/// The single error type returned from the public API surface.
///
/// Every variant carries a human-readable message and maps to a stable
/// [`ErrorCode`] via [`ToolCallError::code`].
#[derive(Debug, Clone, Error)]
pub enum ToolCallError {
    #[error("{message}")]
    Unauthorized {
        message: String,
        status_code: Option<u16>,
    },

    #[error("{message}")]
    InvalidRequest {
        message: String,
        status_code: Option<u16>,
    },

    #[error("{message}")]
    ValidationError {
        message: String,
        status_code: Option<u16>,
    },

    #[error("{message}")]
    NetworkError {
        message: String,
        status_code: Option<u16>,
        /// Set when this failure represents a caller-initiated cancellation
        /// rather than a genuine transport failure — the retry engine must
        /// never retry it regardless of policy.
        cancelled_by_caller: bool,
    },

    #[error("{message}")]
    NotFound {
        message: String,
        status_code: Option<u16>,
    },

    #[error("{message}")]
    SizeLimitExceeded {
        message: String,
        status_code: Option<u16>,
    },

    #[error("{message}")]
    MaxCapacity {
        message: String,
        status_code: Option<u16>,
    },

    #[error("{message}")]
    Unknown {
        message: String,
        status_code: Option<u16>,
    },
}

impl ToolCallError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ToolCallError::Unauthorized { .. } => ErrorCode::Unauthorized,
            ToolCallError::InvalidRequest { .. } => ErrorCode::InvalidRequest,
            ToolCallError::ValidationError { .. } => ErrorCode::ValidationError,
            ToolCallError::NetworkError { .. } => ErrorCode::NetworkError,
            ToolCallError::NotFound { .. } => ErrorCode::NotFound,
            ToolCallError::SizeLimitExceeded { .. } => ErrorCode::SizeLimitExceeded,
            ToolCallError::MaxCapacity { .. } => ErrorCode::MaxCapacity,
            ToolCallError::Unknown { .. } => ErrorCode::UnknownError,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ToolCallError::Unauthorized { message, .. }
            | ToolCallError::InvalidRequest { message, .. }
            | ToolCallError::ValidationError { message, .. }
            | ToolCallError::NetworkError { message, .. }
            | ToolCallError::NotFound { message, .. }
            | ToolCallError::SizeLimitExceeded { message, .. }
            | ToolCallError::MaxCapacity { message, .. }
            | ToolCallError::Unknown { message, .. } => message,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            ToolCallError::Unauthorized { status_code, .. }
            | ToolCallError::InvalidRequest { status_code, .. }
            | ToolCallError::ValidationError { status_code, .. }
            | ToolCallError::NetworkError { status_code, .. }
            | ToolCallError::NotFound { status_code, .. }
            | ToolCallError::SizeLimitExceeded { status_code, .. }
            | ToolCallError::MaxCapacity { status_code, .. }
            | ToolCallError::Unknown { status_code, .. } => *status_code,
        }
    }

    pub fn cancelled_by_caller(&self) -> bool {
        matches!(
            self,
            ToolCallError::NetworkError {
                cancelled_by_caller: true,
                ..
            }
        )
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        ToolCallError::Unauthorized {
            message: message.into(),
            status_code: Some(403),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        ToolCallError::InvalidRequest {
            message: message.into(),
            status_code: Some(400),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ToolCallError::ValidationError {
            message: message.into(),
            status_code: Some(400),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        ToolCallError::NetworkError {
            message: message.into(),
            status_code: None,
            cancelled_by_caller: false,
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        ToolCallError::NetworkError {
            message: message.into(),
            status_code: None,
            cancelled_by_caller: true,
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        ToolCallError::Unknown {
            message: message.into(),
            status_code: None,
        }
    }

    pub fn with_status_code(mut self, status_code: Option<u16>) -> Self {
        match &mut self {
            ToolCallError::Unauthorized { status_code: s, .. }
            | ToolCallError::InvalidRequest { status_code: s, .. }
            | ToolCallError::ValidationError { status_code: s, .. }
            | ToolCallError::NetworkError { status_code: s, .. }
            | ToolCallError::NotFound { status_code: s, .. }
            | ToolCallError::SizeLimitExceeded { status_code: s, .. }
            | ToolCallError::MaxCapacity { status_code: s, .. }
            | ToolCallError::Unknown { status_code: s, .. } => *s = status_code,
        }
        self
    }
}

/// Configuration validation/clamping errors, surfaced at `RuntimeConfig::resolve()`.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("invalid configuration for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

pub type ToolCallResult<T> = Result<T, ToolCallError>;
