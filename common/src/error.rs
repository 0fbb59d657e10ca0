use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable error codes surfaced at API boundaries and on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    Validation,
    Conflict,
    NotFound,
    Unauthorized,
    Forbidden,
    RateLimit,
    Timeout,
    Cancelled,
    RuntimeIncompatible,
    InsufficientCapacity,
    PreemptionBlocked,
    AlreadyRunning,
    TransientIo,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "validation",
            ErrorCode::Conflict => "conflict",
            ErrorCode::NotFound => "notFound",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::RateLimit => "rateLimit",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::RuntimeIncompatible => "runtimeIncompatible",
            ErrorCode::InsufficientCapacity => "insufficientCapacity",
            ErrorCode::PreemptionBlocked => "preemptionBlocked",
            ErrorCode::AlreadyRunning => "alreadyRunning",
            ErrorCode::TransientIo => "transientIo",
            ErrorCode::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct OrchestratorError {
    pub code: ErrorCode,
    pub message: String,
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

impl OrchestratorError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        OrchestratorError {
            code,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}
