use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Connect-time authentication failures.
///
/// `Missing` covers an absent or malformed `Authorization` header; the other
/// variants come back from the token validator. None of these tear down the
/// connection by themselves: the router enforces what an anonymous
/// connection may touch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing or malformed bearer token")]
    Missing,

    #[error("invalid token: {0}")]
    Invalid(String),

    #[error("token expired")]
    Expired,
}

/// Routing failures. Every variant is reported to the offending connection
/// as an error envelope on its own channel, never as a transport error.
#[derive(Error, Debug)]
pub enum RouteError {
    #[error("destination requires an authenticated principal")]
    Unauthorized,

    #[error("unknown destination: {0}")]
    UnknownDestination(String),

    #[error("handler failed: {0}")]
    HandlerFailure(#[source] anyhow::Error),
}

/// Relay failures.
///
/// Publish-side errors surface synchronously to the caller issuing the state
/// change (the write is unacknowledged and must be retried or reported).
/// `DecodeFailure` only occurs on consume and is logged-and-skipped there.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("publish to '{topic}' timed out after {timeout_ms}ms")]
    PublishTimeout { topic: String, timeout_ms: u64 },

    #[error("publish to '{topic}' rejected: {reason}")]
    PublishRejected { topic: String, reason: String },

    #[error("failed to decode relay record: {0}")]
    DecodeFailure(#[from] serde_json::Error),
}

/// Login rate limiter rejection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("rate limit exceeded, retry after {retry_after_seconds}s")]
    WindowExceeded { retry_after_seconds: i64 },
}

impl RouteError {
    /// Stable error code delivered to clients.
    pub fn code(&self) -> &'static str {
        match self {
            RouteError::Unauthorized => "AUTHENTICATION_ERROR",
            RouteError::UnknownDestination(_) => "UNKNOWN_DESTINATION",
            RouteError::HandlerFailure(_) => "HANDLER_FAILURE",
        }
    }

    pub fn suggestion(&self) -> &'static str {
        match self {
            RouteError::Unauthorized => "Please login again and reconnect",
            RouteError::UnknownDestination(_) => "Check the destination path",
            RouteError::HandlerFailure(_) => "Please try again or contact support",
        }
    }
}

/// Structured error frame delivered to clients over their own channel.
///
/// Carries a short correlation id so a client report can be matched against
/// server logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub trace_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub error: String,
    pub message: String,
    pub suggestion: String,
    pub timestamp: DateTime<Utc>,
}

impl ErrorFrame {
    pub fn new(kind: &str, error: &str, message: &str, suggestion: &str) -> Self {
        Self {
            trace_id: trace_id(),
            kind: kind.to_string(),
            error: error.to_string(),
            message: message.to_string(),
            suggestion: suggestion.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn authentication() -> Self {
        Self::new(
            "AUTHENTICATION_ERROR",
            "Authentication Failed",
            "Invalid or missing authentication token",
            "Please login again and reconnect",
        )
    }

    pub fn from_route_error(err: &RouteError) -> Self {
        Self::new(err.code(), "Routing Failed", &err.to_string(), err.suggestion())
    }

    pub fn rate_limited(retry_after_seconds: i64) -> Self {
        Self::new(
            "RATE_LIMIT_EXCEEDED",
            "Too Many Requests",
            &format!(
                "Login rate limit exceeded, retry after {}s",
                retry_after_seconds
            ),
            "Please wait before retrying",
        )
    }

    pub fn protocol(message: &str) -> Self {
        Self::new(
            "PROTOCOL_ERROR",
            "Protocol Error",
            message,
            "Please reconnect and check your payload or headers",
        )
    }
}

/// Short uppercase correlation id, logged alongside every structured error.
pub fn trace_id() -> String {
    Uuid::new_v4().to_string()[..8].to_uppercase()
}
