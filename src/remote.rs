//! Errors returned by remote writes and fetches, classified the way the
//! dashboard reports them to users.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::cache::Retryable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    Network,
    Timeout,
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    RateLimited,
    Server,
    /// Any other HTTP failure status.
    Api,
    Unknown,
}

impl RemoteErrorKind {
    /// Classify an HTTP status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            422 => Self::Validation,
            429 => Self::RateLimited,
            500.. => Self::Server,
            _ => Self::Api,
        }
    }

    pub fn is_retryable(self) -> bool {
        !matches!(
            self,
            Self::Unauthorized | Self::Forbidden | Self::NotFound | Self::Validation
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Validation => "validation",
            Self::RateLimited => "rate_limited",
            Self::Server => "server",
            Self::Api => "api",
            Self::Unknown => "unknown",
        }
    }

    /// Fixed user-facing text, if this kind has one.
    fn canned_message(self) -> Option<&'static str> {
        Some(match self {
            Self::Unauthorized => "Authentication error: Please sign in again",
            Self::Forbidden => "You do not have permission to perform this action",
            Self::Network => "Network error: Please check your connection and try again",
            Self::Timeout => "The request timed out. Please try again",
            Self::Validation => "There was an issue with the data you provided",
            Self::NotFound => "The requested resource was not found",
            Self::RateLimited => "Too many requests. Please try again later",
            Self::Server => "Server error: We're working to fix this issue",
            Self::Api | Self::Unknown => return None,
        })
    }

    pub fn suggested_action(self) -> &'static str {
        match self {
            Self::Unauthorized => "Sign in again",
            Self::Network => "Check your internet connection",
            Self::Timeout | Self::Server | Self::Unknown => "Try again later",
            Self::RateLimited => "Wait a few minutes and try again",
            Self::Forbidden | Self::NotFound | Self::Validation | Self::Api => "Try again",
        }
    }
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub status: Option<u16>,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
        }
    }

    /// Error for a failed HTTP response. An empty message falls back to the
    /// status line.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.is_empty() {
            format!("Server responded with status {status}")
        } else {
            message
        };
        Self {
            kind: RemoteErrorKind::from_status(status),
            status: Some(status),
            message,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Timeout, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Validation, message)
    }

    /// Message suitable for a toast.
    pub fn user_message(&self) -> &str {
        self.kind.canned_message().unwrap_or(&self.message)
    }

    pub fn suggested_action(&self) -> &'static str {
        self.kind.suggested_action()
    }
}

impl Retryable for RemoteError {
    fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}
