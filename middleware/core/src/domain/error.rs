// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0
//! # Call Errors
//!
//! The error surface every RPC caller sees. Each [`CallError`] variant maps to
//! exactly one stable [`ErrorCode`]; clients switch on the code and never
//! parse the human reason.
//!
//! | Variant | Code | Disposition |
//! |---------|------|-------------|
//! | `MethodNotFound` | `METHOD_NOT_FOUND` | returned, session stays up |
//! | `NotAuthenticated` | `NOT_AUTHENTICATED` | returned, audited |
//! | `NotAuthorized` | `NOT_AUTHORIZED` | returned, audited |
//! | `Validation` | `VALIDATION_ERROR` | returned with path/reason list |
//! | `RateLimited` | `RATE_LIMITED` | returned, never audited |
//! | `Timeout` | `TIMEOUT` | returned, job-mode calls are aborted |
//! | `Call` | `CALL_ERROR` | returned verbatim with errno |
//! | `MatchNotFound` | `MATCH_NOT_FOUND` | returned |
//! | `LockQueueFull` | `LOCK_QUEUE_FULL` | returned |
//! | `Internal` | `INTERNAL` | returned with trace (also in `extra`), always audited |

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use thiserror::Error;

/// Short uppercase identifier carried in every error frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MethodNotFound,
    NotAuthenticated,
    NotAuthorized,
    ValidationError,
    RateLimited,
    Timeout,
    CallError,
    MatchNotFound,
    LockQueueFull,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MethodNotFound => "METHOD_NOT_FOUND",
            Self::NotAuthenticated => "NOT_AUTHENTICATED",
            Self::NotAuthorized => "NOT_AUTHORIZED",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::RateLimited => "RATE_LIMITED",
            Self::Timeout => "TIMEOUT",
            Self::CallError => "CALL_ERROR",
            Self::MatchNotFound => "MATCH_NOT_FOUND",
            Self::LockQueueFull => "LOCK_QUEUE_FULL",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single schema violation, addressed by a dotted path such as
/// `user_create.username` or `args.0.nic_attach`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub path: String,
    pub reason: String,
}

/// Ordered collection of [`ValidationError`]s produced by one validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(transparent)]
#[error("{}", self.summary())]
pub struct ValidationErrors(Vec<ValidationError>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn add(&mut self, path: impl Into<String>, reason: impl Into<String>) {
        self.0.push(ValidationError {
            path: path.into(),
            reason: reason.into(),
        });
    }

    pub fn extend(&mut self, other: ValidationErrors) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.0.iter()
    }

    pub fn into_inner(self) -> Vec<ValidationError> {
        self.0
    }

    /// `Ok(value)` when empty, otherwise `Err(self)`.
    pub fn check<T>(self, value: T) -> Result<T, ValidationErrors> {
        if self.is_empty() {
            Ok(value)
        } else {
            Err(self)
        }
    }

    fn summary(&self) -> String {
        self.0
            .iter()
            .map(|e| format!("[{}] {}", e.path, e.reason))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl FromIterator<ValidationError> for ValidationErrors {
    fn from_iter<I: IntoIterator<Item = ValidationError>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Error returned by a method invocation or raised by the dispatcher before
/// the method is reached.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    #[error("Method {0} does not exist")]
    MethodNotFound(String),

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("Rate limit exceeded for {0}")]
    RateLimited(String),

    #[error("Call timed out after {0} seconds")]
    Timeout(u64),

    #[error("{reason}")]
    Call {
        errno: i32,
        reason: String,
        extra: Option<Value>,
    },

    #[error("{0}")]
    MatchNotFound(String),

    #[error("Lock queue for {0} is full")]
    LockQueueFull(String),

    #[error("{reason}")]
    Internal { reason: String, trace: Option<String> },
}

impl CallError {
    /// Method-level failure with an errno, the common case for plugins.
    pub fn new(errno: i32, reason: impl Into<String>) -> Self {
        Self::Call {
            errno,
            reason: reason.into(),
            extra: None,
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::new(libc::EINVAL, reason)
    }

    pub fn with_extra(self, extra: Value) -> Self {
        match self {
            Self::Call { errno, reason, .. } => Self::Call {
                errno,
                reason,
                extra: Some(extra),
            },
            other => other,
        }
    }

    /// Wrap an unexpected failure. The debug rendering (error chain and, for
    /// `anyhow`, the captured backtrace) becomes the trace.
    pub fn internal<E: fmt::Display + fmt::Debug>(err: E) -> Self {
        Self::Internal {
            reason: err.to_string(),
            trace: Some(format!("{:?}", err)),
        }
    }

    /// A method body panicked; `trace` is the backtrace captured at the panic site.
    pub fn panicked(message: impl Into<String>, trace: impl Into<String>) -> Self {
        Self::Internal {
            reason: message.into(),
            trace: Some(trace.into()),
        }
    }

    /// Single-attribute validation failure raised from inside a method.
    pub fn validation(path: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut errors = ValidationErrors::new();
        errors.add(path, reason);
        Self::Validation(errors)
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::MethodNotFound(_) => ErrorCode::MethodNotFound,
            Self::NotAuthenticated => ErrorCode::NotAuthenticated,
            Self::NotAuthorized(_) => ErrorCode::NotAuthorized,
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::RateLimited(_) => ErrorCode::RateLimited,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::Call { .. } => ErrorCode::CallError,
            Self::MatchNotFound(_) => ErrorCode::MatchNotFound,
            Self::LockQueueFull(_) => ErrorCode::LockQueueFull,
            Self::Internal { .. } => ErrorCode::Internal,
        }
    }

    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Call { errno, .. } => Some(*errno),
            Self::Validation(_) => Some(libc::EINVAL),
            Self::NotAuthenticated | Self::NotAuthorized(_) => Some(libc::EACCES),
            Self::MatchNotFound(_) => Some(libc::ENOENT),
            Self::LockQueueFull(_) | Self::RateLimited(_) => Some(libc::EBUSY),
            Self::Timeout(_) => Some(libc::ETIMEDOUT),
            Self::MethodNotFound(_) | Self::Internal { .. } => None,
        }
    }

    /// Render as the `error` object of a result frame.
    pub fn to_payload(&self) -> ErrorPayload {
        let (trace, extra) = match self {
            Self::Validation(errors) => (None, Some(json!(errors))),
            Self::Call { extra, .. } => (None, extra.clone()),
            Self::Internal { trace, .. } => (trace.clone(), trace.clone().map(Value::String)),
            _ => (None, None),
        };
        ErrorPayload {
            error: self.code(),
            reason: self.to_string(),
            errno: self.errno(),
            trace,
            extra,
        }
    }
}

impl From<anyhow::Error> for CallError {
    fn from(err: anyhow::Error) -> Self {
        // A CallError that travelled through anyhow keeps its identity.
        match err.downcast::<CallError>() {
            Ok(call_error) => call_error,
            Err(err) => Self::internal(err),
        }
    }
}

/// Wire form of a [`CallError`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: ErrorCode,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errno: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.error, self.reason)
    }
}
