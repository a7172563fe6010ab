// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0
//! # Job Aggregate
//!
//! A job is a long-running method invocation with observable progress.
//!
//! ## State machine
//!
//! ```text
//!            ┌──────────────┐
//!  WAITING ──┤              ├──► RUNNING ──► SUCCESS
//!            │              │        │─────► FAILED
//!            └──► ABORTED ◄─┘        └─────► ABORTED
//! ```
//!
//! Transitions are monotone. Once a job is terminal its progress and logs
//! are frozen and further updates are ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::credential::CredentialSummary;
use crate::domain::error::CallError;

pub type JobId = u64;

/// Lines kept from each end of the log for `logs_excerpt`.
pub const LOGS_EXCERPT_LINES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Waiting,
    Running,
    Success,
    Failed,
    Aborted,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Aborted)
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (Self::Waiting, Self::Running)
                | (Self::Waiting, Self::Aborted)
                | (Self::Running, Self::Success)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Aborted)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "WAITING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Aborted => "ABORTED",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("Invalid job state transition {from:?} -> {to:?}")]
    InvalidTransition { from: JobState, to: JobState },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub percent: u8,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub extra: Option<Value>,
}

/// Structured failure details for clients that switch on error type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcInfo {
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(default)]
    pub errno: Option<i32>,
    #[serde(default)]
    pub extra: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub method: String,
    /// Validated arguments with secret fields redacted.
    pub arguments: Vec<Value>,
    pub description: Option<String>,
    pub state: JobState,
    pub progress: JobProgress,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub exception: Option<String>,
    pub exc_info: Option<ExcInfo>,
    pub logs_excerpt: Option<String>,
    pub time_created: DateTime<Utc>,
    pub time_started: Option<DateTime<Utc>>,
    pub time_finished: Option<DateTime<Utc>>,
    pub lock_key: Option<String>,
    pub abortable: bool,
    pub transient: bool,
    pub durable: bool,
    pub abandon_on_disconnect: bool,
    pub owner_session: Option<Uuid>,
    pub credentials: Option<CredentialSummary>,
    #[serde(skip)]
    logs: Vec<String>,
}

impl Job {
    pub fn new(id: JobId, method: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            id,
            method: method.into(),
            arguments,
            description: None,
            state: JobState::Waiting,
            progress: JobProgress::default(),
            result: None,
            error: None,
            exception: None,
            exc_info: None,
            logs_excerpt: None,
            time_created: Utc::now(),
            time_started: None,
            time_finished: None,
            lock_key: None,
            abortable: true,
            transient: false,
            durable: false,
            abandon_on_disconnect: false,
            owner_session: None,
            credentials: None,
            logs: Vec::new(),
        }
    }

    fn transition(&mut self, next: JobState) -> Result<(), JobError> {
        if !self.state.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        if next.is_terminal() {
            self.time_finished = Some(Utc::now());
            self.logs_excerpt = self.excerpt();
        }
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), JobError> {
        self.transition(JobState::Running)?;
        self.time_started = Some(Utc::now());
        Ok(())
    }

    pub fn succeed(&mut self, result: Value) -> Result<(), JobError> {
        self.transition(JobState::Success)?;
        self.progress.percent = 100;
        self.result = Some(result);
        Ok(())
    }

    pub fn fail(&mut self, error: &CallError) -> Result<(), JobError> {
        self.transition(JobState::Failed)?;
        self.record_error(error);
        Ok(())
    }

    pub fn abort(&mut self, reason: impl Into<String>) -> Result<(), JobError> {
        self.transition(JobState::Aborted)?;
        self.error = Some(reason.into());
        self.exc_info = Some(ExcInfo {
            error_type: "ABORTED".to_string(),
            errno: None,
            extra: None,
        });
        Ok(())
    }

    fn record_error(&mut self, error: &CallError) {
        let payload = error.to_payload();
        self.error = Some(payload.reason.clone());
        self.exception = payload.trace.clone();
        self.exc_info = Some(ExcInfo {
            error_type: payload.error.as_str().to_string(),
            errno: payload.errno,
            extra: payload.extra,
        });
    }

    /// Ignored once terminal.
    pub fn set_progress(&mut self, percent: u8, description: Option<String>, extra: Option<Value>) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.progress = JobProgress {
            percent: percent.min(100),
            description,
            extra,
        };
        true
    }

    /// Ignored once terminal.
    pub fn append_log(&mut self, text: &str) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.logs.extend(text.lines().map(str::to_string));
        true
    }

    pub fn logs(&self) -> &[String] {
        &self.logs
    }

    fn excerpt(&self) -> Option<String> {
        if self.logs.is_empty() {
            return None;
        }
        let lines = if self.logs.len() <= 2 * LOGS_EXCERPT_LINES {
            self.logs.clone()
        } else {
            let mut lines = self.logs[..LOGS_EXCERPT_LINES].to_vec();
            lines.push("...".to_string());
            lines.extend_from_slice(&self.logs[self.logs.len() - LOGS_EXCERPT_LINES..]);
            lines
        };
        Some(lines.join("\n"))
    }
}
