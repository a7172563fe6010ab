// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0
//! # Frame Protocol
//!
//! Every transport carries the same JSON frames, discriminated by `msg`:
//!
//! ```text
//! client → server   connect { version }            method { id, method, params, kwargs?, timeout? }
//!                   sub { id, name }               unsub { id }
//! server → client   connected { session }          failed { version }
//!                   result { id, result | error }  chunk { id, data }
//!                   event { id, name, fields }     ready { subs }   nosub { id, error }
//! ```
//!
//! `params` is either a positional array or an object of keyword arguments.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::error::{CallError, ErrorPayload};

pub const PROTOCOL_VERSION: &str = "1";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum Frame {
    Connect {
        version: String,
    },
    Connected {
        session: Uuid,
    },
    Failed {
        version: String,
    },
    Method {
        id: String,
        method: String,
        #[serde(default)]
        params: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kwargs: Option<Map<String, Value>>,
        /// Seconds
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<u64>,
    },
    Result {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorPayload>,
    },
    Chunk {
        id: String,
        data: Value,
    },
    Sub {
        id: String,
        name: String,
    },
    Unsub {
        id: String,
    },
    Event {
        id: String,
        name: String,
        fields: Value,
    },
    Ready {
        subs: Vec<String>,
    },
    Nosub {
        id: String,
        error: ErrorPayload,
    },
}

impl Frame {
    pub fn reply(id: impl Into<String>, outcome: Result<Value, CallError>) -> Self {
        match outcome {
            Ok(value) => Self::Result {
                id: id.into(),
                result: Some(value),
                error: None,
            },
            Err(e) => Self::Result {
                id: id.into(),
                result: None,
                error: Some(e.to_payload()),
            },
        }
    }

    /// Decode one frame, refusing anything larger than `limit` bytes.
    pub fn decode(text: &str, limit: usize) -> Result<Self, ProtocolError> {
        if text.len() > limit {
            return Err(ProtocolError::FrameTooLarge {
                size: text.len(),
                limit,
            });
        }
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Outcome of a `result` frame as seen by a client.
    pub fn into_outcome(self) -> Option<(String, Result<Value, ErrorPayload>)> {
        match self {
            Self::Result { id, error: Some(error), .. } => Some((id, Err(error))),
            Self::Result { id, result, .. } => Some((id, Ok(result.unwrap_or(Value::Null)))),
            _ => None,
        }
    }
}

/// Split `params` into positional and keyword arguments.
pub fn split_params(params: Value, kwargs: Option<Map<String, Value>>) -> Result<(Vec<Value>, Option<Map<String, Value>>), CallError> {
    match params {
        Value::Null => Ok((Vec::new(), kwargs)),
        Value::Array(positional) => Ok((positional, kwargs)),
        Value::Object(named) => match kwargs {
            None => Ok((Vec::new(), Some(named))),
            Some(_) => Err(CallError::invalid("params and kwargs cannot both be objects")),
        },
        _ => Err(CallError::invalid("params must be an array or an object")),
    }
}
