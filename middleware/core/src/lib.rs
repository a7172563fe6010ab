// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0
//! Core of the storage appliance middleware daemon.
//!
//! # Architecture
//!
//! - **domain:** schemas, credentials, jobs, events, audit records, config
//! - **application:** registries, authentication, dispatcher, job manager,
//!   plugin loader and the built-in services
//! - **infrastructure:** event bus, audit sink, config stores, rate limiting
//! - **presentation:** frame protocol, sessions and the WebSocket, TCP and
//!   Unix socket transports

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod presentation;

pub use application::{Middleware, MiddlewareBuilder};
pub use domain::error::CallError;
