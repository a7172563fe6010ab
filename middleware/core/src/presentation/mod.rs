// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer
//!
//! Client-facing surface of the middleware.
//!
//! | Module | Purpose |
//! |---|---|
//! | [`protocol`] | JSON frame types shared by every transport |
//! | [`session`] | Per-connection runtime: handshake, ordered replies, event delivery, back-pressure |
//! | [`transport`] | WebSocket, raw TCP and Unix socket listeners |
//! | [`client`] | Frame client used by the `middlewared` CLI |

pub mod client;
pub mod protocol;
pub mod session;
pub mod transport;

pub use client::{Client, ClientError, ClientEvent};
pub use protocol::Frame;
pub use session::{run_session, Peer, TransportError};
