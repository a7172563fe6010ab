// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0
//! # Transports
//!
//! | Back-end | Framing | Authentication on connect |
//! |---|---|---|
//! | [`websocket`] | one text message per frame | none |
//! | [`tcp`] | newline-delimited JSON | none |
//! | [`unix`] | newline-delimited JSON | peer uid via `SO_PEERCRED` |
//!
//! All of them feed [`crate::presentation::session::run_session`].

pub mod tcp;
pub mod unix;
pub mod websocket;

use anyhow::{Context, Result};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::info;

use crate::application::middleware::Middleware;
use crate::presentation::session::TransportError;

/// Run every configured listener until the middleware shuts down.
pub async fn serve(middleware: Middleware) -> Result<()> {
    let server = middleware.config().server.clone();
    let mut listeners = JoinSet::new();

    if server.websocket_port != 0 {
        let addr = socket_addr(&server.bind_address, server.websocket_port)?;
        listeners.spawn(websocket::serve(middleware.clone(), addr));
    }
    if let Some(port) = server.tcp_port {
        let addr = socket_addr(&server.bind_address, port)?;
        listeners.spawn(tcp::serve(middleware.clone(), addr));
    }
    listeners.spawn(unix::serve(middleware.clone(), server.unix_socket.clone()));

    while let Some(joined) = listeners.join_next().await {
        // One failed listener takes the others down with it.
        if let Err(e) = joined.context("Listener task panicked").and_then(|served| served) {
            middleware.shutdown_token().cancel();
            listeners.shutdown().await;
            return Err(e);
        }
    }
    info!("All listeners stopped");
    Ok(())
}

fn socket_addr(host: &str, port: u16) -> Result<SocketAddr> {
    format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", host, port))
}

/// Newline-delimited frames over a byte stream.
pub fn line_framed<T>(
    io: T,
    max_frame_bytes: usize,
) -> (
    impl Stream<Item = Result<String, TransportError>> + Send + Unpin,
    impl Sink<String, Error = TransportError> + Send + Unpin + 'static,
)
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sink, stream) = Framed::new(io, LinesCodec::new_with_max_length(max_frame_bytes)).split();
    (
        stream.map(|line| line.map_err(TransportError::from)),
        sink.sink_map_err(TransportError::from),
    )
}
