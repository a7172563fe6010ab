// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0
//! Raw TCP listener with newline-delimited frames.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::line_framed;
use crate::application::middleware::Middleware;
use crate::presentation::session::{run_session, Peer};

pub async fn serve(middleware: Middleware, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind TCP listener on {}", addr))?;
    info!("TCP listener on {}", addr);

    let shutdown = middleware.shutdown_token();
    let max_frame_bytes = middleware.config().server.max_frame_bytes;
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("TCP accept failed: {}", e);
                    continue;
                }
            },
        };
        let _ = stream.set_nodelay(true);
        let middleware = middleware.clone();
        tokio::spawn(async move {
            let (inbound, outbound) = line_framed(stream, max_frame_bytes);
            if let Err(e) = run_session(middleware, Peer::new("tcp", Some(peer.to_string())), inbound, outbound).await {
                debug!("TCP session from {} ended: {}", peer, e);
            }
        });
    }
    info!("TCP listener on {} stopped", addr);
    Ok(())
}
