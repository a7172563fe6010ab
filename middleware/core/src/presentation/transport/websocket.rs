// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0
//! WebSocket listener: `GET /websocket` upgrades, one text message per frame.

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{future, SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::application::middleware::Middleware;
use crate::presentation::session::{run_session, Peer, TransportError};

pub fn router(middleware: Middleware) -> Router {
    Router::new()
        .route("/websocket", get(upgrade))
        .route("/health", get(health))
        .with_state(middleware)
}

pub async fn serve(middleware: Middleware, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind WebSocket listener on {}", addr))?;
    info!("WebSocket listener on ws://{}/websocket", addr);

    let shutdown = middleware.shutdown_token();
    axum::serve(
        listener,
        router(middleware).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .context("WebSocket server failed")?;

    info!("WebSocket listener on {} stopped", addr);
    Ok(())
}

async fn health(State(middleware): State<Middleware>) -> Response {
    let status = if middleware.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = Json(json!({
        "ready": middleware.is_ready(),
        "sessions": middleware.sessions().len(),
    }));
    (status, body).into_response()
}

async fn upgrade(
    State(middleware): State<Middleware>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    if !middleware.is_ready() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let limit = middleware.config().server.max_frame_bytes;
    ws.max_message_size(limit)
        .on_upgrade(move |socket| handle_socket(middleware, socket, addr))
}

async fn handle_socket(middleware: Middleware, socket: WebSocket, addr: SocketAddr) {
    let (sink, stream) = socket.split();

    let inbound = stream
        .filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => Some(
                    String::from_utf8(bytes.to_vec())
                        .map_err(|e| TransportError::Connection(format!("binary frame is not UTF-8: {}", e))),
                ),
                // Ping/pong are answered by the WebSocket layer; close ends the stream.
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::Connection(e.to_string()))),
            })
        })
        .boxed();
    let outbound = sink
        .sink_map_err(|e| TransportError::Connection(e.to_string()))
        .with(|text: String| future::ready(Ok::<_, TransportError>(Message::Text(text.into()))));

    if let Err(e) = run_session(middleware, Peer::new("websocket", Some(addr.to_string())), inbound, outbound).await {
        debug!("WebSocket session from {} ended: {}", addr, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::MiddlewareSpec;

    #[tokio::test]
    async fn test_health_reports_readiness() {
        let middleware = Middleware::builder(MiddlewareSpec::default()).build().await.unwrap();
        let response = health(State(middleware.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);

        middleware.shutdown().await;
        let response = health(State(middleware)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
