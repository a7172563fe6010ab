// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0
//! # Session Runtime
//!
//! Drives one client connection, independent of framing. A transport hands
//! over a stream of inbound text frames and a sink for outbound ones; the
//! runtime performs the handshake, routes `method`/`sub`/`unsub` frames and
//! tears the session down when the peer leaves.
//!
//! ```text
//! inbound ──► decode ──► method ──► spawn(dispatch) ──► reply sequencer ─┐
//!                    └─► sub/unsub ───────────────────────────────────────┤
//!             EventBus ──► SessionSink::deliver (try_send) ───────────────┤
//!                                                                         ▼
//!                                              bounded send queue ──► writer ──► outbound
//! ```
//!
//! Call replies leave in the order their `method` frames arrived; events
//! and chunks interleave freely. A full send queue closes the session.

use futures::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::context::SessionState;
use crate::application::dispatcher::CallRequest;
use crate::application::middleware::Middleware;
use crate::domain::config::ServerConfig;
use crate::domain::credential::{AuthState, Credential};
use crate::domain::error::CallError;
use crate::domain::events::Event;
use crate::infrastructure::event_bus::EventSink;
use crate::presentation::protocol::{split_params, Frame, ProtocolError, PROTOCOL_VERSION};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Framing error: {0}")]
    Framing(#[from] tokio_util::codec::LinesCodecError),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Unsupported protocol version {0}")]
    Version(String),

    #[error("Expected a connect frame")]
    Handshake,
}

/// Who is on the other end of a connection, as established by the transport.
#[derive(Debug, Clone)]
pub struct Peer {
    pub transport: &'static str,
    pub origin: Option<String>,
    /// Pre-authenticated credential (local socket peers).
    pub credential: Option<Credential>,
}

impl Peer {
    pub fn new(transport: &'static str, origin: Option<String>) -> Self {
        Self {
            transport,
            origin,
            credential: None,
        }
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }
}

/// Event sink of one session: never blocks the publisher.
struct SessionSink {
    state: Arc<SessionState>,
    outbound: mpsc::Sender<Frame>,
}

impl EventSink for SessionSink {
    fn credential(&self) -> Option<Arc<Credential>> {
        self.state.credential()
    }

    fn deliver(&self, subscription: &str, event: &Event) -> bool {
        let frame = Frame::Event {
            id: subscription.to_string(),
            name: event.name.clone(),
            fields: event.fields.clone(),
        };
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Session {} cannot keep up with events, closing", self.state.id);
                metrics::counter!("middleware_sessions_overflowed_total").increment(1);
                self.state.closed.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Run a connection to completion.
pub async fn run_session<R, W>(
    middleware: Middleware,
    peer: Peer,
    mut inbound: R,
    outbound: W,
) -> Result<(), TransportError>
where
    R: Stream<Item = Result<String, TransportError>> + Send + Unpin,
    W: Sink<String, Error = TransportError> + Send + Unpin + 'static,
{
    let limits = middleware.config().server.clone();
    let state = Arc::new(SessionState::new(peer.transport, peer.origin));
    if let Some(credential) = peer.credential {
        state.set_auth_state(AuthState::Authenticated(Arc::new(credential.with_session(state.id))));
    }

    let (frames, queue) = mpsc::channel::<Frame>(limits.send_queue.max(1));
    let writer = tokio::spawn(write_frames(queue, outbound, state.closed.clone()));

    if let Err(e) = handshake(&mut inbound, &frames, &limits).await {
        debug!("Handshake failed on {} connection: {}", state.transport, e);
        drop(frames);
        let _ = writer.await;
        return Err(e);
    }

    let sink = Arc::new(SessionSink {
        state: Arc::clone(&state),
        outbound: frames.clone(),
    });
    middleware.register_session(Arc::clone(&state), sink).await;
    metrics::gauge!("middleware_sessions_active").increment(1.0);
    info!(
        session = %state.id,
        transport = state.transport,
        origin = state.origin.as_deref().unwrap_or("-"),
        "Session connected"
    );

    // The connected frame always precedes any reply or event.
    let connected = frames.send(Frame::Connected { session: state.id }).await;

    let (replies, pending) = mpsc::channel::<PendingReply>(limits.send_queue.max(1));
    let sequencer = tokio::spawn(sequence_replies(pending, frames.clone()));

    let result = match connected {
        Ok(()) => read_frames(&middleware, &state, &limits, &mut inbound, &frames, &replies).await,
        Err(_) => Err(TransportError::Connection("writer closed".into())),
    };
    if let Err(e) = &result {
        warn!(session = %state.id, "Closing session: {}", e);
    }

    drop(replies);
    middleware.unregister_session(state.id).await;
    metrics::gauge!("middleware_sessions_active").decrement(1.0);
    let _ = sequencer.await;
    drop(frames);
    let _ = writer.await;
    info!(session = %state.id, "Session closed");
    result
}

async fn handshake<R>(inbound: &mut R, frames: &mpsc::Sender<Frame>, limits: &ServerConfig) -> Result<(), TransportError>
where
    R: Stream<Item = Result<String, TransportError>> + Unpin,
{
    let Some(text) = inbound.next().await.transpose()? else {
        return Err(TransportError::Handshake);
    };
    match Frame::decode(&text, limits.unauthenticated_max_frame_bytes)? {
        Frame::Connect { version } if version == PROTOCOL_VERSION => Ok(()),
        Frame::Connect { version } => {
            let _ = frames
                .send(Frame::Failed {
                    version: PROTOCOL_VERSION.to_string(),
                })
                .await;
            Err(TransportError::Version(version))
        }
        _ => Err(TransportError::Handshake),
    }
}

async fn read_frames<R>(
    middleware: &Middleware,
    state: &Arc<SessionState>,
    limits: &ServerConfig,
    inbound: &mut R,
    frames: &mpsc::Sender<Frame>,
    replies: &mpsc::Sender<PendingReply>,
) -> Result<(), TransportError>
where
    R: Stream<Item = Result<String, TransportError>> + Unpin,
{
    loop {
        let text = tokio::select! {
            _ = state.closed.cancelled() => return Ok(()),
            item = inbound.next() => match item {
                Some(text) => text?,
                None => return Ok(()),
            },
        };
        let limit = if state.is_authenticated() {
            limits.max_frame_bytes
        } else {
            limits.unauthenticated_max_frame_bytes
        };

        match Frame::decode(&text, limit)? {
            Frame::Method {
                id,
                method,
                params,
                kwargs,
                timeout,
            } => {
                let call = spawn_call(middleware, state, frames, id.clone(), method, params, kwargs, timeout);
                tokio::select! {
                    _ = state.closed.cancelled() => return Ok(()),
                    sent = replies.send((id, call)) => if sent.is_err() {
                        return Ok(());
                    },
                }
            }
            Frame::Sub { id, name } => {
                let reply = match middleware.events().subscribe(state.id, &id, &name) {
                    Ok(()) => Frame::Ready { subs: vec![id] },
                    Err(e) => Frame::Nosub {
                        id,
                        error: CallError::from(e).to_payload(),
                    },
                };
                if frames.send(reply).await.is_err() {
                    return Ok(());
                }
            }
            Frame::Unsub { id } => {
                middleware.events().unsubscribe(state.id, &id);
            }
            other => {
                debug!(session = %state.id, "Ignoring unexpected frame {:?}", other);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_call(
    middleware: &Middleware,
    state: &Arc<SessionState>,
    frames: &mpsc::Sender<Frame>,
    id: String,
    method: String,
    params: Value,
    kwargs: Option<serde_json::Map<String, Value>>,
    timeout: Option<u64>,
) -> JoinHandle<Frame> {
    let middleware = middleware.clone();
    let state = Arc::clone(state);
    let frames = frames.clone();
    tokio::spawn(async move {
        let (positional, kwargs) = match split_params(params, kwargs) {
            Ok(split) => split,
            Err(e) => return Frame::reply(id, Err(e)),
        };
        let streaming = middleware
            .services()
            .get_method(&method)
            .map(|entry| entry.is_streaming())
            .unwrap_or(false);

        let mut request = CallRequest::session(Arc::clone(&state), method, positional);
        if let Some(kwargs) = kwargs {
            request = request.with_kwargs(kwargs);
        }
        if let Some(secs) = timeout.filter(|secs| *secs > 0) {
            request = request.with_timeout(Duration::from_secs(secs));
        }

        let forwarder = if streaming {
            let (chunks, mut rx) = mpsc::channel::<Value>(16);
            request = request.with_stream(chunks);
            let chunk_id = id.clone();
            Some(tokio::spawn(async move {
                while let Some(data) = rx.recv().await {
                    let frame = Frame::Chunk {
                        id: chunk_id.clone(),
                        data,
                    };
                    if frames.send(frame).await.is_err() {
                        break;
                    }
                }
            }))
        } else {
            None
        };

        let outcome = middleware.dispatch(request).await.map(|response| response.into_value());
        // Every chunk is queued before the final result frame.
        if let Some(forwarder) = forwarder {
            let _ = forwarder.await;
        }
        Frame::reply(id, outcome)
    })
}

/// Call id and the task producing its reply.
type PendingReply = (String, JoinHandle<Frame>);

/// Forward call replies in submission order.
async fn sequence_replies(mut pending: mpsc::Receiver<PendingReply>, frames: mpsc::Sender<Frame>) {
    while let Some((id, call)) = pending.recv().await {
        let frame = match call.await {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Call task {} failed: {}", id, e);
                Frame::reply(id, Err(CallError::internal(format!("Call task failed: {}", e))))
            }
        };
        if frames.send(frame).await.is_err() {
            break;
        }
    }
}

async fn write_frames<W>(mut queue: mpsc::Receiver<Frame>, mut outbound: W, closed: CancellationToken)
where
    W: Sink<String, Error = TransportError> + Unpin,
{
    while let Some(frame) = queue.recv().await {
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!("Dropping unencodable frame: {}", e);
                continue;
            }
        };
        if let Err(e) = outbound.send(text).await {
            debug!("Peer stopped reading: {}", e);
            closed.cancel();
            break;
        }
    }
    let _ = outbound.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::MiddlewareSpec;
    use futures::channel::mpsc as fmpsc;
    use serde_json::json;

    struct Client {
        tx: fmpsc::UnboundedSender<Result<String, TransportError>>,
        rx: fmpsc::UnboundedReceiver<String>,
        task: JoinHandle<Result<(), TransportError>>,
    }

    impl Client {
        async fn start(middleware: &Middleware) -> Self {
            let (tx, inbound) = fmpsc::unbounded();
            let (outbound, rx) = fmpsc::unbounded::<String>();
            let outbound = outbound.sink_map_err(|e| TransportError::Connection(e.to_string()));
            let task = tokio::spawn(run_session(
                middleware.clone(),
                Peer::new("test", Some("127.0.0.1:1".into())),
                inbound,
                outbound,
            ));
            Self { tx, rx, task }
        }

        fn send(&self, frame: Value) {
            self.tx.unbounded_send(Ok(frame.to_string())).unwrap();
        }

        async fn recv(&mut self) -> Value {
            let text = tokio::time::timeout(Duration::from_secs(5), self.rx.next())
                .await
                .unwrap()
                .unwrap();
            serde_json::from_str(&text).unwrap()
        }
    }

    async fn middleware() -> Middleware {
        Middleware::builder(MiddlewareSpec::default()).build().await.unwrap()
    }

    #[tokio::test]
    async fn test_handshake_and_unauthenticated_call() {
        let middleware = middleware().await;
        let mut client = Client::start(&middleware).await;

        client.send(json!({"msg": "connect", "version": "1"}));
        let connected = client.recv().await;
        assert_eq!(connected["msg"], "connected");
        assert!(connected["session"].is_string());

        client.send(json!({"msg": "method", "id": "c3", "method": "core.get_jobs", "params": []}));
        let reply = client.recv().await;
        assert_eq!(reply["id"], "c3");
        assert_eq!(reply["error"]["error"], "NOT_AUTHENTICATED");

        drop(client.tx);
        client.task.await.unwrap().unwrap();
        middleware.shutdown().await;
    }

    #[tokio::test]
    async fn test_version_mismatch_fails() {
        let middleware = middleware().await;
        let mut client = Client::start(&middleware).await;

        client.send(json!({"msg": "connect", "version": "2"}));
        assert_eq!(client.recv().await, json!({"msg": "failed", "version": "1"}));
        assert!(matches!(client.task.await.unwrap(), Err(TransportError::Version(v)) if v == "2"));
        assert!(middleware.sessions().is_empty());
        middleware.shutdown().await;
    }

    #[tokio::test]
    async fn test_oversized_unauthenticated_frame_closes_session() {
        let mut spec = MiddlewareSpec::default();
        spec.server.unauthenticated_max_frame_bytes = 128;
        let middleware = Middleware::builder(spec).build().await.unwrap();
        let mut client = Client::start(&middleware).await;

        client.send(json!({"msg": "connect", "version": "1"}));
        client.recv().await;
        let padding = "x".repeat(512);
        client.send(json!({"msg": "method", "id": "big", "method": "core.ping", "params": [padding]}));

        let result = client.task.await.unwrap();
        assert!(matches!(
            result,
            Err(TransportError::Protocol(ProtocolError::FrameTooLarge { .. }))
        ));
        assert!(middleware.sessions().is_empty());
        middleware.shutdown().await;
    }

    #[tokio::test]
    async fn test_replies_follow_request_order() {
        let middleware = middleware().await;
        let mut client = Client::start(&middleware).await;
        client.send(json!({"msg": "connect", "version": "1"}));
        client.recv().await;

        for i in 0..5 {
            client.send(json!({"msg": "method", "id": format!("p{}", i), "method": "core.ping", "params": []}));
        }
        for i in 0..5 {
            let reply = client.recv().await;
            assert_eq!(reply["id"], format!("p{}", i));
        }
        middleware.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_call_task_still_replies() {
        let (replies, pending) = mpsc::channel::<PendingReply>(4);
        let (frames, mut outbound) = mpsc::channel::<Frame>(4);
        replies
            .send(("c9".into(), tokio::spawn(async { panic!("handler task died") })))
            .await
            .unwrap();
        replies
            .send(("c10".into(), tokio::spawn(async { Frame::reply("c10", Ok(json!("pong"))) })))
            .await
            .unwrap();
        drop(replies);
        sequence_replies(pending, frames).await;

        let Some(Frame::Result { id, result, error }) = outbound.recv().await else {
            panic!("expected a result frame");
        };
        assert_eq!(id, "c9");
        assert!(result.is_none());
        assert_eq!(error.unwrap().error, crate::domain::error::ErrorCode::Internal);
        assert!(matches!(outbound.recv().await, Some(Frame::Result { id, .. }) if id == "c10"));
    }

    #[tokio::test]
    async fn test_reader_stops_when_reply_queue_is_full_and_session_closes() {
        let middleware = middleware().await;
        let limits = middleware.config().server.clone();
        let state = Arc::new(SessionState::new("test", Some("127.0.0.1:2".into())));
        let (frames, _outbound) = mpsc::channel::<Frame>(8);
        let (replies, _pending) = mpsc::channel::<PendingReply>(1);
        replies
            .send(("c0".into(), tokio::spawn(async { Frame::reply("c0", Ok(Value::Null)) })))
            .await
            .unwrap();

        let (tx, mut inbound) = fmpsc::unbounded::<Result<String, TransportError>>();
        let frame = json!({"msg": "method", "id": "c1", "method": "core.ping", "params": []});
        tx.unbounded_send(Ok(frame.to_string())).unwrap();

        let closed = state.closed.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            closed.cancel();
        });
        let finished = tokio::time::timeout(
            Duration::from_secs(5),
            read_frames(&middleware, &state, &limits, &mut inbound, &frames, &replies),
        )
        .await;

        assert!(matches!(finished, Ok(Ok(()))));
        drop(tx);
        middleware.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_event_gets_nosub() {
        let middleware = middleware().await;
        let mut client = Client::start(&middleware).await;
        client.send(json!({"msg": "connect", "version": "1"}));
        client.recv().await;

        client.send(json!({"msg": "sub", "id": "s1", "name": "no.such.event"}));
        let reply = client.recv().await;
        assert_eq!(reply["msg"], "nosub");
        assert_eq!(reply["id"], "s1");
        middleware.shutdown().await;
    }
}
