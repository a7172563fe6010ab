// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0
//! Frame protocol client over a line-framed byte stream.

use futures::{Sink, SinkExt, Stream, StreamExt};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::path::Path;
use std::pin::Pin;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use uuid::Uuid;

use crate::domain::error::ErrorPayload;
use crate::presentation::protocol::{Frame, PROTOCOL_VERSION};
use crate::presentation::session::TransportError;
use crate::presentation::transport::line_framed;

const CLIENT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{0}")]
    Remote(ErrorPayload),

    #[error("Server refused protocol version, it speaks {0}")]
    Refused(String),

    #[error("Connection closed")]
    Closed,

    #[error("Subscription {id} refused: {error}")]
    NoSub { id: String, error: ErrorPayload },
}

/// Event frame received on a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientEvent {
    pub subscription: String,
    pub name: String,
    pub fields: Value,
}

type Inbound = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;
type Outbound = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

pub struct Client {
    inbound: Inbound,
    outbound: Outbound,
    session: Uuid,
    next_id: u64,
    /// Events that arrived while waiting for a reply.
    events: VecDeque<ClientEvent>,
}

impl Client {
    pub async fn connect_unix(path: &Path) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(path).await.map_err(TransportError::from)?;
        Self::connect(stream).await
    }

    pub async fn connect<T>(io: T) -> Result<Self, ClientError>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (inbound, outbound) = line_framed(io, CLIENT_MAX_FRAME_BYTES);
        let mut client = Self {
            inbound: Box::pin(inbound),
            outbound: Box::pin(outbound),
            session: Uuid::nil(),
            next_id: 0,
            events: VecDeque::new(),
        };
        client
            .send(Frame::Connect {
                version: PROTOCOL_VERSION.to_string(),
            })
            .await?;
        match client.recv().await? {
            Frame::Connected { session } => client.session = session,
            Frame::Failed { version } => return Err(ClientError::Refused(version)),
            _ => return Err(TransportError::Handshake.into()),
        }
        Ok(client)
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    pub async fn call(&mut self, method: &str, params: Vec<Value>) -> Result<Value, ClientError> {
        self.call_streaming(method, Value::Array(params), |_| {}).await
    }

    pub async fn call_kwargs(&mut self, method: &str, kwargs: Map<String, Value>) -> Result<Value, ClientError> {
        self.call_streaming(method, Value::Object(kwargs), |_| {}).await
    }

    /// Call a method, handing every chunk frame to `on_chunk` before the result arrives.
    pub async fn call_streaming(
        &mut self,
        method: &str,
        params: Value,
        mut on_chunk: impl FnMut(Value),
    ) -> Result<Value, ClientError> {
        let id = self.next_call_id();
        self.send(Frame::Method {
            id: id.clone(),
            method: method.to_string(),
            params,
            kwargs: None,
            timeout: None,
        })
        .await?;

        loop {
            match self.recv().await? {
                Frame::Chunk { id: chunk, data } if chunk == id => on_chunk(data),
                frame @ Frame::Result { .. } => match frame.into_outcome() {
                    Some((reply, outcome)) if reply == id => return outcome.map_err(ClientError::Remote),
                    _ => continue,
                },
                Frame::Event { id, name, fields } => self.events.push_back(ClientEvent {
                    subscription: id,
                    name,
                    fields,
                }),
                _ => continue,
            }
        }
    }

    /// Subscribe to an event mask; returns the subscription id.
    pub async fn subscribe(&mut self, name: &str) -> Result<String, ClientError> {
        let id = self.next_call_id();
        self.send(Frame::Sub {
            id: id.clone(),
            name: name.to_string(),
        })
        .await?;
        loop {
            match self.recv().await? {
                Frame::Ready { subs } if subs.contains(&id) => return Ok(id),
                Frame::Nosub { id: refused, error } if refused == id => {
                    return Err(ClientError::NoSub { id: refused, error })
                }
                Frame::Event { id, name, fields } => self.events.push_back(ClientEvent {
                    subscription: id,
                    name,
                    fields,
                }),
                _ => continue,
            }
        }
    }

    pub async fn unsubscribe(&mut self, id: &str) -> Result<(), ClientError> {
        self.send(Frame::Unsub { id: id.to_string() }).await
    }

    /// Next event frame; `None` once the server closes the connection.
    pub async fn next_event(&mut self) -> Result<Option<ClientEvent>, ClientError> {
        if let Some(event) = self.events.pop_front() {
            return Ok(Some(event));
        }
        loop {
            match self.recv().await {
                Ok(Frame::Event { id, name, fields }) => {
                    return Ok(Some(ClientEvent {
                        subscription: id,
                        name,
                        fields,
                    }))
                }
                Ok(_) => continue,
                Err(ClientError::Closed) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn close(mut self) -> Result<(), ClientError> {
        self.outbound.close().await?;
        Ok(())
    }

    fn next_call_id(&mut self) -> String {
        self.next_id += 1;
        format!("c{}", self.next_id)
    }

    async fn send(&mut self, frame: Frame) -> Result<(), ClientError> {
        let text = frame.encode().map_err(TransportError::from)?;
        self.outbound.send(text).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Frame, ClientError> {
        let text = self.inbound.next().await.ok_or(ClientError::Closed)??;
        Ok(Frame::decode(&text, CLIENT_MAX_FRAME_BYTES).map_err(TransportError::from)?)
    }
}
