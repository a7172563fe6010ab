// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for Middleware Events
//
// Two delivery paths share one publish call:
// - Session fan-out: every registered subscriber is tested against its glob
//   masks and the event's role requirement, then handed the event through a
//   non-blocking sink (a full session queue closes that session, never the
//   publisher).
// - In-process stream: a tokio broadcast channel for observers inside the
//   daemon (job waiters, the CLI bridge, tests).
//
// Payloads are validated against the registered schema; invalid or
// unregistered events are dropped with a warning.

use dashmap::DashMap;
use globset::{Glob, GlobMatcher};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::application::schema_registry::{SchemaId, SchemaRegistry};
use crate::domain::credential::Credential;
use crate::domain::error::CallError;
use crate::domain::events::{Event, EventType};

/// Extra per-event visibility check, evaluated after the role check.
pub type EventAccess = Arc<dyn Fn(&Credential, &Value) -> bool + Send + Sync>;

/// Receiving end of a session's event subscriptions.
pub trait EventSink: Send + Sync {
    /// Credential currently attached to the subscriber.
    fn credential(&self) -> Option<Arc<Credential>>;

    /// Hand over one event frame. `false` means the subscriber is gone or
    /// could not keep up and must be dropped.
    fn deliver(&self, subscription: &str, event: &Event) -> bool;
}

struct Registration {
    schema: Option<SchemaId>,
    roles: Vec<String>,
    access: Option<EventAccess>,
    description: Option<String>,
}

struct Subscription {
    id: String,
    mask: String,
    matcher: GlobMatcher,
}

struct Subscriber {
    sink: Arc<dyn EventSink>,
    subscriptions: Vec<Subscription>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SubscribeError {
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Invalid subscription mask {0}: {1}")]
    InvalidMask(String, String),

    #[error("Event {0} does not exist")]
    UnknownEvent(String),

    #[error("Not authorized to subscribe to {0}")]
    NotAuthorized(String),

    #[error("Subscriber {0} is not registered")]
    UnknownSubscriber(Uuid),
}

impl From<SubscribeError> for CallError {
    fn from(err: SubscribeError) -> Self {
        match err {
            SubscribeError::NotAuthenticated => CallError::NotAuthenticated,
            SubscribeError::NotAuthorized(_) => CallError::NotAuthorized(err.to_string()),
            SubscribeError::UnknownEvent(_) => CallError::MatchNotFound(err.to_string()),
            SubscribeError::InvalidMask(..) => CallError::validation("name", err.to_string()),
            SubscribeError::UnknownSubscriber(_) => CallError::invalid(err.to_string()),
        }
    }
}

/// Event bus for publishing events to sessions and in-process observers
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<Event>>,
    schemas: Arc<SchemaRegistry>,
    types: Arc<HashMap<String, Registration>>,
    subscribers: Arc<DashMap<Uuid, Subscriber>>,
}

/// Builder collecting event registrations during plugin load.
#[derive(Default)]
pub struct EventBusBuilder {
    types: HashMap<String, Registration>,
}

impl EventBusBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// `schema` is the compiled payload schema of `event.payload`, if any.
    pub fn register(&mut self, event: &EventType, schema: Option<SchemaId>) {
        if self.types.contains_key(&event.name) {
            warn!("Event {} registered twice; keeping the first registration", event.name);
            return;
        }
        self.types.insert(
            event.name.clone(),
            Registration {
                schema,
                roles: event.roles.clone(),
                access: None,
                description: event.description.clone(),
            },
        );
    }

    /// Attach a visibility check to an already registered event.
    pub fn restrict(&mut self, name: &str, access: EventAccess) {
        if let Some(registration) = self.types.get_mut(name) {
            registration.access = Some(access);
        }
    }

    pub fn build(self, schemas: Arc<SchemaRegistry>, capacity: usize) -> EventBus {
        let (sender, _) = broadcast::channel(capacity);
        EventBus {
            sender: Arc::new(sender),
            schemas,
            types: Arc::new(self.types),
            subscribers: Arc::new(DashMap::new()),
        }
    }
}

impl EventBus {
    /// Validate and publish an event. Never fails into the caller.
    pub fn publish(&self, name: &str, fields: Value) {
        let Some(registration) = self.types.get(name) else {
            warn!(event = name, "Dropping unregistered event");
            metrics::counter!("middleware_events_dropped_total", "reason" => "unregistered").increment(1);
            return;
        };

        let fields = match registration.schema {
            Some(schema) => match self.schemas.validate(fields, schema) {
                Ok(fields) => fields,
                Err(errors) => {
                    warn!(event = name, %errors, "Dropping event with invalid payload");
                    metrics::counter!("middleware_events_dropped_total", "reason" => "invalid_payload")
                        .increment(1);
                    return;
                }
            },
            None => fields,
        };

        let event = Event::new(name, fields);
        debug!(event = name, "Publishing event");

        // Sinks may close their session (and detach) while we deliver, so no
        // map guard is held across `deliver`.
        let targets: Vec<(Uuid, Arc<dyn EventSink>, Vec<String>)> = self
            .subscribers
            .iter()
            .filter_map(|entry| {
                let subscriber = entry.value();
                let matching: Vec<String> = subscriber
                    .subscriptions
                    .iter()
                    .filter(|s| s.matcher.is_match(name))
                    .map(|s| s.id.clone())
                    .collect();
                (!matching.is_empty()).then(|| (*entry.key(), subscriber.sink.clone(), matching))
            })
            .collect();

        let mut gone = Vec::new();
        for (session, sink, subscriptions) in targets {
            let Some(credential) = sink.credential() else {
                continue;
            };
            if !Self::may_receive(registration, &credential, &event.fields) {
                continue;
            }
            // One frame per matching subscription.
            if !subscriptions.iter().all(|subscription| sink.deliver(subscription, &event)) {
                gone.push(session);
            }
        }
        for session in gone {
            debug!(%session, "Removing subscriber that could not accept events");
            self.subscribers.remove(&session);
        }

        let receiver_count = self.sender.send(event).unwrap_or(0);
        if receiver_count == 0 {
            debug!("No in-process observers listening to event");
        }
    }

    fn may_receive(registration: &Registration, credential: &Credential, fields: &Value) -> bool {
        if !credential.has_all_roles(&registration.roles) {
            return false;
        }
        match &registration.access {
            Some(access) => credential.full_admin || access(credential, fields),
            None => true,
        }
    }

    /// Register a session as a potential subscriber.
    pub fn attach(&self, session: Uuid, sink: Arc<dyn EventSink>) {
        self.subscribers.insert(
            session,
            Subscriber {
                sink,
                subscriptions: Vec::new(),
            },
        );
    }

    /// Drop a session and all of its subscriptions.
    pub fn detach(&self, session: Uuid) {
        self.subscribers.remove(&session);
    }

    /// Add a subscription. A mask without wildcards must name an event the
    /// session may receive; wildcard masks are filtered at delivery.
    pub fn subscribe(&self, session: Uuid, id: &str, mask: &str) -> Result<(), SubscribeError> {
        let mut subscriber = self
            .subscribers
            .get_mut(&session)
            .ok_or(SubscribeError::UnknownSubscriber(session))?;
        let credential = subscriber
            .sink
            .credential()
            .ok_or(SubscribeError::NotAuthenticated)?;

        let is_glob = mask.contains(['*', '?', '[']);
        if !is_glob {
            let registration = self
                .types
                .get(mask)
                .ok_or_else(|| SubscribeError::UnknownEvent(mask.to_string()))?;
            if !credential.has_all_roles(&registration.roles) {
                return Err(SubscribeError::NotAuthorized(mask.to_string()));
            }
        }

        let matcher = Glob::new(mask)
            .map_err(|e| SubscribeError::InvalidMask(mask.to_string(), e.to_string()))?
            .compile_matcher();
        subscriber.subscriptions.retain(|s| s.id != id);
        subscriber.subscriptions.push(Subscription {
            id: id.to_string(),
            mask: mask.to_string(),
            matcher,
        });
        Ok(())
    }

    /// Remove a subscription by id. Returns whether it existed.
    pub fn unsubscribe(&self, session: Uuid, id: &str) -> bool {
        match self.subscribers.get_mut(&session) {
            Some(mut subscriber) => {
                let before = subscriber.subscriptions.len();
                subscriber.subscriptions.retain(|s| s.id != id);
                subscriber.subscriptions.len() != before
            }
            None => false,
        }
    }

    /// `(id, mask)` pairs of a session's subscriptions.
    pub fn subscriptions(&self, session: Uuid) -> Vec<(String, String)> {
        self.subscribers
            .get(&session)
            .map(|s| {
                s.subscriptions
                    .iter()
                    .map(|sub| (sub.id.clone(), sub.mask.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Registered event types visible to `credential`, for `core.get_events`.
    pub fn describe(&self, credential: &Credential) -> Vec<Value> {
        let mut names: Vec<&String> = self.types.keys().collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|name| {
                let registration = &self.types[name];
                if !credential.has_all_roles(&registration.roles) {
                    return None;
                }
                Some(serde_json::json!({
                    "name": name,
                    "description": registration.description,
                    "roles": registration.roles,
                    "schema": registration.schema.map(|id| self.schemas.to_json(id)),
                }))
            })
            .collect()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Subscribe to all events published in-process
    pub fn observe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe in-process and keep only events matching `mask`
    pub fn observe_mask(&self, mask: &str) -> Result<MaskedEventReceiver, SubscribeError> {
        let matcher = Glob::new(mask)
            .map_err(|e| SubscribeError::InvalidMask(mask.to_string(), e.to_string()))?
            .compile_matcher();
        Ok(MaskedEventReceiver {
            receiver: self.sender.subscribe(),
            matcher,
        })
    }

    pub fn observer_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

/// Receiver for all in-process events
pub struct EventReceiver {
    receiver: broadcast::Receiver<Event>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<Event, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    pub fn try_recv(&mut self) -> Result<Event, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver filtered by a glob mask
pub struct MaskedEventReceiver {
    receiver: broadcast::Receiver<Event>,
    matcher: GlobMatcher,
}

impl MaskedEventReceiver {
    pub async fn recv(&mut self) -> Result<Event, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if self.matcher.is_match(&event.name) {
                return Ok(event);
            }
        }
    }
}

/// Errors that can occur when receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::credential::{CredentialKind, FULL_ADMIN};
    use crate::domain::schema::Schema;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::BTreeSet;

    struct RecordingSink {
        credential: Option<Arc<Credential>>,
        received: Mutex<Vec<(String, String)>>,
        accept: bool,
    }

    impl RecordingSink {
        fn new(credential: Option<Credential>) -> Arc<Self> {
            Arc::new(Self {
                credential: credential.map(Arc::new),
                received: Mutex::new(Vec::new()),
                accept: true,
            })
        }
    }

    impl EventSink for RecordingSink {
        fn credential(&self) -> Option<Arc<Credential>> {
            self.credential.clone()
        }

        fn deliver(&self, subscription: &str, event: &Event) -> bool {
            self.received
                .lock()
                .push((subscription.to_string(), event.name.clone()));
            self.accept
        }
    }

    fn user(roles: &[&str]) -> Credential {
        let roles: BTreeSet<String> = roles.iter().map(|r| r.to_string()).collect();
        let full_admin = roles.contains(FULL_ADMIN);
        Credential::new(CredentialKind::LoginPassword, "bob", roles, full_admin)
    }

    fn bus() -> EventBus {
        let mut schemas = SchemaRegistry::new();
        let payload = Schema::dict("pool_changed").attr(Schema::string("name").required());
        let schema = schemas.compile(&payload).unwrap();
        schemas.resolve().unwrap();

        let mut builder = EventBusBuilder::new();
        builder.register(&EventType::new("pool.changed").payload(payload), Some(schema));
        builder.register(&EventType::new("pool.secret").roles(&["POOL_ADMIN"]), None);
        builder.register(&EventType::new("core.job_updated"), None);
        builder.build(Arc::new(schemas), 16)
    }

    #[tokio::test]
    async fn test_glob_mask_delivery_in_publish_order() {
        let bus = bus();
        let session = Uuid::new_v4();
        let sink = RecordingSink::new(Some(user(&[])));
        bus.attach(session, sink.clone());
        bus.subscribe(session, "s1", "pool.*").unwrap();

        bus.publish("pool.changed", json!({"name": "tank"}));
        bus.publish("core.job_updated", json!({}));
        bus.publish("pool.changed", json!({"name": "boot"}));

        let received = sink.received.lock().clone();
        assert_eq!(
            received,
            vec![
                ("s1".to_string(), "pool.changed".to_string()),
                ("s1".to_string(), "pool.changed".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_each_matching_subscription_receives_the_event() {
        let bus = bus();
        let session = Uuid::new_v4();
        let sink = RecordingSink::new(Some(user(&[])));
        bus.attach(session, sink.clone());
        bus.subscribe(session, "pools", "pool.*").unwrap();
        bus.subscribe(session, "exact", "pool.changed").unwrap();
        bus.subscribe(session, "jobs", "core.job_*").unwrap();

        bus.publish("pool.changed", json!({"name": "tank"}));

        let received = sink.received.lock().clone();
        assert_eq!(
            received,
            vec![
                ("pools".to_string(), "pool.changed".to_string()),
                ("exact".to_string(), "pool.changed".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_invalid_payload_is_dropped() {
        let bus = bus();
        let mut observer = bus.observe();
        bus.publish("pool.changed", json!({"nope": 1}));
        bus.publish("not.registered", json!({}));
        assert!(matches!(observer.try_recv(), Err(EventBusError::Empty)));
    }

    #[tokio::test]
    async fn test_role_filtering_and_direct_subscription_checks() {
        let bus = bus();
        let session = Uuid::new_v4();
        let sink = RecordingSink::new(Some(user(&[])));
        bus.attach(session, sink.clone());

        assert_eq!(
            bus.subscribe(session, "s1", "pool.secret"),
            Err(SubscribeError::NotAuthorized("pool.secret".into()))
        );
        assert_eq!(
            bus.subscribe(session, "s2", "pool.missing"),
            Err(SubscribeError::UnknownEvent("pool.missing".into()))
        );

        bus.subscribe(session, "all", "*").unwrap();
        bus.publish("pool.secret", json!({}));
        bus.publish("core.job_updated", json!({}));
        let names: Vec<String> = sink.received.lock().iter().map(|(_, n)| n.clone()).collect();
        assert_eq!(names, vec!["core.job_updated".to_string()]);
    }

    #[tokio::test]
    async fn test_unauthenticated_session_cannot_subscribe() {
        let bus = bus();
        let session = Uuid::new_v4();
        bus.attach(session, RecordingSink::new(None));
        assert_eq!(bus.subscribe(session, "s1", "*"), Err(SubscribeError::NotAuthenticated));
    }

    #[tokio::test]
    async fn test_full_sink_detaches_subscriber() {
        let bus = bus();
        let session = Uuid::new_v4();
        let sink = Arc::new(RecordingSink {
            credential: Some(Arc::new(user(&[FULL_ADMIN]))),
            received: Mutex::new(Vec::new()),
            accept: false,
        });
        bus.attach(session, sink);
        bus.subscribe(session, "s1", "*").unwrap();
        bus.publish("core.job_updated", json!({}));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_masked_observer() {
        let bus = bus();
        let mut observer = bus.observe_mask("core.job_*").unwrap();
        bus.publish("pool.changed", json!({"name": "tank"}));
        bus.publish("core.job_updated", json!({"id": 1}));
        let event = observer.recv().await.unwrap();
        assert_eq!(event.name, "core.job_updated");
    }
}
