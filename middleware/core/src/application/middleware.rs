// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0
//! # Middleware
//!
//! The process-wide handle every component shares. It owns the registries,
//! the job manager, the event bus and the audit sink, and tracks connected
//! sessions. Cloning is cheap.
//!
//! Startup is driven by [`MiddlewareBuilder::build`]:
//!
//! 1. register core services, events and roles
//! 2. run `register` of every selected plugin
//! 3. resolve the schema registry (an unresolved reference is fatal)
//! 4. open the config store and audit sink, restore durable jobs
//! 5. run `setup` of every plugin
//! 6. start background tasks and mark the middleware ready
//!
//! Transports are opened by the caller once `build` returns.

use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::authentication::{self, Authenticator};
use crate::application::authorization::Authorizer;
use crate::application::context::SessionState;
use crate::application::core_service;
use crate::application::dispatcher::{CallRequest, CallResponse};
use crate::application::hooks::{self, HookRegistry, ON_CONNECT, ON_DISCONNECT};
use crate::application::job_manager::JobManager;
use crate::application::plugin_loader::{Plugin, PluginCatalog, PluginError, PluginLoader, Registrar};
use crate::application::schema_registry::{SchemaError, SchemaRegistry};
use crate::application::service_registry::ServiceRegistry;
use crate::domain::config::MiddlewareSpec;
use crate::domain::credential::{Credential, RoleTable};
use crate::domain::error::CallError;
use crate::domain::events::{JOB_ADDED, JOB_FINISHED, JOB_UPDATED, SESSION_CONNECTED, SESSION_DISCONNECTED};
use crate::domain::job::{Job, JobState};
use crate::domain::repository::{ConfigStore, StoreError};
use crate::infrastructure::audit::{AuditError, AuditSink};
use crate::infrastructure::db::Database;
use crate::infrastructure::event_bus::{EventBus, EventBusBuilder, EventSink};
use crate::infrastructure::repositories::{InMemoryConfigStore, PostgresConfigStore};

/// Broadcast capacity of the event bus.
const EVENT_CAPACITY: usize = 1024;
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);
const CORE_PLUGIN: &str = "core";

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("Schema resolution failed: {0}")]
    Schema(#[from] SchemaError),

    #[error("Config store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("Audit log unavailable: {0}")]
    Audit(#[from] AuditError),

    #[error("Failed to restore jobs: {0}")]
    Jobs(CallError),

    #[error("Plugin {plugin} setup failed: {reason}")]
    Setup { plugin: String, reason: String },
}

struct Inner {
    spec: MiddlewareSpec,
    schemas: Arc<SchemaRegistry>,
    services: ServiceRegistry,
    events: Arc<EventBus>,
    jobs: Arc<JobManager>,
    audit: Arc<AuditSink>,
    store: Arc<dyn ConfigStore>,
    authenticator: Authenticator,
    authorizer: Authorizer,
    hooks: HookRegistry,
    plugins: Vec<Arc<dyn Plugin>>,
    sessions: DashMap<Uuid, Arc<SessionState>>,
    internal: Arc<Credential>,
    ready: AtomicBool,
    shutdown: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Middleware {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Middleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Middleware")
            .field("methods", &self.inner.services.method_count())
            .field("sessions", &self.inner.sessions.len())
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl Middleware {
    pub fn builder(spec: MiddlewareSpec) -> MiddlewareBuilder {
        MiddlewareBuilder::new(spec)
    }

    pub fn config(&self) -> &MiddlewareSpec {
        &self.inner.spec
    }

    pub fn schemas(&self) -> &SchemaRegistry {
        &self.inner.schemas
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.inner.services
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    pub fn jobs(&self) -> &Arc<JobManager> {
        &self.inner.jobs
    }

    pub fn audit(&self) -> &Arc<AuditSink> {
        &self.inner.audit
    }

    pub fn store(&self) -> Arc<dyn ConfigStore> {
        Arc::clone(&self.inner.store)
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.inner.authenticator
    }

    pub fn authorizer(&self) -> &Authorizer {
        &self.inner.authorizer
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.inner.hooks
    }

    pub fn plugins(&self) -> impl Iterator<Item = &str> {
        self.inner.plugins.iter().map(|p| p.name())
    }

    /// Credential of in-process calls.
    pub fn internal_credential(&self) -> Arc<Credential> {
        Arc::clone(&self.inner.internal)
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Acquire)
    }

    /// Cancelled when the middleware begins shutting down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn session(&self, id: Uuid) -> Option<Arc<SessionState>> {
        self.inner.sessions.get(&id).map(|s| Arc::clone(s.value()))
    }

    pub fn sessions(&self) -> Vec<Arc<SessionState>> {
        let mut sessions: Vec<_> = self.inner.sessions.iter().map(|s| Arc::clone(s.value())).collect();
        sessions.sort_by_key(|s| s.connected_at);
        sessions
    }

    pub async fn register_session(&self, session: Arc<SessionState>, sink: Arc<dyn EventSink>) {
        self.inner.sessions.insert(session.id, Arc::clone(&session));
        self.inner.events.attach(session.id, sink);
        let info = session.info();
        self.inner.events.publish(SESSION_CONNECTED, info.clone());
        if let Err(e) = self.inner.hooks.call_hook(self, ON_CONNECT, &info).await {
            warn!("Session {} connect hook failed: {}", session.id, e);
        }
        debug!("Session {} connected over {}", session.id, session.transport);
    }

    /// Detach a closed session: subscriptions go, abandon-on-disconnect jobs
    /// are aborted, then `core.session_disconnected` is published.
    pub async fn unregister_session(&self, id: Uuid) {
        let Some((_, session)) = self.inner.sessions.remove(&id) else {
            return;
        };
        session.closed.cancel();
        self.inner.events.detach(id);
        let aborted = self.inner.jobs.abort_session_jobs(id).await;
        if aborted > 0 {
            info!("Aborted {} jobs of closed session {}", aborted, id);
        }
        self.inner.events.publish(SESSION_DISCONNECTED, json!({ "id": id }));
        if let Err(e) = self.inner.hooks.call_hook(self, ON_DISCONNECT, &json!({ "id": id })).await {
            warn!("Session {} disconnect hook failed: {}", id, e);
        }
        debug!("Session {} disconnected", id);
    }

    /// In-process call with the internal credential. Job methods return the
    /// job id; use [`Middleware::call_sync`] to wait for their result.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, CallError> {
        let request = CallRequest::internal(method, params, self.internal_credential());
        match self.dispatch(request).await? {
            CallResponse::Value(value) => Ok(value),
            CallResponse::Job(id) => Ok(json!(id)),
        }
    }

    /// Like [`Middleware::call`], but waits for job methods to finish.
    pub async fn call_sync(&self, method: &str, params: Vec<Value>) -> Result<Value, CallError> {
        let request = CallRequest::internal(method, params, self.internal_credential());
        match self.dispatch(request).await? {
            CallResponse::Value(value) => Ok(value),
            CallResponse::Job(id) => job_outcome(self.inner.jobs.wait(id, None, None).await?),
        }
    }

    /// Stop accepting work, abort jobs and flush the audit log.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!("Middleware shutting down");
        self.inner.ready.store(false, Ordering::Release);
        self.inner.shutdown.cancel();
        for session in self.inner.sessions.iter() {
            session.closed.cancel();
        }
        self.inner.jobs.cancel_all();
        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        if let Err(e) = self.inner.audit.flush().await {
            error!("Final audit flush failed: {}", e);
        }
    }
}

/// Final value of a terminal job, or its failure as a call error.
pub fn job_outcome(job: Job) -> Result<Value, CallError> {
    match job.state {
        JobState::Success => Ok(job.result.unwrap_or(Value::Null)),
        JobState::Aborted => Err(CallError::new(
            libc::ECANCELED,
            job.error.unwrap_or_else(|| format!("Job {} was aborted", job.id)),
        )),
        JobState::Failed => {
            let reason = job.error.unwrap_or_else(|| format!("Job {} failed", job.id));
            let info = job.exc_info;
            let errno = info.as_ref().and_then(|i| i.errno).unwrap_or(libc::EFAULT);
            let error = CallError::new(errno, reason);
            Err(match info.and_then(|i| i.extra) {
                Some(extra) => error.with_extra(extra),
                None => error,
            })
        }
        JobState::Waiting | JobState::Running => {
            Err(CallError::internal(format!("Job {} is still {}", job.id, job.state.as_str())))
        }
    }
}

pub struct MiddlewareBuilder {
    spec: MiddlewareSpec,
    catalog: PluginCatalog,
    plugins: Vec<Arc<dyn Plugin>>,
    store: Option<Arc<dyn ConfigStore>>,
    audit: Option<Arc<AuditSink>>,
}

impl MiddlewareBuilder {
    pub fn new(spec: MiddlewareSpec) -> Self {
        Self {
            spec,
            catalog: PluginCatalog::new(),
            plugins: Vec::new(),
            store: None,
            audit: None,
        }
    }

    /// Plugins selected through `plugins.directory` come from this catalog.
    pub fn catalog(mut self, catalog: PluginCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Load a plugin regardless of the plugin directory.
    pub fn plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn audit(mut self, audit: Arc<AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub async fn build(self) -> Result<Middleware, BuildError> {
        let MiddlewareBuilder {
            spec,
            catalog,
            mut plugins,
            store,
            audit,
        } = self;
        plugins.extend(PluginLoader::new(&catalog).load(&spec.plugins)?);

        let mut schemas = SchemaRegistry::new();
        let mut services = ServiceRegistry::new();
        let mut events = EventBusBuilder::new();
        let mut roles = RoleTable::default();
        let mut hooks = HookRegistry::new();

        {
            let mut registrar = Registrar::new(
                CORE_PLUGIN,
                &mut schemas,
                &mut services,
                &mut events,
                &mut roles,
                &mut hooks,
            );
            for event in core_service::event_types() {
                registrar.event(event)?;
            }
            for name in [JOB_ADDED, JOB_UPDATED, JOB_FINISHED] {
                registrar.event_access(name, core_service::job_event_access());
            }
            let definitions = core_service::service_definitions()
                .into_iter()
                .chain(std::iter::once(authentication::service_definition()))
                .chain(hooks::service_definitions());
            for definition in definitions {
                registrar.service(definition)?;
            }
        }

        for plugin in &plugins {
            let mut registrar = Registrar::new(
                plugin.name(),
                &mut schemas,
                &mut services,
                &mut events,
                &mut roles,
                &mut hooks,
            );
            plugin.register(&mut registrar)?;
            debug!("Plugin {} registered", plugin.name());
        }

        schemas.resolve()?;
        let schemas = Arc::new(schemas);
        let events = Arc::new(events.build(Arc::clone(&schemas), EVENT_CAPACITY));
        info!(
            "Registered {} methods from {} plugins",
            services.method_count(),
            plugins.len()
        );

        let store = match store {
            Some(store) => store,
            None => open_store(&spec).await?,
        };
        let audit = match audit {
            Some(audit) => audit,
            None => Arc::new(AuditSink::new(&spec.audit)),
        };
        audit.resume().await?;

        let jobs = JobManager::new(&spec.jobs, Arc::clone(&events), Arc::clone(&store));
        let restored = jobs.restore().await.map_err(BuildError::Jobs)?;
        if restored > 0 {
            info!("Restored {} durable jobs", restored);
        }

        let roles = Arc::new(roles);
        let authenticator = Authenticator::new(&spec.auth, roles);
        let authorizer = Authorizer::new(&spec);

        let middleware = Middleware {
            inner: Arc::new(Inner {
                spec,
                schemas,
                services,
                events,
                jobs,
                audit,
                store,
                authenticator,
                authorizer,
                hooks,
                plugins,
                sessions: DashMap::new(),
                internal: Arc::new(Credential::internal()),
                ready: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                tasks: parking_lot::Mutex::new(Vec::new()),
            }),
        };

        for plugin in &middleware.inner.plugins {
            plugin.setup(&middleware).await.map_err(|e| BuildError::Setup {
                plugin: plugin.name().to_string(),
                reason: format!("{:#}", e),
            })?;
        }

        middleware.spawn_background_tasks();
        middleware.inner.ready.store(true, Ordering::Release);
        info!("Middleware ready");
        Ok(middleware)
    }
}

async fn open_store(spec: &MiddlewareSpec) -> Result<Arc<dyn ConfigStore>, StoreError> {
    let Some(database) = &spec.database else {
        debug!("No database configured, using the in-memory config store");
        return Ok(Arc::new(InMemoryConfigStore::new()));
    };
    let db = Database::new(&database.url, database.max_connections).await?;
    let store = PostgresConfigStore::new(db.get_pool().clone());
    store.migrate().await?;
    info!("Connected to config store database");
    Ok(Arc::new(store))
}

impl Middleware {
    fn spawn_background_tasks(&self) {
        let shutdown = self.inner.shutdown.clone();
        let mut tasks = self.inner.tasks.lock();
        tasks.push(self.inner.audit.spawn_flusher(shutdown.clone()));
        tasks.push(self.inner.jobs.spawn_sweeper(shutdown.clone()));

        let middleware = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(PRUNE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        middleware.inner.authenticator.prune_tokens();
                        middleware.inner.authorizer.prune();
                    }
                }
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_registers_core_services() {
        let middleware = Middleware::builder(MiddlewareSpec::default()).build().await.unwrap();
        assert!(middleware.is_ready());
        for method in ["core.ping", "core.get_jobs", "auth.login_ex", "etc.generate", "audit.query"] {
            assert!(middleware.services().get_method(method).is_some(), "{} missing", method);
        }
        assert_eq!(middleware.call("core.ping", vec![]).await.unwrap(), json!("pong"));
        middleware.shutdown().await;
        assert!(!middleware.is_ready());
    }

    #[tokio::test]
    async fn test_session_lifecycle_events() {
        let middleware = Middleware::builder(MiddlewareSpec::default()).build().await.unwrap();
        let mut events = middleware.events().observe();

        struct Discard;
        impl EventSink for Discard {
            fn credential(&self) -> Option<Arc<Credential>> {
                None
            }
            fn deliver(&self, _subscription: &str, _event: &crate::domain::events::Event) -> bool {
                true
            }
        }

        let session = Arc::new(SessionState::new("unix", Some("unix:0".into())));
        middleware.register_session(Arc::clone(&session), Arc::new(Discard)).await;
        assert_eq!(middleware.sessions().len(), 1);
        assert_eq!(events.recv().await.unwrap().name, SESSION_CONNECTED);

        middleware.unregister_session(session.id).await;
        assert!(session.closed.is_cancelled());
        assert!(middleware.sessions().is_empty());
        assert_eq!(events.recv().await.unwrap().name, SESSION_DISCONNECTED);
    }

    #[test]
    fn test_job_outcome_maps_failure() {
        let mut job = Job::new(3, "pool.scrub", vec![]);
        job.start().unwrap();
        job.fail(&CallError::new(libc::EBUSY, "pool is busy")).unwrap();
        match job_outcome(job) {
            Err(CallError::Call { errno, reason, .. }) => {
                assert_eq!(errno, libc::EBUSY);
                assert_eq!(reason, "pool is busy");
            }
            other => panic!("unexpected {:?}", other),
        }

        let mut job = Job::new(4, "pool.scrub", vec![]);
        job.abort("stopped").unwrap();
        assert!(matches!(job_outcome(job), Err(CallError::Call { errno, .. }) if errno == libc::ECANCELED));
    }
}
