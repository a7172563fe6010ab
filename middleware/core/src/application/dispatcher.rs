// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0
//! # Dispatcher
//!
//! Turns one call request into one reply:
//!
//! ```text
//! lookup ─► authorize ─► rate limit ─► normalize ─► validate ─┬─► job: submit, reply job id
//!                                                             └─► sync/streaming: invoke
//!                                                                   ─► result check ─► audit
//! ```
//!
//! Authorization failures are audited for session calls; rate-limit
//! rejections never are. Validation and method errors are audited when the
//! method's audit policy includes failures, `INTERNAL` errors always.

use futures::FutureExt;
use serde_json::{json, Map, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::authorization::CallOrigin;
use crate::application::context::{CallContext, SessionState};
use crate::application::job_manager::{JobHandle, JobRunner, JobSubmission};
use crate::application::middleware::Middleware;
use crate::application::panics;
use crate::application::schema_registry::{SchemaId, SchemaRegistry};
use crate::application::service_registry::MethodEntry;
use crate::domain::audit::AuditEntry;
use crate::domain::credential::Credential;
use crate::domain::error::{CallError, ValidationErrors};
use crate::domain::job::JobId;
use crate::domain::schema::ParamKind;

/// One call as the dispatcher sees it.
pub struct CallRequest {
    pub method: String,
    pub params: Vec<Value>,
    /// Keyword arguments by parameter name.
    pub kwargs: Option<Map<String, Value>>,
    pub origin: CallOrigin,
    /// Explicit credential; falls back to the session's.
    pub credential: Option<Arc<Credential>>,
    pub session: Option<Arc<SessionState>>,
    pub timeout: Option<Duration>,
    /// Chunk channel for streaming methods.
    pub stream: Option<mpsc::Sender<Value>>,
}

impl CallRequest {
    pub fn internal(method: impl Into<String>, params: Vec<Value>, credential: Arc<Credential>) -> Self {
        Self {
            method: method.into(),
            params,
            kwargs: None,
            origin: CallOrigin::Internal,
            credential: Some(credential),
            session: None,
            timeout: None,
            stream: None,
        }
    }

    pub fn session(session: Arc<SessionState>, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
            kwargs: None,
            origin: CallOrigin::Session,
            credential: None,
            session: Some(session),
            timeout: None,
            stream: None,
        }
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = Some(kwargs);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_stream(mut self, stream: mpsc::Sender<Value>) -> Self {
        self.stream = Some(stream);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallResponse {
    Value(Value),
    /// Job-mode methods reply with the id of the queued job.
    Job(JobId),
}

impl CallResponse {
    pub fn into_value(self) -> Value {
        match self {
            Self::Value(value) => value,
            Self::Job(id) => json!(id),
        }
    }
}

/// Who made a call, for the audit record.
struct Caller<'a> {
    credential: Option<&'a Arc<Credential>>,
    session: Option<&'a Arc<SessionState>>,
}

impl Middleware {
    pub async fn dispatch(&self, request: CallRequest) -> Result<CallResponse, CallError> {
        let started = Instant::now();
        let Some(method) = self.services().get_method(&request.method).cloned() else {
            debug!("Unknown method {}", request.method);
            return Err(CallError::MethodNotFound(request.method));
        };

        let result = self.dispatch_method(&method, request).await;
        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.code().as_str(),
        };
        metrics::counter!("middleware_calls_total", "method" => method.name.clone(), "outcome" => outcome)
            .increment(1);
        metrics::histogram!("middleware_call_duration_seconds", "method" => method.name.clone())
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn dispatch_method(&self, method: &Arc<MethodEntry>, request: CallRequest) -> Result<CallResponse, CallError> {
        let CallRequest {
            params,
            kwargs,
            origin,
            credential,
            session,
            timeout,
            stream,
            ..
        } = request;
        let credential = credential.or_else(|| session.as_ref().and_then(|s| s.credential()));
        let caller = Caller {
            credential: credential.as_ref(),
            session: session.as_ref(),
        };
        debug!("Dispatching {}", method.name);

        if let Err(e) = self
            .authorizer()
            .authorize(method, origin, credential.as_deref(), &params)
        {
            if origin == CallOrigin::Session && !matches!(e, CallError::MethodNotFound(_)) {
                self.audit_call(method, &caller, &params, false, false);
            }
            return Err(e);
        }

        if let Some(session) = &session {
            self.authorizer().check_rate(method, &session.rate_key())?;
        }

        let schemas = self.schemas();
        let args = match normalize_args(schemas, &method.accepts, params.clone(), kwargs)
            .and_then(|args| schemas.validate_args(&method.accepts, args).map_err(CallError::from))
        {
            Ok(args) => args,
            Err(e) => {
                info!("Rejected arguments for {}: {}", method.name, e);
                if audits_failures(method) {
                    self.audit_call(method, &caller, &params, true, false);
                }
                return Err(e);
            }
        };

        let mut call_args = args.clone();
        if method.descriptor.pass_sender {
            call_args.push(json!(credential.as_ref().map(|c| c.summary())));
        }

        let mut ctx = CallContext::new(self.clone(), method.name.clone());
        ctx.credential = credential.clone();
        ctx.session = session.clone();

        if method.is_job() {
            return self.submit_job(method, &caller, ctx, args, call_args, timeout).await;
        }

        let cancel = match &session {
            Some(session) => session.closed.child_token(),
            None => self.shutdown_token().child_token(),
        };
        ctx.cancel = cancel.clone();
        if method.is_streaming() {
            ctx.stream = stream;
        }

        let timeout = timeout.or(method.descriptor.timeout).or_else(|| {
            let secs = self.config().server.call_timeout_secs;
            (origin == CallOrigin::Session && secs > 0).then(|| Duration::from_secs(secs))
        });
        let result = invoke(method, ctx, call_args, cancel, timeout).await;
        let result = result.and_then(|value| self.check_result(method, value));

        match &result {
            Ok(_) => {
                if method.descriptor.audit.is_some() {
                    self.audit_call(method, &caller, &args, true, true);
                }
            }
            Err(CallError::Internal { reason, trace }) => {
                error!("{} failed: {}\n{}", method.name, reason, trace.as_deref().unwrap_or_default());
                self.audit_call(method, &caller, &args, true, false);
            }
            Err(e) => {
                debug!("{} failed: {}", method.name, e);
                if audits_failures(method) {
                    self.audit_call(method, &caller, &args, true, false);
                }
            }
        }
        self.authorizer().record_outcome(&method.name, &result);
        result.map(CallResponse::Value)
    }

    async fn submit_job(
        &self,
        method: &Arc<MethodEntry>,
        caller: &Caller<'_>,
        ctx: CallContext,
        args: Vec<Value>,
        call_args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<CallResponse, CallError> {
        let options = &method.descriptor.job;
        let handler = Arc::clone(&method.handler);
        let runner: JobRunner = Box::new(move |handle: JobHandle| {
            let mut ctx = ctx;
            ctx.cancel = handle.cancellation_token();
            ctx.job = Some(handle);
            Box::pin(async move { handler.call(ctx, call_args).await })
        });

        let mut submission = JobSubmission::new(
            method.name.clone(),
            self.schemas().redact_args(&method.accepts, &args),
            runner,
        );
        submission.description = options.describer.as_ref().and_then(|d| d(&args));
        submission.lock_key = options.lock.as_ref().and_then(|l| l.resolve(&args));
        submission.queue_limit = options.queue_limit;
        submission.abandon_on_disconnect = options.abandon_on_disconnect;
        submission.durable = options.durable;
        submission.transient = options.transient;
        submission.abortable = options.abortable;
        submission.read_roles = options.read_roles.clone();
        submission.owner_session = caller.session.map(|s| s.id);
        submission.credential = caller.credential.map(|c| c.summary());

        let id = match self.jobs().submit(submission).await {
            Ok(id) => id,
            Err(e) => {
                info!("Job submission for {} refused: {}", method.name, e);
                if audits_failures(method) {
                    self.audit_call(method, caller, &args, true, false);
                }
                return Err(e);
            }
        };
        if method.descriptor.audit.is_some() {
            self.audit_call(method, caller, &args, true, true);
        }

        if let Some(limit) = timeout {
            let jobs = Arc::clone(self.jobs());
            tokio::spawn(async move {
                if jobs.wait(id, Some(limit), None).await.is_err() {
                    let reason = format!("Timed out after {} seconds", limit.as_secs());
                    if let Err(e) = jobs.abort(id, None, &reason).await {
                        debug!("Timed out job {} could not be aborted: {}", id, e);
                    }
                }
            });
        }
        Ok(CallResponse::Job(id))
    }

    /// Advisory unless the method opted into strict results.
    fn check_result(&self, method: &MethodEntry, value: Value) -> Result<Value, CallError> {
        let Some(returns) = method.returns else {
            return Ok(value);
        };
        match self.schemas().validate(value.clone(), returns) {
            Ok(_) => Ok(value),
            Err(errors) if method.descriptor.strict_result => Err(CallError::internal(format!(
                "{} returned an invalid result: {}",
                method.name, errors
            ))),
            Err(errors) => {
                warn!("{} returned a result not matching its schema: {}", method.name, errors);
                Ok(value)
            }
        }
    }

    fn audit_call(&self, method: &MethodEntry, caller: &Caller<'_>, args: &[Value], authorized: bool, success: bool) {
        let description = match &method.descriptor.audit {
            Some(policy) => policy.describe(args),
            None => method.name.clone(),
        };
        let params = json!(self.schemas().redact_args(&method.accepts, args));
        let entry = AuditEntry::method_call(
            &method.name,
            &description,
            params,
            caller.credential.is_some(),
            authorized,
            success,
        )
        .with_credential(caller.credential.map(|c| c.summary()))
        .with_origin(
            caller.session.and_then(|s| s.origin.clone()),
            caller.session.map(|s| s.id),
        );
        self.audit().record(entry);
    }
}

fn audits_failures(method: &MethodEntry) -> bool {
    method.descriptor.audit.as_ref().map(|p| p.failures).unwrap_or(false)
}

async fn invoke(
    method: &MethodEntry,
    ctx: CallContext,
    args: Vec<Value>,
    cancel: CancellationToken,
    timeout: Option<Duration>,
) -> Result<Value, CallError> {
    panics::install_hook();
    let call = AssertUnwindSafe(method.handler.call(ctx, args)).catch_unwind();
    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        outcome = call => match outcome {
            Ok(result) => result,
            Err(panic) => Err(panics::caught(panic)),
        },
        _ = cancel.cancelled() => Err(CallError::new(libc::ECANCELED, format!("{} was cancelled", method.name))),
        _ = deadline => {
            cancel.cancel();
            Err(CallError::Timeout(timeout.map(|t| t.as_secs()).unwrap_or_default()))
        }
    }
}

/// Map positional and keyword arguments onto the method's parameter list.
///
/// An object whose keys are not all parameter names is taken as the single
/// argument of a method whose first parameter is a dict.
pub fn normalize_args(
    schemas: &SchemaRegistry,
    params: &[SchemaId],
    positional: Vec<Value>,
    kwargs: Option<Map<String, Value>>,
) -> Result<Vec<Value>, CallError> {
    let infos: Vec<_> = params.iter().map(|id| schemas.param_info(*id)).collect();
    let mut errors = ValidationErrors::new();

    for (value, info) in positional.iter().zip(&infos) {
        if info.kind == ParamKind::KeywordOnly && !value.is_null() {
            errors.add(info.name.clone(), "parameter must be passed by keyword");
        }
    }

    let Some(kwargs) = kwargs else {
        return errors.check(positional).map_err(CallError::from);
    };

    let all_named = kwargs.keys().all(|k| infos.iter().any(|i| &i.name == k));
    if !all_named && positional.is_empty() && params.first().is_some_and(|p| schemas.is_dict(*p)) {
        return errors.check(vec![Value::Object(kwargs)]).map_err(CallError::from);
    }

    let mut slots: Vec<Option<Value>> = positional.into_iter().map(Some).collect();
    for (key, value) in kwargs {
        let Some(index) = infos.iter().position(|i| i.name == key) else {
            errors.add(key, "unknown parameter");
            continue;
        };
        if infos[index].kind == ParamKind::PositionalOnly {
            errors.add(key, "parameter must be passed positionally");
            continue;
        }
        if slots.len() <= index {
            slots.resize(index + 1, None);
        }
        if slots[index].is_some() {
            errors.add(key, "parameter given both positionally and by keyword");
            continue;
        }
        slots[index] = Some(value);
    }

    let args = slots
        .into_iter()
        .zip(&infos)
        .map(|(slot, info)| match slot {
            Some(value) => value,
            None => match &info.default {
                Some(default) => default.clone(),
                None if info.required => {
                    errors.add(info.name.clone(), "attribute required");
                    Value::Null
                }
                None => Value::Null,
            },
        })
        .collect();
    errors.check(args).map_err(CallError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::context::handler;
    use crate::application::plugin_loader::{Plugin, PluginError, Registrar};
    use crate::application::service_registry::ServiceDefinition;
    use crate::domain::audit::{AuditEventKind, AuditRecord};
    use crate::domain::config::{MiddlewareSpec, RateLimitClass};
    use crate::domain::credential::{AuthState, CredentialKind};
    use crate::domain::error::ErrorCode;
    use crate::domain::job::JobState;
    use crate::domain::schema::Schema;
    use crate::domain::service::{JobOptions, MethodDescriptor, ServiceMeta};
    use std::collections::BTreeSet;

    struct DiskPlugin;

    impl Plugin for DiskPlugin {
        fn name(&self) -> &str {
            "disk"
        }

        fn register(&self, registrar: &mut Registrar<'_>) -> Result<(), PluginError> {
            let disk = ServiceDefinition::plain(ServiceMeta::new("disk"))
                .method(
                    MethodDescriptor::new("query")
                        .returns(Schema::any("disks"))
                        .rate_limit("disk")
                        .audit("Query disks"),
                    handler(|_ctx, _args| async { Ok(json!([])) }),
                )
                .method(
                    MethodDescriptor::new("wipe")
                        .accepts(Schema::string("disk").required())
                        .roles(&["DISK_WRITE"])
                        .audit("Wipe disk"),
                    handler(|_ctx, _args| async { Ok(Value::Null) }),
                )
                .method(
                    MethodDescriptor::new("temperature"),
                    handler(|_ctx, _args| async {
                        if true {
                            panic!("sensor exploded");
                        }
                        Ok(Value::Null)
                    }),
                )
                .method(
                    MethodDescriptor::new("resilver"),
                    handler(|_ctx, _args| async {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok(Value::Null)
                    }),
                )
                .method(
                    MethodDescriptor::new("format")
                        .accepts(Schema::string("disk").required())
                        .job(JobOptions::default()),
                    handler(|ctx, _args| async move {
                        let job = ctx.job()?.clone();
                        job.cancelled().await;
                        Err(CallError::new(libc::ECANCELED, "Format interrupted"))
                    }),
                )
                .method(
                    MethodDescriptor::new("label")
                        .accepts(Schema::string("disk").required())
                        .pass_sender(),
                    handler(|_ctx, args| async move { Ok(Value::Array(args)) }),
                );
            registrar.service(disk)
        }
    }

    async fn disk_middleware() -> Middleware {
        let mut spec = MiddlewareSpec::default();
        spec.rate_limits
            .insert("disk".into(), RateLimitClass { calls: 1, per_seconds: 3600 });
        Middleware::builder(spec)
            .plugin(Arc::new(DiskPlugin))
            .build()
            .await
            .unwrap()
    }

    fn session_of(username: &str) -> Arc<SessionState> {
        let session = Arc::new(SessionState::new("test", Some("192.0.2.7:4000".into())));
        let credential = Credential::new(CredentialKind::LoginPassword, username, BTreeSet::new(), false);
        session.set_auth_state(AuthState::Authenticated(Arc::new(credential)));
        session
    }

    fn method_calls(middleware: &Middleware, method: &str) -> Vec<AuditRecord> {
        middleware
            .audit()
            .records()
            .into_iter()
            .filter(|r| r.entry.event == AuditEventKind::MethodCall && r.entry.event_data["method"] == method)
            .collect()
    }

    #[tokio::test]
    async fn test_rate_limited_call_is_not_audited() {
        let middleware = disk_middleware().await;
        let session = session_of("alice");

        middleware
            .dispatch(CallRequest::session(Arc::clone(&session), "disk.query", vec![]))
            .await
            .unwrap();
        let err = middleware
            .dispatch(CallRequest::session(Arc::clone(&session), "disk.query", vec![]))
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::RateLimited);
        assert_eq!(method_calls(&middleware, "disk.query").len(), 1);
        middleware.shutdown().await;
    }

    #[tokio::test]
    async fn test_unauthorized_call_is_audited() {
        let middleware = disk_middleware().await;
        let err = middleware
            .dispatch(CallRequest::session(session_of("alice"), "disk.wipe", vec![json!("sda")]))
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::NotAuthorized);
        let audited = method_calls(&middleware, "disk.wipe");
        assert_eq!(audited.len(), 1);
        assert!(!audited[0].entry.success);
        assert_eq!(audited[0].entry.event_data["authorized"], false);
        assert_eq!(audited[0].entry.event_data["authenticated"], true);
        middleware.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_method_is_internal_and_always_audited() {
        let middleware = disk_middleware().await;
        let err = middleware
            .dispatch(CallRequest::session(session_of("alice"), "disk.temperature", vec![]))
            .await
            .unwrap_err();

        let payload = err.to_payload();
        assert_eq!(payload.error, ErrorCode::Internal);
        assert!(payload.reason.contains("sensor exploded"));
        assert!(payload.trace.is_some());
        assert_eq!(payload.extra, payload.trace.clone().map(Value::String));

        let audited = method_calls(&middleware, "disk.temperature");
        assert_eq!(audited.len(), 1);
        assert!(!audited[0].entry.success);
        assert_eq!(audited[0].entry.event_data["authorized"], true);
        middleware.shutdown().await;
    }

    #[tokio::test]
    async fn test_session_call_times_out() {
        let middleware = disk_middleware().await;
        let request = CallRequest::session(session_of("alice"), "disk.resilver", vec![])
            .with_timeout(Duration::from_millis(50));
        let started = Instant::now();
        let err = middleware.dispatch(request).await.unwrap_err();

        assert_eq!(err.code(), ErrorCode::Timeout);
        assert!(started.elapsed() < Duration::from_secs(5));
        middleware.shutdown().await;
    }

    #[tokio::test]
    async fn test_job_timeout_aborts_the_job() {
        let middleware = disk_middleware().await;
        let request = CallRequest::session(session_of("alice"), "disk.format", vec![json!("sda")])
            .with_timeout(Duration::from_millis(50));
        let id = match middleware.dispatch(request).await.unwrap() {
            CallResponse::Job(id) => id,
            other => panic!("expected a job id, got {:?}", other),
        };

        let job = middleware.jobs().wait(id, Some(Duration::from_secs(5)), None).await.unwrap();
        assert_eq!(job.state, JobState::Aborted);
        assert!(job.error.unwrap().starts_with("Timed out"));
        middleware.shutdown().await;
    }

    #[tokio::test]
    async fn test_pass_sender_appends_caller_summary() {
        let middleware = disk_middleware().await;
        let response = middleware
            .dispatch(CallRequest::session(session_of("alice"), "disk.label", vec![json!("sda")]))
            .await
            .unwrap()
            .into_value();

        let args = response.as_array().unwrap();
        assert_eq!(args.len(), 2);
        assert_eq!(args[0], "sda");
        assert_eq!(args[1]["username"], "alice");
        assert_eq!(args[1]["type"], "LOGIN_PASSWORD");
        middleware.shutdown().await;
    }

    fn registry(params: Vec<Schema>) -> (SchemaRegistry, Vec<SchemaId>) {
        let mut schemas = SchemaRegistry::new();
        let ids = params.iter().map(|p| schemas.compile(p).unwrap()).collect();
        schemas.resolve().unwrap();
        (schemas, ids)
    }

    fn kwargs(value: Value) -> Option<Map<String, Value>> {
        value.as_object().cloned()
    }

    #[test]
    fn test_keyword_args_reordered_with_defaults() {
        let (schemas, ids) = registry(vec![
            Schema::string("name").required(),
            Schema::integer("count").default_value(json!(1)),
            Schema::boolean("force").default_value(json!(false)),
        ]);
        let args = normalize_args(&schemas, &ids, vec![], kwargs(json!({"force": true, "name": "tank"}))).unwrap();
        assert_eq!(args, vec![json!("tank"), json!(1), json!(true)]);

        let args = normalize_args(&schemas, &ids, vec![json!("tank")], kwargs(json!({"count": 3}))).unwrap();
        assert_eq!(args, vec![json!("tank"), json!(3)]);
    }

    #[test]
    fn test_parameter_kinds_enforced() {
        let (schemas, ids) = registry(vec![
            Schema::string("id").required().param_kind(ParamKind::PositionalOnly),
            Schema::boolean("recursive").param_kind(ParamKind::KeywordOnly),
        ]);
        assert!(normalize_args(&schemas, &ids, vec![], kwargs(json!({"id": "a"}))).is_err());
        assert!(normalize_args(&schemas, &ids, vec![json!("a"), json!(true)], None).is_err());
        let args = normalize_args(&schemas, &ids, vec![json!("a")], kwargs(json!({"recursive": true}))).unwrap();
        assert_eq!(args, vec![json!("a"), json!(true)]);
    }

    #[test]
    fn test_duplicate_and_unknown_keywords() {
        let (schemas, ids) = registry(vec![Schema::string("name").required()]);
        let err = normalize_args(&schemas, &ids, vec![json!("a")], kwargs(json!({"name": "b"}))).unwrap_err();
        assert!(matches!(err, CallError::Validation(_)));
        let (schemas, ids) = registry(vec![Schema::string("name"), Schema::string("other")]);
        assert!(normalize_args(&schemas, &ids, vec![], kwargs(json!({"nope": 1}))).is_err());
    }

    #[test]
    fn test_object_becomes_single_dict_argument() {
        let (schemas, ids) = registry(vec![Schema::dict("user_create")
            .attr(Schema::string("username").required())
            .attr(Schema::string("full_name").required())]);
        let args = normalize_args(
            &schemas,
            &ids,
            vec![],
            kwargs(json!({"username": "x", "full_name": "X"})),
        )
        .unwrap();
        assert_eq!(args, vec![json!({"username": "x", "full_name": "X"})]);
    }

    #[test]
    fn test_missing_required_keyword() {
        let (schemas, ids) = registry(vec![
            Schema::string("pool").required(),
            Schema::string("name").required(),
        ]);
        let err = normalize_args(&schemas, &ids, vec![], kwargs(json!({"name": "s1"}))).unwrap_err();
        match err {
            CallError::Validation(errors) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors.iter().next().unwrap().path, "pool");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
