// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0
//! Built-in `core` and `audit` services and the core event types.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::application::context::{arg, handler, CallContext};
use crate::application::middleware::job_outcome;
use crate::application::service_registry::ServiceDefinition;
use crate::application::shapes::query_params;
use crate::domain::credential::{Credential, FULL_ADMIN, JOB_READ, SYSTEM_AUDIT_READ};
use crate::domain::error::CallError;
use crate::domain::events::{
    EventType, JOB_ADDED, JOB_FINISHED, JOB_UPDATED, SESSION_CONNECTED, SESSION_DISCONNECTED,
};
use crate::domain::filter::{Filter, QueryOptions};
use crate::domain::job::JobId;
use crate::domain::schema::Schema;
use crate::domain::service::{MethodDescriptor, ServiceMeta};
use crate::infrastructure::event_bus::EventAccess;

const USER_ABORT_REASON: &str = "Aborted by user";

pub(crate) fn event_types() -> Vec<EventType> {
    vec![
        EventType::new(SESSION_CONNECTED)
            .roles(&[FULL_ADMIN])
            .describe("A client session connected"),
        EventType::new(SESSION_DISCONNECTED)
            .payload(Schema::dict("session_disconnected").attr(Schema::string("id").required()))
            .roles(&[FULL_ADMIN])
            .describe("A client session disconnected"),
        EventType::new(JOB_ADDED).describe("A job was queued"),
        EventType::new(JOB_UPDATED).describe("A job started or reported progress"),
        EventType::new(JOB_FINISHED).describe("A job reached SUCCESS, FAILED or ABORTED"),
    ]
}

/// Job events reach the job's owner and holders of `JOB_READ`.
pub(crate) fn job_event_access() -> EventAccess {
    Arc::new(|credential: &Credential, fields: &Value| {
        credential.has_role(JOB_READ)
            || fields
                .pointer("/credentials/username")
                .and_then(Value::as_str)
                .map(|owner| owner == credential.username)
                .unwrap_or(false)
    })
}

fn job_id(args: &[Value]) -> Result<JobId, CallError> {
    arg(args, 0)
        .as_u64()
        .ok_or_else(|| CallError::validation("id", "Not a job id"))
}

fn query_jobs(ctx: &CallContext, args: &[Value]) -> Result<Value, CallError> {
    let credential = ctx.credential()?;
    let filters = Filter::parse_list(&arg(args, 0))?;
    let options = QueryOptions::from_value(&arg(args, 1))?;
    ctx.middleware.jobs().query(credential, &filters, &options)
}

pub(crate) fn service_definitions() -> Vec<ServiceDefinition> {
    vec![core_service(), audit_service()]
}

fn core_service() -> ServiceDefinition {
    let (filters, options) = query_params();

    ServiceDefinition::plain(ServiceMeta::new("core"))
        .method(
            MethodDescriptor::new("ping")
                .returns(Schema::string("pong"))
                .audit("Ping")
                .describe("Liveness probe"),
            handler(|_ctx, _args| async { Ok(json!("pong")) }),
        )
        .method(
            MethodDescriptor::new("get_services")
                .returns(Schema::list("services", vec![Schema::any("service")]))
                .describe("Registered services and their configuration"),
            handler(|ctx, _args| async move { Ok(ctx.middleware.services().describe_services(false)) }),
        )
        .method(
            MethodDescriptor::new("get_methods")
                .accepts(Schema::string("service").nullable().default_value(Value::Null))
                .returns(Schema::list("methods", vec![Schema::any("method")]))
                .describe("Method descriptors with their argument and result schemas"),
            handler(|ctx, args| async move {
                let service = arg(&args, 0);
                let middleware = &ctx.middleware;
                Ok(middleware
                    .services()
                    .describe_methods(middleware.schemas(), service.as_str(), false))
            }),
        )
        .method(
            MethodDescriptor::new("get_events")
                .returns(Schema::list("events", vec![Schema::any("event")]))
                .describe("Event types the caller may subscribe to"),
            handler(|ctx, _args| async move {
                let credential = ctx.credential()?;
                Ok(Value::Array(ctx.middleware.events().describe(credential)))
            }),
        )
        .method(
            MethodDescriptor::new("get_jobs")
                .accepts(filters.clone())
                .accepts(options.clone())
                .returns(Schema::any("jobs"))
                .describe("Query the job table"),
            handler(|ctx, args| async move { query_jobs(&ctx, &args) }),
        )
        .method(
            MethodDescriptor::new("job_query")
                .accepts(filters)
                .accepts(options)
                .returns(Schema::any("jobs"))
                .describe("Query the job table"),
            handler(|ctx, args| async move { query_jobs(&ctx, &args) }),
        )
        .method(
            MethodDescriptor::new("job_abort")
                .accepts(Schema::integer("id").required().min(1))
                .returns(Schema::any("result"))
                .audit_with("Abort job", |args: &[Value]| {
                    args.first().and_then(Value::as_u64).map(|id| format!("Abort job {}", id))
                })
                .describe("Request cancellation of a job"),
            handler(|ctx, args| async move {
                let id = job_id(&args)?;
                let credential = Arc::clone(ctx.credential()?);
                ctx.middleware
                    .jobs()
                    .abort(id, Some(credential.as_ref()), USER_ABORT_REASON)
                    .await?;
                Ok(Value::Null)
            }),
        )
        .method(
            MethodDescriptor::new("job_wait")
                .accepts(Schema::integer("id").required().min(1))
                .accepts(Schema::integer("timeout").nullable().min(1).default_value(Value::Null))
                .returns(Schema::any("result"))
                .describe("Wait for a job to finish and return its result"),
            handler(|ctx, args| async move {
                let id = job_id(&args)?;
                let timeout = arg(&args, 1).as_u64().map(Duration::from_secs);
                let credential = Arc::clone(ctx.credential()?);
                let job = tokio::select! {
                    job = ctx.middleware.jobs().wait(id, timeout, Some(credential.as_ref())) => job?,
                    _ = ctx.cancel.cancelled() => {
                        return Err(CallError::new(libc::ECANCELED, "Wait cancelled"));
                    }
                };
                job_outcome(job)
            }),
        )
        .method(
            MethodDescriptor::new("job_logs_fd")
                .accepts(Schema::integer("id").required().min(1))
                .returns(Schema::integer("lines"))
                .streaming()
                .describe("Stream a job's log lines as chunks until the job finishes"),
            handler(|ctx, args| async move { stream_job_logs(ctx, job_id(&args)?).await }),
        )
        .method(
            MethodDescriptor::new("subscribe")
                .accepts(Schema::string("name").required().non_empty())
                .returns(Schema::string("id"))
                .describe("Subscribe the calling session to events matching a mask"),
            handler(|ctx, args| async move {
                let session = ctx.session()?;
                let mask = arg(&args, 0);
                let mask = mask.as_str().unwrap_or_default();
                let id = Uuid::new_v4().to_string();
                ctx.middleware.events().subscribe(session.id, &id, mask)?;
                Ok(json!(id))
            }),
        )
        .method(
            MethodDescriptor::new("unsubscribe")
                .accepts(Schema::string("id").required())
                .returns(Schema::boolean("removed"))
                .describe("Drop a subscription of the calling session"),
            handler(|ctx, args| async move {
                let session = ctx.session()?;
                let id = arg(&args, 0);
                let removed = ctx
                    .middleware
                    .events()
                    .unsubscribe(session.id, id.as_str().unwrap_or_default());
                Ok(Value::Bool(removed))
            }),
        )
        .method(
            MethodDescriptor::new("sessions")
                .returns(Schema::list("sessions", vec![Schema::any("session")]))
                .roles(&[FULL_ADMIN])
                .describe("Connected client sessions"),
            handler(|ctx, _args| async move {
                let sessions = ctx.middleware.sessions();
                Ok(Value::Array(sessions.iter().map(|s| s.info()).collect()))
            }),
        )
}

async fn stream_job_logs(ctx: CallContext, id: JobId) -> Result<Value, CallError> {
    let credential = Arc::clone(ctx.credential()?);
    let jobs = Arc::clone(ctx.middleware.jobs());
    if !jobs.is_visible(id, &credential) {
        return Err(CallError::MatchNotFound(format!("Job {} does not exist", id)));
    }

    let mut offset = 0;
    loop {
        let Some((lines, finished, notify)) = jobs.logs_since(id, offset) else {
            return Err(CallError::MatchNotFound(format!("Job {} does not exist", id)));
        };
        // Register interest before sending so a line appended meanwhile wakes us.
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        offset += lines.len();
        if !lines.is_empty() {
            ctx.send_chunk(json!(lines.join("\n"))).await?;
        }
        if finished {
            debug!("Streamed {} log lines of job {}", offset, id);
            return Ok(json!(offset));
        }
        tokio::select! {
            _ = notified => {}
            _ = ctx.cancel.cancelled() => {
                return Err(CallError::new(libc::ECANCELED, "Log stream cancelled"));
            }
        }
    }
}

fn audit_service() -> ServiceDefinition {
    let (filters, options) = query_params();
    ServiceDefinition::plain(ServiceMeta::new("audit")).method(
        MethodDescriptor::new("query")
            .accepts(filters)
            .accepts(options)
            .returns(Schema::any("records"))
            .roles(&[SYSTEM_AUDIT_READ])
            .describe("Query recent audit records"),
        handler(|ctx, args| async move {
            let filters = Filter::parse_list(&arg(&args, 0))?;
            let options = QueryOptions::from_value(&arg(&args, 1))?;
            ctx.middleware.audit().query(&filters, &options)
        }),
    )
}
