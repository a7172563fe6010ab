// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0
//! Shared fixtures: a plugin with a user CRUD service and snapshot jobs,
//! and in-process connections to the session runtime.

#![allow(dead_code)]

use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use middlewared_core::application::authentication::hash_password_with_iterations;
use middlewared_core::application::{handler, Plugin, PluginError, Registrar, ServiceDefinition, StoreCrudBackend};
use middlewared_core::domain::config::{MiddlewareSpec, UserEntry};
use middlewared_core::domain::credential::FULL_ADMIN;
use middlewared_core::domain::error::CallError;
use middlewared_core::domain::schema::Schema;
use middlewared_core::domain::service::{JobOptions, MethodDescriptor, ServiceMeta};
use middlewared_core::presentation::transport::line_framed;
use middlewared_core::presentation::{run_session, Client, Peer, TransportError};
use middlewared_core::Middleware;

pub const ROOT_PASSWORD: &str = "abcd1234";

/// Counts how often the snapshot clone job body ran.
#[derive(Default)]
pub struct Fixtures {
    pub clones: Arc<AtomicUsize>,
}

impl Fixtures {
    pub fn clone_count(&self) -> usize {
        self.clones.load(Ordering::SeqCst)
    }
}

pub struct FixturePlugin {
    clones: Arc<AtomicUsize>,
}

impl Plugin for FixturePlugin {
    fn name(&self) -> &str {
        "fixtures"
    }

    fn register(&self, registrar: &mut Registrar<'_>) -> Result<(), PluginError> {
        let user = Schema::dict("user")
            .attr(Schema::string("username").required().non_empty())
            .attr(Schema::string("full_name").required())
            .attr(Schema::string("email").nullable().default_value(Value::Null));
        registrar.service(ServiceDefinition::crud(
            ServiceMeta::new("user"),
            user,
            Arc::new(StoreCrudBackend::new("account_user")),
        ))?;

        let clones = Arc::clone(&self.clones);
        let snapshot = ServiceDefinition::plain(ServiceMeta::new("pool.snapshot"))
            .method(
                MethodDescriptor::new("clone")
                    .accepts(
                        Schema::dict("snapshot_clone")
                            .attr(Schema::string("snapshot").required())
                            .attr(Schema::string("dataset_dst").required()),
                    )
                    .returns(Schema::boolean("cloned"))
                    .job(JobOptions::default().lock_with(|args| {
                        args.first()
                            .and_then(|a| a.get("dataset_dst"))
                            .and_then(Value::as_str)
                            .map(|d| format!("clone_{}", d))
                    }))
                    .audit("Clone snapshot"),
                handler(move |ctx, _args| {
                    let clones = Arc::clone(&clones);
                    async move {
                        let job = ctx.job()?;
                        job.set_progress(50, "Cloning");
                        clones.fetch_add(1, Ordering::SeqCst);
                        job.set_progress(100, "Cloned");
                        Ok(json!(true))
                    }
                }),
            )
            .method(
                MethodDescriptor::new("hold")
                    .accepts(Schema::string("snapshot").required())
                    .returns(Schema::any("result"))
                    .job(JobOptions::default().abandon_on_disconnect()),
                handler(|ctx, _args| async move {
                    let job = ctx.job()?.clone();
                    job.set_progress(10, "Holding");
                    job.cancelled().await;
                    Err(CallError::new(libc::ECANCELED, "Hold released"))
                }),
            );
        registrar.service(snapshot)
    }
}

pub fn spec() -> MiddlewareSpec {
    let mut spec = MiddlewareSpec::default();
    spec.auth.users.push(UserEntry {
        username: "root".into(),
        uid: 0,
        password_hash: hash_password_with_iterations(ROOT_PASSWORD, 1000),
        roles: vec![FULL_ADMIN.into()],
        otp_secret: None,
        locked: false,
    });
    spec
}

pub async fn middleware(fixtures: &Fixtures) -> Middleware {
    Middleware::builder(spec())
        .plugin(Arc::new(FixturePlugin {
            clones: Arc::clone(&fixtures.clones),
        }))
        .build()
        .await
        .expect("middleware builds")
}

/// Connect a client to the session runtime over an in-memory pipe.
pub async fn connect(middleware: &Middleware) -> (Client, tokio::task::JoinHandle<Result<(), TransportError>>) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let max_frame_bytes = middleware.config().server.max_frame_bytes;
    let (inbound, outbound) = line_framed(server_io, max_frame_bytes);
    let server = tokio::spawn(run_session(
        middleware.clone(),
        Peer::new("test", Some("192.0.2.10:50000".into())),
        inbound,
        outbound,
    ));
    let client = Client::connect(client_io).await.expect("handshake");
    (client, server)
}

pub async fn login_root(client: &mut Client) {
    let mut data = Map::new();
    data.insert("mechanism".into(), json!("PASSWORD_PLAIN"));
    data.insert("username".into(), json!("root"));
    data.insert("password".into(), json!(ROOT_PASSWORD));
    let response = client
        .call("auth.login_ex", vec![Value::Object(data)])
        .await
        .expect("login call");
    assert_eq!(response["response_type"], "SUCCESS");
}

/// Poll `check` until it holds or `limit` passes.
pub async fn eventually<F: FnMut() -> bool>(limit: Duration, mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
