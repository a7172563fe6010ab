// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0
//! End-to-end behaviour through the session runtime.

mod common;

use serde_json::{json, Value};
use std::time::Duration;

use common::{connect, eventually, login_root, middleware, Fixtures};
use middlewared_core::domain::audit::AuditEventKind;
use middlewared_core::domain::error::ErrorCode;
use middlewared_core::domain::job::JobState;
use middlewared_core::presentation::ClientError;

fn method_calls(middleware: &middlewared_core::Middleware, method: &str) -> Vec<(bool, Value)> {
    middleware
        .audit()
        .records()
        .into_iter()
        .filter(|r| r.entry.event == AuditEventKind::MethodCall && r.entry.event_data["method"] == method)
        .map(|r| (r.entry.success, r.entry.event_data))
        .collect()
}

fn remote_code(result: Result<Value, ClientError>) -> (ErrorCode, Option<Value>) {
    match result {
        Err(ClientError::Remote(payload)) => (payload.error, payload.extra),
        other => panic!("expected a remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_authenticated_ping_is_audited() {
    let fixtures = Fixtures::default();
    let middleware = middleware(&fixtures).await;
    let (mut client, _server) = connect(&middleware).await;
    login_root(&mut client).await;

    assert_eq!(client.call("core.ping", vec![]).await.unwrap(), json!("pong"));

    let audited = method_calls(&middleware, "core.ping");
    assert_eq!(audited.len(), 1);
    assert!(audited[0].0);
    middleware.shutdown().await;
}

#[tokio::test]
async fn test_missing_required_attributes_are_all_reported() {
    let fixtures = Fixtures::default();
    let middleware = middleware(&fixtures).await;
    let (mut client, _server) = connect(&middleware).await;
    login_root(&mut client).await;

    let (code, extra) = remote_code(client.call("user.create", vec![json!({})]).await);
    assert_eq!(code, ErrorCode::ValidationError);
    let extra = extra.unwrap();
    let errors: Vec<(&str, &str)> = extra
        .as_array()
        .unwrap()
        .iter()
        .map(|e| (e["path"].as_str().unwrap(), e["reason"].as_str().unwrap()))
        .collect();
    assert!(errors.contains(&("user_create.username", "attribute required")));
    assert!(errors.contains(&("user_create.full_name", "attribute required")));

    let audited = method_calls(&middleware, "user.create");
    assert_eq!(audited.len(), 1);
    assert!(!audited[0].0);
    middleware.shutdown().await;
}

#[tokio::test]
async fn test_unauthenticated_call_never_reaches_the_method() {
    let fixtures = Fixtures::default();
    let middleware = middleware(&fixtures).await;
    let (mut client, _server) = connect(&middleware).await;

    let (code, _) = remote_code(
        client
            .call("user.create", vec![json!({"username": "x", "full_name": "X"})])
            .await,
    );
    assert_eq!(code, ErrorCode::NotAuthenticated);

    let audited = method_calls(&middleware, "user.create");
    assert_eq!(audited.len(), 1);
    assert!(!audited[0].0);
    assert_eq!(audited[0].1["authenticated"], false);

    login_root(&mut client).await;
    let rows = client.call("user.query", vec![]).await.unwrap();
    assert_eq!(rows, json!([]));
    middleware.shutdown().await;
}

#[tokio::test]
async fn test_job_lifecycle_events() {
    let fixtures = Fixtures::default();
    let middleware = middleware(&fixtures).await;
    let (mut client, _server) = connect(&middleware).await;
    login_root(&mut client).await;
    let subscription = client.subscribe("core.job_*").await.unwrap();

    let job_id = client
        .call(
            "pool.snapshot.clone",
            vec![json!({"snapshot": "tank/a@s1", "dataset_dst": "tank/b"})],
        )
        .await
        .unwrap();
    let job_id = job_id.as_u64().expect("job id");

    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), client.next_event())
            .await
            .expect("job events arrive")
            .unwrap()
            .expect("connection open");
        assert_eq!(event.subscription, subscription);
        if event.fields["id"] != job_id {
            continue;
        }
        seen.push(event.name.clone());
        if event.name == "core.job_finished" {
            assert_eq!(event.fields["state"], "SUCCESS");
            assert_eq!(event.fields["result"], true);
            break;
        }
    }
    assert_eq!(seen.first().map(String::as_str), Some("core.job_added"));
    assert_eq!(fixtures.clone_count(), 1);
    middleware.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_aborts_abandoned_jobs() {
    let fixtures = Fixtures::default();
    let middleware = middleware(&fixtures).await;
    let (mut client, server) = connect(&middleware).await;
    login_root(&mut client).await;

    let job_id = client
        .call("pool.snapshot.hold", vec![json!("tank/a@s1")])
        .await
        .unwrap()
        .as_u64()
        .unwrap();
    assert!(
        eventually(Duration::from_secs(2), || {
            middleware.jobs().get(job_id).map(|j| j.state) == Some(JobState::Running)
        })
        .await
    );

    drop(client);
    server.await.unwrap().unwrap();

    assert!(
        eventually(Duration::from_secs(5), || {
            middleware.jobs().get(job_id).map(|j| j.state) == Some(JobState::Aborted)
        })
        .await
    );
    assert!(middleware.sessions().is_empty());
    middleware.shutdown().await;
}

#[tokio::test]
async fn test_update_schema_relaxes_required_attributes() {
    let fixtures = Fixtures::default();
    let middleware = middleware(&fixtures).await;
    let (mut client, _server) = connect(&middleware).await;
    login_root(&mut client).await;

    let created = client
        .call("user.create", vec![json!({"username": "alice", "full_name": "Alice"})])
        .await
        .unwrap();
    let id = created["id"].clone();
    assert!(id.is_i64());

    let updated = client.call("user.update", vec![id.clone(), json!({})]).await.unwrap();
    assert_eq!(updated["username"], "alice");

    let renamed = client
        .call("user.update", vec![id, json!({"full_name": "Alice Liddell"})])
        .await
        .unwrap();
    assert_eq!(renamed["full_name"], "Alice Liddell");

    let (code, _) = remote_code(client.call("user.create", vec![json!({})]).await);
    assert_eq!(code, ErrorCode::ValidationError);
    middleware.shutdown().await;
}

#[tokio::test]
async fn test_wildcard_subscription_sees_other_sessions() {
    let fixtures = Fixtures::default();
    let middleware = middleware(&fixtures).await;
    let (mut admin, _server) = connect(&middleware).await;
    login_root(&mut admin).await;
    admin.subscribe("*").await.unwrap();

    let (_other, _other_server) = connect(&middleware).await;
    let event = tokio::time::timeout(Duration::from_secs(5), admin.next_event())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(event.name, "core.session_connected");
    assert_eq!(event.fields["origin"], "192.0.2.10:50000");
    middleware.shutdown().await;
}

#[tokio::test]
async fn test_anonymous_session_cannot_subscribe_to_admin_events() {
    let fixtures = Fixtures::default();
    let middleware = middleware(&fixtures).await;
    let (mut client, _server) = connect(&middleware).await;

    match client.subscribe("core.session_connected").await {
        Err(ClientError::NoSub { error, .. }) => assert_eq!(error.error, ErrorCode::NotAuthenticated),
        other => panic!("expected nosub, got {:?}", other),
    }
    middleware.shutdown().await;
}
