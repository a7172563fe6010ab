// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0
//! Local Unix socket listener.
//!
//! The peer's uid comes from the kernel, so a connection is authenticated
//! before its first frame: root maps to a full-admin credential and other
//! uids to the matching local account, when there is one.

use anyhow::{Context, Result};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use super::line_framed;
use crate::application::middleware::Middleware;
use crate::presentation::session::{run_session, Peer};

pub async fn serve(middleware: Middleware, path: PathBuf) -> Result<()> {
    let listener = bind(&path)?;
    info!("Unix socket listener on {}", path.display());

    let shutdown = middleware.shutdown_token();
    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!("Unix socket accept failed: {}", e);
                    continue;
                }
            },
        };
        let middleware = middleware.clone();
        tokio::spawn(async move {
            let peer = match identify(&middleware, &stream) {
                Ok(peer) => peer,
                Err(e) => {
                    warn!("Rejecting Unix socket peer: {:#}", e);
                    return;
                }
            };
            let origin = peer.origin.clone().unwrap_or_default();
            let max_frame_bytes = middleware.config().server.max_frame_bytes;
            let (inbound, outbound) = line_framed(stream, max_frame_bytes);
            if let Err(e) = run_session(middleware, peer, inbound, outbound).await {
                debug!("Unix session {} ended: {}", origin, e);
            }
        });
    }

    if let Err(e) = std::fs::remove_file(&path) {
        debug!("Could not remove {}: {}", path.display(), e);
    }
    info!("Unix socket listener stopped");
    Ok(())
}

fn bind(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create socket directory {}", parent.display()))?;
    }
    // A stale socket from a previous run blocks bind.
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
    }
    let listener =
        UnixListener::bind(path).with_context(|| format!("Failed to bind Unix socket {}", path.display()))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    Ok(listener)
}

fn identify(middleware: &Middleware, stream: &UnixStream) -> Result<Peer> {
    let uid = stream
        .peer_cred()
        .context("Failed to read peer credentials")?
        .uid();
    let peer = Peer::new("unix", Some(format!("unix:{}", uid)));
    Ok(match middleware.authenticator().credential_for_uid(uid) {
        Some(credential) => peer.with_credential(credential),
        None => peer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::MiddlewareSpec;
    use crate::presentation::client::Client;
    use serde_json::json;

    #[tokio::test]
    async fn test_local_peer_is_authenticated_by_uid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("middleware.sock");
        let mut spec = MiddlewareSpec::default();
        spec.server.unix_socket = path.clone();
        let middleware = Middleware::builder(spec).build().await.unwrap();
        let server = tokio::spawn(serve(middleware.clone(), path.clone()));

        let mut client = loop {
            match Client::connect_unix(&path).await {
                Ok(client) => break client,
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(20)).await,
            }
        };
        let sessions = middleware.sessions();
        assert_eq!(sessions.len(), 1);
        let uid = unsafe { libc::getuid() };
        assert_eq!(sessions[0].origin.as_deref(), Some(format!("unix:{}", uid).as_str()));

        if uid == 0 {
            assert_eq!(client.call("core.ping", vec![]).await.unwrap(), json!("pong"));
            assert!(sessions[0].is_authenticated());
        }

        middleware.shutdown().await;
        server.await.unwrap().unwrap();
        assert!(!path.exists());
    }
}
