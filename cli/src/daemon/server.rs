// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0

//! Daemon entry point: configuration, plugin load, listeners, shutdown.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};

use middlewared_core::domain::config::MiddlewareConfig;
use middlewared_core::presentation::transport;
use middlewared_core::Middleware;

use super::{remove_pid_file, write_pid_file};

pub async fn start_daemon(config_path: Option<PathBuf>) -> Result<()> {
    let pid = std::process::id();
    write_pid_file(pid)?;

    // Ensure PID file cleanup on exit
    let _guard = PidFileGuard;

    info!("middlewared starting (PID: {})", pid);

    let config = MiddlewareConfig::load_or_default(config_path).context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;
    info!("Configuration loaded: {}", config.metadata.name);

    if let Some(port) = config.spec.observability.metrics_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!("Prometheus metrics on http://{}/metrics", addr);
    }

    let middleware = Middleware::builder(config.spec)
        .build()
        .await
        .context("Failed to start middleware")?;
    let plugins: Vec<&str> = middleware.plugins().collect();
    info!("Loaded plugins: {}", plugins.join(", "));

    let mut listeners = tokio::spawn(transport::serve(middleware.clone()));

    tokio::select! {
        _ = shutdown_signal() => {}
        served = &mut listeners => {
            match served {
                Ok(Ok(())) => info!("Listeners stopped"),
                Ok(Err(e)) => error!("Listener failed: {:#}", e),
                Err(e) => error!("Listener task panicked: {}", e),
            }
        }
    }

    info!("middlewared shutting down");
    middleware.shutdown().await;
    if !listeners.is_finished() {
        match listeners.await {
            Ok(result) => result?,
            Err(e) => error!("Listener task panicked: {}", e),
        }
    }

    info!("middlewared stopped");
    Ok(())
}

struct PidFileGuard;

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        let _ = remove_pid_file();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
