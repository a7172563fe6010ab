// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0

// Audit Sink - append-only JSON-lines log of audit records
//
// Stamping (sequence number + millisecond timestamp) happens under one lock,
// so sequence order and timestamp order agree process-wide. Serialized lines
// are buffered and written by a flush task on a short timer and on shutdown.
// A bounded in-memory ring serves `audit.query`.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::domain::audit::{AuditEntry, AuditRecord};
use crate::domain::config::AuditConfig;
use crate::domain::error::CallError;
use crate::domain::filter::{filter_list, Filter, QueryOptions};

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Failed to write audit log {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize audit record: {0}")]
    Serialization(#[from] serde_json::Error),
}

struct SinkState {
    next_seq: u64,
    last_timestamp: Option<DateTime<Utc>>,
    ring: VecDeque<AuditRecord>,
    pending: Vec<String>,
}

pub struct AuditSink {
    path: Option<PathBuf>,
    flush_interval: Duration,
    ring_size: usize,
    state: Mutex<SinkState>,
    // Serializes file writers so flushed batches keep their order.
    file_lock: tokio::sync::Mutex<()>,
}

impl AuditSink {
    pub fn new(config: &AuditConfig) -> Self {
        Self {
            path: config.path.clone(),
            flush_interval: Duration::from_millis(config.flush_interval_ms.clamp(1, 5000)),
            ring_size: config.memory_records.max(1),
            state: Mutex::new(SinkState {
                next_seq: 1,
                last_timestamp: None,
                ring: VecDeque::new(),
                pending: Vec::new(),
            }),
            file_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Memory-only sink.
    pub fn in_memory() -> Self {
        Self::new(&AuditConfig::default())
    }

    /// Resume numbering after records already on disk.
    pub async fn resume(&self) -> Result<(), AuditError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(AuditError::Io {
                    path: path.clone(),
                    source,
                })
            }
        };
        let mut state = self.state.lock();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<AuditRecord>(line) {
                Ok(record) => {
                    state.next_seq = state.next_seq.max(record.seq + 1);
                    state.last_timestamp = Some(match state.last_timestamp {
                        Some(last) => last.max(record.timestamp),
                        None => record.timestamp,
                    });
                    state.ring.push_back(record);
                    if state.ring.len() > self.ring_size {
                        state.ring.pop_front();
                    }
                }
                Err(e) => debug!("Skipping unreadable audit line: {}", e),
            }
        }
        info!("Audit log resumed at sequence {}", state.next_seq);
        Ok(())
    }

    /// Stamp and append one record.
    pub fn record(&self, entry: AuditEntry) -> AuditRecord {
        let now = Utc::now()
            .duration_trunc(TimeDelta::milliseconds(1))
            .unwrap_or_else(|_| Utc::now());
        let mut state = self.state.lock();
        let timestamp = match state.last_timestamp {
            Some(last) if last > now => last,
            _ => now,
        };
        let record = AuditRecord::new(state.next_seq, timestamp, entry);
        state.next_seq += 1;
        state.last_timestamp = Some(timestamp);

        if self.path.is_some() {
            match serde_json::to_string(&record) {
                Ok(line) => state.pending.push(line),
                Err(e) => error!("Failed to serialize audit record {}: {}", record.seq, e),
            }
        }
        state.ring.push_back(record.clone());
        if state.ring.len() > self.ring_size {
            state.ring.pop_front();
        }
        record
    }

    /// Write buffered lines to disk. On failure the lines stay buffered for the next flush.
    pub async fn flush(&self) -> Result<(), AuditError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.file_lock.lock().await;
        let lines = std::mem::take(&mut self.state.lock().pending);
        if lines.is_empty() {
            return Ok(());
        }

        if let Err(e) = append_lines(path, &lines).await {
            let mut state = self.state.lock();
            let newer = std::mem::replace(&mut state.pending, lines);
            state.pending.extend(newer);
            return Err(e);
        }
        debug!("Flushed {} audit records", lines.len());
        Ok(())
    }

    /// Periodic flush until `shutdown` fires, then a final flush.
    pub fn spawn_flusher(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let sink = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sink.flush_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = sink.flush().await {
                            error!("Audit flush failed: {}", e);
                        }
                    }
                    _ = shutdown.cancelled() => {
                        if let Err(e) = sink.flush().await {
                            error!("Final audit flush failed: {}", e);
                        }
                        break;
                    }
                }
            }
        })
    }

    /// Filter DSL over the in-memory ring.
    pub fn query(&self, filters: &[Filter], options: &QueryOptions) -> Result<Value, CallError> {
        let rows: Vec<Value> = self
            .state
            .lock()
            .ring
            .iter()
            .filter_map(|r| serde_json::to_value(r).ok())
            .collect();
        filter_list(rows, filters, options)
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.state.lock().ring.iter().cloned().collect()
    }

    pub fn last_seq(&self) -> u64 {
        self.state.lock().next_seq - 1
    }
}

async fn append_lines(path: &Path, lines: &[String]) -> Result<(), AuditError> {
    let io_err = |source| AuditError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(io_err)?;
    let mut buffer = lines.join("\n");
    buffer.push('\n');
    file.write_all(buffer.as_bytes()).await.map_err(io_err)?;
    file.sync_data().await.map_err(io_err)?;
    Ok(())
}
