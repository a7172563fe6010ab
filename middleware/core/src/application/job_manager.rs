// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0
//! # Job Manager
//!
//! Owns the per-process job table and runs job-mode methods on a worker pool
//! sized independently from the dispatcher.
//!
//! ## Scheduling
//!
//! ```text
//! submit ──► WAITING queue (FIFO) ──schedule()──► RUNNING ──► SUCCESS | FAILED | ABORTED
//!                 │                      │
//!                 │                      ├─ needs a worker permit (jobs.workers)
//!                 │                      └─ needs its lock key free; a blocked key
//!                 │                         blocks every later job with that key
//!                 └─ abort ──► ABORTED
//! ```
//!
//! There is no scheduler task: `schedule()` runs after every submission and
//! after every job finishes. Events are published after the table lock is
//! released.
//!
//! ## Cancellation
//!
//! `abort` cancels the job's token. A method that ignores it gets
//! `jobs.abort_grace_secs` before its future is dropped, which closes the
//! I/O resources it owns. Either way the job ends in `ABORTED`.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::panics;
use crate::domain::config::JobsConfig;
use crate::domain::credential::{Credential, CredentialSummary, JOB_READ};
use crate::domain::error::CallError;
use crate::domain::events::{JOB_ADDED, JOB_FINISHED, JOB_UPDATED};
use crate::domain::filter::{filter_list, Filter, QueryOptions};
use crate::domain::job::{Job, JobId, JobState};
use crate::domain::repository::ConfigStore;
use crate::infrastructure::event_bus::EventBus;

/// Config-store table mirroring durable jobs.
pub const JOBS_TABLE: &str = "core.jobs";

const RESTART_REASON: &str = "interrupted by restart";
const DISCONNECT_REASON: &str = "Session disconnected";

/// Future that runs the method body once the job is scheduled.
pub type JobRunner = Box<dyn FnOnce(JobHandle) -> BoxFuture<'static, Result<Value, CallError>> + Send>;

/// Everything the manager needs to queue one job.
pub struct JobSubmission {
    pub method: String,
    /// Validated arguments with secrets redacted; stored on the job row.
    pub arguments: Vec<Value>,
    pub description: Option<String>,
    pub lock_key: Option<String>,
    pub queue_limit: Option<usize>,
    pub abandon_on_disconnect: bool,
    pub durable: bool,
    pub transient: bool,
    pub abortable: bool,
    pub read_roles: Vec<String>,
    pub owner_session: Option<Uuid>,
    pub credential: Option<CredentialSummary>,
    pub runner: JobRunner,
}

impl JobSubmission {
    pub fn new(method: impl Into<String>, arguments: Vec<Value>, runner: JobRunner) -> Self {
        Self {
            method: method.into(),
            arguments,
            description: None,
            lock_key: None,
            queue_limit: None,
            abandon_on_disconnect: false,
            durable: false,
            transient: false,
            abortable: true,
            read_roles: Vec::new(),
            owner_session: None,
            credential: None,
            runner,
        }
    }
}

struct JobSlot {
    job: Job,
    read_roles: Vec<String>,
    cancel: CancellationToken,
    abort_reason: Option<String>,
    state_tx: watch::Sender<JobState>,
    log_notify: Arc<Notify>,
    runner: Option<JobRunner>,
}

impl JobSlot {
    fn new(job: Job, read_roles: Vec<String>, runner: Option<JobRunner>) -> Self {
        let (state_tx, _) = watch::channel(job.state);
        Self {
            job,
            read_roles,
            cancel: CancellationToken::new(),
            abort_reason: None,
            state_tx,
            log_notify: Arc::new(Notify::new()),
            runner,
        }
    }

    fn visible_to(&self, credential: &Credential) -> bool {
        credential.full_admin
            || credential.has_role(JOB_READ)
            || self
                .job
                .credentials
                .as_ref()
                .map(|owner| owner.username == credential.username)
                .unwrap_or(false)
            || (!self.read_roles.is_empty() && credential.has_any_role(&self.read_roles))
    }
}

#[derive(Default)]
struct JobTable {
    jobs: BTreeMap<JobId, JobSlot>,
    waiting: VecDeque<JobId>,
    running_locks: HashSet<String>,
    next_id: JobId,
}

impl JobTable {
    fn waiting_on(&self, key: &str) -> usize {
        self.waiting
            .iter()
            .filter(|id| {
                self.jobs
                    .get(id)
                    .and_then(|slot| slot.job.lock_key.as_deref())
                    == Some(key)
            })
            .count()
    }

    /// Drop the oldest terminal job while over capacity.
    fn evict(&mut self, max_jobs: usize) {
        while self.jobs.len() > max_jobs {
            let oldest = self
                .jobs
                .iter()
                .find(|(_, slot)| slot.job.state.is_terminal())
                .map(|(id, _)| *id);
            match oldest {
                Some(id) => {
                    self.jobs.remove(&id);
                }
                None => break,
            }
        }
    }
}

enum Completion {
    Finished(Result<Value, CallError>),
    Aborted,
}

pub struct JobManager {
    table: Mutex<JobTable>,
    workers: Arc<Semaphore>,
    events: Arc<EventBus>,
    store: Arc<dyn ConfigStore>,
    config: JobsConfig,
}

impl JobManager {
    pub fn new(config: &JobsConfig, events: Arc<EventBus>, store: Arc<dyn ConfigStore>) -> Arc<Self> {
        Arc::new(Self {
            table: Mutex::new(JobTable {
                next_id: 1,
                ..JobTable::default()
            }),
            workers: Arc::new(Semaphore::new(config.workers.max(1))),
            events,
            store,
            config: config.clone(),
        })
    }

    /// Queue a job and try to start it. Returns the job id.
    pub async fn submit(self: &Arc<Self>, submission: JobSubmission) -> Result<JobId, CallError> {
        let JobSubmission {
            method,
            arguments,
            description,
            lock_key,
            queue_limit,
            abandon_on_disconnect,
            durable,
            transient,
            abortable,
            read_roles,
            owner_session,
            credential,
            runner,
        } = submission;

        let job = {
            let mut table = self.table.lock();
            if let (Some(key), Some(limit)) = (&lock_key, queue_limit) {
                let waiting = table.waiting_on(key);
                let full = if limit == 0 {
                    waiting > 0 || table.running_locks.contains(key)
                } else {
                    waiting >= limit
                };
                if full {
                    return Err(CallError::LockQueueFull(key.clone()));
                }
            }

            let id = table.next_id;
            table.next_id += 1;
            let mut job = Job::new(id, method, arguments);
            job.description = description;
            job.lock_key = lock_key;
            job.abandon_on_disconnect = abandon_on_disconnect;
            job.durable = durable;
            job.transient = transient;
            job.abortable = abortable;
            job.owner_session = owner_session;
            job.credentials = credential;

            table.jobs.insert(id, JobSlot::new(job.clone(), read_roles, Some(runner)));
            // Published under the table lock so no scheduler can report the job first.
            self.announce(JOB_ADDED, &job);
            table.waiting.push_back(id);
            table.evict(self.config.max_jobs);
            job
        };

        debug!("Job {} ({}) queued", job.id, job.method);
        metrics::counter!("middleware_jobs_total", "state" => JobState::Waiting.as_str()).increment(1);
        self.persist(&job).await;
        self.schedule();
        Ok(job.id)
    }

    /// Start every waiting job whose lock key is free while permits remain.
    fn schedule(self: &Arc<Self>) {
        let mut started: Vec<(Job, JobRunner, CancellationToken, OwnedSemaphorePermit)> = Vec::new();
        {
            let mut table = self.table.lock();
            let mut blocked: HashSet<String> = HashSet::new();
            let mut index = 0;
            while index < table.waiting.len() {
                let id = table.waiting[index];
                let key = table.jobs.get(&id).and_then(|slot| slot.job.lock_key.clone());
                if let Some(key) = &key {
                    if blocked.contains(key) || table.running_locks.contains(key) {
                        blocked.insert(key.clone());
                        index += 1;
                        continue;
                    }
                }
                let Ok(permit) = Arc::clone(&self.workers).try_acquire_owned() else {
                    break;
                };
                table.waiting.remove(index);
                let Some(slot) = table.jobs.get_mut(&id) else {
                    continue;
                };
                let Some(runner) = slot.runner.take() else {
                    continue;
                };
                if slot.job.start().is_err() {
                    continue;
                }
                slot.state_tx.send_replace(JobState::Running);
                let job = slot.job.clone();
                let cancel = slot.cancel.clone();
                if let Some(key) = key {
                    table.running_locks.insert(key);
                }
                started.push((job, runner, cancel, permit));
            }
        }

        for (job, runner, cancel, permit) in started {
            metrics::counter!("middleware_jobs_total", "state" => JobState::Running.as_str()).increment(1);
            self.announce(JOB_UPDATED, &job);
            self.spawn_job(job.id, runner, cancel, permit);
        }
    }

    fn spawn_job(self: &Arc<Self>, id: JobId, runner: JobRunner, cancel: CancellationToken, permit: OwnedSemaphorePermit) {
        let manager = Arc::clone(self);
        let grace = Duration::from_secs(self.config.abort_grace_secs);
        tokio::spawn(async move {
            let handle = JobHandle {
                id,
                manager: Arc::clone(&manager),
                cancel: cancel.clone(),
            };
            panics::install_hook();
            let body = AssertUnwindSafe(runner(handle)).catch_unwind();
            tokio::pin!(body);

            let completion = tokio::select! {
                outcome = &mut body => match outcome {
                    Ok(result) => Completion::Finished(result),
                    Err(panic) => Completion::Finished(Err(panics::caught(panic))),
                },
                _ = cancel.cancelled() => {
                    if tokio::time::timeout(grace, &mut body).await.is_err() {
                        warn!("Job {} ignored cancellation for {:?}; dropping it", id, grace);
                    }
                    Completion::Aborted
                }
            };
            // A job that observes cancellation and returns normally still counts as aborted.
            let completion = if cancel.is_cancelled() {
                Completion::Aborted
            } else {
                completion
            };
            drop(permit);
            manager.finish(id, completion).await;
        });
    }

    async fn finish(self: &Arc<Self>, id: JobId, completion: Completion) {
        let job = {
            let mut table = self.table.lock();
            let Some(slot) = table.jobs.get_mut(&id) else {
                return;
            };
            let transition = match completion {
                Completion::Finished(Ok(result)) => slot.job.succeed(result),
                Completion::Finished(Err(error)) => slot.job.fail(&error),
                Completion::Aborted => {
                    let reason = slot.abort_reason.clone().unwrap_or_else(|| "Job aborted".to_string());
                    slot.job.abort(reason)
                }
            };
            if let Err(e) = transition {
                warn!("Job {}: {}", id, e);
            }
            slot.state_tx.send_replace(slot.job.state);
            slot.log_notify.notify_waiters();
            let job = slot.job.clone();
            if let Some(key) = &job.lock_key {
                table.running_locks.remove(key);
            }
            job
        };

        info!("Job {} ({}) finished: {}", job.id, job.method, job.state.as_str());
        metrics::counter!("middleware_jobs_total", "state" => job.state.as_str()).increment(1);
        self.announce(JOB_FINISHED, &job);
        self.persist(&job).await;
        self.write_log_file(id).await;
        self.schedule();
    }

    fn announce(&self, event: &str, job: &Job) {
        if job.transient {
            return;
        }
        match serde_json::to_value(job) {
            Ok(fields) => self.events.publish(event, fields),
            Err(e) => warn!("Could not serialize job {}: {}", job.id, e),
        }
    }

    async fn persist(&self, job: &Job) {
        if !job.durable {
            return;
        }
        let row = match serde_json::to_value(job) {
            Ok(row) => row,
            Err(e) => {
                warn!("Could not serialize job {}: {}", job.id, e);
                return;
            }
        };
        if let Err(e) = self.store.upsert(JOBS_TABLE, job.id as i64, row).await {
            warn!("Could not persist job {}: {}", job.id, e);
        }
    }

    async fn write_log_file(&self, id: JobId) {
        let Some(dir) = &self.config.logs_dir else {
            return;
        };
        let lines = match self.table.lock().jobs.get(&id) {
            Some(slot) if !slot.job.logs().is_empty() => slot.job.logs().join("\n"),
            _ => return,
        };
        let path: PathBuf = dir.join(format!("{}.log", id));
        if let Err(e) = tokio::fs::write(&path, lines + "\n").await {
            warn!("Could not write job log {}: {}", path.display(), e);
        }
    }

    /// Reload durable rows. Rows that were not terminal are aborted.
    pub async fn restore(&self) -> Result<usize, CallError> {
        let rows = self.store.list(JOBS_TABLE).await?;
        let mut restored = Vec::new();
        for row in rows {
            let mut job: Job = match serde_json::from_value(row) {
                Ok(job) => job,
                Err(e) => {
                    warn!("Skipping unreadable job row: {}", e);
                    continue;
                }
            };
            if !job.state.is_terminal() {
                if let Err(e) = job.abort(RESTART_REASON) {
                    warn!("Job {}: {}", job.id, e);
                }
                self.persist(&job).await;
            }
            restored.push(job);
        }

        let count = restored.len();
        let mut table = self.table.lock();
        for job in restored {
            table.next_id = table.next_id.max(job.id + 1);
            table.jobs.insert(job.id, JobSlot::new(job, Vec::new(), None));
        }
        table.evict(self.config.max_jobs);
        if count > 0 {
            info!("Restored {} durable jobs; next job id {}", count, table.next_id);
        }
        Ok(count)
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        self.table.lock().jobs.get(&id).map(|slot| slot.job.clone())
    }

    /// Job rows visible to `credential`, filtered with the query DSL.
    pub fn query(&self, credential: &Credential, filters: &[Filter], options: &QueryOptions) -> Result<Value, CallError> {
        let rows: Vec<Value> = {
            let table = self.table.lock();
            table
                .jobs
                .values()
                .filter(|slot| slot.visible_to(credential))
                .filter_map(|slot| serde_json::to_value(&slot.job).ok())
                .collect()
        };
        filter_list(rows, filters, options)
    }

    fn check_visible(&self, id: JobId, credential: Option<&Credential>) -> Result<(), CallError> {
        let table = self.table.lock();
        match table.jobs.get(&id) {
            Some(slot) if credential.map(|c| slot.visible_to(c)).unwrap_or(true) => Ok(()),
            _ => Err(CallError::MatchNotFound(format!("Job {} does not exist", id))),
        }
    }

    /// Request cancellation. Waiting jobs are aborted at once; running jobs
    /// are aborted when their task observes the token or the grace expires.
    pub async fn abort(self: &Arc<Self>, id: JobId, credential: Option<&Credential>, reason: &str) -> Result<(), CallError> {
        self.check_visible(id, credential)?;
        let aborted_waiting = {
            let mut table = self.table.lock();
            let Some(slot) = table.jobs.get_mut(&id) else {
                return Err(CallError::MatchNotFound(format!("Job {} does not exist", id)));
            };
            if !slot.job.abortable {
                return Err(CallError::invalid(format!("Job {} is not abortable", id)));
            }
            let state = slot.job.state;
            match state {
                JobState::Waiting => {
                    if let Err(e) = slot.job.abort(reason) {
                        warn!("Job {}: {}", id, e);
                    }
                    slot.runner = None;
                    slot.state_tx.send_replace(slot.job.state);
                    slot.log_notify.notify_waiters();
                    let job = slot.job.clone();
                    table.waiting.retain(|queued| *queued != id);
                    Some(job)
                }
                JobState::Running => {
                    if slot.abort_reason.is_none() {
                        slot.abort_reason = Some(reason.to_string());
                    }
                    slot.cancel.cancel();
                    None
                }
                _ => None,
            }
        };

        if let Some(job) = aborted_waiting {
            info!("Job {} aborted before it started", id);
            metrics::counter!("middleware_jobs_total", "state" => job.state.as_str()).increment(1);
            self.announce(JOB_FINISHED, &job);
            self.persist(&job).await;
            self.schedule();
        } else {
            debug!("Abort requested for job {}", id);
        }
        Ok(())
    }

    /// Abort every abandonable job owned by a closed session.
    pub async fn abort_session_jobs(self: &Arc<Self>, session: Uuid) -> usize {
        let ids: Vec<JobId> = {
            let table = self.table.lock();
            table
                .jobs
                .values()
                .filter(|slot| {
                    slot.job.owner_session == Some(session)
                        && slot.job.abandon_on_disconnect
                        && !slot.job.state.is_terminal()
                })
                .map(|slot| slot.job.id)
                .collect()
        };
        let mut aborted = 0;
        for id in ids {
            match self.abort(id, None, DISCONNECT_REASON).await {
                Ok(()) => aborted += 1,
                Err(e) => debug!("Job {} kept after disconnect: {}", id, e),
            }
        }
        aborted
    }

    /// Wait until the job is terminal and return its final row.
    pub async fn wait(&self, id: JobId, timeout: Option<Duration>, credential: Option<&Credential>) -> Result<Job, CallError> {
        self.check_visible(id, credential)?;
        let mut rx = {
            let table = self.table.lock();
            match table.jobs.get(&id) {
                Some(slot) => slot.state_tx.subscribe(),
                None => return Err(CallError::MatchNotFound(format!("Job {} does not exist", id))),
            }
        };
        let terminal = async move { rx.wait_for(|state| state.is_terminal()).await.map(|_| ()) };
        let waited = match timeout {
            Some(limit) => tokio::time::timeout(limit, terminal)
                .await
                .map_err(|_| CallError::Timeout(limit.as_secs()))?,
            None => terminal.await,
        };
        if waited.is_err() {
            debug!("Job {} was evicted while waited on", id);
        }
        self.get(id)
            .ok_or_else(|| CallError::MatchNotFound(format!("Job {} does not exist", id)))
    }

    /// Log lines from `offset` on, whether the job is terminal, and the
    /// notifier woken on new lines.
    pub fn logs_since(&self, id: JobId, offset: usize) -> Option<(Vec<String>, bool, Arc<Notify>)> {
        let table = self.table.lock();
        let slot = table.jobs.get(&id)?;
        let lines = slot.job.logs().iter().skip(offset).cloned().collect();
        Some((lines, slot.job.state.is_terminal(), Arc::clone(&slot.log_notify)))
    }

    pub fn is_visible(&self, id: JobId, credential: &Credential) -> bool {
        self.check_visible(id, Some(credential)).is_ok()
    }

    fn set_progress(&self, id: JobId, percent: u8, description: Option<String>, extra: Option<Value>) {
        let job = {
            let mut table = self.table.lock();
            let Some(slot) = table.jobs.get_mut(&id) else {
                return;
            };
            if !slot.job.set_progress(percent, description, extra) {
                return;
            }
            slot.job.clone()
        };
        self.announce(JOB_UPDATED, &job);
    }

    fn append_logs(&self, id: JobId, text: &str) {
        let mut table = self.table.lock();
        if let Some(slot) = table.jobs.get_mut(&id) {
            if slot.job.append_log(text) {
                slot.log_notify.notify_waiters();
            }
        }
    }

    /// Drop terminal non-durable jobs older than the retention window.
    pub fn sweep(&self) -> usize {
        let retention = chrono::Duration::seconds(self.config.transient_retention_secs as i64);
        let cutoff = chrono::Utc::now() - retention;
        let mut table = self.table.lock();
        let before = table.jobs.len();
        table.jobs.retain(|_, slot| {
            slot.job.durable
                || !slot.job.state.is_terminal()
                || slot.job.time_finished.map(|at| at > cutoff).unwrap_or(true)
        });
        before - table.jobs.len()
    }

    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = Duration::from_secs((self.config.transient_retention_secs / 4).clamp(1, 60));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let removed = manager.sweep();
                        if removed > 0 {
                            debug!("Swept {} finished jobs", removed);
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    /// Cancel everything still running; used on shutdown.
    pub fn cancel_all(&self) {
        let table = self.table.lock();
        for slot in table.jobs.values().filter(|slot| !slot.job.state.is_terminal()) {
            slot.cancel.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.table.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Given to a running job method through `CallContext::job`.
#[derive(Clone)]
pub struct JobHandle {
    id: JobId,
    manager: Arc<JobManager>,
    cancel: CancellationToken,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn set_progress(&self, percent: u8, description: impl Into<String>) {
        self.manager.set_progress(self.id, percent, Some(description.into()), None);
    }

    pub fn set_progress_extra(&self, percent: u8, description: impl Into<String>, extra: Value) {
        self.manager
            .set_progress(self.id, percent, Some(description.into()), Some(extra));
    }

    pub fn append_logs(&self, text: &str) {
        self.manager.append_logs(self.id, text);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// `Err` once an abort was requested; for use at suspension points.
    pub fn check_cancelled(&self) -> Result<(), CallError> {
        if self.cancel.is_cancelled() {
            return Err(CallError::new(libc::ECANCELED, format!("Job {} was aborted", self.id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::schema_registry::SchemaRegistry;
    use crate::domain::credential::CredentialKind;
    use crate::domain::events::EventType;
    use crate::infrastructure::event_bus::EventBusBuilder;
    use crate::infrastructure::repositories::InMemoryConfigStore;
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    fn manager_with(config: JobsConfig) -> (Arc<JobManager>, Arc<EventBus>, Arc<InMemoryConfigStore>) {
        let mut schemas = SchemaRegistry::new();
        schemas.resolve().unwrap();
        let mut builder = EventBusBuilder::new();
        for name in [JOB_ADDED, JOB_UPDATED, JOB_FINISHED] {
            builder.register(&EventType::new(name), None);
        }
        let events = Arc::new(builder.build(Arc::new(schemas), 64));
        let store = Arc::new(InMemoryConfigStore::new());
        let manager = JobManager::new(&config, Arc::clone(&events), store.clone());
        (manager, events, store)
    }

    fn manager() -> Arc<JobManager> {
        manager_with(JobsConfig::default()).0
    }

    fn returning(value: Value) -> JobRunner {
        Box::new(move |_job| async move { Ok(value) }.boxed())
    }

    fn gated(gate: oneshot::Receiver<()>, value: Value) -> JobRunner {
        Box::new(move |_job| {
            async move {
                let _ = gate.await;
                Ok(value)
            }
            .boxed()
        })
    }

    fn locked(method: &str, key: &str, runner: JobRunner) -> JobSubmission {
        let mut submission = JobSubmission::new(method, vec![], runner);
        submission.lock_key = Some(key.to_string());
        submission
    }

    fn user(name: &str, roles: &[&str]) -> Credential {
        Credential::new(
            CredentialKind::LoginPassword,
            name,
            roles.iter().map(|r| r.to_string()).collect::<BTreeSet<_>>(),
            false,
        )
    }

    #[tokio::test]
    async fn test_job_runs_to_success() {
        let (jobs, events, _) = manager_with(JobsConfig::default());
        let mut rx = events.observe_mask("core.job_*").unwrap();
        let id = jobs
            .submit(JobSubmission::new("pool.scrub", vec![json!("tank")], returning(json!(42))))
            .await
            .unwrap();
        let job = jobs.wait(id, Some(Duration::from_secs(5)), None).await.unwrap();
        assert_eq!(job.state, JobState::Success);
        assert_eq!(job.result, Some(json!(42)));
        assert_eq!(job.progress.percent, 100);

        let mut names = Vec::new();
        while names.last().map(String::as_str) != Some(JOB_FINISHED) {
            names.push(rx.recv().await.unwrap().name);
        }
        assert_eq!(names, vec![JOB_ADDED, JOB_UPDATED, JOB_FINISHED]);
    }

    #[tokio::test]
    async fn test_failure_records_exc_info() {
        let jobs = manager();
        let runner: JobRunner = Box::new(|_job| async { Err(CallError::new(libc::ENOENT, "no such pool")) }.boxed());
        let id = jobs.submit(JobSubmission::new("pool.scrub", vec![], runner)).await.unwrap();
        let job = jobs.wait(id, Some(Duration::from_secs(5)), None).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error.as_deref(), Some("no such pool"));
        assert_eq!(job.exc_info.unwrap().errno, Some(libc::ENOENT));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_job_added_precedes_job_updated() {
        let (jobs, events, _store) = manager_with(JobsConfig {
            workers: 1,
            ..JobsConfig::default()
        });
        let mut observer = events.observe();

        let mut submitters = Vec::new();
        for n in 0..10 {
            let jobs = Arc::clone(&jobs);
            submitters.push(tokio::spawn(async move {
                jobs.submit(JobSubmission::new("pool.scrub", vec![], returning(json!(n))))
                    .await
                    .unwrap()
            }));
        }
        let mut ids = Vec::new();
        for submitter in submitters {
            ids.push(submitter.await.unwrap());
        }
        for id in &ids {
            jobs.wait(*id, Some(Duration::from_secs(5)), None).await.unwrap();
        }

        let mut seen: Vec<(String, u64)> = Vec::new();
        while let Ok(event) = observer.try_recv() {
            seen.push((event.name.clone(), event.fields["id"].as_u64().unwrap()));
        }
        for id in ids {
            let added = seen.iter().position(|(name, job)| name == JOB_ADDED && *job == id).unwrap();
            let updated = seen.iter().position(|(name, job)| name == JOB_UPDATED && *job == id).unwrap();
            assert!(added < updated, "job {} reported before it was added", id);
        }
    }

    #[tokio::test]
    async fn test_panicking_job_fails() {
        let jobs = manager();
        let runner: JobRunner = Box::new(|_job| {
            async {
                if true {
                    panic!("boom");
                }
                Ok(Value::Null)
            }
            .boxed()
        });
        let id = jobs.submit(JobSubmission::new("pool.scrub", vec![], runner)).await.unwrap();
        let job = jobs.wait(id, Some(Duration::from_secs(5)), None).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.error.unwrap().contains("boom"));
        let trace = job.exception.unwrap();
        assert_ne!(trace, "method panicked: boom");
        assert_eq!(job.exc_info.unwrap().extra, Some(Value::String(trace)));
    }

    #[tokio::test]
    async fn test_lock_key_runs_fifo() {
        let jobs = manager();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (release, gate) = oneshot::channel();
        let first = jobs.submit(locked("pool.import", "pool", gated(gate, json!(1)))).await.unwrap();

        let mut ids = vec![first];
        for n in 2..=4 {
            let order = Arc::clone(&order);
            let runner: JobRunner = Box::new(move |_job| {
                async move {
                    order.lock().push(n);
                    Ok(json!(n))
                }
                .boxed()
            });
            ids.push(jobs.submit(locked("pool.import", "pool", runner)).await.unwrap());
        }
        assert_eq!(jobs.get(ids[1]).unwrap().state, JobState::Waiting);

        release.send(()).unwrap();
        for id in &ids {
            jobs.wait(*id, Some(Duration::from_secs(5)), None).await.unwrap();
        }
        assert_eq!(*order.lock(), vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_queue_limit_zero_rejects_while_running() {
        let jobs = manager();
        let (release, gate) = oneshot::channel();
        let mut first = locked("update.apply", "update", gated(gate, json!(true)));
        first.queue_limit = Some(0);
        let id = jobs.submit(first).await.unwrap();

        let mut second = locked("update.apply", "update", returning(json!(true)));
        second.queue_limit = Some(0);
        let err = jobs.submit(second).await.unwrap_err();
        assert!(matches!(err, CallError::LockQueueFull(ref key) if key == "update"));

        release.send(()).unwrap();
        jobs.wait(id, Some(Duration::from_secs(5)), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_limit_counts_waiting() {
        let jobs = manager();
        let (release, gate) = oneshot::channel();
        jobs.submit(locked("disk.wipe", "disk", gated(gate, json!(1)))).await.unwrap();
        let mut queued = locked("disk.wipe", "disk", returning(json!(2)));
        queued.queue_limit = Some(1);
        jobs.submit(queued).await.unwrap();
        let mut over = locked("disk.wipe", "disk", returning(json!(3)));
        over.queue_limit = Some(1);
        assert!(matches!(jobs.submit(over).await, Err(CallError::LockQueueFull(_))));
        release.send(()).unwrap();
    }

    #[tokio::test]
    async fn test_abort_running_cooperative_job() {
        let jobs = manager();
        let runner: JobRunner = Box::new(|job| {
            async move {
                job.cancelled().await;
                Ok(json!("stopped"))
            }
            .boxed()
        });
        let id = jobs.submit(JobSubmission::new("pool.scrub", vec![], runner)).await.unwrap();
        tokio::task::yield_now().await;
        jobs.abort(id, None, "Aborted by user").await.unwrap();
        let job = jobs.wait(id, Some(Duration::from_secs(5)), None).await.unwrap();
        assert_eq!(job.state, JobState::Aborted);
        assert_eq!(job.error.as_deref(), Some("Aborted by user"));
    }

    #[tokio::test]
    async fn test_abort_escalates_after_grace() {
        let config = JobsConfig {
            abort_grace_secs: 0,
            ..JobsConfig::default()
        };
        let (jobs, _, _) = manager_with(config);
        let runner: JobRunner = Box::new(|_job| {
            async {
                futures::future::pending::<()>().await;
                Ok(Value::Null)
            }
            .boxed()
        });
        let id = jobs.submit(JobSubmission::new("pool.scrub", vec![], runner)).await.unwrap();
        jobs.abort(id, None, "Aborted by user").await.unwrap();
        let job = jobs.wait(id, Some(Duration::from_secs(5)), None).await.unwrap();
        assert_eq!(job.state, JobState::Aborted);
    }

    #[tokio::test]
    async fn test_abort_waiting_job_skips_it() {
        let jobs = manager();
        let (release, gate) = oneshot::channel();
        let runs = Arc::new(AtomicUsize::new(0));
        let first = jobs.submit(locked("pool.import", "pool", gated(gate, json!(1)))).await.unwrap();
        let counter = Arc::clone(&runs);
        let runner: JobRunner = Box::new(move |_job| {
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
            .boxed()
        });
        let second = jobs.submit(locked("pool.import", "pool", runner)).await.unwrap();
        jobs.abort(second, None, "Aborted by user").await.unwrap();
        assert_eq!(jobs.get(second).unwrap().state, JobState::Aborted);

        release.send(()).unwrap();
        jobs.wait(first, Some(Duration::from_secs(5)), None).await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_not_abortable() {
        let jobs = manager();
        let (_release, gate) = oneshot::channel::<()>();
        let mut submission = JobSubmission::new("update.apply", vec![], gated(gate, Value::Null));
        submission.abortable = false;
        let id = jobs.submit(submission).await.unwrap();
        assert!(jobs.abort(id, None, "Aborted by user").await.is_err());
    }

    #[tokio::test]
    async fn test_session_disconnect_aborts_abandonable_jobs() {
        let jobs = manager();
        let session = Uuid::new_v4();
        let mut abandon = JobSubmission::new(
            "pool.scrub",
            vec![],
            Box::new(|job: JobHandle| {
                async move {
                    job.cancelled().await;
                    Ok(Value::Null)
                }
                .boxed()
            }),
        );
        abandon.owner_session = Some(session);
        abandon.abandon_on_disconnect = true;
        let abandoned = jobs.submit(abandon).await.unwrap();

        let (release, gate) = oneshot::channel();
        let mut keep = JobSubmission::new("pool.scrub", vec![], gated(gate, json!("done")));
        keep.owner_session = Some(session);
        let kept = jobs.submit(keep).await.unwrap();

        tokio::task::yield_now().await;
        assert_eq!(jobs.abort_session_jobs(session).await, 1);
        let job = jobs.wait(abandoned, Some(Duration::from_secs(5)), None).await.unwrap();
        assert_eq!(job.state, JobState::Aborted);

        release.send(()).unwrap();
        let job = jobs.wait(kept, Some(Duration::from_secs(5)), None).await.unwrap();
        assert_eq!(job.state, JobState::Success);
    }

    #[tokio::test]
    async fn test_wait_timeout() {
        let jobs = manager();
        let (_release, gate) = oneshot::channel::<()>();
        let id = jobs.submit(JobSubmission::new("pool.scrub", vec![], gated(gate, Value::Null))).await.unwrap();
        let err = jobs.wait(id, Some(Duration::from_millis(20)), None).await.unwrap_err();
        assert!(matches!(err, CallError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_progress_and_logs() {
        let jobs = manager();
        let (release, gate) = oneshot::channel::<()>();
        let runner: JobRunner = Box::new(move |job| {
            async move {
                job.set_progress(50, "halfway");
                job.append_logs("line one\nline two");
                let _ = gate.await;
                Ok(Value::Null)
            }
            .boxed()
        });
        let id = jobs.submit(JobSubmission::new("pool.scrub", vec![], runner)).await.unwrap();
        for _ in 0..50 {
            if jobs.get(id).unwrap().progress.percent == 50 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let job = jobs.get(id).unwrap();
        assert_eq!(job.progress.description.as_deref(), Some("halfway"));
        let (lines, done, _) = jobs.logs_since(id, 1).unwrap();
        assert_eq!(lines, vec!["line two".to_string()]);
        assert!(!done);

        release.send(()).unwrap();
        let job = jobs.wait(id, Some(Duration::from_secs(5)), None).await.unwrap();
        assert_eq!(job.logs_excerpt.as_deref(), Some("line one\nline two"));
    }

    #[tokio::test]
    async fn test_visibility() {
        let jobs = manager();
        let mut submission = JobSubmission::new("pool.scrub", vec![], returning(Value::Null));
        submission.credential = Some(user("alice", &[]).summary());
        submission.read_roles = vec!["POOL_READ".to_string()];
        let id = jobs.submit(submission).await.unwrap();
        jobs.wait(id, Some(Duration::from_secs(5)), None).await.unwrap();

        let options = QueryOptions::default();
        let rows = |c: &Credential| jobs.query(c, &[], &options).unwrap().as_array().unwrap().len();
        assert_eq!(rows(&user("alice", &[])), 1);
        assert_eq!(rows(&user("bob", &[])), 0);
        assert_eq!(rows(&user("bob", &["POOL_READ"])), 1);
        assert_eq!(rows(&user("carol", &[JOB_READ])), 1);
        assert!(jobs.abort(id, Some(&user("bob", &[])), "x").await.is_err());
    }

    #[tokio::test]
    async fn test_durable_restore_aborts_unfinished() {
        let (jobs, _, store) = manager_with(JobsConfig::default());
        let mut row = Job::new(7, "pool.import", vec![]);
        row.durable = true;
        store.upsert(JOBS_TABLE, 7, serde_json::to_value(&row).unwrap()).await.unwrap();

        assert_eq!(jobs.restore().await.unwrap(), 1);
        let restored = jobs.get(7).unwrap();
        assert_eq!(restored.state, JobState::Aborted);
        assert_eq!(restored.error.as_deref(), Some(RESTART_REASON));

        let id = jobs.submit(JobSubmission::new("pool.scrub", vec![], returning(Value::Null))).await.unwrap();
        assert_eq!(id, 8);
    }

    #[tokio::test]
    async fn test_max_jobs_evicts_oldest_terminal() {
        let config = JobsConfig {
            max_jobs: 2,
            ..JobsConfig::default()
        };
        let (jobs, _, _) = manager_with(config);
        for _ in 0..3 {
            let id = jobs.submit(JobSubmission::new("core.ping", vec![], returning(Value::Null))).await.unwrap();
            jobs.wait(id, Some(Duration::from_secs(5)), None).await.unwrap();
        }
        assert_eq!(jobs.len(), 2);
        assert!(jobs.get(1).is_none());
    }

    #[tokio::test]
    async fn test_sweep_drops_expired_transient_jobs() {
        let config = JobsConfig {
            transient_retention_secs: 0,
            ..JobsConfig::default()
        };
        let (jobs, _, _) = manager_with(config);
        let id = jobs.submit(JobSubmission::new("core.ping", vec![], returning(Value::Null))).await.unwrap();
        jobs.wait(id, Some(Duration::from_secs(5)), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(jobs.sweep(), 1);
        assert!(jobs.is_empty());
    }
}
