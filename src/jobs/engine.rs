//! Asynchronous job engine
//!
//! Jobs are queued to a single dispatcher task, so at most one job runs at a
//! time across the engine. The dispatcher hands each job to a blocking
//! thread, where every device share gets its own scoped OS thread. Job
//! records are persisted on submit, start and completion.

use super::runner::{JobCell, JobRunner, ShareContext, ShareOutcome};
use super::types::{DeviceJobState, DeviceJobStatus, Job, JobError, JobKind, JobOptions, JobResult, JobStatus};
use crate::metadata::{BatchCatalog, RecordingLayout, SidecarStore};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

struct EngineInner {
    runners: HashMap<JobKind, Arc<dyn JobRunner>>,
    catalog: Arc<BatchCatalog>,
    store: Arc<dyn SidecarStore>,
    jobs: RwLock<HashMap<String, Arc<JobCell>>>,
    /// Non-terminal job per (batch, kind)
    active: Mutex<HashMap<(String, JobKind), String>>,
    queue: mpsc::UnboundedSender<String>,
}

/// Registry and scheduler for conversion and processing jobs
#[derive(Clone)]
pub struct JobEngine {
    inner: Arc<EngineInner>,
}

impl JobEngine {
    /// Create the engine and start its dispatcher. Must run inside a tokio runtime.
    ///
    /// Records left non-terminal by a previous process are marked failed.
    pub fn new(
        catalog: Arc<BatchCatalog>,
        store: Arc<dyn SidecarStore>,
        runners: Vec<Arc<dyn JobRunner>>,
    ) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(EngineInner {
            runners: runners.into_iter().map(|r| (r.kind(), r)).collect(),
            catalog,
            store,
            jobs: RwLock::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            queue,
        });

        inner.recover();
        tokio::spawn(dispatch(Arc::downgrade(&inner), rx));
        Self { inner }
    }

    /// Queue a job against a batch
    pub fn submit(&self, kind: JobKind, batch_id: &str, options: JobOptions) -> JobResult<Job> {
        let inner = &self.inner;
        let runner = inner
            .runners
            .get(&kind)
            .ok_or_else(|| JobError::InvalidRequest(format!("No runner registered for {kind}")))?;

        if !RecordingLayout::is_valid_batch_id(batch_id) {
            return Err(JobError::InvalidRequest(format!("Invalid batch id {batch_id:?}")));
        }
        let batch = inner
            .catalog
            .find(batch_id)
            .ok_or_else(|| JobError::NotFound(format!("batch {batch_id}")))?;
        if let Some(device) = batch.devices.iter().find(|d| !d.is_finalized()) {
            return Err(JobError::InvalidRequest(format!(
                "Batch {batch_id} is still recording ({} has not been stopped)",
                device.role
            )));
        }
        let roles = runner.shares(&batch);
        if roles.is_empty() {
            return Err(JobError::InvalidRequest(format!(
                "Batch {batch_id} has no recordings for {kind}"
            )));
        }

        // Lock order: `active` is never held while taking `jobs`
        let job = Job::new(kind, batch_id, &roles, options);
        let job_id = job.job_id.clone();
        let key = (batch_id.to_string(), kind);
        {
            let mut active = inner.active.lock();
            if let Some(existing) = active.get(&key) {
                return Err(JobError::Conflict {
                    kind,
                    existing: existing.clone(),
                });
            }
            active.insert(key, job_id.clone());
        }

        if let Err(e) = inner.store.save_job(&job) {
            inner.release(batch_id, kind, &job_id);
            return Err(e.into());
        }
        inner
            .jobs
            .write()
            .insert(job_id.clone(), Arc::new(JobCell::new(job.clone())));

        if inner.queue.send(job_id.clone()).is_err() {
            inner.release(&job.batch_id, kind, &job_id);
            return Err(JobError::EngineStopped);
        }

        tracing::info!("Queued {} job {} for batch {}", kind, job_id, batch_id);
        Ok(job)
    }

    /// Current snapshot of a job
    pub fn get(&self, job_id: &str) -> JobResult<Job> {
        if let Some(cell) = self.inner.cell(job_id) {
            return Ok(cell.snapshot());
        }
        self.inner
            .store
            .load_job(job_id)?
            .ok_or_else(|| JobError::NotFound(format!("job {job_id}")))
    }

    /// Request cancellation
    ///
    /// A pending job is cancelled on the spot; a running one stops at its
    /// next frame boundary.
    pub fn cancel(&self, job_id: &str) -> JobResult<Job> {
        let inner = &self.inner;
        let Some(cell) = inner.cell(job_id) else {
            return match inner.store.load_job(job_id)? {
                Some(job) => Err(JobError::AlreadyTerminal {
                    job_id: job.job_id,
                    status: job.status,
                }),
                None => Err(JobError::NotFound(format!("job {job_id}"))),
            };
        };

        let (snapshot, released) = {
            let mut job = cell.job.lock();
            if job.status.is_terminal() {
                return Err(JobError::AlreadyTerminal {
                    job_id: job.job_id.clone(),
                    status: job.status,
                });
            }

            cell.cancel.store(true, Ordering::SeqCst);
            job.cancel_requested = true;

            let released = job.status == JobStatus::Pending;
            if released {
                job.advance(JobStatus::Cancelled);
                for state in job.per_device.values_mut() {
                    state.status = DeviceJobStatus::Cancelled;
                    state.step_label = "Cancelled".to_string();
                }
                if let Err(e) = inner.store.save_job(&job) {
                    tracing::error!("Failed to persist cancelled job {}: {}", job_id, e);
                }
            }
            (job.clone(), released)
        };

        if released {
            inner.release(&snapshot.batch_id, snapshot.kind, job_id);
            tracing::info!("Cancelled pending job {}", job_id);
        } else {
            tracing::info!("Cancellation requested for job {}", job_id);
        }
        Ok(snapshot)
    }

    /// All known jobs, newest first
    pub fn list(&self, kind: Option<JobKind>) -> JobResult<Vec<Job>> {
        let mut by_id: HashMap<String, Job> = self
            .inner
            .store
            .list_jobs()?
            .into_iter()
            .map(|j| (j.job_id.clone(), j))
            .collect();
        let cells: Vec<Arc<JobCell>> = self.inner.jobs.read().values().cloned().collect();
        for cell in cells {
            let job = cell.snapshot();
            by_id.insert(job.job_id.clone(), job);
        }

        let mut jobs: Vec<Job> = by_id
            .into_values()
            .filter(|j| kind.map(|k| j.kind == k).unwrap_or(true))
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    /// Id of the non-terminal job of `kind` for a batch, if any
    pub fn active_job(&self, batch_id: &str, kind: JobKind) -> Option<String> {
        self.inner
            .active
            .lock()
            .get(&(batch_id.to_string(), kind))
            .cloned()
    }
}

impl EngineInner {
    fn cell(&self, job_id: &str) -> Option<Arc<JobCell>> {
        self.jobs.read().get(job_id).cloned()
    }

    fn release(&self, batch_id: &str, kind: JobKind, job_id: &str) {
        let mut active = self.active.lock();
        let key = (batch_id.to_string(), kind);
        if active.get(&key).map(|id| id == job_id).unwrap_or(false) {
            active.remove(&key);
        }
    }

    fn persist(&self, job: &Job) {
        if let Err(e) = self.store.save_job(job) {
            tracing::error!("Failed to persist job {}: {}", job.job_id, e);
        }
    }

    /// Mark records interrupted by a crash as failed
    fn recover(&self) {
        let jobs = match self.store.list_jobs() {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!("Could not read job records: {}", e);
                return;
            }
        };

        for mut job in jobs.into_iter().filter(|j| !j.status.is_terminal()) {
            tracing::warn!("Job {} was interrupted while {}", job.job_id, job.status);
            job.advance(JobStatus::Failed);
            job.error = Some("interrupted".to_string());
            for state in job.per_device.values_mut().filter(|s| !s.status.is_terminal()) {
                state.status = DeviceJobStatus::Failed;
                state.error = Some("interrupted".to_string());
            }
            self.persist(&job);
        }
    }

    /// Run one job to completion on the current (blocking) thread
    fn execute(&self, cell: Arc<JobCell>) {
        let (job_id, kind, batch_id, options, roles) = {
            let mut job = cell.job.lock();
            if job.status != JobStatus::Pending {
                // Cancelled while queued
                return;
            }
            job.advance(JobStatus::Running);
            self.persist(&job);
            (
                job.job_id.clone(),
                job.kind,
                job.batch_id.clone(),
                job.options.clone(),
                job.per_device.keys().copied().collect::<Vec<_>>(),
            )
        };

        let outcome = match (self.runners.get(&kind), self.catalog.find(&batch_id)) {
            (Some(runner), Some(batch)) => {
                tracing::info!("Running {} job {} on {} share(s)", kind, job_id, roles.len());
                let batch = Arc::new(batch);
                let outcomes: Vec<ShareOutcome> = std::thread::scope(|scope| {
                    let handles: Vec<_> = roles
                        .iter()
                        .map(|role| {
                            let ctx = ShareContext::new(*role, batch.clone(), options.clone(), cell.clone());
                            let runner = runner.clone();
                            std::thread::Builder::new()
                                .name(format!("{kind}-{role}"))
                                .spawn_scoped(scope, move || {
                                    ctx.mark_running();
                                    let outcome = runner.run_share(&ctx);
                                    ctx.finish(&outcome);
                                    outcome
                                })
                        })
                        .collect();

                    handles
                        .into_iter()
                        .map(|spawned| match spawned {
                            Ok(handle) => handle
                                .join()
                                .unwrap_or_else(|_| ShareOutcome::Failed("worker panicked".to_string())),
                            Err(e) => ShareOutcome::Failed(format!("could not start worker: {e}")),
                        })
                        .collect()
                });
                Some((outcomes, runner.allows_partial_success()))
            }
            _ => None,
        };

        let status = {
            let mut job = cell.job.lock();
            match outcome {
                Some((_, partial)) => {
                    let (status, warning) = aggregate(&job.per_device, partial);
                    if let Some(warning) = warning {
                        job.warnings.push(warning);
                    }
                    if status == JobStatus::Failed {
                        job.error = Some(share_errors(&job.per_device));
                    }
                    job.advance(status);
                }
                None => {
                    job.error = Some(format!("Batch {batch_id} is no longer available"));
                    job.advance(JobStatus::Failed);
                }
            }
            self.persist(&job);
            job.status
        };
        self.release(&batch_id, kind, &job_id);

        tracing::info!("{} job {} finished: {}", kind, job_id, status);
    }
}

/// Overall status from the share states
///
/// Cancellation honored by any share wins, then failure. Runners allowing
/// partial success only fail when every share failed.
pub fn aggregate(shares: &BTreeMap<crate::capture::DeviceRole, DeviceJobState>, partial: bool) -> (JobStatus, Option<String>) {
    if shares.values().any(|s| s.status == DeviceJobStatus::Cancelled) {
        return (JobStatus::Cancelled, None);
    }

    let failed: Vec<String> = shares
        .iter()
        .filter(|(_, s)| s.status == DeviceJobStatus::Failed)
        .map(|(role, _)| role.to_string())
        .collect();
    if failed.is_empty() {
        return (JobStatus::Done, None);
    }
    if partial && failed.len() < shares.len() {
        return (
            JobStatus::Done,
            Some(format!("Completed with failures on: {}", failed.join(", "))),
        );
    }
    (JobStatus::Failed, None)
}

fn share_errors(shares: &BTreeMap<crate::capture::DeviceRole, DeviceJobState>) -> String {
    shares
        .iter()
        .filter_map(|(role, s)| s.error.as_ref().map(|e| format!("{role}: {e}")))
        .collect::<Vec<_>>()
        .join("; ")
}

async fn dispatch(inner: Weak<EngineInner>, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(job_id) = rx.recv().await {
        let Some(engine) = inner.upgrade() else {
            break;
        };
        let Some(cell) = engine.cell(&job_id) else {
            continue;
        };

        let worker = engine.clone();
        drop(engine);
        if let Err(e) = tokio::task::spawn_blocking(move || worker.execute(cell)).await {
            tracing::error!("Job {} worker failed: {}", job_id, e);
        }
    }
    tracing::debug!("Job dispatcher stopped");
}
