//! Job runner capability
//!
//! A runner does the actual work of one job kind, one device share at a
//! time. The engine owns scheduling, cancellation and aggregation; a runner
//! only reports progress through its [`ShareContext`] and returns a
//! [`ShareOutcome`].

use super::types::{DeviceJobStatus, Job, JobKind, JobOptions};
use crate::capture::DeviceRole;
use crate::metadata::Batch;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Job record plus its cancellation flag
pub struct JobCell {
    pub(crate) job: Mutex<Job>,
    pub(crate) cancel: AtomicBool,
}

impl JobCell {
    pub fn new(job: Job) -> Self {
        Self {
            job: Mutex::new(job),
            cancel: AtomicBool::new(false),
        }
    }

    pub fn snapshot(&self) -> Job {
        self.job.lock().clone()
    }
}

/// How one share ended
#[derive(Debug, Clone)]
pub enum ShareOutcome {
    Done { result_path: Option<PathBuf> },
    /// Nothing to do; counts as success
    Skipped { result_path: Option<PathBuf>, reason: String },
    Failed(String),
    Cancelled,
}

/// Handle a runner uses to observe and report on its share
pub struct ShareContext {
    role: DeviceRole,
    batch: Arc<Batch>,
    options: JobOptions,
    cell: Arc<JobCell>,
}

impl ShareContext {
    pub(crate) fn new(role: DeviceRole, batch: Arc<Batch>, options: JobOptions, cell: Arc<JobCell>) -> Self {
        Self {
            role,
            batch,
            options,
            cell,
        }
    }

    pub fn role(&self) -> DeviceRole {
        self.role
    }

    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    pub fn job_id(&self) -> String {
        self.cell.job.lock().job_id.clone()
    }

    /// Whether cancellation was requested; check once per frame
    pub fn is_cancelled(&self) -> bool {
        self.cell.cancel.load(Ordering::SeqCst)
    }

    /// Publish progress; values lower than the current one are ignored
    pub fn report(&self, progress: u8, step: &str) {
        let mut job = self.cell.job.lock();
        if let Some(state) = job.per_device.get_mut(&self.role) {
            state.progress = state.progress.max(progress.min(100));
            if state.step_label != step {
                tracing::debug!("[{} {}] {}% {}", self.batch.batch_id, self.role, state.progress, step);
                state.step_label = step.to_string();
            }
        }
    }

    /// Record a metric on this share
    pub fn set_metric(&self, key: &str, value: impl Into<serde_json::Value>) {
        let mut job = self.cell.job.lock();
        if let Some(state) = job.per_device.get_mut(&self.role) {
            state.metrics.insert(key.to_string(), value.into());
        }
    }

    /// Attach a warning to the job
    pub fn warn(&self, message: impl Into<String>) {
        let message = format!("{}: {}", self.role, message.into());
        tracing::warn!("[{}] {}", self.batch.batch_id, message);
        self.cell.job.lock().warnings.push(message);
    }

    pub(crate) fn mark_running(&self) {
        let mut job = self.cell.job.lock();
        if let Some(state) = job.per_device.get_mut(&self.role) {
            state.status = DeviceJobStatus::Running;
            state.step_label = "Starting".to_string();
        }
    }

    pub(crate) fn finish(&self, outcome: &ShareOutcome) {
        let mut job = self.cell.job.lock();
        let Some(state) = job.per_device.get_mut(&self.role) else {
            return;
        };
        match outcome {
            ShareOutcome::Done { result_path } => {
                state.status = DeviceJobStatus::Done;
                state.progress = 100;
                state.step_label = "Complete".to_string();
                state.result_path = result_path.clone();
            }
            ShareOutcome::Skipped { result_path, reason } => {
                state.status = DeviceJobStatus::Skipped;
                state.progress = 100;
                state.step_label = reason.clone();
                state.result_path = result_path.clone();
            }
            ShareOutcome::Failed(error) => {
                state.status = DeviceJobStatus::Failed;
                state.step_label = "Failed".to_string();
                state.error = Some(error.clone());
            }
            ShareOutcome::Cancelled => {
                state.status = DeviceJobStatus::Cancelled;
                state.step_label = "Cancelled".to_string();
            }
        }
    }
}

/// Work performed by one job kind
pub trait JobRunner: Send + Sync {
    fn kind(&self) -> JobKind;

    /// Devices of the batch this job works on
    fn shares(&self, batch: &Batch) -> Vec<DeviceRole> {
        batch.roles()
    }

    /// Do one device's share. Runs on its own OS thread.
    fn run_share(&self, ctx: &ShareContext) -> ShareOutcome;

    /// Whether the job may succeed while some shares failed
    fn allows_partial_success(&self) -> bool {
        false
    }
}
