//! Job types and error handling
//!
//! This module defines the job record shared by every job kind, the
//! per-device share state and the engine's error type.

use crate::capture::DeviceRole;
use crate::metadata::SidecarError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// Closed set of job kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Raw recording to playback file
    Conversion,
    /// Pose analysis report
    Processing,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Conversion => "conversion",
            JobKind::Processing => "processing",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Allowed moves: pending → running → terminal, or pending → cancelled
    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Pending, JobStatus::Running) => true,
            (JobStatus::Pending, JobStatus::Cancelled) => true,
            // A job that never got to run can still be marked failed on recovery
            (JobStatus::Pending, JobStatus::Failed) => true,
            (JobStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Status of one device's share of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceJobStatus {
    Pending,
    Running,
    Done,
    Skipped,
    Failed,
    Cancelled,
}

impl DeviceJobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeviceJobStatus::Pending | DeviceJobStatus::Running)
    }
}

/// Progress and result of one device's share
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceJobState {
    /// 0..=100, never decreases while running
    pub progress: u8,
    pub status: DeviceJobStatus,
    pub step_label: String,
    pub error: Option<String>,
    pub result_path: Option<PathBuf>,
    #[serde(default)]
    pub metrics: BTreeMap<String, serde_json::Value>,
}

impl DeviceJobState {
    pub fn pending() -> Self {
        Self {
            progress: 0,
            status: DeviceJobStatus::Pending,
            step_label: "Waiting".to_string(),
            error: None,
            result_path: None,
            metrics: BTreeMap::new(),
        }
    }
}

/// Options accepted at submission
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobOptions {
    /// Redo work whose output already exists
    pub force: bool,
}

/// One submission of a job against a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: String,
    pub kind: JobKind,
    pub batch_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub per_device: BTreeMap<DeviceRole, DeviceJobState>,
    pub cancel_requested: bool,
    pub options: JobOptions,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Job {
    pub fn new(kind: JobKind, batch_id: &str, roles: &[DeviceRole], options: JobOptions) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            kind,
            batch_id: batch_id.to_string(),
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            per_device: roles.iter().map(|r| (*r, DeviceJobState::pending())).collect(),
            cancel_requested: false,
            options,
            warnings: Vec::new(),
            error: None,
        }
    }

    /// Move to `next` if the lifecycle allows it
    pub fn advance(&mut self, next: JobStatus) -> bool {
        if !self.status.can_advance_to(next) {
            tracing::warn!(
                "Job {} refused transition {} -> {}",
                self.job_id,
                self.status,
                next
            );
            return false;
        }
        self.status = next;
        let now = Utc::now();
        match next {
            JobStatus::Running => self.started_at = Some(now),
            s if s.is_terminal() => self.completed_at = Some(now),
            _ => {}
        }
        true
    }

    /// Mean share progress
    pub fn progress(&self) -> u8 {
        if self.per_device.is_empty() {
            return 0;
        }
        let sum: u32 = self.per_device.values().map(|d| d.progress as u32).sum();
        (sum / self.per_device.len() as u32) as u8
    }
}

/// Job engine errors
#[derive(Error, Debug)]
pub enum JobError {
    #[error("A {kind} job is already active for this batch: {existing}")]
    Conflict { kind: JobKind, existing: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Job {job_id} already finished ({status})")]
    AlreadyTerminal { job_id: String, status: JobStatus },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Sidecar error: {0}")]
    Store(#[from] SidecarError),

    #[error("Job engine is not running")]
    EngineStopped,
}

pub type JobResult<T> = Result<T, JobError>;
