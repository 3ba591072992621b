//! Background job system
//!
//! Kind-agnostic registry of cancellable, progress-reporting jobs that
//! operate on one recorded batch. Conversion and processing plug in as
//! [`JobRunner`]s.

pub mod engine;
pub mod runner;
pub mod types;

pub use engine::JobEngine;
pub use runner::{JobRunner, ShareContext, ShareOutcome};
pub use types::{DeviceJobState, DeviceJobStatus, Job, JobError, JobKind, JobOptions, JobResult, JobStatus};
