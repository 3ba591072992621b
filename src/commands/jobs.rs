//! Background job commands

use super::AppState;
use crate::jobs::{Job, JobKind, JobOptions};
use crate::utils::error::ErrorResponse;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobRequest {
    pub kind: JobKind,
    pub batch_id: String,
    #[serde(default)]
    pub force: bool,
}

/// Queue a conversion or processing job for a batch
pub async fn submit_job(state: &AppState, request: SubmitJobRequest) -> Result<Job, ErrorResponse> {
    let options = JobOptions { force: request.force };
    Ok(state.engine.submit(request.kind, &request.batch_id, options)?)
}

pub async fn get_job(state: &AppState, job_id: String) -> Result<Job, ErrorResponse> {
    Ok(state.engine.get(&job_id)?)
}

/// Request cancellation; finished jobs report `ALREADY_TERMINAL`
pub async fn cancel_job(state: &AppState, job_id: String) -> Result<Job, ErrorResponse> {
    Ok(state.engine.cancel(&job_id)?)
}

/// Jobs newest first, optionally of one kind
pub async fn list_jobs(state: &AppState, kind: Option<JobKind>) -> Result<Vec<Job>, ErrorResponse> {
    Ok(state.engine.list(kind)?)
}
