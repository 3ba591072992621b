//! Recording session commands

use super::AppState;
use crate::capture::DeviceSummary;
use crate::metadata::Batch;
use crate::recorder::{SessionOptions, SessionStatus, StartOutcome, StopOutcome};
use crate::utils::error::{AppError, ErrorResponse};

/// Start a recording session on every present device
pub async fn start_session(state: &AppState, options: SessionOptions) -> Result<StartOutcome, ErrorResponse> {
    tracing::info!("start_session: patient {:?}", options.patient_id);
    Ok(state.controller.start_session(options).await?)
}

/// Stop the active session and finalize its recordings
pub async fn stop_session(state: &AppState) -> Result<StopOutcome, ErrorResponse> {
    Ok(state.controller.stop_session().await?)
}

pub async fn pause_session(state: &AppState) -> Result<(), ErrorResponse> {
    Ok(state.controller.pause_session().await?)
}

pub async fn resume_session(state: &AppState) -> Result<(), ErrorResponse> {
    Ok(state.controller.resume_session().await?)
}

/// Current session snapshot, `idle` when nothing is recording
pub async fn get_session_status(state: &AppState) -> Result<SessionStatus, ErrorResponse> {
    Ok(state.controller.status())
}

/// Re-detect devices; only while idle
pub async fn refresh_devices(state: &AppState) -> Result<Vec<DeviceSummary>, ErrorResponse> {
    Ok(state.controller.refresh_devices()?)
}

/// Exchange the front and side roles; only while idle
pub async fn swap_device_roles(state: &AppState) -> Result<Vec<DeviceSummary>, ErrorResponse> {
    Ok(state.controller.swap_roles()?)
}

pub async fn list_devices(state: &AppState) -> Result<Vec<DeviceSummary>, ErrorResponse> {
    Ok(state.controller.devices())
}

/// Recorded batches, newest first
pub async fn list_batches(state: &AppState) -> Result<Vec<Batch>, ErrorResponse> {
    state
        .catalog
        .list()
        .map_err(|e| AppError::from(e).into())
}
