//! Error types and handling
//!
//! Every module error converges into [`AppError`], which the command layer
//! turns into a serializable [`ErrorResponse`].

use crate::capture::DeviceError;
use crate::config::SettingsError;
use crate::conversion::EncodeError;
use crate::jobs::JobError;
use crate::metadata::SidecarError;
use crate::processing::AnalysisError;
use crate::recorder::{SessionError, SyncError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Session(#[from] SessionError),

    #[error("{0}")]
    Job(#[from] JobError),

    #[error("{0}")]
    Sidecar(#[from] SidecarError),

    #[error("{0}")]
    Encode(#[from] EncodeError),

    #[error("{0}")]
    Analysis(#[from] AnalysisError),

    #[error("Configuration error: {0}")]
    Settings(#[from] SettingsError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Error response for callers of the command surface
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

fn sync_code(error: &SyncError) -> &'static str {
    match error {
        SyncError::Device {
            source: DeviceError::Timeout(_),
            ..
        } => "SYNCHRONIZATION_TIMEOUT",
        SyncError::NoDevices(_) => "DEVICE_UNAVAILABLE",
        _ => "SYNCHRONIZATION_FAILED",
    }
}

impl AppError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Session(e) => match e {
                SessionError::InvalidRequest(_) => "INVALID_REQUEST",
                SessionError::Conflict { .. } => "CONFLICT",
                SessionError::DeviceUnavailable(_) => "DEVICE_UNAVAILABLE",
                SessionError::Sync(e) => sync_code(e),
                SessionError::Store(_) | SessionError::Io(_) => "IO_ERROR",
                SessionError::Internal(_) => "INTERNAL_ERROR",
            },
            AppError::Job(e) => match e {
                JobError::Conflict { .. } => "CONFLICT",
                JobError::NotFound(_) => "NOT_FOUND",
                JobError::AlreadyTerminal { .. } => "ALREADY_TERMINAL",
                JobError::InvalidRequest(_) => "INVALID_REQUEST",
                JobError::Store(_) => "IO_ERROR",
                JobError::EngineStopped => "INTERNAL_ERROR",
            },
            AppError::Sidecar(SidecarError::Json(_)) => "SERIALIZATION_ERROR",
            AppError::Sidecar(_) => "IO_ERROR",
            AppError::Encode(e) => match e {
                EncodeError::Validation { .. } => "ENCODE_VALIDATION_FAILURE",
                EncodeError::Cancelled => "CANCELLED",
                _ => "ENCODE_FAILURE",
            },
            AppError::Analysis(_) => "ANALYSIS_FAILURE",
            AppError::Settings(_) => "CONFIGURATION_ERROR",
            AppError::InvalidRequest(_) => "INVALID_REQUEST",
            AppError::NotFound(_) => "NOT_FOUND",
        }
    }
}

impl From<AppError> for ErrorResponse {
    fn from(error: AppError) -> Self {
        ErrorResponse {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

impl From<SessionError> for ErrorResponse {
    fn from(error: SessionError) -> Self {
        AppError::from(error).into()
    }
}

impl From<JobError> for ErrorResponse {
    fn from(error: JobError) -> Self {
        AppError::from(error).into()
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
