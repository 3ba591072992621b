//! Capture device trait definitions
//!
//! The physical capture driver lives outside this crate. Everything the
//! session controller needs from a device goes through [`DeviceHandle`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Logical position of a device in the capture rig
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    /// First detected device (sagittal view)
    Front,
    /// Second detected device (frontal view)
    Side,
}

impl DeviceRole {
    /// All roles in detection order
    pub const ALL: [DeviceRole; 2] = [DeviceRole::Front, DeviceRole::Side];

    /// Name used in file names and sidecars
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceRole::Front => "front",
            DeviceRole::Side => "side",
        }
    }

    /// Parse a role from its file-name form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "front" => Some(DeviceRole::Front),
            "side" => Some(DeviceRole::Side),
            _ => None,
        }
    }

    /// Role assigned to the n-th detected device
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline a device should build during the prepare phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureMode {
    /// Capture and write frames to the given raw recording path
    Recording { output: PathBuf },
    /// Capture for live preview only, nothing written
    Streaming,
}

impl CaptureMode {
    pub fn is_recording(&self) -> bool {
        matches!(self, CaptureMode::Recording { .. })
    }
}

/// Static description of a detected device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Serial number or other stable identifier
    pub id: String,

    /// Human readable name
    pub name: String,

    /// Frame width in pixels
    pub width: u32,

    /// Frame height in pixels
    pub height: u32,

    /// Nominal frame rate
    pub fps: u32,
}

/// Device-level errors
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Device not present: {0}")]
    NotPresent(String),

    #[error("Device has no prepared pipeline")]
    NotPrepared,

    #[error("Device is not recording")]
    NotRecording,

    #[error("Device call timed out after {0}ms")]
    Timeout(u64),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DeviceResult<T> = Result<T, DeviceError>;

/// One physical capture device.
///
/// Calls are blocking and may take seconds (`prepare`), so callers run them
/// on dedicated threads. Implementations use interior mutability so a handle
/// can be shared between the synchronizer's worker threads.
pub trait DeviceHandle: Send + Sync {
    /// Stable device identifier
    fn id(&self) -> &str;

    /// Device description
    fn info(&self) -> DeviceInfo;

    /// Whether the device is connected and able to capture
    fn is_present(&self) -> bool;

    /// Tear down the current pipeline and build one in `mode` without starting it
    fn prepare(&self, mode: CaptureMode) -> DeviceResult<()>;

    /// Start the prepared pipeline, returning the device's start timestamp
    fn commit(&self) -> DeviceResult<DateTime<Utc>>;

    /// Suspend the write path; capture keeps running
    fn pause(&self) -> DeviceResult<()>;

    /// Re-enable the write path
    fn resume(&self) -> DeviceResult<()>;

    /// Shut the pipeline down entirely
    fn stop(&self) -> DeviceResult<()>;

    /// Frames appended to the current (or last) recording
    fn frames_written(&self) -> u64;
}
