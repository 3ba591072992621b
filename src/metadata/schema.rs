//! Sidecar document definitions
//!
//! Device sidecars sit next to each raw recording and accumulate provenance
//! as the recording moves through the pipeline: the controller writes the
//! capture fields on stop, the conversion and processing jobs add their own
//! sections later. Every field is defaulted so older sidecars keep loading.

use crate::capture::DeviceRole;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-device sidecar for one batch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceSidecar {
    pub version: String,
    pub batch_id: String,
    pub device_role: Option<DeviceRole>,
    pub device_id: String,
    pub patient_name: String,
    pub patient_id: String,
    pub raw_file: Option<String>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub frames_recorded: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub start_offset_ms: Option<f64>,
    pub warnings: Vec<String>,
    pub conversion: Option<ConversionInfo>,
    pub processing: Option<ProcessingInfo>,
}

impl Default for DeviceSidecar {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            batch_id: String::new(),
            device_role: None,
            device_id: String::new(),
            patient_name: String::new(),
            patient_id: String::new(),
            raw_file: None,
            width: 0,
            height: 0,
            fps: 0,
            frames_recorded: 0,
            started_at: None,
            stopped_at: None,
            start_offset_ms: None,
            warnings: Vec::new(),
            conversion: None,
            processing: None,
        }
    }
}

/// How a playback file came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputSource {
    /// Produced by a conversion job
    Converted,
    /// Found already present and left untouched
    Existing,
}

/// Conversion results stamped into the sidecar
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionInfo {
    pub output_file: String,
    pub source: OutputSource,
    pub frames: Option<u64>,
    pub input_frames: Option<u64>,
    pub duration_secs: Option<f64>,
    pub encoder: Option<String>,
    pub output_size_mb: Option<f64>,
    pub converted_at: DateTime<Utc>,
}

/// Processing results stamped into the sidecar
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingInfo {
    pub report_file: String,
    pub frames_processed: u64,
    pub duration_secs: f64,
    pub processed_at: DateTime<Utc>,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    /// Stopped after recording
    Completed,
    /// Stopped before the warmup finished
    CancelledDuringWarmup,
}

/// One participant in an archived session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDeviceRecord {
    pub role: DeviceRole,
    pub device_id: String,
    pub present: bool,
    pub frames_written: u64,
    pub output_file: Option<String>,
    pub error: Option<String>,
}

/// Archive entry written when a session ends
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub patient_name: String,
    pub patient_id: String,
    pub note: Option<String>,
    pub outcome: SessionOutcome,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: DateTime<Utc>,
    pub start_offset_ms: Option<f64>,
    pub stop_offset_ms: Option<f64>,
    pub recorded_duration_secs: f64,
    pub devices: Vec<SessionDeviceRecord>,
    pub warnings: Vec<String>,
}
