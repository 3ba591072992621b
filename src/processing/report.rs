//! Analysis report document
//!
//! One report per device share, written to the processed directory. The
//! shape is fixed: every section is always present, with zeros when nothing
//! was detected.

use super::analysis::{FrameSample, MotionSummary, TremorSeverity, KEYPOINT_NAMES};
use crate::capture::{DeviceRole, StreamFormat};
use crate::metadata::DeviceSidecar;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// COCO body keypoints reported per detected person
pub const KEYPOINTS_PER_PERSON: u32 = 17;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub batch_id: String,
    pub device_role: DeviceRole,
    /// Camera view, `frontal` or `sagittal`
    pub view: String,
    pub processed_at: DateTime<Utc>,
    pub patient: PatientSection,
    pub video: VideoSection,
    pub pose_detection: PoseDetectionSection,
    pub pose_keypoints: PoseKeypointsSection,
    pub motion_analysis: MotionSection,
    pub tremor_analysis: TremorSection,
    pub frame_data: Vec<FrameSample>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientSection {
    pub name: String,
    pub id: String,
    pub recorded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSection {
    pub file: String,
    pub frames: u64,
    pub frames_processed: u64,
    pub duration_seconds: f64,
    pub fps: u32,
    pub resolution: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoseDetectionSection {
    pub persons_detected: u64,
    pub persons_not_detected: u64,
    pub detection_rate: f64,
    pub engine: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoseKeypointsSection {
    pub keypoints_per_person: u32,
    pub tracked_regions: Vec<String>,
    pub sampled_frames: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MotionSection {
    pub average_motion: f64,
    pub max_motion: f64,
    pub min_motion: f64,
    pub standard_deviation: f64,
    pub movement_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TremorSection {
    pub nose_jitter_variance: f64,
    pub severity: TremorSeverity,
}

/// Inputs the report is assembled from
pub struct ReportInput<'a> {
    pub batch_id: &'a str,
    pub role: DeviceRole,
    pub raw_file: &'a Path,
    pub format: StreamFormat,
    pub total_frames: u64,
    pub sidecar: Option<&'a DeviceSidecar>,
    pub engine: &'a str,
    pub summary: &'a MotionSummary,
    pub samples: Vec<FrameSample>,
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

impl AnalysisReport {
    pub fn build(input: ReportInput<'_>) -> Self {
        let summary = input.summary;
        let fps = input.format.fps;
        let duration = if fps > 0 {
            input.total_frames as f64 / fps as f64
        } else {
            0.0
        };
        let (name, id, recorded_at) = match input.sidecar {
            Some(s) => (s.patient_name.clone(), s.patient_id.clone(), s.started_at),
            None => (String::new(), String::new(), None),
        };

        Self {
            batch_id: input.batch_id.to_string(),
            device_role: input.role,
            view: match input.role {
                DeviceRole::Front => "sagittal".to_string(),
                DeviceRole::Side => "frontal".to_string(),
            },
            processed_at: Utc::now(),
            patient: PatientSection {
                name,
                id,
                recorded_at,
            },
            video: VideoSection {
                file: crate::metadata::layout::file_name(input.raw_file),
                frames: input.total_frames,
                frames_processed: summary.frames_processed,
                duration_seconds: round_to(duration, 2),
                fps,
                resolution: format!("{}x{}", input.format.width, input.format.height),
            },
            pose_detection: PoseDetectionSection {
                persons_detected: summary.persons_detected,
                persons_not_detected: summary.persons_not_detected,
                detection_rate: round_to(summary.detection_rate, 1),
                engine: input.engine.to_string(),
            },
            pose_keypoints: PoseKeypointsSection {
                keypoints_per_person: KEYPOINTS_PER_PERSON,
                tracked_regions: KEYPOINT_NAMES.iter().map(|s| s.to_string()).collect(),
                sampled_frames: input.samples.len(),
            },
            motion_analysis: MotionSection {
                average_motion: round_to(summary.average_motion, 3),
                max_motion: round_to(summary.max_motion, 3),
                min_motion: round_to(summary.min_motion, 3),
                standard_deviation: round_to(summary.motion_std, 3),
                movement_score: round_to(summary.movement_score, 3),
            },
            tremor_analysis: TremorSection {
                nose_jitter_variance: round_to(summary.tremor_variance, 4),
                severity: summary.tremor_severity,
            },
            frame_data: input.samples,
            status: "completed".to_string(),
        }
    }

    /// Pretty JSON via temp file and rename
    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        let temp = path.with_extension("json.tmp");
        std::fs::write(&temp, json)?;
        std::fs::rename(&temp, path)
    }
}
