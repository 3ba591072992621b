//! Pose analysis capability and motion metrics
//!
//! The analyzer finds head keypoints in a frame. Everything else here is
//! plain arithmetic over the detected keypoints: inter-frame motion, nose
//! jitter variance, and the landmark samples kept for the report.

use crate::capture::{Frame, RawError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Analysis errors
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Analyzer failed: {0}")]
    Analyzer(String),

    #[error("Raw recording error: {0}")]
    Raw(#[from] RawError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Names of the tracked keypoints, in report order
pub const KEYPOINT_NAMES: [&str; 5] = ["nose", "left_eye", "right_eye", "left_ear", "right_ear"];

/// Landmarks are sampled every this many frames
pub const SAMPLE_EVERY: u64 = 10;

/// At most this many samples go into a report
pub const MAX_SAMPLES: usize = 50;

/// Fewer detections than this give a zero tremor variance
const MIN_TREMOR_FRAMES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn distance(&self, other: &Point) -> f64 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Head keypoints of the first detected person
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Keypoints {
    pub nose: Point,
    pub left_eye: Point,
    pub right_eye: Point,
    pub left_ear: Point,
    pub right_ear: Point,
}

impl Keypoints {
    pub fn points(&self) -> [Point; 5] {
        [self.nose, self.left_eye, self.right_eye, self.left_ear, self.right_ear]
    }
}

/// A pose estimator bound to one stream
pub trait PoseSession: Send {
    /// Keypoints of the first person in the frame, `None` when nobody is found
    fn detect(&mut self, frame: &Frame) -> Result<Option<Keypoints>, AnalysisError>;
}

/// Pose estimation capability
pub trait PoseAnalyzer: Send + Sync {
    /// Engine name recorded in reports
    fn name(&self) -> &str;

    /// Open a session for one device share
    fn start(&self) -> Result<Box<dyn PoseSession>, AnalysisError>;
}

/// Movement between two consecutive detections
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameMotion {
    pub total_motion: f64,
    pub average_motion: f64,
    pub max_point_motion: f64,
    pub points_tracked: usize,
}

impl FrameMotion {
    pub fn between(prev: &Keypoints, curr: &Keypoints) -> Self {
        let distances: Vec<f64> = prev
            .points()
            .iter()
            .zip(curr.points().iter())
            .map(|(a, b)| a.distance(b))
            .collect();
        let total: f64 = distances.iter().sum();
        Self {
            total_motion: total,
            average_motion: total / distances.len().max(1) as f64,
            max_point_motion: distances.iter().copied().fold(0.0, f64::max),
            points_tracked: distances.len(),
        }
    }
}

/// Landmark sample kept for the report
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameSample {
    pub frame_number: u64,
    pub landmarks: Keypoints,
    pub motion: Option<FrameMotion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TremorSeverity {
    None,
    Mild,
    Moderate,
    Severe,
}

impl TremorSeverity {
    pub fn from_variance(variance: f64) -> Self {
        if variance < 1.0 {
            TremorSeverity::None
        } else if variance < 5.0 {
            TremorSeverity::Mild
        } else if variance < 20.0 {
            TremorSeverity::Moderate
        } else {
            TremorSeverity::Severe
        }
    }
}

/// Aggregated results of one share
#[derive(Debug, Clone, PartialEq)]
pub struct MotionSummary {
    pub frames_processed: u64,
    pub persons_detected: u64,
    pub persons_not_detected: u64,
    /// Percentage of frames with a detection
    pub detection_rate: f64,
    pub average_motion: f64,
    pub max_motion: f64,
    pub min_motion: f64,
    pub motion_std: f64,
    /// 0..=1, higher means more movement
    pub movement_score: f64,
    pub tremor_variance: f64,
    pub tremor_severity: TremorSeverity,
}

/// Accumulates detections frame by frame
#[derive(Debug, Default)]
pub struct MotionAccumulator {
    frames: u64,
    detected: u64,
    missed: u64,
    prev: Option<Keypoints>,
    motions: Vec<f64>,
    nose_x: Vec<f64>,
    samples: Vec<FrameSample>,
}

impl MotionAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame_number: u64, detection: Option<Keypoints>) {
        self.frames += 1;
        let Some(keypoints) = detection else {
            self.missed += 1;
            // Motion is only measured between consecutive detections
            self.prev = None;
            return;
        };

        self.detected += 1;
        self.nose_x.push(keypoints.nose.x);

        let motion = self.prev.as_ref().map(|prev| FrameMotion::between(prev, &keypoints));
        if let Some(m) = &motion {
            self.motions.push(m.average_motion);
        }
        self.prev = Some(keypoints);

        if frame_number % SAMPLE_EVERY == 0 && self.samples.len() < MAX_SAMPLES {
            self.samples.push(FrameSample {
                frame_number,
                landmarks: keypoints,
                motion,
            });
        }
    }

    pub fn persons_detected(&self) -> u64 {
        self.detected
    }

    pub fn samples(&self) -> &[FrameSample] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<FrameSample> {
        self.samples
    }

    pub fn summary(&self) -> MotionSummary {
        let (average, std, max, min) = if self.motions.is_empty() {
            (0.0, 0.0, 0.0, 0.0)
        } else {
            let mean = mean(&self.motions);
            (
                mean,
                variance(&self.motions, mean).sqrt(),
                self.motions.iter().copied().fold(f64::MIN, f64::max),
                self.motions.iter().copied().fold(f64::MAX, f64::min),
            )
        };

        let tremor = if self.nose_x.len() < MIN_TREMOR_FRAMES {
            0.0
        } else {
            variance(&self.nose_x, mean(&self.nose_x))
        };

        let observed = self.detected + self.missed;
        MotionSummary {
            frames_processed: self.frames,
            persons_detected: self.detected,
            persons_not_detected: self.missed,
            detection_rate: self.detected as f64 / observed.max(1) as f64 * 100.0,
            average_motion: average,
            max_motion: max,
            min_motion: min,
            motion_std: std,
            movement_score: (average / 5.0).min(1.0),
            tremor_variance: tremor,
            tremor_severity: TremorSeverity::from_variance(tremor),
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len().max(1) as f64
}

/// Population variance
fn variance(values: &[f64], mean: f64) -> f64 {
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len().max(1) as f64
}
