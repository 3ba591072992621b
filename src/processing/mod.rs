//! Pose analysis of recorded batches
//!
//! This module contains:
//! - The analyzer capability and the motion/tremor metrics
//! - The fixed-shape analysis report
//! - The processing job runner
//! - A helper-process analyzer

pub mod analysis;
pub mod job;
pub mod report;
pub mod subprocess;

pub use analysis::{AnalysisError, Keypoints, MotionAccumulator, MotionSummary, Point, PoseAnalyzer, PoseSession, TremorSeverity};
pub use job::ProcessingRunner;
pub use report::AnalysisReport;
pub use subprocess::SubprocessAnalyzer;
