//! Processing job runner
//!
//! Replays each device's raw recording through a [`PoseAnalyzer`] and writes
//! one analysis report per device. A failing device does not sink the other
//! one; the job succeeds when any device produced a report.

use super::analysis::{AnalysisError, MotionAccumulator, PoseAnalyzer};
use super::report::{AnalysisReport, ReportInput};
use crate::capture::{FrameSource, RawReader};
use crate::jobs::{JobKind, JobRunner, ShareContext, ShareOutcome};
use crate::metadata::layout::file_name;
use crate::metadata::{ProcessingInfo, RecordingLayout, SidecarStore};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;

const PROGRESS_FRAMES_START: u64 = 12;
const PROGRESS_FRAMES_SPAN: u64 = 78;
const PROGRESS_FRAMES_CAP: u8 = 89;

/// Runner for [`JobKind::Processing`]
pub struct ProcessingRunner {
    analyzer: Arc<dyn PoseAnalyzer>,
    layout: RecordingLayout,
    store: Arc<dyn SidecarStore>,
    progress_every: u64,
}

enum Replay {
    Finished(MotionAccumulator),
    Cancelled,
}

impl ProcessingRunner {
    pub fn new(analyzer: Arc<dyn PoseAnalyzer>, layout: RecordingLayout, store: Arc<dyn SidecarStore>) -> Self {
        Self {
            analyzer,
            layout,
            store,
            progress_every: 10,
        }
    }

    pub fn with_progress_every(mut self, frames: u64) -> Self {
        self.progress_every = frames.max(1);
        self
    }

    fn replay(&self, ctx: &ShareContext, reader: &mut RawReader) -> Result<Replay, AnalysisError> {
        let total = reader.frame_count();
        let mut session = self.analyzer.start()?;
        let mut acc = MotionAccumulator::new();
        let mut processed: u64 = 0;

        ctx.report(PROGRESS_FRAMES_START as u8, "Analyzing frames");
        while let Some(frame) = reader.next_frame()? {
            if ctx.is_cancelled() {
                return Ok(Replay::Cancelled);
            }

            let detection = session.detect(&frame)?;
            acc.push(frame.index, detection);
            processed += 1;

            if processed % self.progress_every == 0 && total > 0 {
                let progress = PROGRESS_FRAMES_START + processed.min(total) * PROGRESS_FRAMES_SPAN / total;
                ctx.report(
                    (progress as u8).min(PROGRESS_FRAMES_CAP),
                    &format!("Analyzing frame {processed}/{total}"),
                );
            }
        }

        Ok(Replay::Finished(acc))
    }
}

impl JobRunner for ProcessingRunner {
    fn kind(&self) -> JobKind {
        JobKind::Processing
    }

    fn run_share(&self, ctx: &ShareContext) -> ShareOutcome {
        let started = Instant::now();
        let batch_id = ctx.batch().batch_id.clone();
        let role = ctx.role();
        let raw = self.layout.raw_path(&batch_id, role);

        ctx.report(2, "Initializing");
        if !raw.exists() {
            return ShareOutcome::Failed(format!("Raw recording not found: {}", file_name(&raw)));
        }

        ctx.report(5, "Opening recording");
        let mut reader = match RawReader::open(&raw) {
            Ok(reader) => reader,
            Err(e) => return ShareOutcome::Failed(format!("Unreadable raw recording: {e}")),
        };
        let total = reader.frame_count();
        let format = reader.format();
        ctx.report(10, &format!("Loaded {total} frames"));
        ctx.set_metric("totalFrames", total);

        let sidecar = match self.store.load_device(&batch_id, role) {
            Ok(sidecar) => sidecar,
            Err(e) => {
                ctx.warn(format!("could not read sidecar: {e}"));
                None
            }
        };
        ctx.report(11, "Loaded metadata");

        tracing::info!(
            "[{} {}] Analyzing {} frames with {}",
            batch_id,
            role,
            total,
            self.analyzer.name()
        );
        let acc = match self.replay(ctx, &mut reader) {
            Ok(Replay::Finished(acc)) => acc,
            Ok(Replay::Cancelled) => {
                tracing::info!("[{} {}] Processing cancelled", batch_id, role);
                return ShareOutcome::Cancelled;
            }
            Err(e) => {
                tracing::warn!("[{} {}] Analysis failed: {}", batch_id, role, e);
                return ShareOutcome::Failed(format!("Analysis failed: {e}"));
            }
        };

        ctx.report(91, "Computing final metrics");
        let summary = acc.summary();
        ctx.set_metric("framesProcessed", summary.frames_processed);
        ctx.set_metric("personsDetected", summary.persons_detected);

        ctx.report(96, "Generating report");
        let report = AnalysisReport::build(ReportInput {
            batch_id: &batch_id,
            role,
            raw_file: &raw,
            format,
            total_frames: total,
            sidecar: sidecar.as_ref(),
            engine: self.analyzer.name(),
            summary: &summary,
            samples: acc.into_samples(),
        });

        let report_path = self.layout.report_path(&batch_id, role);
        if let Err(e) = report.write(&report_path) {
            return ShareOutcome::Failed(format!("Could not write report: {e}"));
        }

        let elapsed = started.elapsed().as_secs_f64();
        ctx.set_metric("processingSecs", (elapsed * 100.0).round() / 100.0);

        let updated = self.store.update_device(&batch_id, role, &mut |sidecar| {
            sidecar.processing = Some(ProcessingInfo {
                report_file: file_name(&report_path),
                frames_processed: summary.frames_processed,
                duration_secs: elapsed,
                processed_at: Utc::now(),
            });
        });
        if let Err(e) = updated {
            ctx.warn(format!("could not update sidecar: {e}"));
        }

        tracing::info!(
            "[{} {}] Processed {} frames in {:.1}s, {} detections",
            batch_id,
            role,
            summary.frames_processed,
            elapsed,
            summary.persons_detected
        );
        ShareOutcome::Done {
            result_path: Some(report_path),
        }
    }

    fn allows_partial_success(&self) -> bool {
        true
    }
}
