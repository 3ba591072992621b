//! Conversion job runner
//!
//! Turns each device's raw recording into a playback file. Output is always
//! written to a `.converting` temp file and only renamed into place after
//! frame-count validation, so a final playback file is never partial.

use super::encoder::{EncodeError, Encoder, ValidationPolicy};
use crate::capture::{count_frames, FrameSource, RawReader};
use crate::jobs::{JobKind, JobRunner, ShareContext, ShareOutcome};
use crate::metadata::layout::file_name;
use crate::metadata::{ConversionInfo, OutputSource, RecordingLayout, SidecarStore};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;

/// Progress bands of a share
const PROGRESS_ENCODE_START: u8 = 5;
const PROGRESS_ENCODE_END: u8 = 95;
const PROGRESS_VALIDATING: u8 = 96;

/// Runner for [`JobKind::Conversion`]
pub struct ConversionRunner {
    encoders: Vec<Arc<dyn Encoder>>,
    policy: ValidationPolicy,
    layout: RecordingLayout,
    store: Arc<dyn SidecarStore>,
    progress_every: u64,
}

impl ConversionRunner {
    /// `encoders` are tried in order until one passes validation
    pub fn new(
        encoders: Vec<Arc<dyn Encoder>>,
        policy: ValidationPolicy,
        layout: RecordingLayout,
        store: Arc<dyn SidecarStore>,
    ) -> Self {
        Self {
            encoders,
            policy,
            layout,
            store,
            progress_every: 10,
        }
    }

    pub fn with_progress_every(mut self, frames: u64) -> Self {
        self.progress_every = frames.max(1);
        self
    }

    /// Replay the raw recording into one encoder, returning output frames
    fn encode_once(
        &self,
        ctx: &ShareContext,
        encoder: &dyn Encoder,
        raw: &Path,
        temp: &Path,
        input_frames: u64,
    ) -> Result<u64, EncodeError> {
        let mut reader = RawReader::open(raw)?;
        let mut session = encoder.begin(temp, reader.format())?;
        let label = format!("Encoding ({})", encoder.name());
        let mut written: u64 = 0;

        loop {
            if ctx.is_cancelled() {
                session.abort();
                return Err(EncodeError::Cancelled);
            }

            let frame = match reader.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    session.abort();
                    return Err(e.into());
                }
            };

            if let Err(e) = session.write_frame(&frame.data) {
                session.abort();
                return Err(e);
            }
            written += 1;

            if written % self.progress_every == 0 && input_frames > 0 {
                let span = (PROGRESS_ENCODE_END - PROGRESS_ENCODE_START) as u64;
                let progress = PROGRESS_ENCODE_START as u64 + written.min(input_frames) * span / input_frames;
                ctx.report(progress as u8, &label);
            }
        }

        ctx.report(PROGRESS_VALIDATING, "Validating output");
        session.finish()
    }

    fn record_existing(&self, ctx: &ShareContext, output: &Path) {
        let batch_id = &ctx.batch().batch_id;
        let result = self.store.update_device(batch_id, ctx.role(), &mut |sidecar| {
            sidecar.conversion = Some(ConversionInfo {
                output_file: file_name(output),
                source: OutputSource::Existing,
                frames: None,
                input_frames: None,
                duration_secs: None,
                encoder: None,
                output_size_mb: None,
                converted_at: Utc::now(),
            });
        });
        if let Err(e) = result {
            ctx.warn(format!("could not update sidecar: {e}"));
        }
    }
}

fn remove_temp(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!("Could not remove temp file {:?}: {}", path, e);
        }
    }
}

impl JobRunner for ConversionRunner {
    fn kind(&self) -> JobKind {
        JobKind::Conversion
    }

    fn run_share(&self, ctx: &ShareContext) -> ShareOutcome {
        let batch_id = ctx.batch().batch_id.clone();
        let role = ctx.role();
        let raw = self.layout.raw_path(&batch_id, role);
        let temp = self.layout.temp_playback_path(&batch_id, role);
        let output = self.layout.playback_path(&batch_id, role);

        remove_temp(&temp);

        if !raw.exists() {
            return ShareOutcome::Failed(format!("Raw recording not found: {}", file_name(&raw)));
        }

        if output.exists() && !ctx.options().force {
            tracing::info!("[{} {}] Playback file exists, skipping", batch_id, role);
            self.record_existing(ctx, &output);
            return ShareOutcome::Skipped {
                result_path: Some(output),
                reason: "Output already exists".to_string(),
            };
        }

        ctx.report(0, "Counting frames");
        let input_frames = match count_frames(&raw) {
            Ok(frames) => frames,
            Err(e) => return ShareOutcome::Failed(format!("Unreadable raw recording: {e}")),
        };
        ctx.set_metric("inputFrames", input_frames);
        ctx.report(PROGRESS_ENCODE_START, "Encoding");

        let mut attempts = Vec::new();
        for encoder in &self.encoders {
            if ctx.is_cancelled() {
                remove_temp(&temp);
                return ShareOutcome::Cancelled;
            }

            tracing::info!("[{} {}] Trying encoder {}", batch_id, role, encoder.name());
            let result = self
                .encode_once(ctx, encoder.as_ref(), &raw, &temp, input_frames)
                .and_then(|frames| self.policy.check(frames, input_frames).map(|()| frames));

            let output_frames = match result {
                Ok(frames) => frames,
                Err(EncodeError::Cancelled) => {
                    remove_temp(&temp);
                    tracing::info!("[{} {}] Conversion cancelled", batch_id, role);
                    return ShareOutcome::Cancelled;
                }
                Err(e) => {
                    remove_temp(&temp);
                    tracing::warn!("[{} {}] Encoder {} failed: {}", batch_id, role, encoder.name(), e);
                    attempts.push(format!("{}: {}", encoder.name(), e));
                    continue;
                }
            };

            if let Err(e) = std::fs::rename(&temp, &output) {
                remove_temp(&temp);
                return ShareOutcome::Failed(format!("Could not finalize output: {e}"));
            }

            let size_mb = std::fs::metadata(&output)
                .map(|m| (m.len() as f64 / (1024.0 * 1024.0) * 10.0).round() / 10.0)
                .unwrap_or(0.0);
            let fps = RawReader::open(&raw).map(|r| r.format().fps).unwrap_or(0);
            let duration_secs = (fps > 0).then(|| output_frames as f64 / fps as f64);

            ctx.set_metric("outputFrames", output_frames);
            ctx.set_metric("encoder", encoder.name());
            ctx.set_metric("outputSizeMb", size_mb);

            let sidecar = self.store.update_device(&batch_id, role, &mut |sidecar| {
                sidecar.conversion = Some(ConversionInfo {
                    output_file: file_name(&output),
                    source: OutputSource::Converted,
                    frames: Some(output_frames),
                    input_frames: Some(input_frames),
                    duration_secs,
                    encoder: Some(encoder.name().to_string()),
                    output_size_mb: Some(size_mb),
                    converted_at: Utc::now(),
                });
            });
            if let Err(e) = sidecar {
                ctx.warn(format!("could not update sidecar: {e}"));
            }

            tracing::info!(
                "[{} {}] Converted {} frames with {} ({} MB)",
                batch_id,
                role,
                output_frames,
                encoder.name(),
                size_mb
            );
            return ShareOutcome::Done {
                result_path: Some(output),
            };
        }

        remove_temp(&temp);
        ShareOutcome::Failed(format!("All encoders failed ({})", attempts.join("; ")))
    }
}
