//! Simulated capture device
//!
//! Behaves like a real camera from the controller's point of view: a
//! frame-grab thread produces frames at the configured rate and, while a
//! recording pipeline is committed and not paused, appends them to a raw
//! recording. Used for development without hardware and in tests.

use super::raw::{RawWriter, StreamFormat};
use super::traits::{CaptureMode, DeviceError, DeviceHandle, DeviceInfo, DeviceResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Pipeline built by `prepare`, waiting for `commit`
struct PreparedPipeline {
    writer: Option<RawWriter>,
}

/// Pipeline with a live frame-grab thread
struct RunningPipeline {
    stop: Arc<AtomicBool>,
    recording: bool,
    thread: JoinHandle<()>,
}

#[derive(Default)]
struct PipelineSlots {
    prepared: Option<PreparedPipeline>,
    running: Option<RunningPipeline>,
}

/// A capture device backed by a synthetic frame generator
pub struct SimulatedDevice {
    info: DeviceInfo,
    present: AtomicBool,
    prepare_delay: Duration,
    pipeline: Mutex<PipelineSlots>,
    frames_written: Arc<AtomicU64>,
    /// Write gate: the capture thread holds this lock while checking and
    /// appending a frame, so once `pause` returns no further frame is written
    paused: Arc<Mutex<bool>>,
}

impl SimulatedDevice {
    /// Create a simulated device
    pub fn new(id: impl Into<String>, format: StreamFormat) -> Self {
        let id = id.into();
        Self {
            info: DeviceInfo {
                name: format!("Simulated camera {id}"),
                id,
                width: format.width,
                height: format.height,
                fps: format.fps,
            },
            present: AtomicBool::new(true),
            prepare_delay: Duration::ZERO,
            pipeline: Mutex::new(PipelineSlots::default()),
            frames_written: Arc::new(AtomicU64::new(0)),
            paused: Arc::new(Mutex::new(false)),
        }
    }

    /// Add an artificial delay to `prepare`, like a real pipeline rebuild
    pub fn with_prepare_delay(mut self, delay: Duration) -> Self {
        self.prepare_delay = delay;
        self
    }

    /// Simulate plugging or unplugging the device
    pub fn set_present(&self, present: bool) {
        self.present.store(present, Ordering::SeqCst);
    }

    /// Whether a recording pipeline is committed
    pub fn is_recording(&self) -> bool {
        self.pipeline
            .lock()
            .running
            .as_ref()
            .map(|p| p.recording)
            .unwrap_or(false)
    }

    fn format(&self) -> StreamFormat {
        StreamFormat {
            width: self.info.width,
            height: self.info.height,
            fps: self.info.fps,
        }
    }

    fn teardown(slots: &mut PipelineSlots) {
        if let Some(running) = slots.running.take() {
            running.stop.store(true, Ordering::SeqCst);
            if running.thread.join().is_err() {
                tracing::error!("Simulated capture thread panicked");
            }
        }
    }
}

impl DeviceHandle for SimulatedDevice {
    fn id(&self) -> &str {
        &self.info.id
    }

    fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    fn is_present(&self) -> bool {
        self.present.load(Ordering::SeqCst)
    }

    fn prepare(&self, mode: CaptureMode) -> DeviceResult<()> {
        if !self.is_present() {
            return Err(DeviceError::NotPresent(self.info.id.clone()));
        }

        tracing::debug!("[{}] Preparing pipeline: {:?}", self.info.id, mode);

        let mut slots = self.pipeline.lock();
        Self::teardown(&mut slots);

        if !self.prepare_delay.is_zero() {
            std::thread::sleep(self.prepare_delay);
        }

        let writer = match mode {
            CaptureMode::Recording { output } => Some(
                RawWriter::create(&output, self.format())
                    .map_err(|e| DeviceError::Pipeline(e.to_string()))?,
            ),
            CaptureMode::Streaming => None,
        };

        slots.prepared = Some(PreparedPipeline { writer });
        Ok(())
    }

    fn commit(&self) -> DeviceResult<DateTime<Utc>> {
        let mut slots = self.pipeline.lock();
        let prepared = slots.prepared.take().ok_or(DeviceError::NotPrepared)?;

        let recording = prepared.writer.is_some();
        if recording {
            self.frames_written.store(0, Ordering::SeqCst);
            *self.paused.lock() = false;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let frames_written = self.frames_written.clone();
        let paused = self.paused.clone();
        let format = self.format();
        let device_id = self.info.id.clone();
        let mut writer = prepared.writer;

        let committed_at = Utc::now();

        let thread = std::thread::Builder::new()
            .name(format!("capture-{device_id}"))
            .spawn(move || {
                let interval = Duration::from_secs_f64(1.0 / format.fps as f64);
                let mut frame = vec![0u8; format.frame_size()];
                let mut grabbed: u64 = 0;

                while !thread_stop.load(Ordering::SeqCst) {
                    frame.fill((grabbed % 251) as u8);
                    grabbed += 1;

                    if let Some(ref mut w) = writer {
                        let gate = paused.lock();
                        if !*gate {
                            match w.write_frame(&frame) {
                                Ok(()) => {
                                    frames_written.fetch_add(1, Ordering::SeqCst);
                                }
                                Err(e) => {
                                    tracing::error!("[{}] Frame write failed: {}", device_id, e);
                                }
                            }
                        }
                    }

                    std::thread::sleep(interval);
                }

                if let Some(w) = writer {
                    match w.finish() {
                        Ok(frames) => tracing::info!("[{}] Recording closed: {} frames", device_id, frames),
                        Err(e) => tracing::error!("[{}] Failed to close recording: {}", device_id, e),
                    }
                }
            })?;

        slots.running = Some(RunningPipeline {
            stop,
            recording,
            thread,
        });

        tracing::info!(
            "[{}] Pipeline committed ({})",
            self.info.id,
            if recording { "recording" } else { "streaming" }
        );
        Ok(committed_at)
    }

    fn pause(&self) -> DeviceResult<()> {
        if !self.is_recording() {
            return Err(DeviceError::NotRecording);
        }
        *self.paused.lock() = true;
        tracing::debug!("[{}] Write path paused", self.info.id);
        Ok(())
    }

    fn resume(&self) -> DeviceResult<()> {
        if !self.is_recording() {
            return Err(DeviceError::NotRecording);
        }
        *self.paused.lock() = false;
        tracing::debug!("[{}] Write path resumed", self.info.id);
        Ok(())
    }

    fn stop(&self) -> DeviceResult<()> {
        let mut slots = self.pipeline.lock();
        Self::teardown(&mut slots);
        slots.prepared = None;
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames_written.load(Ordering::SeqCst)
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        Self::teardown(&mut self.pipeline.lock());
    }
}
