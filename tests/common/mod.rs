#![allow(dead_code)]

use chrono::Utc;
use duo_capture::capture::{DeviceRole, Frame, RawWriter, StreamFormat};
use duo_capture::conversion::{EncodeError, EncodeSession, Encoder};
use duo_capture::jobs::{Job, JobEngine};
use duo_capture::metadata::{BatchCatalog, JsonSidecarStore, RecordingLayout, SidecarStore};
use duo_capture::processing::{AnalysisError, Keypoints, Point, PoseAnalyzer, PoseSession};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const FORMAT: StreamFormat = StreamFormat {
    width: 4,
    height: 2,
    fps: 25,
};

pub struct Workspace {
    pub layout: RecordingLayout,
    pub store: Arc<JsonSidecarStore>,
    pub catalog: Arc<BatchCatalog>,
}

impl Workspace {
    pub fn new(root: &Path) -> Self {
        let layout = RecordingLayout::new(root.join("recordings"), root.join("processed"));
        layout.ensure_dirs().unwrap();
        let store = Arc::new(JsonSidecarStore::new(layout.clone(), root.join("state")));
        let catalog = Arc::new(BatchCatalog::new(
            layout.clone(),
            store.clone() as Arc<dyn SidecarStore>,
        ));
        Self { layout, store, catalog }
    }

    pub fn dyn_store(&self) -> Arc<dyn SidecarStore> {
        self.store.clone()
    }

    /// Write a stopped recording with `frames` frames and its sidecar
    pub fn record(&self, batch_id: &str, role: DeviceRole, format: StreamFormat, frames: u64) {
        self.record_live(batch_id, role, format, frames);
        self.store
            .update_device(batch_id, role, &mut |sidecar| {
                sidecar.patient_name = "Test Patient".to_string();
                sidecar.patient_id = "P-001".to_string();
                sidecar.frames_recorded = frames;
                sidecar.stopped_at = Some(Utc::now());
            })
            .unwrap();
    }

    /// Write only the raw file, as a session still recording leaves it
    pub fn record_live(&self, batch_id: &str, role: DeviceRole, format: StreamFormat, frames: u64) {
        let path = self.layout.raw_path(batch_id, role);
        let mut writer = RawWriter::create(&path, format).unwrap();
        let data = vec![7u8; format.frame_size()];
        for _ in 0..frames {
            writer.write_frame(&data).unwrap();
        }
        writer.finish().unwrap();
    }
}

/// Poll until the job reaches a terminal status
pub async fn wait_terminal(engine: &JobEngine, job_id: &str) -> Job {
    for _ in 0..1000 {
        let job = engine.get(job_id).unwrap();
        if job.status.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} did not finish");
}

/// Encoder that keeps a fixed percentage of the frames it is fed
pub struct FakeEncoder {
    name: String,
    keep_percent: u64,
    frame_delay: Duration,
    pub sessions: AtomicUsize,
}

impl FakeEncoder {
    pub fn new(name: &str, keep_percent: u64) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            keep_percent,
            frame_delay: Duration::ZERO,
            sessions: AtomicUsize::new(0),
        })
    }

    pub fn slow(name: &str, frame_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            keep_percent: 100,
            frame_delay,
            sessions: AtomicUsize::new(0),
        })
    }

    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }
}

struct FakeSession {
    file: File,
    frames: u64,
    keep_percent: u64,
    frame_delay: Duration,
}

impl Encoder for FakeEncoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn begin(&self, output: &Path, _format: StreamFormat) -> Result<Box<dyn EncodeSession>, EncodeError> {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            file: File::create(output)?,
            frames: 0,
            keep_percent: self.keep_percent,
            frame_delay: self.frame_delay,
        }))
    }
}

impl EncodeSession for FakeSession {
    fn write_frame(&mut self, frame: &[u8]) -> Result<(), EncodeError> {
        if !self.frame_delay.is_zero() {
            std::thread::sleep(self.frame_delay);
        }
        self.file.write_all(&frame[..1])?;
        self.frames += 1;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<u64, EncodeError> {
        self.file.flush()?;
        Ok(self.frames * self.keep_percent / 100)
    }

    fn abort(self: Box<Self>) {}
}

/// Analyzer that finds a person in every frame, drifting along x
pub struct FakeAnalyzer {
    /// Frames of this width make the analyzer fail
    pub fail_width: Option<u32>,
}

struct FakePose {
    fail_width: Option<u32>,
}

impl PoseAnalyzer for FakeAnalyzer {
    fn name(&self) -> &str {
        "fake-pose"
    }

    fn start(&self) -> Result<Box<dyn PoseSession>, AnalysisError> {
        Ok(Box::new(FakePose {
            fail_width: self.fail_width,
        }))
    }
}

impl PoseSession for FakePose {
    fn detect(&mut self, frame: &Frame) -> Result<Option<Keypoints>, AnalysisError> {
        if Some(frame.width) == self.fail_width {
            return Err(AnalysisError::Analyzer("model crashed".to_string()));
        }
        if frame.index % 5 == 4 {
            return Ok(None);
        }
        let p = Point {
            x: (frame.index % 3) as f64,
            y: 0.0,
        };
        Ok(Some(Keypoints {
            nose: p,
            left_eye: p,
            right_eye: p,
            left_ear: p,
            right_ear: p,
        }))
    }
}
