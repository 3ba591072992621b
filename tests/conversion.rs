mod common;

use common::{wait_terminal, FakeEncoder, Workspace, FORMAT};
use duo_capture::capture::DeviceRole;
use duo_capture::conversion::{ConversionRunner, Encoder, ValidationPolicy};
use duo_capture::jobs::{DeviceJobStatus, JobEngine, JobError, JobKind, JobOptions, JobRunner, JobStatus};
use duo_capture::jobs::Job;
use duo_capture::metadata::{
    DeviceSidecar, JsonSidecarStore, OutputSource, SessionRecord, SidecarResult, SidecarStore,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

const BATCH: &str = "2026-03-01_09-15-00-000";
const LATER: &str = "2026-03-01_09-20-00-000";

fn engine(ws: &Workspace, encoders: Vec<Arc<dyn Encoder>>) -> JobEngine {
    let runner: Arc<dyn JobRunner> = Arc::new(ConversionRunner::new(
        encoders,
        ValidationPolicy::default(),
        ws.layout.clone(),
        ws.dyn_store(),
    ));
    JobEngine::new(ws.catalog.clone(), ws.dyn_store(), vec![runner])
}

#[tokio::test]
async fn test_full_output_passes() {
    let dir = tempdir().unwrap();
    let ws = Workspace::new(dir.path());
    ws.record(BATCH, DeviceRole::Front, FORMAT, 100);
    ws.record(BATCH, DeviceRole::Side, FORMAT, 100);

    let engine = engine(&ws, vec![FakeEncoder::new("primary", 100)]);
    let job = engine.submit(JobKind::Conversion, BATCH, JobOptions::default()).unwrap();
    assert_eq!(job.status, JobStatus::Pending);

    let job = wait_terminal(&engine, &job.job_id).await;
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.progress(), 100);

    for role in [DeviceRole::Front, DeviceRole::Side] {
        assert!(ws.layout.playback_path(BATCH, role).exists());
        assert!(!ws.layout.temp_playback_path(BATCH, role).exists());

        let sidecar = ws.store.load_device(BATCH, role).unwrap().unwrap();
        let conversion = sidecar.conversion.unwrap();
        assert_eq!(conversion.source, OutputSource::Converted);
        assert_eq!(conversion.frames, Some(100));
        assert_eq!(conversion.encoder.as_deref(), Some("primary"));
        assert_eq!(conversion.duration_secs, Some(4.0));
    }
}

#[tokio::test]
async fn test_ninety_six_percent_passes() {
    let dir = tempdir().unwrap();
    let ws = Workspace::new(dir.path());
    ws.record(BATCH, DeviceRole::Front, FORMAT, 100);

    let engine = engine(&ws, vec![FakeEncoder::new("primary", 96)]);
    let job = engine.submit(JobKind::Conversion, BATCH, JobOptions::default()).unwrap();
    let job = wait_terminal(&engine, &job.job_id).await;

    assert_eq!(job.status, JobStatus::Done);
    assert!(ws.layout.playback_path(BATCH, DeviceRole::Front).exists());
}

#[tokio::test]
async fn test_short_output_falls_back_to_next_encoder() {
    let dir = tempdir().unwrap();
    let ws = Workspace::new(dir.path());
    ws.record(BATCH, DeviceRole::Front, FORMAT, 100);

    let lossy = FakeEncoder::new("lossy", 94);
    let fallback = FakeEncoder::new("fallback", 100);
    let engine = engine(&ws, vec![lossy.clone(), fallback.clone()]);

    let job = engine.submit(JobKind::Conversion, BATCH, JobOptions::default()).unwrap();
    let job = wait_terminal(&engine, &job.job_id).await;

    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(lossy.sessions(), 1);
    assert_eq!(fallback.sessions(), 1);
    let sidecar = ws.store.load_device(BATCH, DeviceRole::Front).unwrap().unwrap();
    assert_eq!(sidecar.conversion.unwrap().encoder.as_deref(), Some("fallback"));
}

#[tokio::test]
async fn test_all_encoders_failing_fails_the_job() {
    let dir = tempdir().unwrap();
    let ws = Workspace::new(dir.path());
    ws.record(BATCH, DeviceRole::Front, FORMAT, 100);

    let engine = engine(&ws, vec![FakeEncoder::new("a", 94), FakeEncoder::new("b", 50)]);
    let job = engine.submit(JobKind::Conversion, BATCH, JobOptions::default()).unwrap();
    let job = wait_terminal(&engine, &job.job_id).await;

    assert_eq!(job.status, JobStatus::Failed);
    let share = &job.per_device[&DeviceRole::Front];
    assert_eq!(share.status, DeviceJobStatus::Failed);
    assert!(share.error.as_ref().unwrap().contains("All encoders failed"));
    assert!(!ws.layout.playback_path(BATCH, DeviceRole::Front).exists());
    assert!(!ws.layout.temp_playback_path(BATCH, DeviceRole::Front).exists());
}

#[tokio::test]
async fn test_existing_output_is_skipped_unless_forced() {
    let dir = tempdir().unwrap();
    let ws = Workspace::new(dir.path());
    ws.record(BATCH, DeviceRole::Front, FORMAT, 10);
    std::fs::write(ws.layout.playback_path(BATCH, DeviceRole::Front), b"already here").unwrap();

    let encoder = FakeEncoder::new("primary", 100);
    let engine = engine(&ws, vec![encoder.clone()]);

    let job = engine.submit(JobKind::Conversion, BATCH, JobOptions::default()).unwrap();
    let job = wait_terminal(&engine, &job.job_id).await;
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.per_device[&DeviceRole::Front].status, DeviceJobStatus::Skipped);
    assert_eq!(encoder.sessions(), 0);
    let sidecar = ws.store.load_device(BATCH, DeviceRole::Front).unwrap().unwrap();
    assert_eq!(sidecar.conversion.unwrap().source, OutputSource::Existing);

    let job = engine
        .submit(JobKind::Conversion, BATCH, JobOptions { force: true })
        .unwrap();
    let job = wait_terminal(&engine, &job.job_id).await;
    assert_eq!(job.per_device[&DeviceRole::Front].status, DeviceJobStatus::Done);
    assert_eq!(encoder.sessions(), 1);
}

#[tokio::test]
async fn test_duplicate_submit_conflicts_and_cancel_leaves_no_artifact() {
    let dir = tempdir().unwrap();
    let ws = Workspace::new(dir.path());
    ws.record(BATCH, DeviceRole::Front, FORMAT, 500);

    let engine = engine(&ws, vec![FakeEncoder::slow("slow", Duration::from_millis(5))]);
    let job = engine.submit(JobKind::Conversion, BATCH, JobOptions::default()).unwrap();

    let err = engine
        .submit(JobKind::Conversion, BATCH, JobOptions::default())
        .unwrap_err();
    assert!(matches!(err, JobError::Conflict { ref existing, .. } if *existing == job.job_id));
    assert_eq!(engine.list(Some(JobKind::Conversion)).unwrap().len(), 1);

    // Let the share get going before cancelling
    for _ in 0..200 {
        if engine.get(&job.job_id).unwrap().status == JobStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    engine.cancel(&job.job_id).unwrap();

    let job = wait_terminal(&engine, &job.job_id).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.cancel_requested);
    assert!(!ws.layout.playback_path(BATCH, DeviceRole::Front).exists());
    assert!(!ws.layout.temp_playback_path(BATCH, DeviceRole::Front).exists());

    // Terminal jobs stay terminal
    let err = engine.cancel(&job.job_id).unwrap_err();
    assert!(matches!(err, JobError::AlreadyTerminal { status: JobStatus::Cancelled, .. }));
    assert_eq!(engine.get(&job.job_id).unwrap().status, JobStatus::Cancelled);
    assert!(engine.active_job(BATCH, JobKind::Conversion).is_none());
}

#[tokio::test]
async fn test_unknown_batch_is_not_found() {
    let dir = tempdir().unwrap();
    let ws = Workspace::new(dir.path());
    let engine = engine(&ws, vec![FakeEncoder::new("primary", 100)]);

    let err = engine
        .submit(JobKind::Conversion, "no-such-batch", JobOptions::default())
        .unwrap_err();
    assert!(matches!(err, JobError::NotFound(_)));
    assert!(engine.list(None).unwrap().is_empty());
}

#[tokio::test]
async fn test_batch_still_recording_is_rejected() {
    let dir = tempdir().unwrap();
    let ws = Workspace::new(dir.path());
    ws.record_live(BATCH, DeviceRole::Front, FORMAT, 20);

    let engine = engine(&ws, vec![FakeEncoder::new("primary", 100)]);
    let err = engine
        .submit(JobKind::Conversion, BATCH, JobOptions::default())
        .unwrap_err();
    assert!(matches!(err, JobError::InvalidRequest(ref msg) if msg.contains("still recording")));
    assert!(engine.list(None).unwrap().is_empty());
    assert!(!ws.layout.playback_path(BATCH, DeviceRole::Front).exists());
}

#[tokio::test]
async fn test_batch_id_escaping_the_recordings_dir_is_rejected() {
    let dir = tempdir().unwrap();
    let ws = Workspace::new(dir.path());
    let engine = engine(&ws, vec![FakeEncoder::new("primary", 100)]);

    for batch_id in ["../recordings/x", "a/b", ".."] {
        let err = engine
            .submit(JobKind::Conversion, batch_id, JobOptions::default())
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidRequest(_)), "{batch_id}");
    }
    assert!(ws.catalog.find("../recordings/x").is_none());
}

#[tokio::test]
async fn test_batches_run_one_at_a_time() {
    let dir = tempdir().unwrap();
    let ws = Workspace::new(dir.path());
    ws.record(BATCH, DeviceRole::Front, FORMAT, 100);
    ws.record(LATER, DeviceRole::Front, FORMAT, 100);

    let engine = engine(&ws, vec![FakeEncoder::slow("slow", Duration::from_millis(5))]);
    let first = engine.submit(JobKind::Conversion, BATCH, JobOptions::default()).unwrap();
    let second = engine.submit(JobKind::Conversion, LATER, JobOptions::default()).unwrap();

    for _ in 0..200 {
        if engine.get(&first.job_id).unwrap().status == JobStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(engine.get(&first.job_id).unwrap().status, JobStatus::Running);
    assert_eq!(engine.get(&second.job_id).unwrap().status, JobStatus::Pending);

    let first = wait_terminal(&engine, &first.job_id).await;
    let second = wait_terminal(&engine, &second.job_id).await;
    assert_eq!(first.status, JobStatus::Done);
    assert_eq!(second.status, JobStatus::Done);
    assert!(second.started_at.unwrap() >= first.completed_at.unwrap());
}

#[tokio::test]
async fn test_progress_never_decreases() {
    let dir = tempdir().unwrap();
    let ws = Workspace::new(dir.path());
    ws.record(BATCH, DeviceRole::Front, FORMAT, 200);

    let engine = engine(&ws, vec![FakeEncoder::slow("slow", Duration::from_millis(2))]);
    let job = engine.submit(JobKind::Conversion, BATCH, JobOptions::default()).unwrap();

    let mut seen = Vec::new();
    loop {
        let snapshot = engine.get(&job.job_id).unwrap();
        seen.push(snapshot.per_device[&DeviceRole::Front].progress);
        if snapshot.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(3)).await;
    }
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
    assert_eq!(seen.last(), Some(&100));
    assert!(seen.iter().any(|p| *p > 0 && *p < 100));
}

/// Store whose final job write is slow
struct SlowFinishStore {
    inner: Arc<JsonSidecarStore>,
    delay: Duration,
}

impl SidecarStore for SlowFinishStore {
    fn load_device(&self, batch_id: &str, role: DeviceRole) -> SidecarResult<Option<DeviceSidecar>> {
        self.inner.load_device(batch_id, role)
    }

    fn update_device(
        &self,
        batch_id: &str,
        role: DeviceRole,
        update: &mut dyn FnMut(&mut DeviceSidecar),
    ) -> SidecarResult<DeviceSidecar> {
        self.inner.update_device(batch_id, role, update)
    }

    fn save_session(&self, record: &SessionRecord) -> SidecarResult<()> {
        self.inner.save_session(record)
    }

    fn load_session(&self, session_id: &str) -> SidecarResult<Option<SessionRecord>> {
        self.inner.load_session(session_id)
    }

    fn save_job(&self, job: &Job) -> SidecarResult<()> {
        if job.status.is_terminal() {
            std::thread::sleep(self.delay);
        }
        self.inner.save_job(job)
    }

    fn load_job(&self, job_id: &str) -> SidecarResult<Option<Job>> {
        self.inner.load_job(job_id)
    }

    fn list_jobs(&self) -> SidecarResult<Vec<Job>> {
        self.inner.list_jobs()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_polling_and_submitting_while_a_job_finishes() {
    let dir = tempdir().unwrap();
    let ws = Workspace::new(dir.path());
    ws.record(BATCH, DeviceRole::Front, FORMAT, 5);
    ws.record(LATER, DeviceRole::Front, FORMAT, 5);

    let store: Arc<dyn SidecarStore> = Arc::new(SlowFinishStore {
        inner: ws.store.clone(),
        delay: Duration::from_millis(400),
    });
    let runner: Arc<dyn JobRunner> = Arc::new(ConversionRunner::new(
        vec![FakeEncoder::new("primary", 100)],
        ValidationPolicy::default(),
        ws.layout.clone(),
        store.clone(),
    ));
    let engine = JobEngine::new(ws.catalog.clone(), store, vec![runner]);

    let first = engine.submit(JobKind::Conversion, BATCH, JobOptions::default()).unwrap();
    // Five frames encode at once; the engine is now inside the final save
    tokio::time::sleep(Duration::from_millis(100)).await;

    let lister = engine.clone();
    let list = tokio::task::spawn_blocking(move || lister.list(None));
    let submitter = engine.clone();
    let submit = tokio::task::spawn_blocking(move || {
        submitter.submit(JobKind::Conversion, LATER, JobOptions::default())
    });
    let canceller = engine.clone();
    let first_id = first.job_id.clone();
    let cancel = tokio::task::spawn_blocking(move || canceller.cancel(&first_id));

    let (list, submit, _cancel) = tokio::time::timeout(Duration::from_secs(5), async {
        (list.await.unwrap(), submit.await.unwrap(), cancel.await.unwrap())
    })
    .await
    .expect("engine calls blocked each other");
    assert!(!list.unwrap().is_empty());
    let second = submit.unwrap();

    assert_eq!(wait_terminal(&engine, &first.job_id).await.status, JobStatus::Done);
    assert_eq!(wait_terminal(&engine, &second.job_id).await.status, JobStatus::Done);
}
