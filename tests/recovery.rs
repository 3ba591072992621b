mod common;

use common::{FakeEncoder, Workspace, FORMAT};
use duo_capture::capture::DeviceRole;
use duo_capture::conversion::{ConversionRunner, ValidationPolicy};
use duo_capture::jobs::{DeviceJobStatus, Job, JobEngine, JobError, JobKind, JobOptions, JobRunner, JobStatus};
use duo_capture::metadata::SidecarStore;
use std::sync::Arc;
use tempfile::tempdir;

#[tokio::test]
async fn test_interrupted_jobs_are_marked_failed() {
    let dir = tempdir().unwrap();
    let ws = Workspace::new(dir.path());
    ws.record("b1", DeviceRole::Front, FORMAT, 5);

    let mut running = Job::new(JobKind::Conversion, "b1", &[DeviceRole::Front], JobOptions::default());
    assert!(running.advance(JobStatus::Running));
    ws.store.save_job(&running).unwrap();

    let mut finished = Job::new(JobKind::Conversion, "b1", &[DeviceRole::Front], JobOptions::default());
    finished.advance(JobStatus::Running);
    finished.advance(JobStatus::Done);
    ws.store.save_job(&finished).unwrap();

    let runner: Arc<dyn JobRunner> = Arc::new(ConversionRunner::new(
        vec![FakeEncoder::new("primary", 100)],
        ValidationPolicy::default(),
        ws.layout.clone(),
        ws.dyn_store(),
    ));
    let engine = JobEngine::new(ws.catalog.clone(), ws.dyn_store(), vec![runner]);

    let recovered = engine.get(&running.job_id).unwrap();
    assert_eq!(recovered.status, JobStatus::Failed);
    assert_eq!(recovered.error.as_deref(), Some("interrupted"));
    assert_eq!(recovered.per_device[&DeviceRole::Front].status, DeviceJobStatus::Failed);

    assert_eq!(engine.get(&finished.job_id).unwrap().status, JobStatus::Done);
    assert_eq!(engine.list(None).unwrap().len(), 2);

    // Interrupted records do not block new work
    assert!(engine.active_job("b1", JobKind::Conversion).is_none());
    let err = engine.cancel(&running.job_id).unwrap_err();
    assert!(matches!(err, JobError::AlreadyTerminal { .. }));
}
