mod common;

use common::{wait_terminal, FakeAnalyzer, FakeEncoder, FORMAT};
use duo_capture::capture::{DeviceDirectory, DeviceHandle, DeviceRole, SimulatedDevice};
use duo_capture::commands::jobs::{cancel_job, list_jobs, submit_job, SubmitJobRequest};
use duo_capture::commands::recording::{
    get_session_status, list_batches, start_session, stop_session, swap_device_roles,
};
use duo_capture::commands::AppState;
use duo_capture::config::Settings;
use duo_capture::conversion::Encoder;
use duo_capture::jobs::{JobKind, JobStatus};
use duo_capture::metadata::{JsonSidecarStore, SidecarStore};
use duo_capture::processing::PoseAnalyzer;
use duo_capture::recorder::{SessionOptions, SessionState};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn app(root: &Path) -> AppState {
    let settings = Settings {
        recordings_dir: root.join("recordings"),
        processed_dir: root.join("processed"),
        state_dir: root.join("state"),
        warmup_secs: 0.02,
        ..Settings::default()
    };
    let devices: Vec<Arc<dyn DeviceHandle>> = vec![
        Arc::new(SimulatedDevice::new("cam0", FORMAT)),
        Arc::new(SimulatedDevice::new("cam1", FORMAT)),
    ];
    let store: Arc<dyn SidecarStore> = Arc::new(JsonSidecarStore::new(settings.layout(), &settings.state_dir));
    let encoders: Vec<Arc<dyn Encoder>> = vec![FakeEncoder::new("primary", 100)];
    let analyzer: Arc<dyn PoseAnalyzer> = Arc::new(FakeAnalyzer { fail_width: None });

    AppState::with_parts(
        settings,
        Arc::new(DeviceDirectory::with_devices(devices)),
        store,
        encoders,
        Some(analyzer),
    )
    .unwrap()
}

#[tokio::test]
async fn test_record_then_convert_and_process() {
    let dir = tempdir().unwrap();
    let state = app(dir.path());

    let started = start_session(&state, SessionOptions::default()).await.unwrap();
    for _ in 0..200 {
        if get_session_status(&state).await.unwrap().state == SessionState::Recording {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    stop_session(&state).await.unwrap();

    let batches = list_batches(&state).await.unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].batch_id, started.session_id);

    for kind in [JobKind::Conversion, JobKind::Processing] {
        let job = submit_job(
            &state,
            SubmitJobRequest {
                kind,
                batch_id: started.session_id.clone(),
                force: false,
            },
        )
        .await
        .unwrap();
        let job = wait_terminal(&state.engine, &job.job_id).await;
        assert_eq!(job.status, JobStatus::Done, "{kind} job: {:?}", job.error);
    }

    let batch = &list_batches(&state).await.unwrap()[0];
    let front = batch.device(DeviceRole::Front).unwrap();
    assert!(front.playback_path.is_some());
    let sidecar = front.sidecar.as_ref().unwrap();
    assert!(sidecar.conversion.is_some());
    assert!(sidecar.processing.is_some());

    assert_eq!(list_jobs(&state, None).await.unwrap().len(), 2);
    assert_eq!(list_jobs(&state, Some(JobKind::Processing)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_error_codes() {
    let dir = tempdir().unwrap();
    let state = app(dir.path());

    let err = stop_session(&state).await.unwrap_err();
    assert_eq!(err.code, "CONFLICT");

    let err = submit_job(
        &state,
        SubmitJobRequest {
            kind: JobKind::Conversion,
            batch_id: "missing".to_string(),
            force: false,
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, "NOT_FOUND");

    let err = cancel_job(&state, "no-such-job".to_string()).await.unwrap_err();
    assert_eq!(err.code, "NOT_FOUND");

    let swapped = swap_device_roles(&state).await.unwrap();
    assert_eq!(swapped[0].info.id, "cam1");
}
