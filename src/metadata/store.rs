//! Sidecar store read/write operations
//!
//! The store is the durable record of everything the controller and the
//! job engine decide. A caller reconnecting after a crash rebuilds its view
//! from here rather than from in-memory state.

use super::layout::RecordingLayout;
use super::schema::{DeviceSidecar, SessionRecord};
use crate::capture::DeviceRole;
use crate::jobs::Job;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Store-related errors
#[derive(Error, Debug)]
pub enum SidecarError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type SidecarResult<T> = Result<T, SidecarError>;

/// Key/document persistence for sidecars, session archives and job records
pub trait SidecarStore: Send + Sync {
    /// Load the sidecar of one device of a batch
    fn load_device(&self, batch_id: &str, role: DeviceRole) -> SidecarResult<Option<DeviceSidecar>>;

    /// Read-modify-write a device sidecar, creating it when missing
    fn update_device(
        &self,
        batch_id: &str,
        role: DeviceRole,
        update: &mut dyn FnMut(&mut DeviceSidecar),
    ) -> SidecarResult<DeviceSidecar>;

    /// Archive a finished session
    fn save_session(&self, record: &SessionRecord) -> SidecarResult<()>;

    /// Load an archived session
    fn load_session(&self, session_id: &str) -> SidecarResult<Option<SessionRecord>>;

    /// Persist a job snapshot
    fn save_job(&self, job: &Job) -> SidecarResult<()>;

    /// Load a persisted job snapshot
    fn load_job(&self, job_id: &str) -> SidecarResult<Option<Job>>;

    /// All persisted job snapshots
    fn list_jobs(&self) -> SidecarResult<Vec<Job>>;
}

/// Store writing pretty JSON files
///
/// Device sidecars live next to the recordings; session archives and job
/// records live under a separate state directory.
pub struct JsonSidecarStore {
    layout: RecordingLayout,
    state_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonSidecarStore {
    pub fn new(layout: RecordingLayout, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            layout,
            state_dir: state_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn sessions_dir(&self) -> PathBuf {
        self.state_dir.join("sessions")
    }

    fn jobs_dir(&self) -> PathBuf {
        self.state_dir.join("jobs")
    }
}

impl SidecarStore for JsonSidecarStore {
    fn load_device(&self, batch_id: &str, role: DeviceRole) -> SidecarResult<Option<DeviceSidecar>> {
        read_json(&self.layout.sidecar_path(batch_id, role))
    }

    fn update_device(
        &self,
        batch_id: &str,
        role: DeviceRole,
        update: &mut dyn FnMut(&mut DeviceSidecar),
    ) -> SidecarResult<DeviceSidecar> {
        let _guard = self.write_lock.lock();
        let path = self.layout.sidecar_path(batch_id, role);

        let mut sidecar = match read_json::<DeviceSidecar>(&path) {
            Ok(Some(existing)) => existing,
            Ok(None) => DeviceSidecar::default(),
            Err(SidecarError::Json(e)) => {
                tracing::warn!("Replacing unreadable sidecar {:?}: {}", path, e);
                DeviceSidecar::default()
            }
            Err(e) => return Err(e),
        };

        update(&mut sidecar);
        sidecar.batch_id = batch_id.to_string();
        sidecar.device_role = Some(role);

        write_json(&path, &sidecar)?;
        tracing::debug!("Sidecar updated: {:?}", path);
        Ok(sidecar)
    }

    fn save_session(&self, record: &SessionRecord) -> SidecarResult<()> {
        let _guard = self.write_lock.lock();
        write_json(
            &self.sessions_dir().join(format!("{}.json", record.session_id)),
            record,
        )
    }

    fn load_session(&self, session_id: &str) -> SidecarResult<Option<SessionRecord>> {
        read_json(&self.sessions_dir().join(format!("{session_id}.json")))
    }

    fn save_job(&self, job: &Job) -> SidecarResult<()> {
        let _guard = self.write_lock.lock();
        write_json(&self.jobs_dir().join(format!("{}.json", job.job_id)), job)
    }

    fn load_job(&self, job_id: &str) -> SidecarResult<Option<Job>> {
        read_json(&self.jobs_dir().join(format!("{job_id}.json")))
    }

    fn list_jobs(&self) -> SidecarResult<Vec<Job>> {
        let dir = self.jobs_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut jobs = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<Job>(&path) {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => {}
                Err(e) => tracing::warn!("Skipping unreadable job record {:?}: {}", path, e),
            }
        }
        Ok(jobs)
    }
}

/// Read a JSON document, `None` when the file does not exist
fn read_json<T: DeserializeOwned>(path: &Path) -> SidecarResult<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&content)?))
}

/// Write a JSON document through a temp file so readers never see half of it
fn write_json<T: Serialize>(path: &Path, value: &T) -> SidecarResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::schema::{SessionDeviceRecord, SessionOutcome};
    use chrono::Utc;
    use tempfile::tempdir;

    fn store(root: &Path) -> JsonSidecarStore {
        JsonSidecarStore::new(
            RecordingLayout::new(root.join("recordings"), root.join("processed")),
            root.join("state"),
        )
    }

    #[test]
    fn test_update_merges_fields() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        store
            .update_device("b1", DeviceRole::Front, &mut |s| {
                s.patient_name = "Jane".to_string();
                s.frames_recorded = 120;
            })
            .unwrap();
        store
            .update_device("b1", DeviceRole::Front, &mut |s| {
                s.warnings.push("late stop".to_string());
            })
            .unwrap();

        let loaded = store.load_device("b1", DeviceRole::Front).unwrap().unwrap();
        assert_eq!(loaded.patient_name, "Jane");
        assert_eq!(loaded.frames_recorded, 120);
        assert_eq!(loaded.warnings, vec!["late stop".to_string()]);
        assert_eq!(loaded.device_role, Some(DeviceRole::Front));
        assert_eq!(loaded.batch_id, "b1");
    }

    #[test]
    fn test_missing_sidecar_is_none() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.load_device("nope", DeviceRole::Side).unwrap().is_none());
        assert!(store.load_session("nope").unwrap().is_none());
        assert!(store.list_jobs().unwrap().is_empty());
    }

    #[test]
    fn test_session_archive_roundtrip() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let now = Utc::now();

        let record = SessionRecord {
            session_id: "s1".to_string(),
            patient_name: String::new(),
            patient_id: String::new(),
            note: Some("baseline".to_string()),
            outcome: SessionOutcome::Completed,
            created_at: now,
            started_at: Some(now),
            stopped_at: now,
            start_offset_ms: Some(12.5),
            stop_offset_ms: Some(3.0),
            recorded_duration_secs: 4.0,
            devices: vec![SessionDeviceRecord {
                role: DeviceRole::Front,
                device_id: "cam-a".to_string(),
                present: true,
                frames_written: 120,
                output_file: Some("s1_front.raw".to_string()),
                error: None,
            }],
            warnings: Vec::new(),
        };
        store.save_session(&record).unwrap();

        let loaded = store.load_session("s1").unwrap().unwrap();
        assert_eq!(loaded.start_offset_ms, Some(12.5));
        assert_eq!(loaded.devices.len(), 1);
        assert_eq!(loaded.note.as_deref(), Some("baseline"));
    }
}
