//! Batch catalog
//!
//! A batch is never stored on its own: it is recomputed from the recordings
//! directory every time it is listed, so it always reflects what is on disk.

use super::layout::{RecordingLayout, RAW_EXTENSION};
use super::schema::DeviceSidecar;
use super::store::SidecarStore;
use crate::capture::DeviceRole;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// One device's files within a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDevice {
    pub role: DeviceRole,
    pub raw_path: PathBuf,
    pub playback_path: Option<PathBuf>,
    pub sidecar: Option<DeviceSidecar>,
}

/// Recordings of one session, grouped by batch id
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub batch_id: String,
    pub devices: Vec<BatchDevice>,
    /// Only one of the expected devices is present
    pub orphaned: bool,
    pub patient_name: String,
    pub patient_id: String,
    pub recorded_at: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
}

impl BatchDevice {
    /// The recording was closed by a stop
    pub fn is_finalized(&self) -> bool {
        self.sidecar.as_ref().map(|s| s.stopped_at.is_some()).unwrap_or(false)
    }
}

impl Batch {
    pub fn device(&self, role: DeviceRole) -> Option<&BatchDevice> {
        self.devices.iter().find(|d| d.role == role)
    }

    pub fn roles(&self) -> Vec<DeviceRole> {
        self.devices.iter().map(|d| d.role).collect()
    }
}

/// Derives batches from the recordings directory
pub struct BatchCatalog {
    layout: RecordingLayout,
    store: Arc<dyn SidecarStore>,
}

impl BatchCatalog {
    pub fn new(layout: RecordingLayout, store: Arc<dyn SidecarStore>) -> Self {
        Self { layout, store }
    }

    pub fn layout(&self) -> &RecordingLayout {
        &self.layout
    }

    /// All batches, newest first
    pub fn list(&self) -> std::io::Result<Vec<Batch>> {
        let dir = self.layout.recordings_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut grouped: BTreeMap<String, Vec<(DeviceRole, Option<DateTime<Utc>>)>> = BTreeMap::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RAW_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some((batch_id, role)) = RecordingLayout::parse_stem(stem) else {
                tracing::debug!("Ignoring unrecognised recording {:?}", path);
                continue;
            };

            let modified = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .map(DateTime::<Utc>::from);
            grouped
                .entry(batch_id.to_string())
                .or_default()
                .push((role, modified));
        }

        let mut batches: Vec<Batch> = grouped
            .into_iter()
            .map(|(batch_id, devices)| self.build(batch_id, devices))
            .collect();
        batches.sort_by(|a, b| b.modified.cmp(&a.modified).then(b.batch_id.cmp(&a.batch_id)));
        Ok(batches)
    }

    /// Look one batch up by id
    pub fn find(&self, batch_id: &str) -> Option<Batch> {
        if !RecordingLayout::is_valid_batch_id(batch_id) {
            tracing::warn!("Rejected batch id {:?}", batch_id);
            return None;
        }
        let devices: Vec<(DeviceRole, Option<DateTime<Utc>>)> = DeviceRole::ALL
            .iter()
            .filter_map(|role| {
                let path = self.layout.raw_path(batch_id, *role);
                let meta = std::fs::metadata(&path).ok()?;
                Some((*role, meta.modified().ok().map(DateTime::<Utc>::from)))
            })
            .collect();

        if devices.is_empty() {
            return None;
        }
        Some(self.build(batch_id.to_string(), devices))
    }

    fn build(&self, batch_id: String, mut found: Vec<(DeviceRole, Option<DateTime<Utc>>)>) -> Batch {
        found.sort_by_key(|(role, _)| *role);
        let modified = found.iter().filter_map(|(_, m)| *m).max();

        let devices: Vec<BatchDevice> = found
            .into_iter()
            .map(|(role, _)| {
                let playback = self.layout.playback_path(&batch_id, role);
                let sidecar = match self.store.load_device(&batch_id, role) {
                    Ok(sidecar) => sidecar,
                    Err(e) => {
                        tracing::warn!("Unreadable sidecar for {} {}: {}", batch_id, role, e);
                        None
                    }
                };
                BatchDevice {
                    role,
                    raw_path: self.layout.raw_path(&batch_id, role),
                    playback_path: playback.exists().then_some(playback),
                    sidecar,
                }
            })
            .collect();

        let first_sidecar = devices.iter().find_map(|d| d.sidecar.as_ref());
        let patient_name = first_sidecar.map(|s| s.patient_name.clone()).unwrap_or_default();
        let patient_id = first_sidecar.map(|s| s.patient_id.clone()).unwrap_or_default();
        let recorded_at = first_sidecar.and_then(|s| s.started_at);

        Batch {
            orphaned: devices.len() < DeviceRole::ALL.len(),
            batch_id,
            devices,
            patient_name,
            patient_id,
            recorded_at,
            modified,
        }
    }
}
