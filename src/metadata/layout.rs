//! On-disk naming of recordings and their derived artifacts
//!
//! Everything belonging to one device of one batch shares the
//! `<batch_id>_<role>` stem:
//!
//! - `recordings/<stem>.raw`             raw capture
//! - `recordings/<stem>.mp4`             playback file
//! - `recordings/<stem>.mp4.converting`  conversion in progress
//! - `recordings/<stem>_metadata.json`   device sidecar
//! - `processed/<stem>_analysis.json`    analysis report

use crate::capture::DeviceRole;
use std::path::{Path, PathBuf};

pub const RAW_EXTENSION: &str = "raw";
pub const PLAYBACK_EXTENSION: &str = "mp4";
pub const TEMP_SUFFIX: &str = ".converting";
pub const SIDECAR_SUFFIX: &str = "_metadata.json";

/// Directory layout shared by the controller, the jobs and the store
#[derive(Debug, Clone)]
pub struct RecordingLayout {
    recordings_dir: PathBuf,
    processed_dir: PathBuf,
}

impl RecordingLayout {
    pub fn new(recordings_dir: impl Into<PathBuf>, processed_dir: impl Into<PathBuf>) -> Self {
        Self {
            recordings_dir: recordings_dir.into(),
            processed_dir: processed_dir.into(),
        }
    }

    /// Create the directories if they do not exist yet
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.recordings_dir)?;
        std::fs::create_dir_all(&self.processed_dir)?;
        Ok(())
    }

    pub fn recordings_dir(&self) -> &Path {
        &self.recordings_dir
    }

    pub fn processed_dir(&self) -> &Path {
        &self.processed_dir
    }

    fn stem(batch_id: &str, role: DeviceRole) -> String {
        format!("{batch_id}_{role}")
    }

    pub fn raw_path(&self, batch_id: &str, role: DeviceRole) -> PathBuf {
        self.recordings_dir
            .join(format!("{}.{RAW_EXTENSION}", Self::stem(batch_id, role)))
    }

    pub fn playback_path(&self, batch_id: &str, role: DeviceRole) -> PathBuf {
        self.recordings_dir
            .join(format!("{}.{PLAYBACK_EXTENSION}", Self::stem(batch_id, role)))
    }

    pub fn temp_playback_path(&self, batch_id: &str, role: DeviceRole) -> PathBuf {
        self.recordings_dir.join(format!(
            "{}.{PLAYBACK_EXTENSION}{TEMP_SUFFIX}",
            Self::stem(batch_id, role)
        ))
    }

    pub fn sidecar_path(&self, batch_id: &str, role: DeviceRole) -> PathBuf {
        self.recordings_dir
            .join(format!("{}{SIDECAR_SUFFIX}", Self::stem(batch_id, role)))
    }

    pub fn report_path(&self, batch_id: &str, role: DeviceRole) -> PathBuf {
        self.processed_dir
            .join(format!("{}_analysis.json", Self::stem(batch_id, role)))
    }

    /// Whether `batch_id` can name files inside the layout directories
    pub fn is_valid_batch_id(batch_id: &str) -> bool {
        !batch_id.is_empty()
            && batch_id != "."
            && !batch_id.contains("..")
            && !batch_id.contains(['/', '\\', '\0'])
    }

    /// Split a recording file stem into batch id and role
    pub fn parse_stem(stem: &str) -> Option<(&str, DeviceRole)> {
        let (batch_id, role) = stem.rsplit_once('_')?;
        if batch_id.is_empty() {
            return None;
        }
        DeviceRole::parse(role).map(|role| (batch_id, role))
    }
}

/// File name component of a path, for sidecars and responses
pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}
