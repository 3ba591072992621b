//! Runtime settings
//!
//! Loaded from an optional JSON file, then overridden by `DUO_*` environment
//! variables. Every field has a default so an empty file (or none) is valid.

use crate::conversion::{Encoder, FfmpegEncoder, ValidationPolicy};
use crate::metadata::RecordingLayout;
use crate::recorder::{ControllerConfig, Synchronizer};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "DUO_";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("IO error reading {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid settings file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub recordings_dir: PathBuf,
    pub processed_dir: PathBuf,
    /// Session archive and job records
    pub state_dir: PathBuf,

    pub warmup_secs: f64,
    pub prepare_timeout_secs: f64,
    pub commit_timeout_secs: f64,
    pub rendezvous_timeout_secs: f64,

    /// Minimum output/input frame ratio for a conversion to pass
    pub min_frame_ratio: f64,
    /// Encoders in fallback order
    pub encoders: Vec<String>,
    pub progress_every_frames: u64,

    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    /// Pose helper program; processing is unavailable without it
    pub analyzer_command: Option<PathBuf>,
    pub analyzer_args: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            recordings_dir: PathBuf::from("recordings"),
            processed_dir: PathBuf::from("processed"),
            state_dir: PathBuf::from("state"),
            warmup_secs: 3.0,
            prepare_timeout_secs: 10.0,
            commit_timeout_secs: 5.0,
            rendezvous_timeout_secs: 2.0,
            min_frame_ratio: 0.95,
            encoders: vec!["h264_nvenc".to_string(), "libx264".to_string()],
            progress_every_frames: 10,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            analyzer_command: None,
            analyzer_args: Vec::new(),
        }
    }
}

fn parse_non_negative(key: &str, value: &str) -> Result<f64, SettingsError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .ok_or_else(|| SettingsError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

impl Settings {
    /// Load from `path` if given and present, then apply the process environment
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let mut settings = match path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                tracing::info!("Loaded settings from {:?}", path);
                serde_json::from_str(&text)?
            }
            _ => Settings::default(),
        };
        settings.apply_env(std::env::vars())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply `DUO_*` overrides from an iterator of variables
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), SettingsError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "RECORDINGS_DIR" => self.recordings_dir = PathBuf::from(&value),
                "PROCESSED_DIR" => self.processed_dir = PathBuf::from(&value),
                "STATE_DIR" => self.state_dir = PathBuf::from(&value),
                "WARMUP_SECS" => self.warmup_secs = parse_non_negative(&key, &value)?,
                "PREPARE_TIMEOUT_SECS" => self.prepare_timeout_secs = parse_non_negative(&key, &value)?,
                "COMMIT_TIMEOUT_SECS" => self.commit_timeout_secs = parse_non_negative(&key, &value)?,
                "RENDEZVOUS_TIMEOUT_SECS" => self.rendezvous_timeout_secs = parse_non_negative(&key, &value)?,
                "MIN_FRAME_RATIO" => self.min_frame_ratio = parse_non_negative(&key, &value)?,
                "ENCODERS" => {
                    self.encoders = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                }
                "PROGRESS_EVERY_FRAMES" => {
                    self.progress_every_frames = value.trim().parse().map_err(|_| SettingsError::InvalidValue {
                        key: key.clone(),
                        value: value.clone(),
                    })?
                }
                "FFMPEG" => self.ffmpeg_path = PathBuf::from(&value),
                "FFPROBE" => self.ffprobe_path = PathBuf::from(&value),
                "ANALYZER" => self.analyzer_command = Some(PathBuf::from(&value)),
                "ANALYZER_ARGS" => self.analyzer_args = value.split_whitespace().map(String::from).collect(),
                _ => tracing::debug!("Ignoring unknown setting {}", key),
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if !(0.0..=1.0).contains(&self.min_frame_ratio) {
            return Err(SettingsError::InvalidValue {
                key: "minFrameRatio".to_string(),
                value: self.min_frame_ratio.to_string(),
            });
        }
        if self.encoders.is_empty() {
            return Err(SettingsError::InvalidValue {
                key: "encoders".to_string(),
                value: "[]".to_string(),
            });
        }
        if self.progress_every_frames == 0 {
            return Err(SettingsError::InvalidValue {
                key: "progressEveryFrames".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    pub fn layout(&self) -> RecordingLayout {
        RecordingLayout::new(&self.recordings_dir, &self.processed_dir)
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            warmup: secs(self.warmup_secs),
            synchronizer: Synchronizer {
                prepare_timeout: secs(self.prepare_timeout_secs),
                commit_timeout: secs(self.commit_timeout_secs),
                rendezvous_timeout: secs(self.rendezvous_timeout_secs),
            },
        }
    }

    pub fn validation_policy(&self) -> ValidationPolicy {
        ValidationPolicy::from_ratio(self.min_frame_ratio)
    }

    /// FFmpeg encoders in fallback order
    pub fn build_encoders(&self) -> Vec<Arc<dyn Encoder>> {
        self.encoders
            .iter()
            .map(|codec| {
                Arc::new(FfmpegEncoder::new(
                    codec.clone(),
                    self.ffmpeg_path.clone(),
                    self.ffprobe_path.clone(),
                )) as Arc<dyn Encoder>
            })
            .collect()
    }
}
