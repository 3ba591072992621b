//! Recording session state management
//!
//! Defines the session state machine, per-device slots and the snapshots
//! handed to pollers.

use crate::capture::DeviceRole;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Current state of the recording system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No session
    #[default]
    Idle,
    /// Devices are being prepared and committed
    Initializing,
    /// Devices run, waiting for exposure to settle
    WarmingUp,
    /// Frames are being written
    Recording,
    /// Write path suspended
    Paused,
    /// Devices are being switched back to streaming
    Stopping,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Initializing => "initializing",
            SessionState::WarmingUp => "warming_up",
            SessionState::Recording => "recording",
            SessionState::Paused => "paused",
            SessionState::Stopping => "stopping",
        }
    }

    /// States from which `stop` is accepted
    pub fn can_stop(&self) -> bool {
        matches!(
            self,
            SessionState::WarmingUp | SessionState::Recording | SessionState::Paused
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options accepted by `start_session`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionOptions {
    pub patient_name: String,
    pub patient_id: String,
    pub note: Option<String>,
}

/// One device taking part in a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSlot {
    pub device_id: String,
    pub role: DeviceRole,
    /// False when the device failed prepare or commit
    pub present: bool,
    pub frames_written: u64,
    pub current_output_path: Option<PathBuf>,
    pub started_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Interval during which frames were being written
///
/// A new segment opens on every resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSegment {
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl RecordingSegment {
    pub fn open(at: DateTime<Utc>) -> Self {
        Self {
            started_at: at,
            ended_at: None,
        }
    }

    pub fn close(&mut self, at: DateTime<Utc>) {
        if self.ended_at.is_none() {
            self.ended_at = Some(at);
        }
    }

    pub fn duration_secs(&self, now: DateTime<Utc>) -> f64 {
        let end = self.ended_at.unwrap_or(now);
        (end - self.started_at).num_milliseconds().max(0) as f64 / 1000.0
    }
}

/// The single active session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Also the batch id of the recordings
    pub session_id: String,
    pub state: SessionState,
    pub options: SessionOptions,
    pub participants: Vec<DeviceSlot>,
    pub created_at: DateTime<Utc>,
    /// Set when warmup ends
    pub started_at: Option<DateTime<Utc>>,
    pub warmup_deadline: Option<DateTime<Utc>>,
    pub start_offset_ms: Option<f64>,
    pub segments: Vec<RecordingSegment>,
    pub warnings: Vec<String>,
}

impl Session {
    pub fn new(options: SessionOptions) -> Self {
        let now = Local::now();
        Self {
            session_id: session_id_for(now),
            state: SessionState::Initializing,
            options,
            participants: Vec::new(),
            created_at: now.with_timezone(&Utc),
            started_at: None,
            warmup_deadline: None,
            start_offset_ms: None,
            segments: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Recorded time, paused intervals excluded
    pub fn duration_secs(&self, now: DateTime<Utc>) -> f64 {
        self.segments.iter().map(|s| s.duration_secs(now)).sum()
    }

    pub fn slot_mut(&mut self, role: DeviceRole) -> Option<&mut DeviceSlot> {
        self.participants.iter_mut().find(|s| s.role == role)
    }
}

/// Session ids double as batch ids: local time down to milliseconds
pub fn session_id_for(at: DateTime<Local>) -> String {
    at.format("%Y-%m-%d_%H-%M-%S-%3f").to_string()
}

/// Pollable view of the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: SessionState,
    pub session_id: Option<String>,
    pub patient_name: String,
    pub patient_id: String,
    /// Seconds recorded, `None` until recording begins
    pub duration: Option<f64>,
    pub warmup_remaining: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub start_offset_ms: Option<f64>,
    pub frame_counts: Vec<(DeviceRole, u64)>,
    pub participants: Vec<DeviceSlot>,
}

impl SessionStatus {
    pub fn idle() -> Self {
        Self {
            state: SessionState::Idle,
            session_id: None,
            patient_name: String::new(),
            patient_id: String::new(),
            duration: None,
            warmup_remaining: None,
            started_at: None,
            start_offset_ms: None,
            frame_counts: Vec::new(),
            participants: Vec::new(),
        }
    }
}

/// Returned by `start_session`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOutcome {
    pub session_id: String,
    pub state: SessionState,
    pub warmup_secs: f64,
    pub participants: Vec<DeviceSlot>,
    pub warnings: Vec<String>,
}

/// One output file produced by a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOutput {
    pub role: DeviceRole,
    pub path: PathBuf,
    pub frames: u64,
}

/// Returned by `stop_session`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopOutcome {
    pub session_id: String,
    pub cancelled_during_warmup: bool,
    pub outputs: Vec<SessionOutput>,
    pub start_offset_ms: Option<f64>,
    pub stop_offset_ms: Option<f64>,
    pub duration_secs: f64,
    pub warnings: Vec<String>,
}

/// Events emitted during a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    StateChanged {
        session_id: String,
        state: SessionState,
    },
    Warning {
        session_id: String,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_session_id_format() {
        let at = Local.with_ymd_and_hms(2026, 2, 17, 9, 5, 7).unwrap()
            + chrono::Duration::milliseconds(42);
        assert_eq!(session_id_for(at), "2026-02-17_09-05-07-042");
    }

    #[test]
    fn test_duration_excludes_pauses() {
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut session = Session::new(SessionOptions::default());

        let mut first = RecordingSegment::open(t0);
        first.close(t0 + chrono::Duration::seconds(4));
        session.segments.push(first);
        // Paused for 10 s, then resumed
        session
            .segments
            .push(RecordingSegment::open(t0 + chrono::Duration::seconds(14)));

        let now = t0 + chrono::Duration::seconds(16);
        assert_eq!(session.duration_secs(now), 6.0);
    }

    #[test]
    fn test_stop_allowed_states() {
        assert!(SessionState::WarmingUp.can_stop());
        assert!(SessionState::Paused.can_stop());
        assert!(!SessionState::Idle.can_stop());
        assert!(!SessionState::Initializing.can_stop());
        assert_eq!(
            serde_json::to_string(&SessionState::WarmingUp).unwrap(),
            "\"warming_up\""
        );
    }
}
