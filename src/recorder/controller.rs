//! Recording session controller
//!
//! Owns the single active session and drives the devices through the
//! synchronizer. All transitions are serialized by one async lock; pollers
//! read a snapshot guarded separately so `status()` never waits behind a
//! slow device call.

use super::state::{
    DeviceSlot, RecordingSegment, Session, SessionEvent, SessionOptions, SessionOutput, SessionState,
    SessionStatus, StartOutcome, StopOutcome,
};
use super::sync::{SyncError, SyncTarget, Synchronizer};
use crate::capture::{CaptureMode, DeviceDirectory, DeviceHandle, DeviceRole, DeviceSummary};
use crate::metadata::layout::file_name;
use crate::metadata::{RecordingLayout, SessionDeviceRecord, SessionOutcome, SessionRecord, SidecarError, SidecarStore};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Operation not allowed while {state}")]
    Conflict { state: SessionState },

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Synchronization failed: {0}")]
    Sync(#[from] SyncError),

    #[error("Sidecar error: {0}")]
    Store(#[from] SidecarError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Controller tuning
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Time between commit and the start of recording proper
    pub warmup: Duration,
    pub synchronizer: Synchronizer,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            warmup: Duration::from_secs(3),
            synchronizer: Synchronizer::default(),
        }
    }
}

struct ControllerInner {
    config: ControllerConfig,
    directory: Arc<DeviceDirectory>,
    store: Arc<dyn SidecarStore>,
    layout: RecordingLayout,

    /// Snapshot read by pollers
    session: RwLock<Option<Session>>,

    /// Devices committed for the current session
    active: Mutex<Vec<(DeviceRole, Arc<dyn DeviceHandle>)>>,

    warmup_task: Mutex<Option<JoinHandle<()>>>,

    /// Serializes transitions
    transition: tokio::sync::Mutex<()>,

    event_tx: broadcast::Sender<SessionEvent>,
}

impl ControllerInner {
    fn state(&self) -> SessionState {
        self.session
            .read()
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(SessionState::Idle)
    }

    fn set_state(&self, state: SessionState) {
        let session_id = {
            let mut guard = self.session.write();
            let Some(session) = guard.as_mut() else {
                return;
            };
            session.state = state;
            session.session_id.clone()
        };
        let _ = self.event_tx.send(SessionEvent::StateChanged { session_id, state });
    }

    fn warn(&self, session_id: &str, message: String) {
        tracing::warn!("[{}] {}", session_id, message);
        let _ = self.event_tx.send(SessionEvent::Warning {
            session_id: session_id.to_string(),
            message,
        });
    }

    /// Warmup timer expired: begin recording if the session is still waiting
    fn finish_warmup(&self, session_id: &str) {
        let mut guard = self.session.write();
        let Some(session) = guard.as_mut() else {
            return;
        };
        if session.session_id != session_id || session.state != SessionState::WarmingUp {
            return;
        }

        let now = Utc::now();
        session.state = SessionState::Recording;
        session.started_at = Some(now);
        session.warmup_deadline = None;
        session.segments.push(RecordingSegment::open(now));
        drop(guard);

        tracing::info!("[{}] Warmup complete, recording", session_id);
        let _ = self.event_tx.send(SessionEvent::StateChanged {
            session_id: session_id.to_string(),
            state: SessionState::Recording,
        });
    }
}

/// Coordinates the capture devices as one logical recording session
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<ControllerInner>,
}

impl SessionController {
    pub fn new(
        config: ControllerConfig,
        directory: Arc<DeviceDirectory>,
        store: Arc<dyn SidecarStore>,
        layout: RecordingLayout,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            inner: Arc::new(ControllerInner {
                config,
                directory,
                store,
                layout,
                session: RwLock::new(None),
                active: Mutex::new(Vec::new()),
                warmup_task: Mutex::new(None),
                transition: tokio::sync::Mutex::new(()),
                event_tx,
            }),
        }
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.event_tx.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Start a new session on every present device
    ///
    /// The transition runs on its own task and completes even if the
    /// caller stops waiting for it.
    pub async fn start_session(&self, options: SessionOptions) -> SessionResult<StartOutcome> {
        let this = self.clone();
        tokio::spawn(async move { this.run_start(options).await })
            .await
            .map_err(|e| SessionError::Internal(format!("start task failed: {e}")))?
    }

    async fn run_start(&self, options: SessionOptions) -> SessionResult<StartOutcome> {
        let inner = &self.inner;
        let _guard = inner.transition.try_lock().map_err(|_| SessionError::Conflict {
            state: inner.state(),
        })?;

        let state = inner.state();
        if state != SessionState::Idle {
            return Err(SessionError::Conflict { state });
        }

        let assignments = inner.directory.assignments();
        if !assignments.iter().any(|(_, d)| d.is_present()) {
            return Err(SessionError::InvalidRequest("No capture device is present".to_string()));
        }
        inner.layout.ensure_dirs()?;

        let mut session = Session::new(options);
        let session_id = session.session_id.clone();
        tracing::info!("[{}] Starting session with {} device(s)", session_id, assignments.len());

        let mut targets = Vec::new();
        for (role, device) in &assignments {
            let present = device.is_present();
            let output = inner.layout.raw_path(&session_id, *role);
            session.participants.push(DeviceSlot {
                device_id: device.id().to_string(),
                role: *role,
                present,
                frames_written: 0,
                current_output_path: present.then(|| output.clone()),
                started_at: None,
                error: (!present).then(|| "Device not present".to_string()),
            });
            if present {
                targets.push(SyncTarget {
                    role: *role,
                    device: device.clone(),
                    mode: CaptureMode::Recording { output },
                });
            }
        }

        *inner.session.write() = Some(session);
        let _ = inner.event_tx.send(SessionEvent::StateChanged {
            session_id: session_id.clone(),
            state: SessionState::Initializing,
        });

        let sync = inner.config.synchronizer.clone();
        let joined = tokio::task::spawn_blocking(move || sync.start_all(&targets)).await;
        let report = match joined {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => {
                tracing::error!("[{}] Start failed: {}", session_id, e);
                self.discard_session(&session_id);
                return Err(match e {
                    SyncError::NoDevices(causes) => SessionError::DeviceUnavailable(causes.join("; ")),
                    other => other.into(),
                });
            }
            Err(e) => {
                self.discard_session(&session_id);
                return Err(SessionError::Internal(e.to_string()));
            }
        };

        let mut active = Vec::new();
        let warmup = inner.config.warmup;
        let outcome = {
            let mut guard = inner.session.write();
            let session = guard
                .as_mut()
                .ok_or_else(|| SessionError::Internal("session vanished during start".to_string()))?;

            for result in &report.devices {
                let Some(slot) = session.slot_mut(result.role) else {
                    continue;
                };
                slot.present = result.committed;
                slot.started_at = result.started_at;
                if !result.committed {
                    slot.current_output_path = None;
                    slot.error = result.error.clone();
                }
            }
            for (role, device) in &assignments {
                if report.device(*role).map(|d| d.committed).unwrap_or(false) {
                    active.push((*role, device.clone()));
                }
            }

            session.start_offset_ms = Some(report.offset_ms);
            session.warnings.extend(report.warnings.iter().cloned());
            let missing: Vec<String> = session
                .participants
                .iter()
                .filter(|s| !s.present)
                .map(|s| format!("{} device missing from session: {}", s.role, s.error.clone().unwrap_or_default()))
                .collect();
            session.warnings.extend(missing);
            session.state = SessionState::WarmingUp;
            session.warmup_deadline = chrono::Duration::from_std(warmup)
                .ok()
                .map(|d| Utc::now() + d);

            StartOutcome {
                session_id: session_id.clone(),
                state: SessionState::WarmingUp,
                warmup_secs: warmup.as_secs_f64(),
                participants: session.participants.clone(),
                warnings: session.warnings.clone(),
            }
        };
        *inner.active.lock() = active;

        for warning in &outcome.warnings {
            inner.warn(&session_id, warning.clone());
        }
        let _ = inner.event_tx.send(SessionEvent::StateChanged {
            session_id: session_id.clone(),
            state: SessionState::WarmingUp,
        });

        let timer_inner = inner.clone();
        let timer_id = session_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(warmup).await;
            timer_inner.finish_warmup(&timer_id);
        });
        *inner.warmup_task.lock() = Some(handle);

        tracing::info!(
            "[{}] Warming up for {:.1}s, start offset {:.2}ms",
            session_id,
            warmup.as_secs_f64(),
            report.offset_ms
        );
        Ok(outcome)
    }

    /// Suspend writing on every device
    pub async fn pause_session(&self) -> SessionResult<()> {
        let inner = &self.inner;
        let _guard = inner.transition.lock().await;

        let state = inner.state();
        if state != SessionState::Recording {
            return Err(SessionError::Conflict { state });
        }

        let devices = inner.active.lock().clone();
        let sync = inner.config.synchronizer.clone();
        tokio::task::spawn_blocking(move || sync.pause_all(&devices))
            .await
            .map_err(|e| SessionError::Internal(e.to_string()))??;

        if let Some(session) = inner.session.write().as_mut() {
            let now = Utc::now();
            if let Some(segment) = session.segments.last_mut() {
                segment.close(now);
            }
        }
        inner.set_state(SessionState::Paused);
        tracing::info!("Session paused");
        Ok(())
    }

    /// Re-enable writing on every device
    pub async fn resume_session(&self) -> SessionResult<()> {
        let inner = &self.inner;
        let _guard = inner.transition.lock().await;

        let state = inner.state();
        if state != SessionState::Paused {
            return Err(SessionError::Conflict { state });
        }

        let devices = inner.active.lock().clone();
        let sync = inner.config.synchronizer.clone();
        tokio::task::spawn_blocking(move || sync.resume_all(&devices))
            .await
            .map_err(|e| SessionError::Internal(e.to_string()))??;

        if let Some(session) = inner.session.write().as_mut() {
            session.segments.push(RecordingSegment::open(Utc::now()));
        }
        inner.set_state(SessionState::Recording);
        tracing::info!("Session resumed");
        Ok(())
    }

    /// End the session and flush its sidecars
    ///
    /// Device and store failures become warnings; the controller always
    /// returns to idle.
    pub async fn stop_session(&self) -> SessionResult<StopOutcome> {
        let this = self.clone();
        tokio::spawn(async move { this.run_stop().await })
            .await
            .map_err(|e| SessionError::Internal(format!("stop task failed: {e}")))?
    }

    async fn run_stop(&self) -> SessionResult<StopOutcome> {
        let inner = &self.inner;
        let _guard = inner.transition.lock().await;

        let state = inner.state();
        if !state.can_stop() {
            return Err(SessionError::Conflict { state });
        }

        if let Some(task) = inner.warmup_task.lock().take() {
            task.abort();
        }

        let stopped_at = Utc::now();
        let cancelled_during_warmup = {
            let mut guard = inner.session.write();
            let session = guard
                .as_mut()
                .ok_or_else(|| SessionError::Internal("no session to stop".to_string()))?;
            // The timer may have fired between the state read and the abort
            let was_warmup = session.state == SessionState::WarmingUp;
            if let Some(segment) = session.segments.last_mut() {
                segment.close(stopped_at);
            }
            was_warmup
        };
        inner.set_state(SessionState::Stopping);

        let devices = std::mem::take(&mut *inner.active.lock());
        let sync = inner.config.synchronizer.clone();
        let stop_devices = devices.clone();
        let joined = tokio::task::spawn_blocking(move || sync.stop_all(&stop_devices)).await;

        let mut session = inner
            .session
            .write()
            .take()
            .ok_or_else(|| SessionError::Internal("session vanished during stop".to_string()))?;
        let session_id = session.session_id.clone();

        let stop_offset_ms = match joined {
            Ok(Ok(report)) => {
                session.warnings.extend(report.warnings);
                for result in report.devices.iter().filter(|r| !r.committed) {
                    session.warnings.push(format!(
                        "{} did not return to streaming: {}",
                        result.device_id,
                        result.error.clone().unwrap_or_default()
                    ));
                }
                Some(report.offset_ms)
            }
            Ok(Err(e)) => {
                session.warnings.push(format!("Stop failed: {e}"));
                None
            }
            Err(e) => {
                session.warnings.push(format!("Stop task failed: {e}"));
                None
            }
        };

        for (role, device) in &devices {
            let frames = device.frames_written();
            if let Some(slot) = session.slot_mut(*role) {
                slot.frames_written = frames;
            }
        }

        let duration_secs = session.duration_secs(stopped_at);
        let mut outputs = Vec::new();

        if cancelled_during_warmup {
            tracing::info!("[{}] Cancelled during warmup", session_id);
            for slot in session.participants.iter().filter(|s| s.present) {
                if let Some(path) = &slot.current_output_path {
                    if let Err(e) = std::fs::remove_file(path) {
                        tracing::debug!("Could not remove {:?}: {}", path, e);
                    }
                }
            }
        } else {
            let mut store_warnings = Vec::new();
            for slot in session.participants.iter().filter(|s| s.present) {
                let Some(path) = slot.current_output_path.clone() else {
                    continue;
                };
                outputs.push(SessionOutput {
                    role: slot.role,
                    path: path.clone(),
                    frames: slot.frames_written,
                });

                let info = devices
                    .iter()
                    .find(|(role, _)| *role == slot.role)
                    .map(|(_, d)| d.info());
                let mut warnings = session.warnings.clone();
                if let Some(error) = &slot.error {
                    warnings.push(error.clone());
                }

                let result = inner.store.update_device(&session_id, slot.role, &mut |sidecar| {
                    sidecar.device_id = slot.device_id.clone();
                    sidecar.patient_name = session.options.patient_name.clone();
                    sidecar.patient_id = session.options.patient_id.clone();
                    sidecar.raw_file = Some(file_name(&path));
                    if let Some(info) = &info {
                        sidecar.width = info.width;
                        sidecar.height = info.height;
                        sidecar.fps = info.fps;
                    }
                    sidecar.frames_recorded = slot.frames_written;
                    sidecar.started_at = slot.started_at;
                    sidecar.stopped_at = Some(stopped_at);
                    sidecar.start_offset_ms = session.start_offset_ms;
                    sidecar.warnings = warnings.clone();
                });
                if let Err(e) = result {
                    store_warnings.push(format!("Failed to write {} sidecar: {e}", slot.role));
                }
            }
            session.warnings.extend(store_warnings);
        }

        let record = SessionRecord {
            session_id: session_id.clone(),
            patient_name: session.options.patient_name.clone(),
            patient_id: session.options.patient_id.clone(),
            note: session.options.note.clone(),
            outcome: if cancelled_during_warmup {
                SessionOutcome::CancelledDuringWarmup
            } else {
                SessionOutcome::Completed
            },
            created_at: session.created_at,
            started_at: session.started_at,
            stopped_at,
            start_offset_ms: session.start_offset_ms,
            stop_offset_ms,
            recorded_duration_secs: duration_secs,
            devices: session
                .participants
                .iter()
                .map(|slot| SessionDeviceRecord {
                    role: slot.role,
                    device_id: slot.device_id.clone(),
                    present: slot.present,
                    frames_written: slot.frames_written,
                    output_file: slot.current_output_path.as_deref().map(file_name),
                    error: slot.error.clone(),
                })
                .collect(),
            warnings: session.warnings.clone(),
        };
        if let Err(e) = inner.store.save_session(&record) {
            session.warnings.push(format!("Failed to archive session: {e}"));
        }

        for warning in &session.warnings {
            tracing::warn!("[{}] {}", session_id, warning);
        }
        let _ = inner.event_tx.send(SessionEvent::StateChanged {
            session_id: session_id.clone(),
            state: SessionState::Idle,
        });
        tracing::info!(
            "[{}] Session stopped after {:.1}s, {} output(s)",
            session_id,
            duration_secs,
            outputs.len()
        );

        Ok(StopOutcome {
            session_id,
            cancelled_during_warmup,
            outputs,
            start_offset_ms: session.start_offset_ms,
            stop_offset_ms,
            duration_secs,
            warnings: session.warnings,
        })
    }

    /// Pollable snapshot with live frame counts
    pub fn status(&self) -> SessionStatus {
        let inner = &self.inner;
        let Some(mut session) = inner.session.read().clone() else {
            return SessionStatus::idle();
        };

        let now = Utc::now();
        let active = inner.active.lock().clone();
        for (role, device) in &active {
            if let Some(slot) = session.slot_mut(*role) {
                slot.frames_written = device.frames_written();
            }
        }

        let warmup_remaining = match (session.state, session.warmup_deadline) {
            (SessionState::WarmingUp, Some(deadline)) => {
                Some(((deadline - now).num_milliseconds().max(0) as f64) / 1000.0)
            }
            _ => None,
        };

        SessionStatus {
            state: session.state,
            duration: session.started_at.map(|_| session.duration_secs(now)),
            warmup_remaining,
            started_at: session.started_at,
            // Published together with started_at once warmup ends
            start_offset_ms: session.started_at.and(session.start_offset_ms),
            frame_counts: session
                .participants
                .iter()
                .filter(|s| s.present)
                .map(|s| (s.role, s.frames_written))
                .collect(),
            session_id: Some(session.session_id),
            patient_name: session.options.patient_name,
            patient_id: session.options.patient_id,
            participants: session.participants,
        }
    }

    /// Re-detect devices; only while idle
    pub fn refresh_devices(&self) -> SessionResult<Vec<DeviceSummary>> {
        let _guard = self.idle_guard()?;
        let count = self.inner.directory.refresh();
        tracing::info!("Device refresh found {} device(s)", count);
        Ok(self.inner.directory.describe())
    }

    /// Exchange the front and side roles; only while idle
    pub fn swap_roles(&self) -> SessionResult<Vec<DeviceSummary>> {
        let _guard = self.idle_guard()?;
        self.inner.directory.swap_roles();
        Ok(self.inner.directory.describe())
    }

    pub fn devices(&self) -> Vec<DeviceSummary> {
        self.inner.directory.describe()
    }

    fn idle_guard(&self) -> SessionResult<tokio::sync::MutexGuard<'_, ()>> {
        let guard = self.inner.transition.try_lock().map_err(|_| SessionError::Conflict {
            state: self.inner.state(),
        })?;
        let state = self.inner.state();
        if state != SessionState::Idle {
            return Err(SessionError::Conflict { state });
        }
        Ok(guard)
    }

    fn discard_session(&self, session_id: &str) {
        *self.inner.session.write() = None;
        self.inner.active.lock().clear();
        let _ = self.inner.event_tx.send(SessionEvent::StateChanged {
            session_id: session_id.to_string(),
            state: SessionState::Idle,
        });
    }
}
