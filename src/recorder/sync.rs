//! Two-phase start/stop across independent devices
//!
//! Every device gets its own OS thread. The thread prepares the device,
//! reports back, and then waits for the go signal. Devices that prepared in
//! time meet at a [`Rendezvous`] and commit together, which keeps the spread
//! between their start timestamps down to scheduling jitter instead of the
//! seconds a pipeline rebuild can take.

use crate::capture::{CaptureMode, DeviceError, DeviceHandle, DeviceRole};
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Synchronizer errors
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("No device could be prepared: {}", .0.join("; "))]
    NoDevices(Vec<String>),

    #[error("No device committed: {}", .0.join("; "))]
    NothingCommitted(Vec<String>),

    #[error("Device {device_id} failed: {source}")]
    Device {
        device_id: String,
        #[source]
        source: DeviceError,
    },
}

/// One device taking part in a start or stop
#[derive(Clone)]
pub struct SyncTarget {
    pub role: DeviceRole,
    pub device: Arc<dyn DeviceHandle>,
    pub mode: CaptureMode,
}

/// Outcome for one device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSyncResult {
    pub role: DeviceRole,
    pub device_id: String,
    pub prepared: bool,
    pub committed: bool,
    /// Timestamp reported by the device's commit
    pub started_at: Option<DateTime<Utc>>,
    /// Wall clock immediately before `commit()`
    pub commit_called_at: Option<DateTime<Utc>>,
    /// Wall clock immediately after `commit()` returned
    pub commit_returned_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl DeviceSyncResult {
    fn new(target: &SyncTarget) -> Self {
        Self {
            role: target.role,
            device_id: target.device.id().to_string(),
            prepared: false,
            committed: false,
            started_at: None,
            commit_called_at: None,
            commit_returned_at: None,
            error: None,
        }
    }
}

/// Result of a synchronized start or stop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Earliest device start timestamp
    pub committed_at: DateTime<Utc>,
    /// Largest pairwise difference between device start timestamps
    pub offset_ms: f64,
    pub devices: Vec<DeviceSyncResult>,
    pub warnings: Vec<String>,
}

impl SyncReport {
    pub fn device(&self, role: DeviceRole) -> Option<&DeviceSyncResult> {
        self.devices.iter().find(|d| d.role == role)
    }

    pub fn committed_count(&self) -> usize {
        self.devices.iter().filter(|d| d.committed).count()
    }
}

/// Largest pairwise difference in milliseconds, 0 for fewer than two stamps
pub fn max_offset_ms(stamps: &[DateTime<Utc>]) -> f64 {
    let (Some(min), Some(max)) = (stamps.iter().min(), stamps.iter().max()) else {
        return 0.0;
    };
    let delta = *max - *min;
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1000.0,
        None => delta.num_milliseconds() as f64,
    }
}

#[derive(Default)]
struct GateState {
    arrived: usize,
    released: bool,
    closed: bool,
}

/// Single-use barrier with a deadline.
///
/// Once `expected` parties have arrived everybody is released. If the
/// deadline passes first the parties already waiting are released and the
/// gate closes: later arrivals are turned away.
pub struct Rendezvous {
    expected: usize,
    deadline: Instant,
    state: Mutex<GateState>,
    cond: Condvar,
}

impl Rendezvous {
    pub fn new(expected: usize, timeout: Duration) -> Self {
        Self {
            expected,
            deadline: Instant::now() + timeout,
            state: Mutex::new(GateState::default()),
            cond: Condvar::new(),
        }
    }

    /// Wait for the other parties. Returns false for a late arrival.
    pub fn arrive(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }

        state.arrived += 1;
        if state.arrived >= self.expected {
            state.released = true;
            self.cond.notify_all();
            return true;
        }

        let result = self
            .cond
            .wait_while_until(&mut state, |s| !s.released && !s.closed, self.deadline);
        if result.timed_out() && !state.released {
            state.closed = true;
            self.cond.notify_all();
            tracing::warn!(
                "Rendezvous timed out with {}/{} parties",
                state.arrived,
                self.expected
            );
        }
        true
    }
}

enum SyncMsg {
    Prepared(usize, Result<(), DeviceError>),
    Committed {
        index: usize,
        called_at: DateTime<Utc>,
        result: Result<DateTime<Utc>, DeviceError>,
        returned_at: DateTime<Utc>,
    },
    Late(usize),
}

/// Drives devices through prepare/commit with bounded waits
#[derive(Debug, Clone)]
pub struct Synchronizer {
    pub prepare_timeout: Duration,
    pub commit_timeout: Duration,
    pub rendezvous_timeout: Duration,
}

impl Default for Synchronizer {
    fn default() -> Self {
        Self {
            prepare_timeout: Duration::from_secs(10),
            commit_timeout: Duration::from_secs(5),
            rendezvous_timeout: Duration::from_secs(2),
        }
    }
}

impl Synchronizer {
    /// Start every target in its own mode, synchronized at commit
    pub fn start_all(&self, targets: &[SyncTarget]) -> Result<SyncReport, SyncError> {
        let mut results: Vec<DeviceSyncResult> = targets.iter().map(DeviceSyncResult::new).collect();
        let mut warnings = Vec::new();
        let (tx, rx) = mpsc::channel::<SyncMsg>();
        let mut go_senders = Vec::with_capacity(targets.len());

        for (index, target) in targets.iter().enumerate() {
            let (go_tx, go_rx) = mpsc::channel::<Arc<Rendezvous>>();
            go_senders.push(Some(go_tx));

            let tx = tx.clone();
            let device = target.device.clone();
            let mode = target.mode.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("sync-{}", target.role))
                .spawn(move || device_worker(index, device, mode, tx, go_rx));

            if let Err(e) = spawned {
                results[index].error = Some(format!("Failed to spawn worker: {e}"));
                go_senders[index] = None;
            }
        }
        drop(tx);

        // Prepare phase
        let deadline = Instant::now() + self.prepare_timeout;
        let mut pending: usize = go_senders.iter().filter(|s| s.is_some()).count();
        while pending > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(SyncMsg::Prepared(index, result)) => {
                    pending -= 1;
                    match result {
                        Ok(()) => results[index].prepared = true,
                        Err(e) => {
                            tracing::warn!("[{}] Prepare failed: {}", results[index].device_id, e);
                            results[index].error = Some(e.to_string());
                        }
                    }
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }

        for (index, result) in results.iter_mut().enumerate() {
            if !result.prepared && result.error.is_none() {
                let timeout = DeviceError::Timeout(self.prepare_timeout.as_millis() as u64);
                tracing::warn!("[{}] Prepare timed out", result.device_id);
                result.error = Some(timeout.to_string());
            }
            if !result.prepared {
                // Dropping the go channel tells the worker to give up
                go_senders[index] = None;
            }
        }

        let prepared: Vec<usize> = (0..results.len()).filter(|i| results[*i].prepared).collect();
        if prepared.is_empty() {
            return Err(SyncError::NoDevices(collect_errors(&results)));
        }

        // Commit phase
        let gate = Arc::new(Rendezvous::new(prepared.len(), self.rendezvous_timeout));
        for index in &prepared {
            if let Some(go) = go_senders[*index].take() {
                if go.send(gate.clone()).is_err() {
                    results[*index].error = Some("Worker exited before commit".to_string());
                }
            }
        }

        let deadline = Instant::now() + self.rendezvous_timeout + self.commit_timeout;
        let mut pending = prepared.len();
        while pending > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(SyncMsg::Committed {
                    index,
                    called_at,
                    result,
                    returned_at,
                }) => {
                    pending -= 1;
                    let entry = &mut results[index];
                    entry.commit_called_at = Some(called_at);
                    entry.commit_returned_at = Some(returned_at);
                    match result {
                        Ok(started_at) => {
                            entry.committed = true;
                            entry.started_at = Some(started_at);
                        }
                        Err(e) => {
                            tracing::warn!("[{}] Commit failed: {}", entry.device_id, e);
                            entry.error = Some(e.to_string());
                        }
                    }
                }
                Ok(SyncMsg::Late(index)) => {
                    pending -= 1;
                    let entry = &mut results[index];
                    entry.error = Some("Synchronization timeout: missed the commit rendezvous".to_string());
                    warnings.push(format!(
                        "{} ({}) missed the commit rendezvous and was not started",
                        entry.role, entry.device_id
                    ));
                }
                Ok(SyncMsg::Prepared(..)) => {}
                Err(_) => break,
            }
        }

        for entry in results.iter_mut() {
            if entry.prepared && !entry.committed && entry.error.is_none() {
                let timeout = DeviceError::Timeout(self.commit_timeout.as_millis() as u64);
                entry.error = Some(timeout.to_string());
                warnings.push(format!("{} ({}) did not confirm commit", entry.role, entry.device_id));
            }
        }

        let stamps: Vec<DateTime<Utc>> = results.iter().filter_map(|r| r.started_at).collect();
        let Some(committed_at) = stamps.iter().min().copied() else {
            return Err(SyncError::NothingCommitted(collect_errors(&results)));
        };

        let offset_ms = max_offset_ms(&stamps);
        tracing::info!(
            "Synchronized commit of {}/{} devices, offset {:.2}ms",
            stamps.len(),
            targets.len(),
            offset_ms
        );

        Ok(SyncReport {
            committed_at,
            offset_ms,
            devices: results,
            warnings,
        })
    }

    /// Switch recording devices back to streaming, closing their recordings
    ///
    /// A device that cannot return to streaming is stopped outright, so no
    /// recording stays open past this call.
    pub fn stop_all(&self, devices: &[(DeviceRole, Arc<dyn DeviceHandle>)]) -> Result<SyncReport, SyncError> {
        let targets: Vec<SyncTarget> = devices
            .iter()
            .map(|(role, device)| SyncTarget {
                role: *role,
                device: device.clone(),
                mode: CaptureMode::Streaming,
            })
            .collect();
        let outcome = self.start_all(&targets);

        let streaming: Vec<DeviceRole> = match &outcome {
            Ok(report) => report.devices.iter().filter(|d| d.committed).map(|d| d.role).collect(),
            Err(_) => Vec::new(),
        };
        for (role, device) in devices.iter().filter(|(role, _)| !streaming.contains(role)) {
            match device.stop() {
                Ok(()) => tracing::warn!("[{}] Stopped {} device that did not return to streaming", device.id(), role),
                Err(e) => tracing::error!("[{}] Fallback stop failed: {}", device.id(), e),
            }
        }
        outcome
    }

    /// Suspend the write path on every device
    ///
    /// All-or-nothing: on any failure the devices that did pause are resumed.
    pub fn pause_all(&self, devices: &[(DeviceRole, Arc<dyn DeviceHandle>)]) -> Result<(), SyncError> {
        apply_all(devices, |d| d.pause(), |d| d.resume())
    }

    /// Re-enable the write path on every device
    pub fn resume_all(&self, devices: &[(DeviceRole, Arc<dyn DeviceHandle>)]) -> Result<(), SyncError> {
        apply_all(devices, |d| d.resume(), |d| d.pause())
    }
}

fn device_worker(
    index: usize,
    device: Arc<dyn DeviceHandle>,
    mode: CaptureMode,
    tx: mpsc::Sender<SyncMsg>,
    go: mpsc::Receiver<Arc<Rendezvous>>,
) {
    let prepared = device.prepare(mode);
    let ok = prepared.is_ok();
    let delivered = tx.send(SyncMsg::Prepared(index, prepared)).is_ok();
    if !ok {
        return;
    }

    let gate = if delivered { go.recv().ok() } else { None };
    let Some(gate) = gate else {
        // Prepared too late; do not leave a half-built pipeline behind
        tracing::debug!("[{}] Dropped after prepare timeout", device.id());
        let _ = device.stop();
        return;
    };

    if !gate.arrive() {
        let _ = device.stop();
        let _ = tx.send(SyncMsg::Late(index));
        return;
    }

    let called_at = Utc::now();
    let result = device.commit();
    let returned_at = Utc::now();
    let committed = result.is_ok();
    let delivered = tx
        .send(SyncMsg::Committed {
            index,
            called_at,
            result,
            returned_at,
        })
        .is_ok();
    if committed && !delivered {
        // Nobody counted this commit; it must not keep running unowned
        tracing::warn!("[{}] Commit returned after the deadline, stopping", device.id());
        let _ = device.stop();
    }
}

/// Run `op` on every device in parallel; undo the successes if any failed
fn apply_all<F, U>(devices: &[(DeviceRole, Arc<dyn DeviceHandle>)], op: F, undo: U) -> Result<(), SyncError>
where
    F: Fn(&dyn DeviceHandle) -> Result<(), DeviceError> + Sync,
    U: Fn(&dyn DeviceHandle) -> Result<(), DeviceError>,
{
    let results: Vec<Result<(), DeviceError>> = std::thread::scope(|scope| {
        let handles: Vec<_> = devices
            .iter()
            .map(|(_, device)| {
                let op = &op;
                scope.spawn(move || op(device.as_ref()))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(DeviceError::Pipeline("device call panicked".to_string())))
            })
            .collect()
    });

    let mut applied = Vec::new();
    let mut failure = None;
    for ((_, device), result) in devices.iter().zip(results) {
        match result {
            Ok(()) => applied.push(device),
            Err(source) if failure.is_none() => {
                failure = Some(SyncError::Device {
                    device_id: device.id().to_string(),
                    source,
                });
            }
            Err(e) => tracing::warn!("[{}] {}", device.id(), e),
        }
    }

    let Some(failure) = failure else {
        return Ok(());
    };
    for device in applied {
        if let Err(e) = undo(device.as_ref()) {
            tracing::error!("[{}] Rollback failed: {}", device.id(), e);
        }
    }
    Err(failure)
}

fn collect_errors(results: &[DeviceSyncResult]) -> Vec<String> {
    results
        .iter()
        .filter_map(|r| r.error.as_ref().map(|e| format!("{}: {}", r.device_id, e)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{SimulatedDevice, StreamFormat};
    use chrono::TimeZone;
    use std::sync::atomic::AtomicBool;
    use tempfile::tempdir;

    fn format() -> StreamFormat {
        StreamFormat {
            width: 4,
            height: 4,
            fps: 100,
        }
    }

    fn targets(dir: &std::path::Path, devices: &[Arc<SimulatedDevice>]) -> Vec<SyncTarget> {
        devices
            .iter()
            .enumerate()
            .map(|(i, d)| {
                let role = DeviceRole::from_index(i).unwrap();
                SyncTarget {
                    role,
                    device: d.clone(),
                    mode: CaptureMode::Recording {
                        output: dir.join(format!("b_{role}.raw")),
                    },
                }
            })
            .collect()
    }

    #[test]
    fn test_offset_is_max_pairwise_delta() {
        let t0 = Utc.timestamp_millis_opt(1_000_000).unwrap();
        let stamps = vec![
            t0 + chrono::Duration::milliseconds(7),
            t0,
            t0 + chrono::Duration::milliseconds(3),
        ];
        assert_eq!(max_offset_ms(&stamps), 7.0);
        assert_eq!(max_offset_ms(&[t0]), 0.0);
        assert_eq!(max_offset_ms(&[]), 0.0);
    }

    #[test]
    fn test_start_two_devices() {
        let dir = tempdir().unwrap();
        let devices = vec![
            Arc::new(SimulatedDevice::new("a", format()).with_prepare_delay(Duration::from_millis(50))),
            Arc::new(SimulatedDevice::new("b", format())),
        ];
        let sync = Synchronizer::default();
        let report = sync.start_all(&targets(dir.path(), &devices)).unwrap();

        assert_eq!(report.committed_count(), 2);
        assert!(report.offset_ms >= 0.0);
        assert!(report.warnings.is_empty());
        for d in &report.devices {
            assert!(d.commit_called_at.unwrap() <= d.commit_returned_at.unwrap());
        }
        assert!(devices.iter().all(|d| d.is_recording()));

        for d in &devices {
            d.stop().unwrap();
        }
    }

    #[test]
    fn test_failed_prepare_leaves_orphan() {
        let dir = tempdir().unwrap();
        let devices = vec![
            Arc::new(SimulatedDevice::new("a", format())),
            Arc::new(SimulatedDevice::new("b", format())),
        ];
        devices[1].set_present(false);

        let report = Synchronizer::default()
            .start_all(&targets(dir.path(), &devices))
            .unwrap();
        assert_eq!(report.committed_count(), 1);
        assert_eq!(report.offset_ms, 0.0);
        let side = report.device(DeviceRole::Side).unwrap();
        assert!(!side.prepared);
        assert!(side.error.as_deref().unwrap().contains("not present"));

        devices[0].stop().unwrap();
    }

    #[test]
    fn test_prepare_timeout_marks_device_absent() {
        let dir = tempdir().unwrap();
        let devices = vec![
            Arc::new(SimulatedDevice::new("a", format())),
            Arc::new(SimulatedDevice::new("slow", format()).with_prepare_delay(Duration::from_millis(400))),
        ];
        let sync = Synchronizer {
            prepare_timeout: Duration::from_millis(100),
            ..Synchronizer::default()
        };

        let report = sync.start_all(&targets(dir.path(), &devices)).unwrap();
        assert_eq!(report.committed_count(), 1);
        assert!(report.device(DeviceRole::Side).unwrap().error.as_deref().unwrap().contains("timed out"));

        // The slow worker tears its pipeline down once it notices
        std::thread::sleep(Duration::from_millis(500));
        assert!(!devices[1].is_recording());
        devices[0].stop().unwrap();
    }

    /// Prepares fine but hangs in commit
    struct HangingCommit {
        hang: Duration,
        stopped: AtomicBool,
    }

    impl DeviceHandle for HangingCommit {
        fn id(&self) -> &str {
            "hanging"
        }

        fn info(&self) -> crate::capture::DeviceInfo {
            crate::capture::DeviceInfo {
                id: "hanging".to_string(),
                name: "Hanging camera".to_string(),
                width: 4,
                height: 4,
                fps: 100,
            }
        }

        fn is_present(&self) -> bool {
            true
        }

        fn prepare(&self, _mode: CaptureMode) -> Result<(), DeviceError> {
            Ok(())
        }

        fn commit(&self) -> Result<DateTime<Utc>, DeviceError> {
            std::thread::sleep(self.hang);
            Ok(Utc::now())
        }

        fn pause(&self) -> Result<(), DeviceError> {
            Ok(())
        }

        fn resume(&self) -> Result<(), DeviceError> {
            Ok(())
        }

        fn stop(&self) -> Result<(), DeviceError> {
            self.stopped.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        fn frames_written(&self) -> u64 {
            0
        }
    }

    #[test]
    fn test_commit_timeout_fails_only_the_slow_device() {
        let dir = tempdir().unwrap();
        let good = Arc::new(SimulatedDevice::new("a", format()));
        let hanging = Arc::new(HangingCommit {
            hang: Duration::from_millis(600),
            stopped: AtomicBool::new(false),
        });
        let targets = vec![
            SyncTarget {
                role: DeviceRole::Front,
                device: good.clone(),
                mode: CaptureMode::Recording {
                    output: dir.path().join("b_front.raw"),
                },
            },
            SyncTarget {
                role: DeviceRole::Side,
                device: hanging.clone(),
                mode: CaptureMode::Recording {
                    output: dir.path().join("b_side.raw"),
                },
            },
        ];
        let sync = Synchronizer {
            commit_timeout: Duration::from_millis(100),
            rendezvous_timeout: Duration::from_millis(100),
            ..Synchronizer::default()
        };

        let report = sync.start_all(&targets).unwrap();
        assert_eq!(report.committed_count(), 1);
        assert!(report.device(DeviceRole::Front).unwrap().committed);
        let side = report.device(DeviceRole::Side).unwrap();
        assert!(!side.committed);
        assert!(side.error.as_deref().unwrap().contains("timed out"));
        assert!(report.warnings.iter().any(|w| w.contains("did not confirm commit")));
        assert!(good.is_recording());

        // The late commit is torn down once it returns
        std::thread::sleep(Duration::from_millis(700));
        assert!(hanging.stopped.load(std::sync::atomic::Ordering::SeqCst));
        good.stop().unwrap();
    }

    #[test]
    fn test_stop_all_stops_device_that_vanished() {
        let dir = tempdir().unwrap();
        let devices = vec![
            Arc::new(SimulatedDevice::new("a", format())),
            Arc::new(SimulatedDevice::new("b", format())),
        ];
        let sync = Synchronizer::default();
        sync.start_all(&targets(dir.path(), &devices)).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        devices[1].set_present(false);
        let handles: Vec<(DeviceRole, Arc<dyn DeviceHandle>)> = vec![
            (DeviceRole::Front, devices[0].clone()),
            (DeviceRole::Side, devices[1].clone()),
        ];
        let report = sync.stop_all(&handles).unwrap();
        assert!(report.device(DeviceRole::Front).unwrap().committed);
        assert!(!report.device(DeviceRole::Side).unwrap().committed);

        assert!(!devices[1].is_recording());
        let frames = devices[1].frames_written();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(devices[1].frames_written(), frames);

        devices[0].stop().unwrap();
    }

    #[test]
    fn test_no_devices_is_fatal() {
        let dir = tempdir().unwrap();
        let devices = vec![Arc::new(SimulatedDevice::new("a", format()))];
        devices[0].set_present(false);

        let err = Synchronizer::default()
            .start_all(&targets(dir.path(), &devices))
            .unwrap_err();
        assert!(matches!(err, SyncError::NoDevices(_)));
    }

    #[test]
    fn test_rendezvous_turns_away_late_arrival() {
        let gate = Rendezvous::new(2, Duration::from_millis(30));
        assert!(gate.arrive());
        assert!(!gate.arrive());
    }

    #[test]
    fn test_rendezvous_releases_all_parties() {
        let gate = Arc::new(Rendezvous::new(3, Duration::from_secs(5)));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let gate = gate.clone();
                std::thread::spawn(move || gate.arrive())
            })
            .collect();
        assert!(handles.into_iter().all(|h| h.join().unwrap()));
    }

    #[test]
    fn test_pause_rolls_back_on_failure() {
        let dir = tempdir().unwrap();
        let recording = Arc::new(SimulatedDevice::new("a", format()));
        let streaming = Arc::new(SimulatedDevice::new("b", format()));
        recording
            .prepare(CaptureMode::Recording {
                output: dir.path().join("b_front.raw"),
            })
            .unwrap();
        recording.commit().unwrap();
        streaming.prepare(CaptureMode::Streaming).unwrap();
        streaming.commit().unwrap();

        let devices: Vec<(DeviceRole, Arc<dyn DeviceHandle>)> = vec![
            (DeviceRole::Front, recording.clone()),
            (DeviceRole::Side, streaming.clone()),
        ];
        let err = Synchronizer::default().pause_all(&devices).unwrap_err();
        assert!(matches!(err, SyncError::Device { ref device_id, .. } if device_id == "b"));

        // The recording device was resumed again and keeps writing
        let before = recording.frames_written();
        std::thread::sleep(Duration::from_millis(50));
        assert!(recording.frames_written() > before);

        recording.stop().unwrap();
        streaming.stop().unwrap();
    }
}
