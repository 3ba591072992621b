//! Detected devices and their logical roles

use super::traits::{DeviceHandle, DeviceInfo, DeviceRole};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Source of currently connected devices
pub trait DeviceDetector: Send + Sync {
    /// Enumerate devices in a stable order (first = front)
    fn detect(&self) -> Vec<Arc<dyn DeviceHandle>>;
}

/// Detector over a fixed device list
pub struct StaticDetector {
    devices: Vec<Arc<dyn DeviceHandle>>,
}

impl StaticDetector {
    pub fn new(devices: Vec<Arc<dyn DeviceHandle>>) -> Self {
        Self { devices }
    }
}

impl DeviceDetector for StaticDetector {
    fn detect(&self) -> Vec<Arc<dyn DeviceHandle>> {
        self.devices.clone()
    }
}

/// Device summary for pollers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSummary {
    pub role: DeviceRole,
    pub info: DeviceInfo,
    pub present: bool,
}

/// The devices the rig currently knows about
pub struct DeviceDirectory {
    detector: Box<dyn DeviceDetector>,
    devices: RwLock<Vec<Arc<dyn DeviceHandle>>>,
    swapped: AtomicBool,
}

impl DeviceDirectory {
    /// Create a directory and run an initial detection
    pub fn new(detector: Box<dyn DeviceDetector>) -> Self {
        let directory = Self {
            detector,
            devices: RwLock::new(Vec::new()),
            swapped: AtomicBool::new(false),
        };
        directory.refresh();
        directory
    }

    /// Directory over a fixed device list
    pub fn with_devices(devices: Vec<Arc<dyn DeviceHandle>>) -> Self {
        Self::new(Box::new(StaticDetector::new(devices)))
    }

    /// Re-run detection, returning the number of devices found
    pub fn refresh(&self) -> usize {
        let mut detected = self.detector.detect();
        if detected.len() > DeviceRole::ALL.len() {
            tracing::warn!(
                "Detected {} devices, only the first {} are used",
                detected.len(),
                DeviceRole::ALL.len()
            );
            detected.truncate(DeviceRole::ALL.len());
        }

        for (index, device) in detected.iter().enumerate() {
            tracing::info!("Device {}: {} ({})", index, device.id(), device.info().name);
        }

        let count = detected.len();
        *self.devices.write() = detected;
        count
    }

    /// Swap the front and side roles, returning the new swap state
    pub fn swap_roles(&self) -> bool {
        let swapped = !self.swapped.fetch_xor(true, Ordering::SeqCst);
        tracing::info!("Device roles swapped: {}", swapped);
        swapped
    }

    /// Whether roles are currently swapped
    pub fn is_swapped(&self) -> bool {
        self.swapped.load(Ordering::SeqCst)
    }

    /// Devices paired with their logical roles, ordered front first
    pub fn assignments(&self) -> Vec<(DeviceRole, Arc<dyn DeviceHandle>)> {
        let swapped = self.is_swapped();
        let mut assigned: Vec<(DeviceRole, Arc<dyn DeviceHandle>)> = self
            .devices
            .read()
            .iter()
            .enumerate()
            .filter_map(|(index, device)| {
                let index = if swapped { 1 - index.min(1) } else { index };
                DeviceRole::from_index(index).map(|role| (role, device.clone()))
            })
            .collect();
        assigned.sort_by_key(|(role, _)| *role);
        assigned
    }

    /// Summaries of all known devices
    pub fn describe(&self) -> Vec<DeviceSummary> {
        self.assignments()
            .into_iter()
            .map(|(role, device)| DeviceSummary {
                role,
                info: device.info(),
                present: device.is_present(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::raw::StreamFormat;
    use crate::capture::SimulatedDevice;

    fn sim(id: &str) -> Arc<dyn DeviceHandle> {
        Arc::new(SimulatedDevice::new(
            id,
            StreamFormat {
                width: 2,
                height: 2,
                fps: 30,
            },
        ))
    }

    #[test]
    fn test_roles_follow_detection_order() {
        let directory = DeviceDirectory::with_devices(vec![sim("a"), sim("b")]);
        let roles: Vec<_> = directory
            .assignments()
            .into_iter()
            .map(|(role, d)| (role, d.id().to_string()))
            .collect();
        assert_eq!(
            roles,
            vec![(DeviceRole::Front, "a".to_string()), (DeviceRole::Side, "b".to_string())]
        );
    }

    #[test]
    fn test_swap_roles() {
        let directory = DeviceDirectory::with_devices(vec![sim("a"), sim("b")]);
        assert!(directory.swap_roles());
        let front = directory.assignments().into_iter().next().unwrap();
        assert_eq!(front.0, DeviceRole::Front);
        assert_eq!(front.1.id(), "b");

        assert!(!directory.swap_roles());
        let front = directory.assignments().into_iter().next().unwrap();
        assert_eq!(front.1.id(), "a");
    }

    #[test]
    fn test_extra_devices_ignored() {
        let directory = DeviceDirectory::with_devices(vec![sim("a"), sim("b"), sim("c")]);
        assert_eq!(directory.assignments().len(), 2);
    }
}
