//! Capture devices
//!
//! The device capability the session controller drives, the raw recording
//! format devices write, and a simulated device for hardware-free runs.

pub mod directory;
pub mod raw;
pub mod simulated;
pub mod traits;

pub use directory::{DeviceDetector, DeviceDirectory, DeviceSummary, StaticDetector};
pub use raw::{count_frames, Frame, FrameSource, RawError, RawReader, RawWriter, StreamFormat};
pub use simulated::SimulatedDevice;
pub use traits::{CaptureMode, DeviceError, DeviceHandle, DeviceInfo, DeviceResult, DeviceRole};
