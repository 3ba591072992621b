//! Recording session system
//!
//! - `sync`: two-phase prepare/commit across devices
//! - `controller`: the session state machine
//! - `state`: session types and snapshots

pub mod controller;
pub mod state;
pub mod sync;

pub use controller::{ControllerConfig, SessionController, SessionError, SessionResult};
pub use state::{
    DeviceSlot, Session, SessionEvent, SessionOptions, SessionOutput, SessionState, SessionStatus, StartOutcome,
    StopOutcome,
};
pub use sync::{DeviceSyncResult, Rendezvous, SyncError, SyncReport, SyncTarget, Synchronizer};
