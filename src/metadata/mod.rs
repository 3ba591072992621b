//! Metadata sidecars and derived batches
//!
//! - `layout`: file naming shared by every component
//! - `schema`: sidecar and archive documents
//! - `store`: the persistence boundary
//! - `batch`: batches recomputed from the recordings directory

pub mod batch;
pub mod layout;
pub mod schema;
pub mod store;

pub use batch::{Batch, BatchCatalog, BatchDevice};
pub use layout::RecordingLayout;
pub use schema::{
    ConversionInfo, DeviceSidecar, OutputSource, ProcessingInfo, SessionDeviceRecord, SessionOutcome,
    SessionRecord,
};
pub use store::{JsonSidecarStore, SidecarError, SidecarResult, SidecarStore};
