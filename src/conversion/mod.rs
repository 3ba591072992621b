//! Raw recording to playback file conversion
//!
//! This module contains:
//! - The encoder capability with its FFmpeg implementation
//! - Frame-count validation policy
//! - The conversion job runner

pub mod encoder;
pub mod job;

pub use encoder::{EncodeError, EncodeSession, Encoder, FfmpegEncoder, ValidationPolicy};
pub use job::ConversionRunner;
