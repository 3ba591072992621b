//! Duo Capture - synchronized two-camera recording with background
//! conversion and pose analysis.
//!
//! This is the main library crate. It provides the session controller, the
//! job engine with its conversion and processing runners, and the command
//! surface tying them together.

pub mod capture;
pub mod commands;
pub mod config;
pub mod conversion;
pub mod jobs;
pub mod metadata;
pub mod processing;
pub mod recorder;
pub mod utils;

pub use commands::AppState;
pub use config::Settings;
pub use utils::error::{AppError, AppResult, ErrorResponse};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging
///
/// `RUST_LOG` takes precedence over the default filter. Calling this more
/// than once is harmless.
pub fn init_tracing() {
    let result = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "duo_capture=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();

    if result.is_ok() {
        tracing::info!("Starting Duo Capture v{}", env!("CARGO_PKG_VERSION"));
    }
}
