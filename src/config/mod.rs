//! Configuration

pub mod settings;

pub use settings::{Settings, SettingsError, ENV_PREFIX};
