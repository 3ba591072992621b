//! Command handlers
//!
//! The request/response surface of the crate. Every handler takes the shared
//! [`AppState`] and returns `Result<_, ErrorResponse>`.

pub mod jobs;
pub mod recording;

use crate::capture::DeviceDirectory;
use crate::config::Settings;
use crate::conversion::{ConversionRunner, Encoder};
use crate::jobs::{JobEngine, JobRunner};
use crate::metadata::{BatchCatalog, JsonSidecarStore, SidecarStore};
use crate::processing::{PoseAnalyzer, ProcessingRunner, SubprocessAnalyzer};
use crate::recorder::SessionController;
use crate::utils::error::AppResult;
use std::sync::Arc;

/// Application state shared by all commands
pub struct AppState {
    pub settings: Settings,
    pub controller: SessionController,
    pub engine: JobEngine,
    pub catalog: Arc<BatchCatalog>,
}

impl AppState {
    /// Wire up everything from settings. Must run inside a tokio runtime.
    pub fn new(settings: Settings, directory: Arc<DeviceDirectory>) -> AppResult<Self> {
        let store: Arc<dyn SidecarStore> = Arc::new(JsonSidecarStore::new(settings.layout(), &settings.state_dir));
        let encoders = settings.build_encoders();
        let analyzer = settings.analyzer_command.as_ref().map(|command| {
            Arc::new(SubprocessAnalyzer::new(command, settings.analyzer_args.clone())) as Arc<dyn PoseAnalyzer>
        });
        if analyzer.is_none() {
            tracing::warn!("No analyzer configured, processing jobs are unavailable");
        }
        Self::with_parts(settings, directory, store, encoders, analyzer)
    }

    /// Wire up with explicit store, encoders and analyzer
    pub fn with_parts(
        settings: Settings,
        directory: Arc<DeviceDirectory>,
        store: Arc<dyn SidecarStore>,
        encoders: Vec<Arc<dyn Encoder>>,
        analyzer: Option<Arc<dyn PoseAnalyzer>>,
    ) -> AppResult<Self> {
        let layout = settings.layout();
        layout.ensure_dirs()?;
        std::fs::create_dir_all(&settings.state_dir)?;

        let catalog = Arc::new(BatchCatalog::new(layout.clone(), store.clone()));

        let mut runners: Vec<Arc<dyn JobRunner>> = vec![Arc::new(
            ConversionRunner::new(encoders, settings.validation_policy(), layout.clone(), store.clone())
                .with_progress_every(settings.progress_every_frames),
        )];
        if let Some(analyzer) = analyzer {
            runners.push(Arc::new(
                ProcessingRunner::new(analyzer, layout.clone(), store.clone())
                    .with_progress_every(settings.progress_every_frames),
            ));
        }

        let engine = JobEngine::new(catalog.clone(), store.clone(), runners);
        let controller = SessionController::new(settings.controller_config(), directory, store, layout);

        tracing::info!(
            "Ready: recordings in {:?}, reports in {:?}",
            settings.recordings_dir,
            settings.processed_dir
        );
        Ok(Self {
            settings,
            controller,
            engine,
            catalog,
        })
    }
}
