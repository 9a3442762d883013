use std::sync::Arc;

use crate::config::AppConfig;
use crate::services::{AdmissionController, JobStore, LabelCorpus, ProcessLauncher};

/// Everything the orchestrator, scheduler and API share.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn JobStore>,
    pub corpus: Arc<dyn LabelCorpus>,
    pub admission: AdmissionController,
    pub launcher: Arc<dyn ProcessLauncher>,
}

impl AppContext {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn JobStore>,
        corpus: Arc<dyn LabelCorpus>,
        admission: AdmissionController,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            corpus,
            admission,
            launcher,
        }
    }
}
