use std::sync::Arc;

use crate::config::Config;
use crate::mitigation::MitigationEngine;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<MitigationEngine>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let engine = Arc::new(MitigationEngine::from_config(&config));
        Self {
            engine,
            config: Arc::new(config),
        }
    }
}
