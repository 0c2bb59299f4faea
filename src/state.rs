use crate::config::Config;
use crate::coordinator::Coordinator;
use std::sync::Arc;

/// Application state shared across handlers
pub struct AppState {
    pub coordinator: Coordinator,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            coordinator: Coordinator::new(&config),
            config,
        }
    }
}
