use crate::config::AppConfig;
use crate::core::JobRegistry;

/// State shared by every dialog in the process.
#[derive(Clone)]
pub struct AppContext {
    pub config: std::sync::Arc<AppConfig>,
    pub registry: JobRegistry,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: std::sync::Arc::new(config),
            registry: JobRegistry::new(),
        }
    }
}
