use crate::config::AppConfig;
use crate::runtime::ContainerRuntime;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub runtime: Arc<dyn ContainerRuntime>,
}

impl AppContext {
    pub fn new(config: AppConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            config: Arc::new(config),
            runtime,
        }
    }
}
