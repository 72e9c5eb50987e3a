use std::sync::Arc;

use engine::{EngineConfig, RuntimeRegistry, SandboxPool};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<EngineConfig>,
    pub registry: Arc<RuntimeRegistry>,
    pub pool: Arc<SandboxPool>,
}
