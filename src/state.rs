//! Shared application state.

use crate::config::ServerConfig;
use crate::pipeline::Pipeline;
use crate::provider::SandboxProvider;
use crate::registry::SessionRegistry;
use std::sync::Arc;

/// State shared by every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub pipeline: Arc<Pipeline>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(provider: Arc<dyn SandboxProvider>, config: ServerConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(provider, config.registry_options()));
        let pipeline = Arc::new(Pipeline::with_agent_command(
            registry.clone(),
            config.agent_command.clone(),
        ));
        Self {
            registry,
            pipeline,
            config: Arc::new(config),
        }
    }
}
