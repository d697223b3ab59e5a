//! Server configuration.

use crate::pipeline::DEFAULT_AGENT_COMMAND;
use crate::provider::{LocalProvider, ProviderError, RemoteProvider, SandboxProvider};
use crate::registry::{RegistryOptions, DEFAULT_CREATE_TIMEOUT, DEFAULT_IDLE_TIMEOUT};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_TEMPLATE: &str = "default";
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

pub const AGENT_API_KEY_ENV: &str = "ANTHROPIC_API_KEY";
pub const AGENT_BASE_URL_ENV: &str = "ANTHROPIC_BASE_URL";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ProviderKind {
    /// Directory-per-sandbox on this host.
    #[default]
    Local,
    /// HTTP sandbox service.
    Remote,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("--provider-url is required for the remote provider")]
    MissingProviderUrl,

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub provider: ProviderKind,
    pub provider_url: Option<String>,
    pub provider_api_key: Option<String>,
    /// Root for the local provider; a temp directory when unset.
    pub local_root: Option<PathBuf>,
    pub template: String,
    pub agent_api_key: Option<String>,
    pub agent_base_url: Option<String>,
    pub agent_command: String,
    pub idle_timeout: Duration,
    pub create_timeout: Duration,
    /// Zero disables the background sweep.
    pub sweep_interval: Duration,
    pub shutdown_deadline: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            provider: ProviderKind::Local,
            provider_url: None,
            provider_api_key: None,
            local_root: None,
            template: DEFAULT_TEMPLATE.to_string(),
            agent_api_key: None,
            agent_base_url: None,
            agent_command: DEFAULT_AGENT_COMMAND.to_string(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            create_timeout: DEFAULT_CREATE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            shutdown_deadline: DEFAULT_SHUTDOWN_DEADLINE,
        }
    }
}

impl ServerConfig {
    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            idle_timeout: self.idle_timeout,
            create_timeout: self.create_timeout,
        }
    }

    pub fn build_provider(&self) -> Result<Arc<dyn SandboxProvider>, ConfigError> {
        match self.provider {
            ProviderKind::Local => Ok(Arc::new(match &self.local_root {
                Some(root) => LocalProvider::new(root),
                None => LocalProvider::default(),
            })),
            ProviderKind::Remote => {
                let url = self
                    .provider_url
                    .as_deref()
                    .filter(|url| !url.is_empty())
                    .ok_or(ConfigError::MissingProviderUrl)?;
                let key = self.provider_api_key.clone().unwrap_or_default();
                Ok(Arc::new(RemoteProvider::new(url, key)?))
            }
        }
    }

    /// Environment handed to a new sandbox. A per-request base URL wins over
    /// the configured one; request envs are applied last.
    pub fn session_envs(
        &self,
        base_url: Option<&str>,
        extra: HashMap<String, String>,
    ) -> HashMap<String, String> {
        let mut envs = HashMap::new();
        if let Some(key) = self.agent_api_key.as_deref().filter(|k| !k.is_empty()) {
            envs.insert(AGENT_API_KEY_ENV.to_string(), key.to_string());
        }
        let base_url = base_url
            .filter(|url| !url.is_empty())
            .or(self.agent_base_url.as_deref().filter(|url| !url.is_empty()));
        if let Some(url) = base_url {
            envs.insert(AGENT_BASE_URL_ENV.to_string(), url.to_string());
        }
        envs.extend(extra);
        envs
    }
}
