//! Session registry.
//!
//! The registry is the only shared mutable state in the process. Every read
//! and write of the session map goes through one mutex; provider calls are
//! always made with the lock released.

use crate::error::{Result, SessionError};
use crate::provider::{CreateOptions, ProviderError, SandboxHandle, SandboxProvider};
use crate::reaper;
use crate::session::{
    MemoryStore, SandboxSession, SessionInfo, SessionRef, SessionStatus, SessionStore,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Idle time after which a session is reaped.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// Lifetime requested from the provider when a sandbox is created.
pub const DEFAULT_CREATE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub idle_timeout: Duration,
    pub create_timeout: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            create_timeout: DEFAULT_CREATE_TIMEOUT,
        }
    }
}

/// Parameters for a new session.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub template: String,
    pub envs: HashMap<String, String>,
}

struct Inner {
    store: Box<dyn SessionStore>,
    /// Every id ever registered in this process; ids are never reused.
    seen: HashSet<String>,
}

pub struct SessionRegistry {
    provider: Arc<dyn SandboxProvider>,
    inner: Mutex<Inner>,
    options: RegistryOptions,
}

impl SessionRegistry {
    pub fn new(provider: Arc<dyn SandboxProvider>, options: RegistryOptions) -> Self {
        Self::with_store(provider, Box::<MemoryStore>::default(), options)
    }

    pub fn with_store(
        provider: Arc<dyn SandboxProvider>,
        store: Box<dyn SessionStore>,
        options: RegistryOptions,
    ) -> Self {
        Self {
            provider,
            inner: Mutex::new(Inner {
                store,
                seen: HashSet::new(),
            }),
            options,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.options.idle_timeout
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Provision a sandbox and register it. Idle sessions are reaped first.
    pub async fn create(&self, config: SessionConfig) -> Result<SessionInfo> {
        reaper::sweep(self).await;

        let handle = self
            .provider
            .create(
                &config.template,
                CreateOptions {
                    timeout: self.options.create_timeout,
                    envs: config.envs,
                },
            )
            .await?;
        let id = handle.id().to_string();

        let session = SandboxSession::new(config.template, handle.clone());
        let info = session.info(session.created_at, self.options.idle_timeout);
        let duplicate = {
            let mut inner = self.inner.lock().await;
            if inner.seen.contains(&id) {
                true
            } else {
                inner.seen.insert(id.clone());
                inner.store.insert(session);
                false
            }
        };

        if duplicate {
            warn!(sandbox_id = %id, "Provider reused a sandbox id; discarding sandbox");
            if let Err(e) = handle.kill().await {
                warn!(sandbox_id = %id, error = %e, "Failed to kill duplicate sandbox");
            }
            return Err(ProviderError::InvalidResponse(format!("duplicate sandbox id {id}")).into());
        }

        info!(sandbox_id = %id, template = %info.template, provider = self.provider.name(), "Created session");
        Ok(info)
    }

    /// Pure lookup; does not count as activity.
    pub async fn get(&self, id: &str) -> Result<SessionInfo> {
        let inner = self.inner.lock().await;
        inner
            .store
            .get(id)
            .map(|s| s.info(Utc::now(), self.options.idle_timeout))
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Record activity on a live session.
    pub async fn touch(&self, id: &str) -> Result<SessionInfo> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let session = inner
            .store
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.touch(now);
        Ok(session.info(now, self.options.idle_timeout))
    }

    /// Touch a session and borrow what is needed to run a command in it.
    pub async fn acquire(&self, id: &str) -> Result<SessionRef> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let session = inner
            .store
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.touch(now);
        Ok(SessionRef::from(&*session))
    }

    /// Drop the record without contacting the provider.
    pub async fn remove(&self, id: &str) -> bool {
        self.take(id).await.is_some()
    }

    pub(crate) async fn take(&self, id: &str) -> Option<SandboxSession> {
        self.inner.lock().await.store.remove(id)
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let now = Utc::now();
        let inner = self.inner.lock().await;
        let mut sessions: Vec<SessionInfo> = inner
            .store
            .list()
            .into_iter()
            .map(|s| s.info(now, self.options.idle_timeout))
            .collect();
        sessions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.sandbox_id.cmp(&b.sandbox_id))
        });
        sessions
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.store.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Kill the sandbox and forget the session.
    ///
    /// A failed kill is logged; the record is removed either way since the
    /// sandbox can no longer be trusted.
    pub async fn terminate(&self, id: &str) -> Result<SessionInfo> {
        let handle = {
            let inner = self.inner.lock().await;
            inner
                .store
                .get(id)
                .map(|s| s.handle.clone())
                .ok_or_else(|| SessionError::NotFound(id.to_string()))?
        };

        if let Err(e) = handle.kill().await {
            warn!(sandbox_id = %id, error = %e, "Failed to kill sandbox during terminate");
        }

        let now = Utc::now();
        let session = self
            .take(id)
            .await
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let mut info = session.info(now, self.options.idle_timeout);
        info.status = SessionStatus::Terminated;
        info!(sandbox_id = %id, "Terminated session");
        Ok(info)
    }

    /// Sessions idle longer than the threshold at `now`. A session with a
    /// command in flight holds its exec lock and is never idle.
    pub(crate) async fn expired(&self, now: DateTime<Utc>) -> Vec<(String, Arc<dyn SandboxHandle>)> {
        let inner = self.inner.lock().await;
        inner
            .store
            .list()
            .into_iter()
            .filter(|s| s.is_expired(now, self.options.idle_timeout))
            .filter(|s| s.exec_lock.try_lock().is_ok())
            .map(|s| (s.id.clone(), s.handle.clone()))
            .collect()
    }

    /// Every registered session.
    pub(crate) async fn all_handles(&self) -> Vec<(String, Arc<dyn SandboxHandle>)> {
        let inner = self.inner.lock().await;
        inner
            .store
            .list()
            .into_iter()
            .map(|s| (s.id.clone(), s.handle.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockCall, MockProvider};

    fn registry(provider: &MockProvider) -> SessionRegistry {
        SessionRegistry::new(Arc::new(provider.clone()), RegistryOptions::default())
    }

    fn config() -> SessionConfig {
        SessionConfig {
            template: "default".to_string(),
            envs: HashMap::from([("ANTHROPIC_API_KEY".to_string(), "key".to_string())]),
        }
    }

    #[tokio::test]
    async fn create_registers_active_session() {
        let provider = MockProvider::new();
        let registry = registry(&provider);

        let info = registry.create(config()).await.unwrap();
        assert_eq!(info.sandbox_id, "sb_1");
        assert_eq!(info.status, SessionStatus::Active);
        assert_eq!(info.created_at, info.last_activity);

        let fetched = registry.get("sb_1").await.unwrap();
        assert_eq!(fetched.sandbox_id, "sb_1");
        assert_eq!(
            provider.calls()[0],
            MockCall::Create {
                template: "default".to_string(),
                envs: config().envs,
            }
        );
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let provider = MockProvider::new();
        let registry = registry(&provider);
        let a = registry.create(config()).await.unwrap();
        let b = registry.create(config()).await.unwrap();
        assert_ne!(a.sandbox_id, b.sandbox_id);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn reused_provider_id_is_rejected_and_killed() {
        let provider = MockProvider::new().with_ids(["sb_x", "sb_x"]);
        let registry = registry(&provider);
        registry.create(config()).await.unwrap();
        registry.terminate("sb_x").await.unwrap();

        let err = registry.create(config()).await.unwrap_err();
        assert!(matches!(err, SessionError::Provider(_)));
        assert!(registry.is_empty().await);
        assert_eq!(provider.kill_count("sb_x"), 2);
    }

    #[tokio::test]
    async fn failed_create_registers_nothing() {
        let provider = MockProvider::new();
        provider.fail_create(true);
        let registry = registry(&provider);

        let err = registry.create(config()).await.unwrap_err();
        assert_eq!(err.status_code(), 500);
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn get_does_not_touch() {
        let provider = MockProvider::new();
        let registry = registry(&provider);
        let created = registry.create(config()).await.unwrap();
        let fetched = registry.get(&created.sandbox_id).await.unwrap();
        assert_eq!(fetched.last_activity, created.last_activity);

        let touched = registry.touch(&created.sandbox_id).await.unwrap();
        assert!(touched.last_activity > created.last_activity);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let provider = MockProvider::new();
        let registry = registry(&provider);
        assert!(matches!(registry.get("nope").await, Err(SessionError::NotFound(_))));
        assert!(matches!(registry.touch("nope").await, Err(SessionError::NotFound(_))));
        assert!(matches!(registry.acquire("nope").await, Err(SessionError::NotFound(_))));
        assert!(matches!(
            registry.terminate("nope").await,
            Err(SessionError::NotFound(_))
        ));
        assert!(!registry.remove("nope").await);
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn remove_does_not_kill() {
        let provider = MockProvider::new();
        let registry = registry(&provider);
        registry.create(config()).await.unwrap();
        assert!(registry.remove("sb_1").await);
        assert!(!registry.remove("sb_1").await);
        assert_eq!(provider.kill_count("sb_1"), 0);
    }

    #[tokio::test]
    async fn terminate_kills_then_removes() {
        let provider = MockProvider::new();
        let registry = registry(&provider);
        registry.create(config()).await.unwrap();

        let info = registry.terminate("sb_1").await.unwrap();
        assert_eq!(info.status, SessionStatus::Terminated);
        assert!(provider.is_killed("sb_1"));
        assert!(matches!(registry.get("sb_1").await, Err(SessionError::NotFound(_))));
        assert!(matches!(
            registry.terminate("sb_1").await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn terminate_removes_even_when_kill_fails() {
        let provider = MockProvider::new();
        let registry = registry(&provider);
        registry.create(config()).await.unwrap();
        provider.fail_kill(true);

        registry.terminate("sb_1").await.unwrap();
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn list_is_ordered_by_creation() {
        let provider = MockProvider::new();
        let registry = registry(&provider);
        for _ in 0..3 {
            registry.create(config()).await.unwrap();
        }
        let ids: Vec<String> = registry
            .list()
            .await
            .into_iter()
            .map(|s| s.sandbox_id)
            .collect();
        assert_eq!(ids, vec!["sb_1", "sb_2", "sb_3"]);
    }
}
