//! Idle reaper.
//!
//! Kills and forgets sessions that have been idle past the registry's
//! threshold. Kill failures are logged and never reach the caller that
//! triggered the sweep.

use crate::provider::SandboxHandle;
use crate::registry::SessionRegistry;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Reap sessions idle at the current time. Returns the reaped ids.
pub async fn sweep(registry: &SessionRegistry) -> Vec<String> {
    sweep_at(registry, Utc::now()).await
}

/// Reap sessions idle at `now`.
pub async fn sweep_at(registry: &SessionRegistry, now: DateTime<Utc>) -> Vec<String> {
    let expired = registry.expired(now).await;
    if expired.is_empty() {
        return Vec::new();
    }

    join_all(expired.iter().map(|(id, handle)| kill_logged(id, handle, "idle"))).await;

    let mut reaped = Vec::with_capacity(expired.len());
    for (id, _) in expired {
        if registry.remove(&id).await {
            info!(sandbox_id = %id, "Reaped idle session");
            reaped.push(id);
        }
    }
    reaped
}

/// Run [`sweep`] on a fixed interval until the task is aborted.
pub fn spawn_sweeper(registry: Arc<SessionRegistry>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        // The first tick fires immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let reaped = sweep(&registry).await;
            debug!(reaped = reaped.len(), "Periodic sweep finished");
        }
    })
}

/// Kill every registered session, waiting at most `deadline` for the
/// provider. All records are removed regardless. Returns how many sessions
/// were drained.
pub async fn drain(registry: &SessionRegistry, deadline: Duration) -> usize {
    let sessions = registry.all_handles().await;
    if sessions.is_empty() {
        return 0;
    }
    info!(count = sessions.len(), "Draining sessions");

    let kills = join_all(
        sessions
            .iter()
            .map(|(id, handle)| kill_logged(id, handle, "shutdown")),
    );
    if tokio::time::timeout(deadline, kills).await.is_err() {
        warn!(?deadline, "Shutdown kills did not finish before the deadline");
    }

    for (id, _) in &sessions {
        registry.remove(id).await;
    }
    sessions.len()
}

async fn kill_logged(id: &str, handle: &Arc<dyn SandboxHandle>, reason: &str) {
    if let Err(e) = handle.kill().await {
        warn!(sandbox_id = %id, reason, error = %e, "Failed to kill sandbox");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{ExecutionRequest, Pipeline};
    use crate::registry::{RegistryOptions, SessionConfig};
    use crate::testing::{MockProvider, MockResponse};
    use chrono::Duration as ChronoDuration;

    fn registry(provider: &MockProvider) -> SessionRegistry {
        SessionRegistry::new(Arc::new(provider.clone()), RegistryOptions::default())
    }

    fn config() -> SessionConfig {
        SessionConfig {
            template: "default".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn keeps_sessions_within_threshold() {
        let provider = MockProvider::new();
        let registry = registry(&provider);
        let info = registry.create(config()).await.unwrap();

        let at_threshold = info.last_activity + ChronoDuration::minutes(10);
        assert!(sweep_at(&registry, at_threshold).await.is_empty());
        assert_eq!(registry.len().await, 1);
        assert_eq!(provider.kill_count("sb_1"), 0);
    }

    #[tokio::test]
    async fn reaps_only_sessions_past_threshold() {
        let provider = MockProvider::new();
        let registry = registry(&provider);
        let stale = registry.create(config()).await.unwrap();
        let fresh = registry.create(config()).await.unwrap();
        let fresh = registry.touch(&fresh.sandbox_id).await.unwrap();

        let now = fresh.last_activity + ChronoDuration::minutes(10);
        let reaped = sweep_at(&registry, now).await;

        assert_eq!(reaped, vec![stale.sandbox_id.clone()]);
        assert!(provider.is_killed(&stale.sandbox_id));
        assert_eq!(provider.kill_count(&fresh.sandbox_id), 0);
        let remaining: Vec<String> = registry.list().await.into_iter().map(|s| s.sandbox_id).collect();
        assert_eq!(remaining, vec![fresh.sandbox_id]);
    }

    #[tokio::test(start_paused = true)]
    async fn skips_sessions_with_command_in_flight() {
        let provider = MockProvider::new();
        provider.respond(
            "claude",
            MockResponse::stdout("done").with_delay(Duration::from_secs(15 * 60)),
        );
        let registry = Arc::new(registry(&provider));
        let info = registry.create(config()).await.unwrap();
        let pipeline = Pipeline::new(registry.clone());

        let run = tokio::spawn(async move {
            pipeline
                .run_agent(ExecutionRequest::new("sb_1", "long task"), None)
                .await
        });
        while provider.commands().is_empty() {
            tokio::task::yield_now().await;
        }

        let later = info.last_activity + ChronoDuration::minutes(11);
        assert!(sweep_at(&registry, later).await.is_empty());
        assert!(!provider.is_killed("sb_1"));

        let result = run.await.unwrap().unwrap();
        assert_eq!(result.stdout, "done");
        let idle_again = Utc::now() + ChronoDuration::minutes(11);
        assert_eq!(sweep_at(&registry, idle_again).await, vec!["sb_1".to_string()]);
    }

    #[tokio::test]
    async fn removes_even_when_kill_fails() {
        let provider = MockProvider::new();
        let registry = registry(&provider);
        let info = registry.create(config()).await.unwrap();
        provider.fail_kill(true);

        let reaped = sweep_at(&registry, info.last_activity + ChronoDuration::hours(1)).await;
        assert_eq!(reaped, vec!["sb_1".to_string()]);
        assert!(registry.is_empty().await);
        assert_eq!(provider.kill_count("sb_1"), 1);
    }

    #[tokio::test]
    async fn create_sweeps_first() {
        let provider = MockProvider::new();
        let registry = SessionRegistry::new(
            Arc::new(provider.clone()),
            RegistryOptions {
                idle_timeout: Duration::ZERO,
                ..Default::default()
            },
        );
        registry.create(config()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        registry.create(config()).await.unwrap();

        let ids: Vec<String> = registry.list().await.into_iter().map(|s| s.sandbox_id).collect();
        assert_eq!(ids, vec!["sb_2"]);
        assert!(provider.is_killed("sb_1"));
    }

    #[tokio::test]
    async fn drain_kills_everything() {
        let provider = MockProvider::new();
        let registry = registry(&provider);
        registry.create(config()).await.unwrap();
        registry.create(config()).await.unwrap();

        assert_eq!(drain(&registry, Duration::from_secs(1)).await, 2);
        assert!(registry.is_empty().await);
        assert!(provider.is_killed("sb_1"));
        assert!(provider.is_killed("sb_2"));
        assert_eq!(drain(&registry, Duration::from_secs(1)).await, 0);
    }

    #[tokio::test]
    async fn drain_swallows_kill_failures() {
        let provider = MockProvider::new();
        let registry = registry(&provider);
        registry.create(config()).await.unwrap();
        provider.fail_kill(true);

        assert_eq!(drain(&registry, Duration::from_secs(1)).await, 1);
        assert!(registry.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_reaps_on_its_interval() {
        let provider = MockProvider::new();
        let registry = Arc::new(SessionRegistry::new(
            Arc::new(provider.clone()),
            RegistryOptions {
                idle_timeout: Duration::ZERO,
                ..Default::default()
            },
        ));
        registry.create(config()).await.unwrap();

        let task = spawn_sweeper(registry.clone(), Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(registry.len().await, 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(registry.is_empty().await);
        assert!(provider.is_killed("sb_1"));
        task.abort();
    }
}
