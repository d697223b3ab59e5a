//! Session records and the store that holds them.

use crate::provider::SandboxHandle;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// One registered sandbox.
pub struct SandboxSession {
    pub id: String,
    pub template: String,
    /// Exclusively owned by this record; handed out by reference only.
    pub handle: Arc<dyn SandboxHandle>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Serializes commands against this sandbox.
    pub exec_lock: Arc<Mutex<()>>,
}

impl SandboxSession {
    pub fn new(template: impl Into<String>, handle: Arc<dyn SandboxHandle>) -> Self {
        let now = Utc::now();
        Self {
            id: handle.id().to_string(),
            template: template.into(),
            handle,
            created_at: now,
            last_activity: now,
            exec_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Bump `last_activity`, never letting it stand still or go backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        let floor = self.last_activity + ChronoDuration::nanoseconds(1);
        self.last_activity = now.max(floor);
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_activity).to_std().unwrap_or_default()
    }

    pub fn is_expired(&self, now: DateTime<Utc>, idle_timeout: Duration) -> bool {
        self.idle_for(now) > idle_timeout
    }

    pub fn status(&self, now: DateTime<Utc>, idle_timeout: Duration) -> SessionStatus {
        if self.is_expired(now, idle_timeout) {
            SessionStatus::Idle
        } else {
            SessionStatus::Active
        }
    }

    pub fn info(&self, now: DateTime<Utc>, idle_timeout: Duration) -> SessionInfo {
        SessionInfo {
            sandbox_id: self.id.clone(),
            template: self.template.clone(),
            created_at: self.created_at,
            last_activity: self.last_activity,
            age_seconds: (now - self.created_at).num_seconds().max(0),
            idle_seconds: (now - self.last_activity).num_seconds().max(0),
            status: self.status(now, idle_timeout),
        }
    }
}

impl std::fmt::Debug for SandboxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxSession")
            .field("id", &self.id)
            .field("template", &self.template)
            .field("created_at", &self.created_at)
            .field("last_activity", &self.last_activity)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Idle,
    Terminated,
}

/// Point-in-time copy of a session's metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub sandbox_id: String,
    pub template: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub age_seconds: i64,
    pub idle_seconds: i64,
    pub status: SessionStatus,
}

/// What a live command needs from a session, without holding the registry lock.
#[derive(Clone)]
pub struct SessionRef {
    pub id: String,
    pub handle: Arc<dyn SandboxHandle>,
    pub exec_lock: Arc<Mutex<()>>,
}

impl From<&SandboxSession> for SessionRef {
    fn from(session: &SandboxSession) -> Self {
        Self {
            id: session.id.clone(),
            handle: session.handle.clone(),
            exec_lock: session.exec_lock.clone(),
        }
    }
}

/// Backing storage for the registry. Every call happens under the registry's
/// lock, so implementations need no synchronization of their own.
pub trait SessionStore: Send {
    fn insert(&mut self, session: SandboxSession);
    fn get(&self, id: &str) -> Option<&SandboxSession>;
    fn get_mut(&mut self, id: &str) -> Option<&mut SandboxSession>;
    fn remove(&mut self, id: &str) -> Option<SandboxSession>;
    fn list(&self) -> Vec<&SandboxSession>;

    fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    fn len(&self) -> usize {
        self.list().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-local store.
#[derive(Default)]
pub struct MemoryStore {
    sessions: HashMap<String, SandboxSession>,
}

impl SessionStore for MemoryStore {
    fn insert(&mut self, session: SandboxSession) {
        self.sessions.insert(session.id.clone(), session);
    }

    fn get(&self, id: &str) -> Option<&SandboxSession> {
        self.sessions.get(id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut SandboxSession> {
        self.sessions.get_mut(id)
    }

    fn remove(&mut self, id: &str) -> Option<SandboxSession> {
        self.sessions.remove(id)
    }

    fn list(&self) -> Vec<&SandboxSession> {
        self.sessions.values().collect()
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockProvider;
    use crate::provider::{CreateOptions, SandboxProvider};

    async fn session() -> SandboxSession {
        let handle = MockProvider::new()
            .create("default", CreateOptions::default())
            .await
            .unwrap();
        SandboxSession::new("default", handle)
    }

    #[tokio::test]
    async fn touch_is_strictly_monotonic() {
        let mut s = session().await;
        let before = s.last_activity;
        s.touch(before);
        assert!(s.last_activity > before);
        let earlier = before - ChronoDuration::seconds(5);
        let prev = s.last_activity;
        s.touch(earlier);
        assert!(s.last_activity > prev);
    }

    #[tokio::test]
    async fn status_follows_idle_threshold() {
        let s = session().await;
        let threshold = Duration::from_secs(600);
        let now = s.last_activity + ChronoDuration::seconds(600);
        assert_eq!(s.status(now, threshold), SessionStatus::Active);
        let later = now + ChronoDuration::milliseconds(1);
        assert_eq!(s.status(later, threshold), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn info_reports_ages() {
        let s = session().await;
        let now = s.created_at + ChronoDuration::seconds(42);
        let info = s.info(now, Duration::from_secs(600));
        assert_eq!(info.sandbox_id, "sb_1");
        assert_eq!(info.age_seconds, 42);
        assert_eq!(info.idle_seconds, 42);
        assert_eq!(info.status, SessionStatus::Active);

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["sandboxId"], "sb_1");
        assert_eq!(json["status"], "active");
        assert!(json["lastActivity"].is_string());
    }

    #[tokio::test]
    async fn memory_store_basics() {
        let mut store = MemoryStore::default();
        assert!(store.is_empty());
        store.insert(session().await);
        assert!(store.contains("sb_1"));
        assert_eq!(store.len(), 1);
        assert!(store.remove("sb_1").is_some());
        assert!(store.remove("sb_1").is_none());
    }
}
