//! Boundary contracts for the external collaborators this engine consumes.
//!
//! Implementations live outside the engine (message store, alert store, task
//! store); tests provide in-memory fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Instant;

use crate::collab::role::Priority;

/// Result of a staff-presence lookup over a trailing window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaffActivity {
    pub has_staff: bool,
    #[serde(default)]
    pub staff_user_id: Option<String>,
    #[serde(default)]
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl StaffActivity {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn by(staff_user_id: impl Into<String>) -> Self {
        Self {
            has_staff: true,
            staff_user_id: Some(staff_user_id.into()),
            last_activity_at: Some(Utc::now()),
        }
    }
}

/// Answers whether a staff member has acted in a session recently.
#[async_trait]
pub trait StaffPresenceDetector: Send + Sync {
    async fn has_staff_activity(
        &self,
        session_id: &str,
        window_secs: u64,
    ) -> anyhow::Result<StaffActivity>;
}

/// Detectors for the non-staff monitor signals.
#[async_trait]
pub trait SessionSignalDetector: Send + Sync {
    async fn user_satisfied(&self, session_id: &str) -> anyhow::Result<bool>;

    async fn escalation_requested(&self, session_id: &str) -> anyhow::Result<bool>;
}

/// An alert row as seen through the alert store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: String,
    pub session_id: String,
    pub status: String,
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn get_alert(&self, alert_id: &str) -> anyhow::Result<Option<AlertRecord>>;

    async fn close_alert(
        &self,
        alert_id: &str,
        handled_by: &str,
        response_time_secs: u64,
        reason: &str,
    ) -> anyhow::Result<()>;
}

/// Work-item creation request emitted for roles with task creation enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub session_id: String,
    pub priority: Priority,
    pub reason: String,
}

#[async_trait]
pub trait TaskSink: Send + Sync {
    async fn create_task(&self, request: TaskRequest) -> anyhow::Result<()>;
}

/// TTL-bounded cache in front of a [`StaffPresenceDetector`].
///
/// Keyed by session and window so a burst of decisions for the same session
/// hits the message store once per TTL.
pub struct CachedStaffDetector<D> {
    inner: Arc<D>,
    ttl: std::time::Duration,
    entries: DashMap<String, (StaffActivity, Instant)>,
}

impl<D: StaffPresenceDetector> CachedStaffDetector<D> {
    pub fn new(inner: Arc<D>, ttl: std::time::Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: DashMap::new(),
        }
    }
}

#[async_trait]
impl<D: StaffPresenceDetector> StaffPresenceDetector for CachedStaffDetector<D> {
    async fn has_staff_activity(
        &self,
        session_id: &str,
        window_secs: u64,
    ) -> anyhow::Result<StaffActivity> {
        let key = format!("{session_id}:{window_secs}");
        if let Some(entry) = self.entries.get(&key) {
            if entry.1.elapsed() < self.ttl {
                return Ok(entry.0.clone());
            }
        }
        let fresh = self.inner.has_staff_activity(session_id, window_secs).await?;
        self.entries.insert(key, (fresh.clone(), Instant::now()));
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingDetector {
        calls: AtomicU32,
    }

    #[async_trait]
    impl StaffPresenceDetector for CountingDetector {
        async fn has_staff_activity(
            &self,
            _session_id: &str,
            _window_secs: u64,
        ) -> anyhow::Result<StaffActivity> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(StaffActivity::by("staff_9"))
        }
    }

    #[tokio::test]
    async fn test_cached_detector_reuses_fresh_entries() {
        let inner = Arc::new(CountingDetector {
            calls: AtomicU32::new(0),
        });
        let cached = CachedStaffDetector::new(inner.clone(), std::time::Duration::from_secs(60));

        for _ in 0..5 {
            let activity = cached.has_staff_activity("s1", 300).await.unwrap();
            assert!(activity.has_staff);
        }
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        // different window is a different cache key
        cached.has_staff_activity("s1", 60).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }
}
