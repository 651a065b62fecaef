//! Alert escalation monitoring: a bounded race between "staff responded"
//! and "timeout elapsed", standalone from the flow executor.
//!
//! On first positive detection the alert is closed through the alert store,
//! attributed to the responding staff member. A timeout leaves the alert
//! open for a separate escalation policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{info, warn};

use crate::collab::detect::{AlertStore, StaffPresenceDetector};

fn default_poll_interval() -> u64 {
    2
}

/// Transient configuration for one monitor run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertMonitorConfig {
    pub alert_id: String,
    pub session_id: String,
    pub monitoring_duration_secs: u64,
    pub enabled: bool,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Resolved,
    /// Reserved for the downstream escalation policy; never produced by
    /// this monitor
    Escalated,
    Timeout,
}

/// Terminal event of one monitor run, persisted to the alert store by the
/// caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertOutcome {
    pub alert_id: String,
    pub status: AlertStatus,
    #[serde(default)]
    pub handled_by: Option<String>,
    #[serde(default)]
    pub handled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub response_time_secs: Option<u64>,
    pub reason: String,
}

impl AlertOutcome {
    fn timeout(alert_id: &str, reason: impl Into<String>) -> Self {
        Self {
            alert_id: alert_id.to_string(),
            status: AlertStatus::Timeout,
            handled_by: None,
            handled_at: None,
            response_time_secs: None,
            reason: reason.into(),
        }
    }
}

/// Handle to a spawned monitor run.
pub struct AlertMonitorHandle {
    pub task: JoinHandle<AlertOutcome>,
    cancel: watch::Sender<bool>,
}

impl AlertMonitorHandle {
    /// Unblocks the next poll iteration immediately; the run terminates with
    /// a `timeout` outcome attributed to cancellation.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }
}

#[derive(Clone)]
pub struct AlertEscalationMonitor {
    staff: Arc<dyn StaffPresenceDetector>,
    alerts: Arc<dyn AlertStore>,
}

impl AlertEscalationMonitor {
    pub fn new(staff: Arc<dyn StaffPresenceDetector>, alerts: Arc<dyn AlertStore>) -> Self {
        Self { staff, alerts }
    }

    /// Spawns one monitor run as its own task.
    pub fn spawn(&self, config: AlertMonitorConfig) -> AlertMonitorHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let monitor = self.clone();
        let task =
            tokio::spawn(async move { monitor.monitor_alert_handling(config, cancel_rx).await });
        AlertMonitorHandle {
            task,
            cancel: cancel_tx,
        }
    }

    /// Polls the staff presence detector every `poll_interval_secs` until a
    /// staff response is seen or `monitoring_duration_secs` elapses. Always
    /// reaches a terminal outcome within one poll interval of the deadline
    /// or a cancellation request.
    pub async fn monitor_alert_handling(
        &self,
        config: AlertMonitorConfig,
        mut cancel: watch::Receiver<bool>,
    ) -> AlertOutcome {
        if !config.enabled {
            info!(alert = %config.alert_id, "alert monitoring disabled");
            return AlertOutcome::timeout(&config.alert_id, "monitoring disabled");
        }
        match self.alerts.get_alert(&config.alert_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(alert = %config.alert_id, "alert not found, nothing to monitor");
                return AlertOutcome::timeout(&config.alert_id, "alert not found");
            }
            // the row may be reachable again by close time; keep monitoring
            Err(e) => {
                warn!(alert = %config.alert_id, error = %e, "alert lookup failed");
            }
        }
        let poll = Duration::from_secs(config.poll_interval_secs.max(1));
        let started = Instant::now();
        let deadline = started + Duration::from_secs(config.monitoring_duration_secs);
        info!(
            alert = %config.alert_id,
            session = %config.session_id,
            duration_secs = config.monitoring_duration_secs,
            "alert monitor started"
        );

        let mut any_poll_succeeded = false;
        let mut last_error: Option<String> = None;
        loop {
            let elapsed_secs = started.elapsed().as_secs();
            let window_secs = elapsed_secs.max(config.poll_interval_secs.max(1));
            match self
                .staff
                .has_staff_activity(&config.session_id, window_secs)
                .await
            {
                Ok(activity) if activity.has_staff => {
                    let response_time_secs = started.elapsed().as_secs();
                    let handled_by = activity
                        .staff_user_id
                        .unwrap_or_else(|| "unknown".to_string());
                    let mut reason =
                        format!("staff {handled_by} responded after {response_time_secs}s");
                    if let Err(e) = self
                        .alerts
                        .close_alert(&config.alert_id, &handled_by, response_time_secs, &reason)
                        .await
                    {
                        warn!(alert = %config.alert_id, error = %e, "alert close failed");
                        reason.push_str(&format!(" (alert close failed: {e})"));
                    }
                    info!(
                        alert = %config.alert_id,
                        handled_by = %handled_by,
                        response_time_secs,
                        "alert resolved by staff"
                    );
                    return AlertOutcome {
                        alert_id: config.alert_id,
                        status: AlertStatus::Resolved,
                        handled_by: Some(handled_by),
                        handled_at: Some(Utc::now()),
                        response_time_secs: Some(response_time_secs),
                        reason,
                    };
                }
                Ok(_) => {
                    any_poll_succeeded = true;
                }
                Err(e) => {
                    warn!(
                        alert = %config.alert_id,
                        error = %e,
                        "alert poll failed, retrying at next tick"
                    );
                    last_error = Some(e.to_string());
                }
            }

            let now = Instant::now();
            if now >= deadline {
                info!(alert = %config.alert_id, "alert monitor timed out");
                let reason = match (any_poll_succeeded, last_error) {
                    (false, Some(err)) => format!("no staff response; staff lookups failed: {err}"),
                    _ => "no staff response within monitoring window".to_string(),
                };
                return AlertOutcome::timeout(&config.alert_id, reason);
            }
            let tick = poll.min(deadline - now);
            tokio::select! {
                _ = sleep(tick) => {}
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        info!(alert = %config.alert_id, "alert monitor cancelled");
                        return AlertOutcome::timeout(&config.alert_id, "cancelled");
                    }
                }
            }
        }
    }
}
