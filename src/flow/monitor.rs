//! Monitor node: bounded asynchronous polling for an external signal.
//!
//! The only node type that holds a live resource (a polling loop) for the
//! duration of its execution. Termination is guaranteed within
//! `duration + one poll interval` of start or cancellation request.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, warn};

use crate::collab::detect::{SessionSignalDetector, StaffPresenceDetector};
use crate::flow::executor::{NodeContext, NodeRunner};
use crate::flow::model::{MonitorSignal, NodeOutcome};

pub const MIN_DURATION_SECS: u64 = 60;
pub const MAX_DURATION_SECS: u64 = 1800;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;

fn default_duration() -> u64 {
    300
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

/// Configuration carried in a monitor node's `config` value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Wall-clock bound in seconds, clamped to [60, 1800]
    #[serde(default = "default_duration")]
    pub duration_secs: u64,
    #[serde(default)]
    pub detect_staff: bool,
    #[serde(default)]
    pub detect_user_satisfaction: bool,
    #[serde(default)]
    pub detect_escalation: bool,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            duration_secs: default_duration(),
            detect_staff: true,
            detect_user_satisfaction: false,
            detect_escalation: false,
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl MonitorConfig {
    pub fn clamped_duration_secs(&self) -> u64 {
        self.duration_secs.clamp(MIN_DURATION_SECS, MAX_DURATION_SECS)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

/// Node runner performing the bounded poll against the session detectors.
pub struct MonitorNodeRunner {
    staff: Arc<dyn StaffPresenceDetector>,
    signals: Arc<dyn SessionSignalDetector>,
}

impl MonitorNodeRunner {
    pub fn new(
        staff: Arc<dyn StaffPresenceDetector>,
        signals: Arc<dyn SessionSignalDetector>,
    ) -> Self {
        Self { staff, signals }
    }

    /// One detector pass, in fixed precedence: staff, user satisfaction,
    /// escalation. `window_secs` is the elapsed time since the monitor
    /// started, so pre-existing activity does not trip the detector.
    async fn probe(
        &self,
        config: &MonitorConfig,
        session_id: &str,
        window_secs: u64,
    ) -> anyhow::Result<Option<MonitorSignal>> {
        if config.detect_staff {
            let activity = self.staff.has_staff_activity(session_id, window_secs).await?;
            if activity.has_staff {
                return Ok(Some(MonitorSignal::Staff {
                    staff_user_id: activity.staff_user_id,
                }));
            }
        }
        if config.detect_user_satisfaction && self.signals.user_satisfied(session_id).await? {
            return Ok(Some(MonitorSignal::UserSatisfaction));
        }
        if config.detect_escalation && self.signals.escalation_requested(session_id).await? {
            return Ok(Some(MonitorSignal::Escalation));
        }
        Ok(None)
    }
}

#[async_trait]
impl NodeRunner for MonitorNodeRunner {
    fn kind(&self) -> &'static str {
        "monitor"
    }

    async fn run(&self, ctx: &NodeContext) -> anyhow::Result<NodeOutcome> {
        let config: MonitorConfig = if ctx.node.config.is_null() {
            MonitorConfig::default()
        } else {
            serde_json::from_value(ctx.node.config.clone())?
        };
        let session_id = ctx.session_id()?;
        let duration_secs = config.clamped_duration_secs();
        let poll = config.poll_interval();
        let started = Instant::now();
        let deadline = started + Duration::from_secs(duration_secs);
        let mut cancel = ctx.cancel.clone();

        if *cancel.borrow() {
            return Ok(NodeOutcome::Cancelled);
        }
        info!(
            instance = %ctx.instance_id,
            session = %session_id,
            duration_secs,
            "monitor started"
        );

        let mut any_poll_succeeded = false;
        let mut last_error: Option<String> = None;
        loop {
            let elapsed_secs = started.elapsed().as_secs();
            let window_secs = elapsed_secs.max(config.poll_interval_secs.max(1));
            match self.probe(&config, session_id, window_secs).await {
                Ok(Some(signal)) => {
                    let elapsed_secs = started.elapsed().as_secs();
                    info!(
                        instance = %ctx.instance_id,
                        session = %session_id,
                        signal = signal.describe(),
                        elapsed_secs,
                        "monitor detected signal"
                    );
                    return Ok(NodeOutcome::Detected {
                        signal,
                        elapsed_secs,
                    });
                }
                Ok(None) => {
                    any_poll_succeeded = true;
                }
                // lookup failures are retried at the next tick, up to the
                // deadline
                Err(e) => {
                    warn!(
                        instance = %ctx.instance_id,
                        session = %session_id,
                        error = %e,
                        "monitor poll failed, retrying at next tick"
                    );
                    last_error = Some(e.to_string());
                }
            }

            let now = Instant::now();
            if now >= deadline {
                let reason = if any_poll_succeeded { None } else { last_error };
                info!(
                    instance = %ctx.instance_id,
                    session = %session_id,
                    "monitor timed out"
                );
                return Ok(NodeOutcome::Timeout {
                    elapsed_secs: started.elapsed().as_secs(),
                    reason,
                });
            }
            let tick = poll.min(deadline - now);
            tokio::select! {
                _ = sleep(tick) => {}
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        debug!(instance = %ctx.instance_id, "monitor cancelled");
                        return Ok(NodeOutcome::Cancelled);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::detect::StaffActivity;
    use crate::flow::model::{NodeKind, NodeSpec};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::watch;

    struct ScriptedStaff {
        reply_after_polls: Option<u32>,
        polls: std::sync::atomic::AtomicU32,
        fail: AtomicBool,
    }

    impl ScriptedStaff {
        fn never() -> Self {
            Self {
                reply_after_polls: None,
                polls: 0.into(),
                fail: AtomicBool::new(false),
            }
        }

        fn after(polls: u32) -> Self {
            Self {
                reply_after_polls: Some(polls),
                polls: 0.into(),
                fail: AtomicBool::new(false),
            }
        }

        fn always_failing() -> Self {
            Self {
                reply_after_polls: None,
                polls: 0.into(),
                fail: AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl StaffPresenceDetector for ScriptedStaff {
        async fn has_staff_activity(
            &self,
            _session_id: &str,
            _window_secs: u64,
        ) -> anyhow::Result<StaffActivity> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("message store unreachable");
            }
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            match self.reply_after_polls {
                Some(limit) if n >= limit => Ok(StaffActivity::by("staff_1")),
                _ => Ok(StaffActivity::none()),
            }
        }
    }

    struct QuietSignals;

    #[async_trait]
    impl SessionSignalDetector for QuietSignals {
        async fn user_satisfied(&self, _session_id: &str) -> anyhow::Result<bool> {
            Ok(false)
        }

        async fn escalation_requested(&self, _session_id: &str) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    fn ctx(config: serde_json::Value, cancel: watch::Receiver<bool>) -> NodeContext {
        NodeContext {
            instance_id: "inst_1".into(),
            flow_name: "welcome".into(),
            session_id: Some("s1".into()),
            node: NodeSpec {
                id: "mon".into(),
                kind: NodeKind::Monitor,
                name: "watch room".into(),
                config,
            },
            input: json!({}),
            variables: HashMap::new(),
            cancel,
        }
    }

    fn runner(staff: ScriptedStaff) -> MonitorNodeRunner {
        MonitorNodeRunner::new(Arc::new(staff), Arc::new(QuietSignals))
    }

    #[test]
    fn test_duration_clamped_to_bounds() {
        let low = MonitorConfig {
            duration_secs: 5,
            ..Default::default()
        };
        let high = MonitorConfig {
            duration_secs: 7200,
            ..Default::default()
        };
        assert_eq!(low.clamped_duration_secs(), MIN_DURATION_SECS);
        assert_eq!(high.clamped_duration_secs(), MAX_DURATION_SECS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_bounded() {
        let (_tx, rx) = watch::channel(false);
        let ctx = ctx(json!({ "duration_secs": 60, "detect_staff": true }), rx);
        let outcome = runner(ScriptedStaff::never()).run(&ctx).await.unwrap();

        match outcome {
            NodeOutcome::Timeout {
                elapsed_secs,
                reason,
            } => {
                assert!(
                    (60..=62).contains(&elapsed_secs),
                    "elapsed {elapsed_secs} outside [duration, duration + poll]"
                );
                assert!(reason.is_none());
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_detection_stops_polling() {
        let (_tx, rx) = watch::channel(false);
        let ctx = ctx(json!({ "duration_secs": 120, "detect_staff": true }), rx);
        let outcome = runner(ScriptedStaff::after(3)).run(&ctx).await.unwrap();

        match outcome {
            NodeOutcome::Detected {
                signal: MonitorSignal::Staff { staff_user_id },
                elapsed_secs,
            } => {
                assert_eq!(staff_user_id.as_deref(), Some("staff_1"));
                // third poll happens at t = 3 * poll_interval
                assert!(elapsed_secs <= 8, "elapsed {elapsed_secs}");
            }
            other => panic!("expected staff detection, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_unblocks_immediately() {
        let (tx, rx) = watch::channel(false);
        let ctx = ctx(json!({ "duration_secs": 600, "detect_staff": true }), rx);
        let run = tokio::spawn(async move { runner(ScriptedStaff::never()).run(&ctx).await });

        tokio::time::sleep(Duration::from_secs(5)).await;
        tx.send(true).unwrap();
        let outcome = run.await.unwrap().unwrap();
        assert_eq!(outcome, NodeOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_polls_failing_reports_reason_on_timeout() {
        let (_tx, rx) = watch::channel(false);
        let ctx = ctx(json!({ "duration_secs": 60, "detect_staff": true }), rx);
        let outcome = runner(ScriptedStaff::always_failing()).run(&ctx).await.unwrap();

        match outcome {
            NodeOutcome::Timeout { reason, .. } => {
                assert!(reason.unwrap().contains("unreachable"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
