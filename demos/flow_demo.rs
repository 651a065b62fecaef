//! Runs a small welcome flow end to end: a monitor node watches a session
//! until a (scripted) staff member shows up, then an AI reply is queued.
//!
//! cargo run --example flow_demo

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

use collabflow::collab::{SessionSignalDetector, StaffActivity, StaffPresenceDetector};
use collabflow::flow::{
    EdgeSpec, FlowExecutor, FlowStore, FlowVersionManager, MonitorNodeRunner, NewFlowDefinition,
    NodeKind, NodeSpec, RetryConfig, TriggerType,
};

/// Pretends a staff member replies five seconds into the run.
struct ScriptedStaff {
    started: Instant,
}

#[async_trait]
impl StaffPresenceDetector for ScriptedStaff {
    async fn has_staff_activity(
        &self,
        _session_id: &str,
        _window_secs: u64,
    ) -> Result<StaffActivity> {
        if self.started.elapsed() >= Duration::from_secs(5) {
            Ok(StaffActivity::by("staff_demo"))
        } else {
            Ok(StaffActivity::none())
        }
    }
}

struct QuietSignals;

#[async_trait]
impl SessionSignalDetector for QuietSignals {
    async fn user_satisfied(&self, _session_id: &str) -> Result<bool> {
        Ok(false)
    }

    async fn escalation_requested(&self, _session_id: &str) -> Result<bool> {
        Ok(false)
    }
}

fn node(id: &str, kind: NodeKind, config: Value) -> NodeSpec {
    NodeSpec {
        id: id.into(),
        kind,
        name: id.into(),
        config,
    }
}

fn edge(source: &str, target: &str, condition: Option<&str>) -> EdgeSpec {
    EdgeSpec {
        source: source.into(),
        target: target.into(),
        condition: condition.map(str::to_string),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Set up logging
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set default tracing subscriber");

    let store = Arc::new(FlowStore::new());
    let manager = FlowVersionManager::new(store.clone());
    let executor = FlowExecutor::new(store);
    executor.register_runner(Arc::new(MonitorNodeRunner::new(
        Arc::new(ScriptedStaff {
            started: Instant::now(),
        }),
        Arc::new(QuietSignals),
    )));

    let def = manager
        .create(NewFlowDefinition {
            name: "welcome".into(),
            trigger_type: TriggerType::Message,
            trigger_config: Value::Null,
            nodes: vec![
                node("entry", NodeKind::Start, Value::Null),
                node(
                    "watch",
                    NodeKind::Monitor,
                    json!({ "duration_secs": 60, "detect_staff": true }),
                ),
                node("reply", NodeKind::AiReply, json!({ "prompt": "greet" })),
                node("done", NodeKind::End, Value::Null),
            ],
            edges: vec![
                edge("entry", "watch", None),
                edge("watch", "reply", Some("timeout")),
                edge("watch", "done", Some("detected")),
                edge("reply", "done", None),
            ],
            variables: HashMap::new(),
            priority: 0,
            timeout_seconds: None,
            retry: RetryConfig::default(),
            created_by: Some("demo".into()),
        })
        .await?;
    println!("Created flow '{}' version {}", def.name, def.version);

    let instance = executor
        .start(&def.id, json!({ "session_id": "demo_session" }))
        .await?;
    println!("Started instance {}", instance.id);

    let finished = executor.join(&instance.id).await?;
    println!(
        "\nInstance finished with status: {}",
        finished.status.as_str()
    );

    for log in executor.logs(&instance.id) {
        println!(
            "  node {:<6} -> {:?} ({}ms)",
            log.node_id,
            log.status,
            log.processing_time_ms.unwrap_or(0)
        );
    }
    Ok(())
}
