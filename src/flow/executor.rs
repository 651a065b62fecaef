//! Flow instance execution.
//!
//! One spawned task drives each instance node-by-node; execution is strictly
//! sequential per instance, concurrency exists only across instances. The
//! executor is the only writer of instance status and the current-node
//! pointer.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::collab::detect::{TaskRequest, TaskSink};
use crate::collab::role::Priority;
use crate::core::errors::{EngineError, Result};
use crate::flow::model::{
    FlowExecutionLog, FlowInstance, InstanceStatus, NodeOutcome, NodeRunStatus, NodeSpec,
};
use crate::flow::store::{FlowStore, InstanceFilter, InstanceStats};

/// Everything a node runner gets to see while executing one node.
pub struct NodeContext {
    pub instance_id: String,
    pub flow_name: String,
    /// Chat session this instance is watching, when the trigger carries one
    pub session_id: Option<String>,
    pub node: NodeSpec,
    pub input: Value,
    pub variables: HashMap<String, Value>,
    /// Flips to `true` when the owning instance is externally cancelled
    pub cancel: watch::Receiver<bool>,
}

impl NodeContext {
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    pub fn session_id(&self) -> anyhow::Result<&str> {
        self.session_id
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("node '{}' requires a session_id in trigger data", self.node.id))
    }
}

/// A node implementation. Errors are mapped to a `failed` outcome by the
/// executor; runners that manage their own terminal states (monitors) return
/// them as outcomes instead.
#[async_trait]
pub trait NodeRunner: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn run(&self, ctx: &NodeContext) -> anyhow::Result<NodeOutcome>;
}

/// Passes trigger data through unchanged.
struct StartRunner;

#[async_trait]
impl NodeRunner for StartRunner {
    fn kind(&self) -> &'static str {
        "start"
    }

    async fn run(&self, ctx: &NodeContext) -> anyhow::Result<NodeOutcome> {
        Ok(NodeOutcome::Success {
            output: ctx.input.clone(),
        })
    }
}

/// Terminal node; its output becomes the instance result.
struct EndRunner;

#[async_trait]
impl NodeRunner for EndRunner {
    fn kind(&self) -> &'static str {
        "end"
    }

    async fn run(&self, ctx: &NodeContext) -> anyhow::Result<NodeOutcome> {
        Ok(NodeOutcome::Success {
            output: ctx.input.clone(),
        })
    }
}

/// Emits an AI reply intent for the outbound gateway to pick up.
struct AiReplyRunner;

#[async_trait]
impl NodeRunner for AiReplyRunner {
    fn kind(&self) -> &'static str {
        "ai_reply"
    }

    async fn run(&self, ctx: &NodeContext) -> anyhow::Result<NodeOutcome> {
        let output = json!({
            "action": "ai_reply",
            "session_id": ctx.session_id,
            "prompt": ctx.node.config.get("prompt").cloned().unwrap_or(Value::Null),
            "input": ctx.input,
        });
        debug!(node = %ctx.node.id, instance = %ctx.instance_id, "queued ai reply intent");
        Ok(NodeOutcome::Success { output })
    }
}

/// Files a work item through the task sink.
pub struct CreateTaskRunner {
    sink: Arc<dyn TaskSink>,
}

impl CreateTaskRunner {
    pub fn new(sink: Arc<dyn TaskSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl NodeRunner for CreateTaskRunner {
    fn kind(&self) -> &'static str {
        "create_task"
    }

    async fn run(&self, ctx: &NodeContext) -> anyhow::Result<NodeOutcome> {
        let session_id = ctx.session_id()?.to_string();
        let priority: Priority = ctx
            .node
            .config
            .get("priority")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        let reason = ctx
            .node
            .config
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("flow task")
            .to_string();
        self.sink
            .create_task(TaskRequest {
                session_id: session_id.clone(),
                priority,
                reason: reason.clone(),
            })
            .await?;
        Ok(NodeOutcome::Success {
            output: json!({ "task_created": true, "session_id": session_id, "reason": reason }),
        })
    }
}

/// Cheap to clone; all state is shared. One handle is typically cloned into
/// each spawned driver task.
#[derive(Clone)]
pub struct FlowExecutor {
    store: Arc<FlowStore>,
    runners: Arc<DashMap<String, Arc<dyn NodeRunner>>>,
    cancels: Arc<DashMap<String, watch::Sender<bool>>>,
    drivers: Arc<DashMap<String, JoinHandle<()>>>,
}

impl FlowExecutor {
    /// Creates an executor with the synchronous built-in runners registered.
    /// Monitor and create-task runners carry collaborators and are
    /// registered by the caller via [`FlowExecutor::register_runner`].
    pub fn new(store: Arc<FlowStore>) -> Self {
        let executor = Self {
            store,
            runners: Arc::new(DashMap::new()),
            cancels: Arc::new(DashMap::new()),
            drivers: Arc::new(DashMap::new()),
        };
        executor.register_runner(Arc::new(StartRunner));
        executor.register_runner(Arc::new(EndRunner));
        executor.register_runner(Arc::new(AiReplyRunner));
        executor
    }

    pub fn register_runner(&self, runner: Arc<dyn NodeRunner>) {
        self.runners.insert(runner.kind().to_string(), runner);
    }

    /// Starts an instance of the definition. Fails with `NoActiveVersion`
    /// unless the referenced definition row is the active one for its name.
    pub async fn start(&self, flow_definition_id: &str, trigger_data: Value) -> Result<FlowInstance> {
        let def = self.store.get_definition(flow_definition_id)?;
        if !def.is_active {
            return Err(EngineError::no_active_version(def.name));
        }
        let entry = def
            .entry_node()
            .ok_or_else(|| EngineError::validation_field("flow has no nodes", "nodes"))?
            .clone();

        let now = Utc::now();
        let instance = FlowInstance {
            id: cuid2::create_id(),
            flow_definition_id: def.id.clone(),
            flow_name: def.name.clone(),
            status: InstanceStatus::Running,
            current_node_id: Some(entry.id.clone()),
            trigger_data: trigger_data.clone(),
            result: None,
            error_message: None,
            started_at: now,
            completed_at: None,
            processing_time_ms: None,
            retry_count: 0,
            metadata: HashMap::new(),
        };
        self.store.insert_instance(instance.clone());
        self.append_running_log(&instance.id, &entry, &trigger_data);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.cancels.insert(instance.id.clone(), cancel_tx);

        info!(flow = %def.name, instance = %instance.id, "started flow instance");
        let driver = self.clone();
        let instance_id = instance.id.clone();
        let handle = tokio::spawn(async move {
            driver.drive(def, instance_id, cancel_rx).await;
        });
        self.drivers.insert(instance.id.clone(), handle);
        // an all-synchronous flow may finish before the insert lands; the
        // driver clears its cancel entry before its driver entry, so a
        // missing cancel entry means the driver removal is done or imminent
        if !self.cancels.contains_key(&instance.id) {
            self.drivers.remove(&instance.id);
        }
        Ok(instance)
    }

    /// Runs nodes sequentially until the instance reaches a terminal status.
    async fn drive(
        self,
        def: crate::flow::model::FlowDefinition,
        instance_id: String,
        cancel: watch::Receiver<bool>,
    ) {
        let started = Instant::now();
        loop {
            let instance = match self.store.get_instance(&instance_id) {
                Ok(i) => i,
                Err(e) => {
                    error!(instance = %instance_id, error = %e, "instance vanished mid-drive");
                    return;
                }
            };
            if instance.status.is_terminal() {
                break;
            }
            let Some(node_id) = instance.current_node_id.clone() else {
                break;
            };
            let Some(node) = def.node(&node_id).cloned() else {
                let _ = self.finish_instance(
                    &instance_id,
                    InstanceStatus::Failed,
                    None,
                    Some(format!("node '{node_id}' missing from definition")),
                );
                break;
            };

            // definition-level timeout, checked between nodes
            if let Some(limit) = def.timeout_seconds {
                if started.elapsed().as_secs() >= limit {
                    let err = EngineError::timeout("flow instance", limit);
                    warn!(instance = %instance_id, limit, "instance exceeded its timeout");
                    let _ = self.store.finalize_log(&instance_id, &node_id, |log| {
                        log.status = NodeRunStatus::Failed;
                        log.error_message = Some(err.to_string());
                        log.completed_at = Some(Utc::now());
                    });
                    let _ = self.finish_instance(
                        &instance_id,
                        InstanceStatus::Failed,
                        None,
                        Some(err.to_string()),
                    );
                    break;
                }
            }

            let outcome = self.run_node(&def, &instance, &node, cancel.clone()).await;
            if let Err(e) = self.advance(&instance_id, outcome).await {
                error!(instance = %instance_id, error = %e, "advance failed");
                let _ = self.finish_instance(
                    &instance_id,
                    InstanceStatus::Failed,
                    None,
                    Some(e.to_string()),
                );
                break;
            }
        }
        // cancel entry first, driver entry last; `start` relies on this order
        self.cancels.remove(&instance_id);
        self.drivers.remove(&instance_id);
    }

    async fn run_node(
        &self,
        def: &crate::flow::model::FlowDefinition,
        instance: &FlowInstance,
        node: &NodeSpec,
        cancel: watch::Receiver<bool>,
    ) -> NodeOutcome {
        let Some(runner) = self.runners.get(node.kind.as_str()).map(|r| r.value().clone()) else {
            return NodeOutcome::Failed {
                message: format!("no runner registered for node type '{}'", node.kind.as_str()),
            };
        };
        let ctx = NodeContext {
            instance_id: instance.id.clone(),
            flow_name: instance.flow_name.clone(),
            session_id: instance
                .trigger_data
                .get("session_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            node: node.clone(),
            input: instance.trigger_data.clone(),
            variables: def.variables.clone(),
            cancel,
        };
        match runner.run(&ctx).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(instance = %instance.id, node = %node.id, error = %e, "node runner failed");
                NodeOutcome::Failed {
                    message: e.to_string(),
                }
            }
        }
    }

    /// Records a finished node and moves the instance to its next node, or
    /// to a terminal status. Called by the driver after each node; also the
    /// entry point for externally-run node runners reporting completion.
    pub async fn advance(&self, instance_id: &str, outcome: NodeOutcome) -> Result<FlowInstance> {
        let instance = self.store.get_instance(instance_id)?;
        if instance.status.is_terminal() {
            return Err(EngineError::invalid_transition(format!(
                "instance {instance_id} is already {}",
                instance.status.as_str()
            )));
        }
        let node_id = instance.current_node_id.clone().ok_or_else(|| {
            EngineError::invalid_transition(format!("instance {instance_id} has no current node"))
        })?;
        let def = self.store.get_definition(&instance.flow_definition_id)?;

        self.store.finalize_log(instance_id, &node_id, |log| {
            let now = Utc::now();
            log.status = if outcome.is_failure() {
                NodeRunStatus::Failed
            } else {
                NodeRunStatus::Completed
            };
            if let NodeOutcome::Failed { message } = &outcome {
                log.error_message = Some(message.clone());
            } else {
                log.output_data = Some(outcome.output_json());
            }
            log.completed_at = Some(now);
            log.processing_time_ms = Some((now - log.started_at).num_milliseconds());
        })?;

        let next_edge = Self::select_edge(&def, &node_id, &outcome);

        if outcome.is_failure() && next_edge.is_none() {
            let message = match &outcome {
                NodeOutcome::Failed { message } => message.clone(),
                _ => "node failed".to_string(),
            };
            warn!(instance = %instance_id, node = %node_id, "node failure propagated to instance");
            return self.finish_instance(instance_id, InstanceStatus::Failed, None, Some(message));
        }

        match next_edge {
            Some(edge) => {
                let next = def.node(&edge.target).ok_or_else(|| {
                    EngineError::not_found("flow_node", edge.target.clone())
                })?;
                let input = outcome.output_json();
                let updated = self.store.update_instance(instance_id, |i| {
                    i.current_node_id = Some(next.id.clone());
                })?;
                self.append_running_log(instance_id, next, &input);
                debug!(instance = %instance_id, from = %node_id, to = %next.id, "advanced");
                Ok(updated)
            }
            None => self.finish_instance(
                instance_id,
                InstanceStatus::Completed,
                Some(outcome.output_json()),
                None,
            ),
        }
    }

    /// Requests cancellation of a running instance. In-flight monitors
    /// observe the signal and report a `cancelled` outcome without waiting
    /// for their deadline.
    pub fn cancel(&self, instance_id: &str) -> Result<()> {
        let instance = self.store.get_instance(instance_id)?;
        if instance.status.is_terminal() {
            return Err(EngineError::invalid_transition(format!(
                "instance {instance_id} is already {}",
                instance.status.as_str()
            )));
        }
        let sender = self.cancels.get(instance_id).ok_or_else(|| {
            EngineError::not_found("flow_instance", instance_id)
        })?;
        let _ = sender.send(true);
        info!(instance = %instance_id, "cancellation requested");
        Ok(())
    }

    /// Waits for the instance's driver task to finish and returns the final
    /// row.
    pub async fn join(&self, instance_id: &str) -> Result<FlowInstance> {
        if let Some((_, handle)) = self.drivers.remove(instance_id) {
            handle
                .await
                .map_err(|e| EngineError::cancelled(format!("flow instance driver: {e}")))?;
        }
        self.store.get_instance(instance_id)
    }

    /// Number of instances whose driver task is still running.
    pub fn running_count(&self) -> usize {
        self.drivers.len()
    }

    pub fn get(&self, instance_id: &str) -> Result<FlowInstance> {
        self.store.get_instance(instance_id)
    }

    pub fn list(&self, filter: &InstanceFilter) -> Vec<FlowInstance> {
        self.store.list_instances(filter)
    }

    pub fn logs(&self, instance_id: &str) -> Vec<FlowExecutionLog> {
        self.store.logs_for_instance(instance_id)
    }

    pub fn stats(&self, window_secs: u64) -> InstanceStats {
        self.store.stats(window_secs)
    }

    /// Edge selection: a conditional edge matching the outcome label wins;
    /// otherwise the first unconditional edge, which matches any outcome
    /// except `failed` and `cancelled` (those only follow explicit edges).
    fn select_edge<'a>(
        def: &'a crate::flow::model::FlowDefinition,
        node_id: &'a str,
        outcome: &NodeOutcome,
    ) -> Option<&'a crate::flow::model::EdgeSpec> {
        let label = outcome.label();
        def.edges_from(node_id)
            .find(|e| e.condition.as_deref() == Some(label))
            .or_else(|| {
                if matches!(label, "failed" | "cancelled") {
                    None
                } else {
                    def.edges_from(node_id).find(|e| e.condition.is_none())
                }
            })
    }

    fn append_running_log(&self, instance_id: &str, node: &NodeSpec, input: &Value) {
        self.store.append_log(FlowExecutionLog {
            id: cuid2::create_id(),
            flow_instance_id: instance_id.to_string(),
            node_id: node.id.clone(),
            node_type: node.kind,
            node_name: node.name.clone(),
            status: NodeRunStatus::Running,
            input_data: input.clone(),
            output_data: None,
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
            processing_time_ms: None,
        });
    }

    fn finish_instance(
        &self,
        instance_id: &str,
        status: InstanceStatus,
        result: Option<Value>,
        error_message: Option<String>,
    ) -> Result<FlowInstance> {
        let updated = self.store.update_instance(instance_id, |i| {
            let now = Utc::now();
            i.status = status;
            i.current_node_id = None;
            i.result = result;
            i.error_message = error_message;
            i.completed_at = Some(now);
            i.processing_time_ms = Some((now - i.started_at).num_milliseconds());
        })?;
        info!(
            instance = %instance_id,
            status = updated.status.as_str(),
            "flow instance finished"
        );
        Ok(updated)
    }
}
