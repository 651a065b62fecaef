//! Data model for versioned flow definitions, instances and execution logs.

use chrono::{DateTime, Utc};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::core::errors::{EngineError, Result};

/// A parsed `major.minor` flow version.
///
/// Version rows are immutable after creation; the only increment path is
/// [`FlowVersion::bump_minor`]. The major component is never bumped
/// automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct FlowVersion {
    pub major: u32,
    pub minor: u32,
}

impl FlowVersion {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// The version assigned to the first row of a brand-new flow.
    pub fn initial() -> Self {
        Self { major: 1, minor: 0 }
    }

    /// `"1.2" -> "1.3"`
    pub fn bump_minor(self) -> Self {
        Self {
            major: self.major,
            minor: self.minor + 1,
        }
    }
}

impl fmt::Display for FlowVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl From<FlowVersion> for String {
    fn from(v: FlowVersion) -> Self {
        v.to_string()
    }
}

impl FromStr for FlowVersion {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let (major, minor) = s
            .split_once('.')
            .ok_or_else(|| EngineError::validation_field("version must be 'major.minor'", "version"))?;
        let major = major
            .parse::<u32>()
            .map_err(|_| EngineError::validation_field("major component is not a number", "version"))?;
        let minor = minor
            .parse::<u32>()
            .map_err(|_| EngineError::validation_field("minor component is not a number", "version"))?;
        Ok(Self { major, minor })
    }
}

impl TryFrom<String> for FlowVersion {
    type Error = EngineError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

/// The closed set of node types this engine executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    Monitor,
    AiReply,
    CreateTask,
    End,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Monitor => "monitor",
            Self::AiReply => "ai_reply",
            Self::CreateTask => "create_task",
            Self::End => "end",
        }
    }
}

/// A node within a flow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Unique (within the definition) node identifier
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub name: String,
    /// Node-type specific configuration (e.g. [`MonitorConfig`] for
    /// monitor nodes)
    ///
    /// [`MonitorConfig`]: crate::flow::monitor::MonitorConfig
    #[serde(default)]
    pub config: Value,
}

/// A directed edge between two nodes, optionally guarded by an outcome
/// condition.
///
/// The condition string is matched against the source node's
/// [`NodeOutcome::label`]. An unconditional edge matches any outcome except
/// `failed` and `cancelled`, which only follow explicit edges: a `"failed"`
/// edge is the only way a node failure does not fail the whole instance, and
/// a `"cancelled"` edge is the only way a cancelled monitor routes onward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// How a trigger reaches this flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    #[default]
    Manual,
    Message,
    Alert,
}

/// Retry configuration carried on a definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u8,
    pub delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            delay_secs: 2,
        }
    }
}

/// A named, versioned workflow template.
///
/// Rows are immutable after creation apart from the `is_active` flag, which
/// only ever toggles inside the version manager's locked sections. For a
/// given `name`, at most one row is active at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: String,
    pub name: String,
    pub version: FlowVersion,
    pub is_active: bool,
    #[serde(default)]
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub trigger_config: Value,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default)]
    pub priority: i32,
    /// Overall instance timeout; monitors carry their own bounds
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlowDefinition {
    /// The node an instance starts at: the single `start` node if the
    /// definition declares one, otherwise the first node in order.
    pub fn entry_node(&self) -> Option<&NodeSpec> {
        self.nodes
            .iter()
            .find(|n| n.kind == NodeKind::Start)
            .or_else(|| self.nodes.first())
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    /// Outgoing edges of `node_id` in definition order.
    pub fn edges_from<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a EdgeSpec> {
        self.edges.iter().filter(move |e| e.source == node_id)
    }

    /// Validates the node/edge graph: non-empty, unique node ids, edges
    /// referencing known nodes, at most one `start` node, and no cycles.
    pub fn validate_graph(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(EngineError::validation_field("flow has no nodes", "nodes"));
        }
        let mut graph = DiGraph::<&str, ()>::new();
        let mut indices = HashMap::new();
        for node in &self.nodes {
            if indices.contains_key(node.id.as_str()) {
                return Err(EngineError::validation_field(
                    format!("duplicate node id '{}'", node.id),
                    "nodes",
                ));
            }
            indices.insert(node.id.as_str(), graph.add_node(node.id.as_str()));
        }
        if self.nodes.iter().filter(|n| n.kind == NodeKind::Start).count() > 1 {
            return Err(EngineError::validation_field(
                "flow declares more than one start node",
                "nodes",
            ));
        }
        for edge in &self.edges {
            let (Some(&src), Some(&dst)) = (
                indices.get(edge.source.as_str()),
                indices.get(edge.target.as_str()),
            ) else {
                return Err(EngineError::validation_field(
                    format!("edge {} -> {} references an unknown node", edge.source, edge.target),
                    "edges",
                ));
            };
            graph.add_edge(src, dst, ());
        }
        if is_cyclic_directed(&graph) {
            return Err(EngineError::validation_field("flow graph contains a cycle", "edges"));
        }
        Ok(())
    }
}

/// Lifecycle of a flow instance: `pending -> running -> {completed | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// One execution of a flow definition.
///
/// Owned exclusively by the executor: created on trigger, advanced only by
/// the single task that holds its current node, terminal once `status`
/// leaves `Running`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowInstance {
    pub id: String,
    pub flow_definition_id: String,
    pub flow_name: String,
    pub status: InstanceStatus,
    pub current_node_id: Option<String>,
    pub trigger_data: Value,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processing_time_ms: Option<i64>,
    #[serde(default)]
    pub retry_count: u8,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// Status of a single node execution within an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRunStatus {
    Running,
    Completed,
    Failed,
}

/// One append-only log row per node execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowExecutionLog {
    pub id: String,
    pub flow_instance_id: String,
    pub node_id: String,
    pub node_type: NodeKind,
    pub node_name: String,
    pub status: NodeRunStatus,
    pub input_data: Value,
    #[serde(default)]
    pub output_data: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processing_time_ms: Option<i64>,
}

/// The signal a monitor node detected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MonitorSignal {
    Staff {
        staff_user_id: Option<String>,
    },
    UserSatisfaction,
    Escalation,
}

impl MonitorSignal {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Staff { .. } => "staff_reply",
            Self::UserSatisfaction => "user_satisfaction",
            Self::Escalation => "escalation",
        }
    }
}

/// What a node execution produced, reported back to the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NodeOutcome {
    /// Ordinary synchronous node finished
    Success { output: Value },
    /// A monitor observed a positive signal before its deadline
    Detected {
        signal: MonitorSignal,
        elapsed_secs: u64,
    },
    /// A monitor exhausted its deadline; a normal terminal outcome, not a
    /// failure. `reason` carries the last detector error if every poll
    /// failed.
    Timeout {
        elapsed_secs: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// The owning instance was externally cancelled mid-monitor
    Cancelled,
    /// The node's work itself failed
    Failed { message: String },
}

impl NodeOutcome {
    /// Label matched against [`EdgeSpec::condition`].
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Detected { .. } => "detected",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn output_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn two_node_def() -> FlowDefinition {
        let now = Utc::now();
        FlowDefinition {
            id: "fd_1".into(),
            name: "welcome".into(),
            version: FlowVersion::initial(),
            is_active: true,
            trigger_type: TriggerType::Manual,
            trigger_config: Value::Null,
            nodes: vec![
                NodeSpec {
                    id: "n1".into(),
                    kind: NodeKind::Start,
                    name: "start".into(),
                    config: Value::Null,
                },
                NodeSpec {
                    id: "n2".into(),
                    kind: NodeKind::End,
                    name: "end".into(),
                    config: Value::Null,
                },
            ],
            edges: vec![EdgeSpec {
                source: "n1".into(),
                target: "n2".into(),
                condition: None,
            }],
            variables: HashMap::new(),
            priority: 0,
            timeout_seconds: None,
            retry: RetryConfig::default(),
            created_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_version_parse_and_bump() {
        let v: FlowVersion = "1.2".parse().unwrap();
        assert_eq!(v, FlowVersion::new(1, 2));
        assert_eq!(v.bump_minor().to_string(), "1.3");
        assert!("3".parse::<FlowVersion>().is_err());
        assert!("a.b".parse::<FlowVersion>().is_err());
    }

    #[test]
    fn test_version_ordering() {
        let a: FlowVersion = "1.2".parse().unwrap();
        let b: FlowVersion = "1.10".parse().unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_graph_validation_accepts_linear_flow() {
        assert!(two_node_def().validate_graph().is_ok());
    }

    #[test]
    fn test_graph_validation_rejects_cycle() {
        let mut def = two_node_def();
        def.edges.push(EdgeSpec {
            source: "n2".into(),
            target: "n1".into(),
            condition: None,
        });
        assert!(def.validate_graph().is_err());
    }

    #[test]
    fn test_graph_validation_rejects_unknown_edge_endpoint() {
        let mut def = two_node_def();
        def.edges.push(EdgeSpec {
            source: "n1".into(),
            target: "ghost".into(),
            condition: None,
        });
        assert!(def.validate_graph().is_err());
    }

    #[test]
    fn test_entry_node_prefers_start_kind() {
        let mut def = two_node_def();
        def.nodes.swap(0, 1);
        assert_eq!(def.entry_node().unwrap().id, "n1");
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(
            NodeOutcome::Success { output: json!({}) }.label(),
            "success"
        );
        assert_eq!(
            NodeOutcome::Timeout {
                elapsed_secs: 60,
                reason: None
            }
            .label(),
            "timeout"
        );
        assert!(NodeOutcome::Failed {
            message: "boom".into()
        }
        .is_failure());
    }
}
