pub mod executor;
pub mod model;
pub mod monitor;
pub mod store;
pub mod version;

pub use executor::{CreateTaskRunner, FlowExecutor, NodeContext, NodeRunner};
pub use model::{
    EdgeSpec, FlowDefinition, FlowExecutionLog, FlowInstance, FlowVersion, InstanceStatus,
    MonitorSignal, NodeKind, NodeOutcome, NodeRunStatus, NodeSpec, RetryConfig, TriggerType,
};
pub use monitor::{MonitorConfig, MonitorNodeRunner};
pub use store::{FlowStore, InstanceFilter, InstanceStats};
pub use version::{FlowVersionManager, NewFlowDefinition, VersionChanges};
