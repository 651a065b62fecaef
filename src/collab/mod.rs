pub mod alert;
pub mod decision;
pub mod detect;
pub mod role;

pub use alert::{AlertEscalationMonitor, AlertMonitorConfig, AlertOutcome, AlertStatus};
pub use decision::{
    AiAction, CollaborationDecision, DecisionConfig, DecisionEngine, DecisionStore,
    InboundMessage, StaffAction,
};
pub use detect::{
    AlertRecord, AlertStore, CachedStaffDetector, SessionSignalDetector, StaffActivity,
    StaffPresenceDetector, TaskRequest, TaskSink,
};
pub use role::{AiBehavior, BusinessRole, BusinessRoleRegistry, Priority, StaffOnlineReplyMode};
