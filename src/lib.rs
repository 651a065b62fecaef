//! Collabflow - collaboration and flow orchestration engine for a chat-bot
//! operations console.
//!
//! Three subsystems share one property: each manages a time-bounded,
//! cancellable, concurrently-running unit of work per chat session, with an
//! auditable decision trail and a strict single-active-version invariant
//! over mutable configuration.
//!
//! - [`flow`]: versioned flow definitions, instance execution, and the
//!   monitor node that polls a chat room for up to 30 minutes.
//! - [`collab`]: per-message arbitration between the AI responder and human
//!   staff, plus the alert escalation monitor racing a human response
//!   against a timeout.
//! - [`core`]: shared error taxonomy.

// Core infrastructure modules
pub mod core {
    pub mod errors;
}

// The two engine subsystems
pub mod collab; // decision arbitration, alert monitoring, boundary traits
pub mod flow; // versioned flow definitions and execution

// Re-exports for convenience
pub use core::errors::{EngineError, Result};

pub use collab::{
    AlertEscalationMonitor, AlertMonitorConfig, AlertOutcome, AlertStatus, BusinessRole,
    BusinessRoleRegistry, CollaborationDecision, DecisionConfig, DecisionEngine, DecisionStore,
    InboundMessage, StaffPresenceDetector,
};
pub use flow::{
    FlowDefinition, FlowExecutor, FlowInstance, FlowStore, FlowVersionManager, MonitorConfig,
    MonitorNodeRunner, NodeOutcome, NodeRunner,
};
