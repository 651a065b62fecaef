use thiserror::Error;

/// Unified error type for the collabflow engine.
///
/// Monitors surface cancellation and deadline exhaustion as node outcomes;
/// `Cancelled` and `Timeout` cover the instance-level cases (a dead driver
/// task, a definition-level timeout). The remaining variants are caller
/// errors returned unchanged to the administrative layer.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A referenced definition, version, instance or role does not exist
    #[error("Not found: {entity} '{id}'")]
    NotFound { entity: &'static str, id: String },

    /// Attempt to start a flow that has no active version
    #[error("No active version for flow '{flow_name}'")]
    NoActiveVersion { flow_name: String },

    /// Illegal state transition (advancing a terminal instance, deleting an
    /// active version, ...)
    #[error("Invalid transition: {message}")]
    InvalidTransition { message: String },

    /// An external collaborator (staff detector, alert store, task sink)
    /// could not be reached
    #[error("External lookup failed: {collaborator} - {message}")]
    ExternalLookupFailed {
        collaborator: &'static str,
        message: String,
    },

    /// Cooperative cancellation of a monitor
    #[error("Operation was cancelled: {operation}")]
    Cancelled {
        operation: String,
        reason: Option<String>,
    },

    /// A bounded wait exhausted its deadline
    #[error("Operation timed out: {operation} ({timeout_secs}s)")]
    Timeout {
        operation: String,
        timeout_secs: u64,
    },

    /// Input validation errors (bad version strings, malformed graphs, ...)
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// IO errors (definition import)
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    pub fn not_found<S: Into<String>>(entity: &'static str, id: S) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn no_active_version<S: Into<String>>(flow_name: S) -> Self {
        Self::NoActiveVersion {
            flow_name: flow_name.into(),
        }
    }

    pub fn invalid_transition<S: Into<String>>(message: S) -> Self {
        Self::InvalidTransition {
            message: message.into(),
        }
    }

    pub fn external<S: Into<String>>(collaborator: &'static str, message: S) -> Self {
        Self::ExternalLookupFailed {
            collaborator,
            message: message.into(),
        }
    }

    pub fn cancelled<S: Into<String>>(operation: S) -> Self {
        Self::Cancelled {
            operation: operation.into(),
            reason: None,
        }
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_secs,
        }
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::NoActiveVersion { .. } => "no_active_version",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::ExternalLookupFailed { .. } => "external_lookup",
            Self::Cancelled { .. } => "cancelled",
            Self::Timeout { .. } => "timeout",
            Self::Validation { .. } => "validation",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            format: "json",
            source: Box::new(err),
        }
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization {
            format: "yaml",
            source: Box::new(err),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            operation: "io_operation".to_string(),
            source: err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = EngineError::not_found("flow_definition", "fd_123");
        assert!(matches!(err, EngineError::NotFound { .. }));
        assert_eq!(err.category(), "not_found");
    }

    #[test]
    fn test_error_display() {
        let err = EngineError::no_active_version("welcome");
        assert_eq!(err.to_string(), "No active version for flow 'welcome'");
        let err = EngineError::timeout("flow instance", 30);
        assert_eq!(err.to_string(), "Operation timed out: flow instance (30s)");
        let err = EngineError::external("staff_detector", "store unreachable");
        assert_eq!(
            err.to_string(),
            "External lookup failed: staff_detector - store unreachable"
        );
    }
}
