//! Core types and error definitions for the maestro coordinator.
//!
//! This crate provides the foundational pieces shared by every maestro crate:
//! the unified error type, dotted-path lookup over JSON documents, the
//! comparison operators used by workflow conditions and policy rules, and the
//! tracing subscriber set-up.
//!
//! # Main types
//!
//! - [`MaestroError`]: Unified error enum for all coordinator subsystems.
//! - [`MaestroResult`]: Convenience alias for `Result<T, MaestroError>`.
//! - [`Comparison`]: A `field <operator> value` predicate over a JSON document.
//! - [`Operator`]: The comparison operators understood by [`Comparison`].

/// Dotted-path lookup and comparison operators.
pub mod path;
/// Tracing subscriber initialisation.
pub mod telemetry;

pub use path::{lookup, Comparison, Operator};

use std::time::Duration;

/// Top-level error type for the coordinator.
///
/// Variants group into not-found, availability, admission and execution
/// failures so callers can decide whether to retry.
#[derive(Debug, thiserror::Error)]
pub enum MaestroError {
    /// No agent is registered under the given identifier.
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// No task exists with the given identifier.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// No workflow is defined under the given identifier.
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// The agent exists but is not `online`.
    #[error("Agent unavailable: {0}")]
    AgentUnavailable(String),

    /// A `deny` policy action rejected the operation.
    #[error("Denied by policy '{policy}': {reason}")]
    PolicyDenied {
        /// Name of the policy that denied the operation.
        policy: String,
        /// Human-readable reason recorded on the action.
        reason: String,
    },

    /// The operation is not legal for the current state of the target.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Input failed a validation rule.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A task or workflow step failed while executing.
    #[error("Execution error: {0}")]
    Execution(String),

    /// The agent endpoint returned an error or could not be reached.
    #[error("Endpoint error: {0}")]
    Endpoint(String),

    /// An agent call or wait exceeded its time budget.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MaestroError {
    /// Whether the error reports an unknown agent, task or workflow.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            MaestroError::AgentNotFound(_)
                | MaestroError::TaskNotFound(_)
                | MaestroError::WorkflowNotFound(_)
        )
    }

    /// Whether re-attempting the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MaestroError::AgentUnavailable(_)
                | MaestroError::Endpoint(_)
                | MaestroError::Execution(_)
                | MaestroError::Timeout(_)
        )
    }
}

/// A convenience `Result` alias using [`MaestroError`].
pub type MaestroResult<T> = Result<T, MaestroError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            MaestroError::AgentNotFound("tutor".into()).to_string(),
            "Agent not found: tutor"
        );
        let denied = MaestroError::PolicyDenied {
            policy: "maintenance".into(),
            reason: "agent drained".into(),
        };
        assert_eq!(
            denied.to_string(),
            "Denied by policy 'maintenance': agent drained"
        );
    }

    #[test]
    fn test_error_classification() {
        assert!(MaestroError::TaskNotFound("t1".into()).is_not_found());
        assert!(!MaestroError::TaskNotFound("t1".into()).is_retryable());
        assert!(MaestroError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(MaestroError::Endpoint("503".into()).is_retryable());
        assert!(!MaestroError::Validation("bad".into()).is_retryable());
    }
}
