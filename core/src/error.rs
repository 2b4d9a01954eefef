//! Structured error types for Colony
//!
//! Provides type-safe error handling with rich context for the scheduler,
//! user-facing messages, and retry decisions.

use std::time::Duration;
use thiserror::Error;

/// Primary error type for Colony operations
#[derive(Error, Debug)]
pub enum ColonyError {
    // =========================================================================
    // Agent / Runtime State Errors
    // =========================================================================
    /// Agent not found
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    /// Agent already deployed under this id
    #[error("agent already deployed: {0}")]
    AgentAlreadyDeployed(String),

    /// Agent has been retired and cannot be scheduled
    #[error("agent retired: {0}")]
    AgentRetired(String),

    /// Duplicate active goal id on an agent's goal stack
    #[error("duplicate active goal {goal_id} on agent {agent_id}")]
    DuplicateGoal { agent_id: String, goal_id: String },

    // =========================================================================
    // Guard / Approval Errors
    // =========================================================================
    /// A guard denied the action
    #[error("action blocked by {guard}: {reason}")]
    GuardDenied { guard: String, reason: String },

    /// Approval request not found
    #[error("approval not found: {0}")]
    ApprovalNotFound(String),

    // =========================================================================
    // Model / Network Errors
    // =========================================================================
    /// Language model failure
    #[error("model error: {0}")]
    Model(#[from] crate::llm::LlmFailure),

    /// Per-step timeout
    #[error("operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    // =========================================================================
    // Subsystem Wrappers
    // =========================================================================
    #[error("capability error: {0}")]
    Capability(#[from] crate::capability::CapabilityError),

    #[error("workflow error: {0}")]
    Workflow(#[from] crate::workflow::WorkflowError),

    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal system error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl ColonyError {
    /// Check if error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Model(f) => f.is_retryable(),
            Self::Capability(e) => e.is_retryable(),
            Self::Workflow(_) => false,

            Self::Io(io_err) => matches!(
                io_err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),

            Self::AgentNotFound(_)
            | Self::AgentAlreadyDeployed(_)
            | Self::AgentRetired(_)
            | Self::DuplicateGoal { .. }
            | Self::GuardDenied { .. }
            | Self::ApprovalNotFound(_)
            | Self::InvalidConfig { .. }
            | Self::Json(_)
            | Self::Internal { .. } => false,
        }
    }

    /// Get suggested retry delay for retryable errors
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::Timeout { .. } => Some(Duration::from_secs(1)),
            Self::Model(f) => f.retry_delay(),
            _ => None,
        }
    }
}

/// Result type alias using ColonyError
pub type Result<T> = std::result::Result<T, ColonyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(ColonyError::Timeout {
            duration: Duration::from_secs(30)
        }
        .is_retryable());

        assert!(!ColonyError::AgentNotFound("a1".to_string()).is_retryable());

        assert!(!ColonyError::GuardDenied {
            guard: "budget".to_string(),
            reason: "exhausted".to_string()
        }
        .is_retryable());
    }
}
