// ABOUTME: Error types for the scheduling and execution engine
// ABOUTME: Defines the engine error taxonomy and the failure type reported by agents

use std::time::Duration;
use thiserror::Error;

use crate::model::TaskStatus;

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Circular dependency detected: {}", path.join(" -> "))]
    CircularDependency { path: Vec<String> },

    #[error("Capacity exceeded: {resource} (limit {limit})")]
    Capacity { resource: String, limit: usize },

    #[error("Task timeout: {task_id} - exceeded {timeout:?}")]
    Timeout { task_id: String, timeout: Duration },

    #[error("No agent available: {reason}")]
    AgentUnavailable { reason: String },

    #[error("Task execution failed: {task_id} - {message}")]
    Execution {
        task_id: String,
        message: String,
        retryable: bool,
    },

    #[error("Execution cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    #[error("Workflow not found: {workflow_id}")]
    WorkflowNotFound { workflow_id: String },

    #[error("Invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Template error: {0}")]
    Template(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Join error: {0}")]
    Join(String),
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Stable short name used in structured execution error details
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation { .. } => "validation",
            EngineError::CircularDependency { .. } => "circular_dependency",
            EngineError::Capacity { .. } => "capacity",
            EngineError::Timeout { .. } => "timeout",
            EngineError::AgentUnavailable { .. } => "agent_unavailable",
            EngineError::Execution { .. } => "execution",
            EngineError::Cancelled { .. } => "cancelled",
            EngineError::TaskNotFound { .. } => "task_not_found",
            EngineError::WorkflowNotFound { .. } => "workflow_not_found",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::Template(_) => "template",
            EngineError::Checkpoint(_) => "checkpoint",
            EngineError::Join(_) => "join",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Execution { retryable, .. } => *retryable,
            EngineError::Timeout { .. } => true,
            _ => false,
        }
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        EngineError::Join(err.to_string())
    }
}

/// Failure reported by an agent executor
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct AgentError {
    pub message: String,
    pub retryable: bool,
    pub details: Option<serde_json::Value>,
}

impl AgentError {
    /// A failure the executor may retry according to the task's retry policy
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            details: None,
        }
    }

    /// A failure that drives the task straight to a terminal FAILED state
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circular_dependency_message_lists_path() {
        let err = EngineError::CircularDependency {
            path: vec!["a".to_string(), "b".to_string(), "a".to_string()],
        };
        assert_eq!(err.to_string(), "Circular dependency detected: a -> b -> a");
        assert_eq!(err.kind(), "circular_dependency");
    }

    #[test]
    fn test_retryable_classification() {
        let retryable = EngineError::Execution {
            task_id: "t".to_string(),
            message: "boom".to_string(),
            retryable: true,
        };
        assert!(retryable.is_retryable());
        assert!(!EngineError::validation("bad").is_retryable());
        assert!(AgentError::retryable("flaky").retryable);
        assert!(!AgentError::fatal("broken").retryable);
    }
}
