// ABOUTME: Execution context handed to agents for each task attempt
// ABOUTME: Carries attempt identity, workflow linkage, metadata and a cancellation token

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::model::{Metadata, Task};

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: String,
    pub task_id: String,
    pub agent_id: String,
    pub workflow_id: Option<String>,
    pub attempt: u32,
    pub start_time: DateTime<Utc>,
    pub metadata: Metadata,
    cancellation: CancellationToken,
}

impl ExecutionContext {
    pub fn new(task_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            execution_id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            workflow_id: None,
            attempt: 1,
            start_time: Utc::now(),
            metadata: Metadata::new(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Context for one attempt of `task` on `agent_id`
    pub fn for_task(task: &Task, agent_id: &str, execution_id: &str, attempt: u32) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            task_id: task.id.clone(),
            agent_id: agent_id.to_string(),
            workflow_id: task.workflow_id.clone(),
            attempt,
            start_time: Utc::now(),
            metadata: task.metadata.clone(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.metadata.insert(key, value);
    }

    pub fn get_metadata(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(key)
    }

    /// Token cancelled when the attempt is cancelled or times out
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the attempt has been cancelled
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}
