// ABOUTME: Task definition, status state machine, priority and retry policy
// ABOUTME: Tasks are the schedulable units tracked by the resolver, scheduler and executor

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use super::metadata::Metadata;
use crate::engine::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
    Retrying,
}

impl TaskStatus {
    /// Whether the status machine permits moving from `self` to `next`
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;

        if self == next {
            // a running task is owned by exactly one attempt
            return self != Running;
        }

        match self {
            Pending => matches!(next, Ready | Running | Cancelled | Paused | Failed),
            Ready => matches!(next, Running | Pending | Cancelled | Paused),
            Running => matches!(next, Completed | Failed | Cancelled),
            Failed => matches!(next, Retrying | Pending),
            Retrying => matches!(next, Pending | Running | Cancelled),
            Paused => matches!(next, Pending | Ready | Cancelled),
            Completed | Cancelled => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    /// Statuses after which an assigned agent no longer carries the task
    pub fn releases_agent(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Paused => "paused",
            TaskStatus::Retrying => "retrying",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl TaskPriority {
    pub fn value(self) -> i64 {
        self as i64
    }
}

/// Retry settings consulted by the executor after each failed attempt
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(300),
        }
    }

    /// Delay before retry number `attempt` (0-indexed): `retry_delay * multiplier^attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay_ms = (self.retry_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32)) as u64;

        let delay = Duration::from_millis(delay_ms);

        if delay > self.max_delay {
            self.max_delay
        } else {
            delay
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(default_max_retries(), default_retry_delay())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    #[serde(default = "new_id")]
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default = "default_status")]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    #[serde(default, skip_deserializing)]
    pub blocks: BTreeSet<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(with = "humantime_serde", default = "default_retry_delay")]
    pub retry_delay: Duration,
    #[serde(with = "humantime_serde", default)]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_status() -> TaskStatus {
    TaskStatus::Pending
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(1)
}

impl Task {
    pub fn new(name: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            task_type: task_type.into(),
            status: TaskStatus::Pending,
            priority: TaskPriority::Normal,
            depends_on: BTreeSet::new(),
            blocks: BTreeSet::new(),
            retry_count: 0,
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            timeout: None,
            deadline: None,
            scheduled_at: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            assigned_to: None,
            workflow_id: None,
            metadata: Metadata::new(),
            result: None,
            error: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependency(mut self, task_id: impl Into<String>) -> Self {
        self.depends_on.insert(task_id.into());
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key, value);
        self
    }

    /// Move to `next`, enforcing the status machine and stamping timestamps
    pub fn transition_to(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }

        match next {
            TaskStatus::Running => self.started_at = Some(Utc::now()),
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                self.completed_at = Some(Utc::now())
            }
            TaskStatus::Pending => self.completed_at = None,
            _ => {}
        }

        self.status = next;
        Ok(())
    }

    pub fn can_retry(&self) -> bool {
        self.status == TaskStatus::Failed && self.retry_count < self.max_retries
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_delay)
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal() || (self.status == TaskStatus::Failed && !self.can_retry())
    }
}
