// ABOUTME: Execution records for individual task attempts
// ABOUTME: Tracks attempt status, timing, resource usage, results and log entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Starting,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::Timeout
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Queued => write!(f, "queued"),
            ExecutionStatus::Starting => write!(f, "starting"),
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Cancelled => write!(f, "cancelled"),
            ExecutionStatus::Timeout => write!(f, "timeout"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub sampled_at: Option<DateTime<Utc>>,
}

impl ResourceUsage {
    /// Field-wise maximum of two samples
    pub fn peak(self, other: ResourceUsage) -> ResourceUsage {
        ResourceUsage {
            cpu_percent: self.cpu_percent.max(other.cpu_percent),
            memory_bytes: self.memory_bytes.max(other.memory_bytes),
            sampled_at: other.sampled_at.or(self.sampled_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionErrorDetails {
    pub kind: String,
    pub message: String,
    pub retryable: bool,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub id: String,
    pub task_id: String,
    pub execution_number: u32,
    pub executor_id: String,
    pub executor_type: String,
    pub status: ExecutionStatus,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(with = "humantime_serde", default)]
    pub duration: Option<Duration>,
    pub resource_usage: Option<ResourceUsage>,
    pub peak_usage: Option<ResourceUsage>,
    pub result: Option<serde_json::Value>,
    pub error: Option<ExecutionErrorDetails>,
    pub logs: Vec<ExecutionLogEntry>,
}

impl TaskExecution {
    pub fn new(
        task_id: impl Into<String>,
        execution_number: u32,
        executor_id: impl Into<String>,
        executor_type: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            execution_number,
            executor_id: executor_id.into(),
            executor_type: executor_type.into(),
            status: ExecutionStatus::Queued,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration: None,
            resource_usage: None,
            peak_usage: None,
            result: None,
            error: None,
            logs: Vec::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    pub fn mark_starting(&mut self) {
        if self.status == ExecutionStatus::Queued {
            self.status = ExecutionStatus::Starting;
        }
    }

    pub fn mark_running(&mut self) {
        if matches!(
            self.status,
            ExecutionStatus::Queued | ExecutionStatus::Starting
        ) {
            self.status = ExecutionStatus::Running;
            self.started_at = Some(Utc::now());
        }
    }

    pub fn complete(&mut self, result: serde_json::Value) -> bool {
        if !self.finish(ExecutionStatus::Completed) {
            return false;
        }
        self.result = Some(result);
        self.log(LogLevel::Info, "execution completed");
        true
    }

    pub fn fail(&mut self, error: ExecutionErrorDetails) -> bool {
        if !self.finish(ExecutionStatus::Failed) {
            return false;
        }
        self.log(LogLevel::Error, error.message.clone());
        self.error = Some(error);
        true
    }

    pub fn time_out(&mut self, timeout: Duration) -> bool {
        if !self.finish(ExecutionStatus::Timeout) {
            return false;
        }
        let message = format!("execution timed out after {:?}", timeout);
        self.log(LogLevel::Error, message.clone());
        self.error = Some(ExecutionErrorDetails {
            kind: "timeout".to_string(),
            message,
            retryable: true,
            details: None,
        });
        true
    }

    pub fn cancel(&mut self, reason: impl Into<String>) -> bool {
        if !self.finish(ExecutionStatus::Cancelled) {
            return false;
        }
        let reason = reason.into();
        self.log(LogLevel::Warn, format!("execution cancelled: {}", reason));
        self.error = Some(ExecutionErrorDetails {
            kind: "cancelled".to_string(),
            message: reason,
            retryable: false,
            details: None,
        });
        true
    }

    /// Record a resource sample and fold it into the peak
    pub fn record_usage(&mut self, usage: ResourceUsage) {
        if self.is_finished() {
            return;
        }
        self.resource_usage = Some(usage);
        self.peak_usage = Some(match self.peak_usage {
            Some(peak) => peak.peak(usage),
            None => usage,
        });
    }

    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.logs.push(ExecutionLogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        });
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.message.as_str())
    }

    fn finish(&mut self, status: ExecutionStatus) -> bool {
        if self.is_finished() {
            return false;
        }
        let now = Utc::now();
        self.status = status;
        self.completed_at = Some(now);
        let started = self.started_at.unwrap_or(self.queued_at);
        self.duration = Some((now - started).to_std().unwrap_or(Duration::ZERO));
        true
    }
}
