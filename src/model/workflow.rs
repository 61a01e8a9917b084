// ABOUTME: Workflow and workflow step definitions
// ABOUTME: Steps carry a tagged payload for task, parallel, sequential, conditional, loop and wait constructs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use super::metadata::Metadata;
use super::task::{TaskPriority, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Pending => write!(f, "pending"),
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::Cancelled => write!(f, "cancelled"),
            WorkflowStatus::Paused => write!(f, "paused"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Task,
    Parallel,
    Sequential,
    Conditional,
    Loop,
    Wait,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    #[default]
    Fail,
    Skip,
}

/// Where a condition reads its field from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionSource {
    Result,
    #[default]
    Variables,
    Context,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    #[default]
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Contains,
    Exists,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(default)]
    pub source: ConditionSource,
    pub field: String,
    #[serde(default)]
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Option<Value>,
}

impl Condition {
    pub fn new(
        source: ConditionSource,
        field: impl Into<String>,
        operator: ConditionOperator,
        value: Option<Value>,
    ) -> Self {
        Self {
            source,
            field: field.into(),
            operator,
            value,
        }
    }
}

/// Blueprint for the task a TASK step instantiates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub name: String,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(with = "humantime_serde", default = "default_template_retry_delay")]
    pub retry_delay: Duration,
    #[serde(with = "humantime_serde", default)]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub agent_id: Option<String>,
}

fn default_template_retry_delay() -> Duration {
    Duration::from_secs(1)
}

impl TaskTemplate {
    pub fn new(name: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            task_type: task_type.into(),
            priority: TaskPriority::Normal,
            max_retries: 0,
            retry_delay: default_template_retry_delay(),
            timeout: None,
            metadata: Metadata::new(),
            agent_id: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key, value);
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

    pub fn on_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Task {
        task: TaskTemplate,
    },
    Parallel {
        sub_steps: Vec<WorkflowStep>,
    },
    Sequential {
        sub_steps: Vec<WorkflowStep>,
    },
    Conditional {
        condition: Condition,
        #[serde(default)]
        true_steps: Vec<WorkflowStep>,
        #[serde(default)]
        false_steps: Vec<WorkflowStep>,
    },
    Loop {
        loop_condition: Condition,
        loop_steps: Vec<WorkflowStep>,
        #[serde(default = "default_max_iterations")]
        max_iterations: u32,
    },
    Wait {
        #[serde(default)]
        wait_seconds: Option<f64>,
        #[serde(default)]
        wait_condition: Option<Condition>,
    },
}

fn default_max_iterations() -> u32 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub on_failure: OnFailure,
    #[serde(default = "default_step_status")]
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

fn default_step_status() -> TaskStatus {
    TaskStatus::Pending
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind,
            depends_on: Vec::new(),
            on_failure: OnFailure::Fail,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn task(id: impl Into<String>, template: TaskTemplate) -> Self {
        Self::new(id, StepKind::Task { task: template })
    }

    pub fn parallel(id: impl Into<String>, sub_steps: Vec<WorkflowStep>) -> Self {
        Self::new(id, StepKind::Parallel { sub_steps })
    }

    pub fn sequential(id: impl Into<String>, sub_steps: Vec<WorkflowStep>) -> Self {
        Self::new(id, StepKind::Sequential { sub_steps })
    }

    pub fn conditional(
        id: impl Into<String>,
        condition: Condition,
        true_steps: Vec<WorkflowStep>,
        false_steps: Vec<WorkflowStep>,
    ) -> Self {
        Self::new(
            id,
            StepKind::Conditional {
                condition,
                true_steps,
                false_steps,
            },
        )
    }

    pub fn looping(
        id: impl Into<String>,
        loop_condition: Condition,
        loop_steps: Vec<WorkflowStep>,
        max_iterations: u32,
    ) -> Self {
        Self::new(
            id,
            StepKind::Loop {
                loop_condition,
                loop_steps,
                max_iterations,
            },
        )
    }

    pub fn wait(id: impl Into<String>, wait_seconds: Option<f64>, wait_condition: Option<Condition>) -> Self {
        Self::new(
            id,
            StepKind::Wait {
                wait_seconds,
                wait_condition,
            },
        )
    }

    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    pub fn skip_on_failure(mut self) -> Self {
        self.on_failure = OnFailure::Skip;
        self
    }

    pub fn step_type(&self) -> StepType {
        match self.kind {
            StepKind::Task { .. } => StepType::Task,
            StepKind::Parallel { .. } => StepType::Parallel,
            StepKind::Sequential { .. } => StepType::Sequential,
            StepKind::Conditional { .. } => StepType::Conditional,
            StepKind::Loop { .. } => StepType::Loop,
            StepKind::Wait { .. } => StepType::Wait,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Completed, or failed with a `skip` policy: dependents may proceed
    pub fn is_settled(&self) -> bool {
        match self.status {
            TaskStatus::Completed => true,
            TaskStatus::Failed => self.on_failure == OnFailure::Skip,
            _ => false,
        }
    }

    /// Return this step and everything nested under it to PENDING
    pub fn reset(&mut self) {
        self.status = TaskStatus::Pending;
        self.result = None;
        self.error = None;
        self.started_at = None;
        self.completed_at = None;
        for child in self.children_mut() {
            child.reset();
        }
    }

    /// Direct sub-steps of a composite step, both branches of a conditional included
    pub fn children(&self) -> Vec<&WorkflowStep> {
        match &self.kind {
            StepKind::Parallel { sub_steps } | StepKind::Sequential { sub_steps } => {
                sub_steps.iter().collect()
            }
            StepKind::Conditional {
                true_steps,
                false_steps,
                ..
            } => true_steps.iter().chain(false_steps).collect(),
            StepKind::Loop { loop_steps, .. } => loop_steps.iter().collect(),
            StepKind::Task { .. } | StepKind::Wait { .. } => Vec::new(),
        }
    }

    pub fn children_mut(&mut self) -> Vec<&mut WorkflowStep> {
        match &mut self.kind {
            StepKind::Parallel { sub_steps } | StepKind::Sequential { sub_steps } => {
                sub_steps.iter_mut().collect()
            }
            StepKind::Conditional {
                true_steps,
                false_steps,
                ..
            } => true_steps.iter_mut().chain(false_steps.iter_mut()).collect(),
            StepKind::Loop { loop_steps, .. } => loop_steps.iter_mut().collect(),
            StepKind::Task { .. } | StepKind::Wait { .. } => Vec::new(),
        }
    }

    /// Follow `path` of sub-step ids down from this step
    pub fn descendant_mut(&mut self, path: &[String]) -> Option<&mut WorkflowStep> {
        let Some((first, rest)) = path.split_first() else {
            return Some(self);
        };
        self.children_mut()
            .into_iter()
            .find(|child| &child.id == first)?
            .descendant_mut(rest)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default = "new_workflow_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default = "default_workflow_status")]
    pub status: WorkflowStatus,
    #[serde(default)]
    pub context: Metadata,
    #[serde(default)]
    pub variables: Metadata,
    #[serde(default = "default_max_parallel_tasks")]
    pub max_parallel_tasks: usize,
    #[serde(default)]
    pub checkpoint_data: Option<Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

fn new_workflow_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_workflow_status() -> WorkflowStatus {
    WorkflowStatus::Pending
}

fn default_max_parallel_tasks() -> usize {
    5
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: new_workflow_id(),
            name: name.into(),
            description: None,
            steps: Vec::new(),
            status: WorkflowStatus::Pending,
            context: Metadata::new(),
            variables: Metadata::new(),
            max_parallel_tasks: default_max_parallel_tasks(),
            checkpoint_data: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(key, value);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key, value);
        self
    }

    pub fn with_max_parallel_tasks(mut self, max_parallel_tasks: usize) -> Self {
        self.max_parallel_tasks = max_parallel_tasks;
        self
    }

    /// Parse a workflow document from YAML
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut WorkflowStep> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    /// Resolve a step by its id path from the top level, e.g. `["fan_out", "left"]`
    pub fn nested_step_mut(&mut self, path: &[String]) -> Option<&mut WorkflowStep> {
        let (first, rest) = path.split_first()?;
        self.step_mut(first)?.descendant_mut(rest)
    }

    pub fn step_ids(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.id.clone()).collect()
    }

    /// Pending steps whose dependencies have all settled, in declaration order
    pub fn ready_steps(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|step| step.status == TaskStatus::Pending)
            .filter(|step| {
                step.depends_on
                    .iter()
                    .all(|dep| self.step(dep).is_some_and(WorkflowStep::is_settled))
            })
            .map(|step| step.id.clone())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(WorkflowStep::is_settled)
    }

    /// First step whose failure is fatal for the workflow
    pub fn fatal_failure(&self) -> Option<&WorkflowStep> {
        self.steps
            .iter()
            .find(|s| s.status == TaskStatus::Failed && s.on_failure == OnFailure::Fail)
    }

    /// Variables and context merged into one JSON object for template rendering
    pub fn template_data(&self) -> Value {
        let mut data = serde_json::Map::new();
        for (key, value) in self.context.iter().chain(self.variables.iter()) {
            data.insert(key.clone(), value.clone());
        }
        data.insert("context".to_string(), self.context.to_value());
        data.insert("variables".to_string(), self.variables.to_value());
        data.insert("workflow_id".to_string(), Value::String(self.id.clone()));
        data.insert("workflow_name".to_string(), Value::String(self.name.clone()));
        Value::Object(data)
    }

    pub fn progress(&self) -> WorkflowProgress {
        let count = |status: TaskStatus| self.steps.iter().filter(|s| s.status == status).count();
        let total = self.steps.len();
        let completed = count(TaskStatus::Completed);
        let percent_complete = if total > 0 {
            (completed as f64 / total as f64) * 100.0
        } else {
            0.0
        };

        WorkflowProgress {
            workflow_id: self.id.clone(),
            status: self.status,
            total_steps: total,
            completed_steps: completed,
            failed_steps: count(TaskStatus::Failed),
            running_steps: count(TaskStatus::Running),
            pending_steps: count(TaskStatus::Pending),
            cancelled_steps: count(TaskStatus::Cancelled),
            percent_complete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowProgress {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub running_steps: usize,
    pub pending_steps: usize,
    pub cancelled_steps: usize,
    pub percent_complete: f64,
}
