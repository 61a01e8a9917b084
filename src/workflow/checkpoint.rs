// ABOUTME: Workflow checkpoints capturing per-step state plus context and variables
// ABOUTME: Serializes to JSON so a workflow can be rebuilt and resumed after a restart

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::error::{EngineError, Result};
use crate::model::{Metadata, TaskStatus, Workflow, WorkflowStatus, WorkflowStep};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCheckpoint {
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub sub_steps: IndexMap<String, StepCheckpoint>,
}

impl StepCheckpoint {
    fn capture(step: &WorkflowStep) -> Self {
        Self {
            status: step.status,
            result: step.result.clone(),
            error: step.error.clone(),
            started_at: step.started_at,
            completed_at: step.completed_at,
            sub_steps: step
                .children()
                .into_iter()
                .map(|child| (child.id.clone(), Self::capture(child)))
                .collect(),
        }
    }

    fn apply(&self, step: &mut WorkflowStep) {
        step.status = self.status;
        step.result = self.result.clone();
        step.error = self.error.clone();
        step.started_at = self.started_at;
        step.completed_at = self.completed_at;
        for child in step.children_mut() {
            if let Some(saved) = self.sub_steps.get(&child.id) {
                saved.apply(child);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCheckpoint {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub steps: IndexMap<String, StepCheckpoint>,
    pub context: Metadata,
    pub variables: Metadata,
}

impl WorkflowCheckpoint {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| EngineError::Checkpoint(e.to_string()))
    }

    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data).map_err(|e| EngineError::Checkpoint(e.to_string()))
    }

    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| EngineError::Checkpoint(e.to_string()))
    }

    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| EngineError::Checkpoint(e.to_string()))
    }
}

impl Workflow {
    /// Snapshot step state, context and variables; also stored in `checkpoint_data`
    pub fn create_checkpoint(&mut self) -> Result<WorkflowCheckpoint> {
        let checkpoint = WorkflowCheckpoint {
            workflow_id: self.id.clone(),
            status: self.status,
            created_at: Utc::now(),
            steps: self
                .steps
                .iter()
                .map(|step| (step.id.clone(), StepCheckpoint::capture(step)))
                .collect(),
            context: self.context.clone(),
            variables: self.variables.clone(),
        };

        self.checkpoint_data = Some(checkpoint.to_value()?);
        Ok(checkpoint)
    }

    /// Apply a checkpoint; steps it does not mention keep their current state
    pub fn restore_from_checkpoint(&mut self, checkpoint: &WorkflowCheckpoint) -> Result<()> {
        if checkpoint.workflow_id != self.id {
            return Err(EngineError::Checkpoint(format!(
                "checkpoint belongs to workflow '{}', not '{}'",
                checkpoint.workflow_id, self.id
            )));
        }

        for step in &mut self.steps {
            if let Some(saved) = checkpoint.steps.get(&step.id) {
                saved.apply(step);
            }
        }

        self.context = checkpoint.context.clone();
        self.variables = checkpoint.variables.clone();
        self.status = checkpoint.status;
        self.checkpoint_data = Some(checkpoint.to_value()?);
        Ok(())
    }
}
