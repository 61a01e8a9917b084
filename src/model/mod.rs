// ABOUTME: Data model for tasks, executions and workflows
// ABOUTME: Exports the entities shared by the resolver, scheduler, executor and orchestrator

pub mod execution;
pub mod metadata;
pub mod task;
pub mod workflow;

pub use execution::{
    ExecutionErrorDetails, ExecutionLogEntry, ExecutionStatus, LogLevel, ResourceUsage,
    TaskExecution,
};
pub use metadata::Metadata;
pub use task::{RetryPolicy, Task, TaskPriority, TaskStatus};
pub use workflow::{
    Condition, ConditionOperator, ConditionSource, OnFailure, StepKind, StepType, TaskTemplate,
    Workflow, WorkflowProgress, WorkflowStatus, WorkflowStep,
};
