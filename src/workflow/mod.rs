// ABOUTME: Workflow orchestration layer built on the task engine
// ABOUTME: Provides step graph validation, conditions, templating, checkpoints and the orchestrator

pub mod checkpoint;
pub mod condition;
pub mod graph;
pub mod orchestrator;
pub mod template;

pub use checkpoint::{StepCheckpoint, WorkflowCheckpoint};
pub use condition::{evaluate, ConditionScope};
pub use graph::StepGraph;
pub use orchestrator::{OrchestratorConfig, WorkflowOrchestrator};
pub use template::TemplateRenderer;
