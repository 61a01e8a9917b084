// ABOUTME: Main library module for taskweave
// ABOUTME: Exports the task model, execution engine, workflow orchestrator and runtime facade

pub mod cli;
pub mod engine;
pub mod model;
pub mod runtime;
pub mod workflow;

// Re-export commonly used types
pub use cli::{App, Args, Config};
pub use engine::{
    AgentError, AgentExecutor, BlockingAgent, DependencyResolver, EngineError, ExecutionContext,
    FnAgent, TaskExecutor, TaskScheduler,
};
pub use model::{Task, TaskExecution, TaskPriority, TaskStatus, Workflow, WorkflowStatus, WorkflowStep};
pub use runtime::Runtime;
pub use workflow::{WorkflowCheckpoint, WorkflowOrchestrator};

pub type Result<T> = anyhow::Result<T>;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
