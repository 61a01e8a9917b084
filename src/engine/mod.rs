// ABOUTME: Task execution engine for taskweave
// ABOUTME: Handles dependency resolution, priority scheduling, agent dispatch and execution monitoring

pub mod agent;
pub mod context;
pub mod dependency;
pub mod error;
pub mod executor;
pub mod monitor;
pub mod scheduler;

pub use agent::{AgentExecutor, AgentInfo, AgentRegistry, BlockingAgent, FnAgent, WILDCARD_CAPABILITY};
pub use context::ExecutionContext;
pub use dependency::{DependencyGraphView, DependencyResolver, ExecutionPhase, ExecutionPlan};
pub use error::{AgentError, EngineError, Result};
pub use executor::{AgentStats, ExecutorStats, TaskExecutor};
pub use monitor::{ResourceSampler, SystemSampler};
pub use scheduler::TaskScheduler;
