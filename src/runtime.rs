// ABOUTME: Runtime facade wiring resolver, scheduler, executor and orchestrator together
// ABOUTME: Owns the background dispatcher, rebalancer and resource monitor lifecycle

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cli::Config;
use crate::engine::{
    AgentExecutor, AgentRegistry, DependencyGraphView, DependencyResolver, EngineError,
    ExecutionPlan, ExecutorStats, Result, SystemSampler, TaskExecutor, TaskScheduler,
};
use crate::model::{Task, TaskExecution, Workflow};
use crate::workflow::{OrchestratorConfig, WorkflowCheckpoint, WorkflowOrchestrator};

/// Single entry point for submitting tasks, running workflows and managing agents
pub struct Runtime {
    config: Config,
    scheduler: Arc<TaskScheduler>,
    executor: Arc<TaskExecutor>,
    orchestrator: WorkflowOrchestrator,
    background: Mutex<Option<Background>>,
}

struct Background {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("max_concurrent_tasks", &self.config.max_concurrent_tasks)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Runtime {
    pub fn new(config: Config) -> Self {
        let resolver = Arc::new(RwLock::new(DependencyResolver::new()));
        let agents = Arc::new(AgentRegistry::new());
        let scheduler = Arc::new(TaskScheduler::new(resolver, agents));

        let mut executor = TaskExecutor::new(Arc::clone(&scheduler), config.max_concurrent_tasks)
            .with_default_timeout(config.default_task_timeout);
        if config.resource_monitoring {
            executor = executor.with_sampler(Arc::new(SystemSampler::new()));
        }
        let executor = Arc::new(executor);

        let orchestrator = WorkflowOrchestrator::new(
            Arc::clone(&executor),
            OrchestratorConfig {
                max_concurrent_workflows: config.max_concurrent_workflows,
                wait_poll_interval: config.wait_poll_interval,
                ..OrchestratorConfig::default()
            },
        );

        Self {
            config,
            scheduler,
            executor,
            orchestrator,
            background: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }

    pub fn orchestrator(&self) -> &WorkflowOrchestrator {
        &self.orchestrator
    }

    /// Validate and queue a task; the dispatcher runs it once dependencies complete
    pub async fn submit_task(&self, task: Task) -> Result<String> {
        self.scheduler.add_task(task).await
    }

    pub async fn task(&self, task_id: &str) -> Option<Task> {
        self.scheduler.task(task_id).await
    }

    /// Run a single attempt of a registered task right away
    pub async fn execute_task(&self, task_id: &str, agent_id: Option<&str>) -> Result<TaskExecution> {
        self.executor.execute_id(task_id, agent_id).await
    }

    /// Run a task, retrying in-line until it completes or its retries run out
    pub async fn execute_task_with_retries(
        &self,
        task: Task,
        agent_id: Option<&str>,
    ) -> Result<TaskExecution> {
        self.executor.execute_with_retries(task, agent_id).await
    }

    pub fn executions(&self, task_id: &str) -> Vec<TaskExecution> {
        self.executor.executions(task_id)
    }

    /// Cancel a running or waiting task; false when there was nothing to cancel
    pub async fn cancel_task(&self, task_id: &str, reason: &str) -> Result<bool> {
        if self.executor.cancel(task_id, reason) {
            return Ok(true);
        }
        self.scheduler.cancel_task(task_id).await
    }

    pub fn register_agent<I, S>(
        &self,
        agent_id: impl Into<String>,
        agent_type: impl Into<String>,
        capabilities: I,
        executor: Arc<dyn AgentExecutor>,
    ) where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scheduler
            .register_agent(agent_id, agent_type, capabilities, executor);
    }

    pub fn unregister_agent(&self, agent_id: &str) -> bool {
        self.scheduler.unregister_agent(agent_id)
    }

    pub async fn execution_order(&self, task_ids: Option<&[String]>) -> Result<Vec<String>> {
        self.scheduler.resolver().read().await.execution_order(task_ids)
    }

    pub async fn dependency_graph(&self) -> DependencyGraphView {
        self.scheduler.resolver().read().await.dependency_graph()
    }

    pub async fn optimize_execution_plan(&self, task_ids: Option<&[String]>) -> Result<ExecutionPlan> {
        self.scheduler
            .resolver()
            .read()
            .await
            .optimize_execution_plan(task_ids)
    }

    pub async fn execute_workflow(&self, workflow: Workflow) -> Result<Workflow> {
        self.orchestrator.execute_workflow(workflow).await
    }

    pub async fn pause_workflow(&self, workflow_id: &str) -> Result<()> {
        self.orchestrator.pause_workflow(workflow_id).await
    }

    pub async fn resume_workflow(&self, workflow_id: &str) -> Result<Workflow> {
        self.orchestrator.resume_workflow(workflow_id).await
    }

    pub async fn cancel_workflow(&self, workflow_id: &str) -> Result<()> {
        self.orchestrator.cancel_workflow(workflow_id).await
    }

    pub async fn workflow_status(&self, workflow_id: &str) -> Result<Workflow> {
        self.orchestrator.workflow_status(workflow_id).await
    }

    pub async fn create_checkpoint(&self, workflow_id: &str) -> Result<WorkflowCheckpoint> {
        self.orchestrator.create_checkpoint(workflow_id).await
    }

    pub async fn restore_workflow(
        &self,
        workflow: Workflow,
        checkpoint: &WorkflowCheckpoint,
    ) -> Result<String> {
        self.orchestrator.restore_workflow(workflow, checkpoint).await
    }

    pub fn stats(&self) -> ExecutorStats {
        self.executor.stats()
    }

    /// Summary of agents, queue and executor state for diagnostics
    pub async fn status(&self) -> Value {
        let agents = self.scheduler.agent_info();
        serde_json::json!({
            "running": self.is_running(),
            "queued": self.scheduler.queue_len().await,
            "agents": agents,
            "executor": self.executor.stats(),
            "agent_statistics": self.executor.agent_statistics(),
            "active_workflows": self.orchestrator.active_workflows(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.background.lock().is_some()
    }

    /// Start dispatching queued tasks plus the rebalancer and resource monitor
    pub fn start(&self) -> Result<()> {
        let mut background = self.background.lock();
        if background.is_some() {
            return Err(EngineError::validation("runtime is already started"));
        }

        let token = CancellationToken::new();
        let mut handles = vec![tokio::spawn(dispatch_loop(
            Arc::clone(&self.scheduler),
            Arc::clone(&self.executor),
            self.config.wait_poll_interval,
            token.clone(),
        ))];
        handles.push(
            self.scheduler
                .spawn_rebalancer(self.config.rebalance_interval, token.clone()),
        );
        if let Some(monitor) = self
            .executor
            .spawn_resource_monitor(self.config.resource_sample_interval, token.clone())
        {
            handles.push(monitor);
        }

        info!("Runtime started with {} background task(s)", handles.len());
        *background = Some(Background { token, handles });
        Ok(())
    }

    /// Stop background loops and drain running executions within `timeout`
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let background = self.background.lock().take();
        if let Some(background) = background {
            background.token.cancel();
            for handle in background.handles {
                if let Err(e) = handle.await {
                    warn!("Background task ended abnormally: {}", e);
                }
            }
        }

        self.executor.shutdown(timeout).await?;
        info!("Runtime shut down");
        Ok(())
    }
}

async fn dispatch_loop(
    scheduler: Arc<TaskScheduler>,
    executor: Arc<TaskExecutor>,
    poll_interval: Duration,
    token: CancellationToken,
) {
    loop {
        let mut unplaceable = Vec::new();

        while let Some(task) = scheduler.get_next_task(None).await {
            let Some(agent_id) = scheduler.least_loaded_agent(&task.task_type) else {
                debug!("No agent for task {} of type {}", task.id, task.task_type);
                unplaceable.push(task.id);
                continue;
            };

            let executor = Arc::clone(&executor);
            tokio::spawn(async move {
                if let Err(e) = executor.execute_id(&task.id, Some(&agent_id)).await {
                    warn!("Dispatch of task {} failed: {}", task.id, e);
                }
            });
        }

        for task_id in unplaceable {
            if let Err(e) = scheduler.defer(&task_id).await {
                warn!("Could not return task {} to the queue: {}", task_id, e);
            }
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = scheduler.wait_for_work() => {}
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
    debug!("Dispatcher stopped");
}
