// ABOUTME: Task executor running agent calls under a global concurrency limit
// ABOUTME: Handles timeouts, cancellation, retry backoff, execution history and resource sampling

use dashmap::{DashMap, DashSet};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::agent::AgentExecutor;
use super::context::ExecutionContext;
use super::error::{AgentError, EngineError, Result};
use super::monitor::ResourceSampler;
use super::scheduler::TaskScheduler;
use crate::model::{ExecutionErrorDetails, ExecutionStatus, Task, TaskExecution, TaskStatus};

struct RunningExecution {
    task_id: String,
    workflow_id: Option<String>,
    token: CancellationToken,
    cancel_reason: Option<String>,
    execution: TaskExecution,
}

struct PendingRetry {
    workflow_id: Option<String>,
    token: CancellationToken,
}

/// Removes a running execution when the attempt ends, however it ends
struct RunningGuard {
    running: Arc<DashMap<String, RunningExecution>>,
    execution_id: String,
}

impl RunningGuard {
    fn take(&self) -> Option<RunningExecution> {
        self.running.remove(&self.execution_id).map(|(_, entry)| entry)
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.remove(&self.execution_id);
    }
}

/// Marks a task as owned by a single attempt until dropped
struct ClaimGuard {
    claimed: Arc<DashSet<String>>,
    task_id: String,
}

impl ClaimGuard {
    fn acquire(claimed: &Arc<DashSet<String>>, task_id: &str) -> Result<Self> {
        if !claimed.insert(task_id.to_string()) {
            return Err(EngineError::validation(format!(
                "Task '{}' is already executing",
                task_id
            )));
        }
        Ok(Self {
            claimed: Arc::clone(claimed),
            task_id: task_id.to_string(),
        })
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.claimed.remove(&self.task_id);
    }
}

enum AttemptOutcome {
    Completed(Value),
    Failed(ExecutionErrorDetails),
    TimedOut(Duration),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    pub agent_id: String,
    pub total_executions: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub running: usize,
}

impl AgentStats {
    fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            total_executions: 0,
            succeeded: 0,
            failed: 0,
            success_rate: 0.0,
            running: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorStats {
    pub max_concurrent: usize,
    pub available_permits: usize,
    pub active_tasks: usize,
    pub running_executions: usize,
    pub pending_retries: usize,
}

impl ExecutorStats {
    pub fn utilization_percentage(&self) -> f64 {
        if self.max_concurrent == 0 {
            0.0
        } else {
            (self.active_tasks as f64 / self.max_concurrent as f64) * 100.0
        }
    }
}

pub struct TaskExecutor {
    scheduler: Arc<TaskScheduler>,
    max_concurrent: usize,
    semaphore: Arc<Semaphore>,
    default_timeout: Option<Duration>,
    running: Arc<DashMap<String, RunningExecution>>,
    claimed: Arc<DashSet<String>>,
    execution_counts: DashMap<String, u32>,
    history: DashMap<String, Vec<TaskExecution>>,
    agent_totals: DashMap<String, AgentStats>,
    pending_retries: DashMap<String, PendingRetry>,
    sampler: Option<Arc<dyn ResourceSampler>>,
}

impl TaskExecutor {
    /// Create a new executor allowing `max_concurrent` simultaneous agent calls
    pub fn new(scheduler: Arc<TaskScheduler>, max_concurrent: usize) -> Self {
        Self {
            scheduler,
            max_concurrent,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            default_timeout: None,
            running: Arc::new(DashMap::new()),
            claimed: Arc::new(DashSet::new()),
            execution_counts: DashMap::new(),
            history: DashMap::new(),
            agent_totals: DashMap::new(),
            pending_retries: DashMap::new(),
            sampler: None,
        }
    }

    /// Timeout applied to tasks that do not set their own
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn ResourceSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// Run one attempt; a retryable failure schedules a background retry through the queue
    pub async fn execute(self: &Arc<Self>, task: Task, agent_id: Option<&str>) -> Result<TaskExecution> {
        let task_id = self.ensure_registered(task).await?;
        self.execute_id(&task_id, agent_id).await
    }

    /// Run one attempt of an already registered task
    pub async fn execute_id(self: &Arc<Self>, task_id: &str, agent_id: Option<&str>) -> Result<TaskExecution> {
        let (execution, retry) = self.run_attempt(task_id, agent_id).await?;
        if let Some(delay) = retry {
            self.schedule_retry(task_id, delay).await;
        }
        Ok(execution)
    }

    /// Run attempts in-line until the task completes, is cancelled or exhausts its retries
    pub async fn execute_with_retries(
        self: &Arc<Self>,
        task: Task,
        agent_id: Option<&str>,
    ) -> Result<TaskExecution> {
        let task_id = self.ensure_registered(task).await?;

        loop {
            let (execution, retry) = self.run_attempt(&task_id, agent_id).await?;
            let Some(delay) = retry else {
                return Ok(execution);
            };

            let token = self.track_retry(&task_id).await;
            let resumed = self.wait_for_retry(&task_id, delay, &token).await;
            self.pending_retries.remove(&task_id);
            if !resumed {
                return Ok(execution);
            }
        }
    }

    /// Execute tasks concurrently; every input yields one execution, failures included
    pub async fn execute_batch(self: &Arc<Self>, tasks: Vec<Task>, agent_id: Option<&str>) -> Vec<TaskExecution> {
        if tasks.is_empty() {
            return Vec::new();
        }

        info!("Executing batch of {} tasks", tasks.len());

        let task_ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
        let handles = tasks.into_iter().map(|task| {
            let executor = Arc::clone(self);
            let agent_id = agent_id.map(str::to_string);
            tokio::spawn(async move { executor.execute(task, agent_id.as_deref()).await })
        });

        let results = join_all(handles).await;

        let executions: Vec<TaskExecution> = results
            .into_iter()
            .zip(task_ids)
            .map(|(result, task_id)| match result {
                Ok(Ok(execution)) => execution,
                Ok(Err(err)) => {
                    error!("Task {} could not be executed: {}", task_id, err);
                    self.failed_execution(&task_id, &err)
                }
                Err(join_error) => {
                    error!("Task join error: {}", join_error);
                    self.failed_execution(&task_id, &EngineError::from(join_error))
                }
            })
            .collect();

        info!("Batch execution completed. {} results", executions.len());
        executions
    }

    /// Cancel running executions and pending retries of a task
    pub fn cancel(&self, task_id: &str, reason: &str) -> bool {
        let mut cancelled = false;

        for mut entry in self.running.iter_mut() {
            if entry.task_id == task_id && !entry.token.is_cancelled() {
                entry.cancel_reason = Some(reason.to_string());
                entry.token.cancel();
                cancelled = true;
            }
        }

        if let Some(retry) = self.pending_retries.get(task_id) {
            retry.token.cancel();
            cancelled = true;
        }

        if cancelled {
            info!("Cancelling task {}: {}", task_id, reason);
        }
        cancelled
    }

    /// Cancel every running execution and pending retry belonging to a workflow
    pub fn cancel_workflow(&self, workflow_id: &str, reason: &str) -> usize {
        let mut cancelled = 0;

        for mut entry in self.running.iter_mut() {
            if entry.workflow_id.as_deref() == Some(workflow_id) && !entry.token.is_cancelled() {
                entry.cancel_reason = Some(reason.to_string());
                entry.token.cancel();
                cancelled += 1;
            }
        }

        for retry in self.pending_retries.iter() {
            if retry.workflow_id.as_deref() == Some(workflow_id) && !retry.token.is_cancelled() {
                retry.token.cancel();
                cancelled += 1;
            }
        }

        if cancelled > 0 {
            info!("Cancelled {} execution(s) of workflow {}", cancelled, workflow_id);
        }
        cancelled
    }

    pub fn executions(&self, task_id: &str) -> Vec<TaskExecution> {
        self.history
            .get(task_id)
            .map(|h| h.value().clone())
            .unwrap_or_default()
    }

    pub fn running_executions(&self) -> Vec<TaskExecution> {
        self.running.iter().map(|e| e.execution.clone()).collect()
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.claimed.contains(task_id)
    }

    /// Drop the execution history of a finished task
    pub fn forget(&self, task_id: &str) {
        if self.claimed.contains(task_id) {
            return;
        }
        self.history.remove(task_id);
        self.execution_counts.remove(task_id);
    }

    /// Per-agent totals over every finished execution, including forgotten tasks
    pub fn agent_statistics(&self) -> Vec<AgentStats> {
        let mut stats: BTreeMap<String, AgentStats> = self
            .agent_totals
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for running in self.running.iter() {
            let agent_id = &running.execution.executor_id;
            stats
                .entry(agent_id.clone())
                .or_insert_with(|| AgentStats::new(agent_id))
                .running += 1;
        }

        stats
            .into_values()
            .map(|mut agent| {
                if agent.total_executions > 0 {
                    agent.success_rate =
                        agent.succeeded as f64 / agent.total_executions as f64 * 100.0;
                }
                agent
            })
            .collect()
    }

    /// Get current resource usage statistics
    pub fn stats(&self) -> ExecutorStats {
        let available_permits = self.semaphore.available_permits();
        ExecutorStats {
            max_concurrent: self.max_concurrent,
            available_permits,
            active_tasks: self.max_concurrent.saturating_sub(available_permits),
            running_executions: self.running.len(),
            pending_retries: self.pending_retries.len(),
        }
    }

    /// Wait for all currently executing tasks to complete
    pub async fn wait_for_completion(&self) -> Result<()> {
        let _permits = self
            .semaphore
            .acquire_many(self.max_concurrent as u32)
            .await
            .map_err(|_| EngineError::Cancelled {
                reason: "executor is shut down".to_string(),
            })?;

        Ok(())
    }

    /// Stop pending retries and wait for running executions, then refuse new work
    pub async fn shutdown(&self, timeout_duration: Duration) -> Result<()> {
        info!("Shutting down task executor...");

        for retry in self.pending_retries.iter() {
            retry.token.cancel();
        }

        let outcome = match timeout(timeout_duration, self.wait_for_completion()).await {
            Ok(Ok(())) => {
                info!("Task executor shutdown completed successfully");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Error during executor shutdown: {}", e);
                Err(e)
            }
            Err(_) => {
                warn!("Executor shutdown timed out after {:?}", timeout_duration);
                for entry in self.running.iter() {
                    entry.token.cancel();
                }
                Err(EngineError::Timeout {
                    task_id: "executor".to_string(),
                    timeout: timeout_duration,
                })
            }
        };

        self.semaphore.close();
        outcome
    }

    /// Sample resources for running executions until `token` is cancelled
    pub fn spawn_resource_monitor(
        self: &Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let sampler = self.sampler.clone()?;
        let running = Arc::clone(&self.running);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if running.is_empty() {
                    continue;
                }

                let sampler = Arc::clone(&sampler);
                let usage = match tokio::task::spawn_blocking(move || sampler.sample()).await {
                    Ok(Some(usage)) => usage,
                    Ok(None) => {
                        debug!("Resource sample unavailable, skipping tick");
                        continue;
                    }
                    Err(e) => {
                        debug!("Resource sampler failed: {}", e);
                        continue;
                    }
                };

                for mut entry in running.iter_mut() {
                    entry.execution.record_usage(usage);
                }
            }
            debug!("Resource monitor stopped");
        }))
    }

    async fn ensure_registered(&self, task: Task) -> Result<String> {
        if self.scheduler.task(&task.id).await.is_some() {
            return Ok(task.id);
        }
        self.scheduler.register_task(task).await
    }

    /// Hand out the next execution number; only called while the task is claimed
    fn take_execution_number(&self, task_id: &str) -> u32 {
        let mut count = self.execution_counts.entry(task_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    fn failed_execution(&self, task_id: &str, err: &EngineError) -> TaskExecution {
        let last = self.execution_counts.get(task_id).map(|c| *c).unwrap_or(0);
        let mut execution = TaskExecution::new(task_id, last + 1, "", "");
        execution.fail(ExecutionErrorDetails {
            kind: err.kind().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
            details: None,
        });
        execution
    }

    fn select_agent(&self, task: &Task, requested: Option<&str>) -> Result<String> {
        let agents = self.scheduler.agents();

        if let Some(agent_id) = requested {
            if !agents.contains(agent_id) {
                return Err(EngineError::AgentUnavailable {
                    reason: format!("agent '{}' is not registered", agent_id),
                });
            }
            if !agents.can_handle(agent_id, &task.task_type) {
                return Err(EngineError::AgentUnavailable {
                    reason: format!(
                        "agent '{}' cannot handle task type '{}'",
                        agent_id, task.task_type
                    ),
                });
            }
            return Ok(agent_id.to_string());
        }

        if let Some(assigned) = task
            .assigned_to
            .as_deref()
            .filter(|id| agents.can_handle(id, &task.task_type))
        {
            return Ok(assigned.to_string());
        }

        agents
            .least_loaded(&task.task_type)
            .ok_or_else(|| EngineError::AgentUnavailable {
                reason: format!("no agent can handle task type '{}'", task.task_type),
            })
    }

    async fn prepare(&self, task_id: &str) -> Result<Task> {
        let task = self
            .scheduler
            .task(task_id)
            .await
            .ok_or_else(|| EngineError::TaskNotFound {
                task_id: task_id.to_string(),
            })?;

        match task.status {
            TaskStatus::Pending | TaskStatus::Ready | TaskStatus::Retrying => Ok(task),
            TaskStatus::Failed => {
                self.scheduler
                    .update_task_status(task_id, TaskStatus::Pending)
                    .await?;
                self.scheduler
                    .task(task_id)
                    .await
                    .ok_or_else(|| EngineError::TaskNotFound {
                        task_id: task_id.to_string(),
                    })
            }
            status => Err(EngineError::validation(format!(
                "Task '{}' cannot be executed while {}",
                task_id, status
            ))),
        }
    }

    async fn acquire_permit(&self, token: &CancellationToken) -> Result<Option<OwnedSemaphorePermit>> {
        tokio::select! {
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.map(Some).map_err(|_| EngineError::Cancelled {
                    reason: "executor is shut down".to_string(),
                })
            }
            _ = token.cancelled() => Ok(None),
        }
    }

    fn update_running(&self, execution_id: &str, f: impl FnOnce(&mut TaskExecution)) {
        if let Some(mut entry) = self.running.get_mut(execution_id) {
            f(&mut entry.execution);
        }
    }

    fn record_totals(&self, execution: &TaskExecution) {
        let mut agent = self
            .agent_totals
            .entry(execution.executor_id.clone())
            .or_insert_with(|| AgentStats::new(&execution.executor_id));
        agent.total_executions += 1;
        match execution.status {
            ExecutionStatus::Completed => agent.succeeded += 1,
            ExecutionStatus::Failed | ExecutionStatus::Timeout => agent.failed += 1,
            _ => {}
        }
    }

    /// One attempt; returns the finished execution and the retry delay when a retry is due
    #[instrument(skip(self))]
    async fn run_attempt(
        &self,
        task_id: &str,
        agent_id: Option<&str>,
    ) -> Result<(TaskExecution, Option<Duration>)> {
        let _claim = ClaimGuard::acquire(&self.claimed, task_id)?;
        let task = self.prepare(task_id).await?;
        let agent_id = self.select_agent(&task, agent_id)?;
        let agents = self.scheduler.agents();
        let agent: Arc<dyn AgentExecutor> =
            agents
                .executor(&agent_id)
                .ok_or_else(|| EngineError::AgentUnavailable {
                    reason: format!("agent '{}' is not registered", agent_id),
                })?;
        let agent_type = agents.agent_type(&agent_id).unwrap_or_default();
        self.scheduler.assign(task_id, &agent_id).await?;

        let attempt = self.run_assigned(task, &agent_id, agent, agent_type).await;
        if attempt.is_err() {
            self.scheduler.release_assignment(task_id).await;
        }
        attempt
    }

    async fn run_assigned(
        &self,
        task: Task,
        agent_id: &str,
        agent: Arc<dyn AgentExecutor>,
        agent_type: String,
    ) -> Result<(TaskExecution, Option<Duration>)> {
        let owned_id = task.id.clone();
        let task_id = owned_id.as_str();
        let execution_number = self.take_execution_number(task_id);
        let execution = TaskExecution::new(task_id, execution_number, agent_id, agent_type);
        let execution_id = execution.id.clone();
        let token = CancellationToken::new();

        self.running.insert(
            execution_id.clone(),
            RunningExecution {
                task_id: task_id.to_string(),
                workflow_id: task.workflow_id.clone(),
                token: token.clone(),
                cancel_reason: None,
                execution,
            },
        );
        let guard = RunningGuard {
            running: Arc::clone(&self.running),
            execution_id: execution_id.clone(),
        };

        let outcome = match self.acquire_permit(&token).await? {
            None => AttemptOutcome::Cancelled,
            Some(permit) => {
                self.update_running(&execution_id, TaskExecution::mark_starting);
                self.scheduler
                    .update_task_status(task_id, TaskStatus::Running)
                    .await?;
                self.update_running(&execution_id, TaskExecution::mark_running);

                info!(
                    "Executing task {} on agent {} (attempt {})",
                    task_id, agent_id, execution_number
                );

                let ctx = ExecutionContext::for_task(&task, agent_id, &execution_id, execution_number)
                    .with_cancellation(token.child_token());
                let limit = task.timeout.or(self.default_timeout);
                let outcome = self.invoke(agent, task, ctx, limit, &token).await;
                drop(permit);
                outcome
            }
        };

        let (mut execution, cancel_reason) = match guard.take() {
            Some(entry) => (entry.execution, entry.cancel_reason),
            None => {
                return Err(EngineError::Execution {
                    task_id: task_id.to_string(),
                    message: "execution record disappeared".to_string(),
                    retryable: false,
                })
            }
        };

        let retry = self
            .finish_attempt(task_id, &mut execution, outcome, cancel_reason)
            .await;

        self.record_totals(&execution);
        self.history
            .entry(task_id.to_string())
            .or_default()
            .push(execution.clone());

        Ok((execution, retry))
    }

    async fn invoke(
        &self,
        agent: Arc<dyn AgentExecutor>,
        task: Task,
        ctx: ExecutionContext,
        limit: Option<Duration>,
        token: &CancellationToken,
    ) -> AttemptOutcome {
        let mut handle: JoinHandle<std::result::Result<Value, AgentError>> =
            tokio::spawn(async move { agent.execute(task, ctx).await });

        let raced = tokio::select! {
            _ = token.cancelled() => None,
            joined = join_with_timeout(&mut handle, limit) => Some(joined),
        };

        match raced {
            None => {
                handle.abort();
                AttemptOutcome::Cancelled
            }
            Some(None) => {
                handle.abort();
                token.cancel();
                AttemptOutcome::TimedOut(limit.unwrap_or_default())
            }
            Some(Some(Ok(Ok(value)))) => AttemptOutcome::Completed(value),
            Some(Some(Ok(Err(err)))) => AttemptOutcome::Failed(ExecutionErrorDetails {
                kind: "agent".to_string(),
                message: err.message,
                retryable: err.retryable,
                details: err.details,
            }),
            Some(Some(Err(join_error))) => AttemptOutcome::Failed(ExecutionErrorDetails {
                kind: if join_error.is_panic() { "panic" } else { "join" }.to_string(),
                message: format!("agent task failed: {}", join_error),
                retryable: false,
                details: None,
            }),
        }
    }

    async fn finish_attempt(
        &self,
        task_id: &str,
        execution: &mut TaskExecution,
        outcome: AttemptOutcome,
        cancel_reason: Option<String>,
    ) -> Option<Duration> {
        let (status, retryable) = match outcome {
            AttemptOutcome::Completed(value) => {
                execution.complete(value.clone());
                self.store_outcome(task_id, |task| {
                    task.result = Some(value);
                    task.error = None;
                })
                .await;
                info!("Task {} completed", task_id);
                (TaskStatus::Completed, false)
            }
            AttemptOutcome::TimedOut(limit) => {
                execution.time_out(limit);
                let message = format!("Task timed out after {:?}", limit);
                warn!("Task {} timed out after {:?}", task_id, limit);
                self.store_outcome(task_id, |task| task.error = Some(message)).await;
                (TaskStatus::Failed, true)
            }
            AttemptOutcome::Failed(details) => {
                warn!("Task {} failed: {}", task_id, details.message);
                let message = details.message.clone();
                let retryable = details.retryable;
                execution.fail(details);
                self.store_outcome(task_id, |task| task.error = Some(message)).await;
                (TaskStatus::Failed, retryable)
            }
            AttemptOutcome::Cancelled => {
                let reason = cancel_reason.unwrap_or_else(|| "cancelled".to_string());
                info!("Task {} cancelled: {}", task_id, reason);
                execution.cancel(reason.clone());
                self.store_outcome(task_id, |task| task.error = Some(reason)).await;
                (TaskStatus::Cancelled, false)
            }
        };

        if let Err(e) = self.scheduler.update_task_status(task_id, status).await {
            warn!("Could not record status {} for task {}: {}", status, task_id, e);
            return None;
        }

        if status != TaskStatus::Failed || !retryable {
            return None;
        }

        let delay = self
            .scheduler
            .modify_task(task_id, |task| {
                if !task.can_retry() {
                    return None;
                }
                let delay = task.retry_policy().delay_for(task.retry_count);
                task.retry_count += 1;
                task.transition_to(TaskStatus::Retrying).ok()?;
                Some(delay)
            })
            .await
            .ok()
            .flatten();

        if let Some(delay) = delay {
            debug!("Task {} will retry in {:?}", task_id, delay);
        } else {
            error!("Task {} failed permanently", task_id);
        }
        delay
    }

    async fn store_outcome(&self, task_id: &str, f: impl FnOnce(&mut Task)) {
        if let Err(e) = self.scheduler.modify_task(task_id, f).await {
            warn!("Could not record outcome of task {}: {}", task_id, e);
        }
    }

    async fn track_retry(&self, task_id: &str) -> CancellationToken {
        let workflow_id = self
            .scheduler
            .task(task_id)
            .await
            .and_then(|t| t.workflow_id);
        let token = CancellationToken::new();
        if let Some(previous) = self.pending_retries.insert(
            task_id.to_string(),
            PendingRetry {
                workflow_id,
                token: token.clone(),
            },
        ) {
            previous.token.cancel();
        }
        token
    }

    /// Sleep out the backoff; false when cancelled, in which case the task is CANCELLED
    async fn wait_for_retry(&self, task_id: &str, delay: Duration, token: &CancellationToken) -> bool {
        let status = tokio::select! {
            _ = token.cancelled() => TaskStatus::Cancelled,
            _ = tokio::time::sleep(delay) => TaskStatus::Pending,
        };

        if let Err(e) = self.scheduler.update_task_status(task_id, status).await {
            warn!("Could not move task {} to {}: {}", task_id, status, e);
            return false;
        }
        status == TaskStatus::Pending
    }

    async fn schedule_retry(self: &Arc<Self>, task_id: &str, delay: Duration) {
        let token = self.track_retry(task_id).await;
        let executor = Arc::clone(self);
        let task_id = task_id.to_string();

        tokio::spawn(async move {
            let resumed = executor.wait_for_retry(&task_id, delay, &token).await;
            executor.pending_retries.remove(&task_id);
            if resumed {
                if let Err(e) = executor.scheduler.requeue(&task_id).await {
                    warn!("Could not requeue task {}: {}", task_id, e);
                }
            }
        });
    }
}

async fn join_with_timeout<T>(
    handle: &mut JoinHandle<T>,
    limit: Option<Duration>,
) -> Option<std::result::Result<T, JoinError>> {
    match limit {
        Some(limit) => timeout(limit, handle).await.ok(),
        None => Some(handle.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::agent::{AgentRegistry, FnAgent};
    use crate::engine::dependency::DependencyResolver;
    use serde_json::json;
    use tokio::sync::RwLock;

    fn executor(max_concurrent: usize) -> Arc<TaskExecutor> {
        let scheduler = Arc::new(TaskScheduler::new(
            Arc::new(RwLock::new(DependencyResolver::new())),
            Arc::new(AgentRegistry::new()),
        ));
        Arc::new(TaskExecutor::new(scheduler, max_concurrent))
    }

    #[tokio::test]
    async fn test_executor_creation() {
        let executor = executor(4);
        let stats = executor.stats();
        assert_eq!(stats.max_concurrent, 4);
        assert_eq!(stats.available_permits, 4);
        assert_eq!(stats.utilization_percentage(), 0.0);
    }

    #[tokio::test]
    async fn test_missing_agent_is_reported() {
        let executor = executor(1);
        let err = executor
            .execute(Task::new("orphan", "nobody"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AgentUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_successful_execution_records_history() {
        let executor = executor(2);
        executor.scheduler().register_agent(
            "echo",
            "worker",
            ["echo"],
            Arc::new(FnAgent::new(|task: Task, ctx: ExecutionContext| async move {
                Ok(json!({ "name": task.name, "attempt": ctx.attempt }))
            })),
        );

        let task = Task::new("hello", "echo");
        let task_id = task.id.clone();
        let execution = executor.execute(task, None).await.unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.result, Some(json!({ "name": "hello", "attempt": 1 })));
        assert_eq!(execution.executor_id, "echo");

        let task = executor.scheduler().task(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.assigned_to.is_none());
        assert_eq!(executor.executions(&task_id).len(), 1);
        assert_eq!(executor.scheduler().agents().workload("echo"), Some(0));

        let stats = executor.agent_statistics();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].succeeded, 1);
        assert_eq!(stats[0].success_rate, 100.0);
    }

    #[tokio::test]
    async fn test_panicking_agent_becomes_failed_execution() {
        let executor = executor(1);
        executor.scheduler().register_agent(
            "crashy",
            "worker",
            ["*"],
            Arc::new(FnAgent::new(|_task: Task, _ctx| async move {
                if true {
                    panic!("boom");
                }
                Ok(json!(null))
            })),
        );

        let execution = executor
            .execute(Task::new("explode", "any"), None)
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.error.unwrap().kind, "panic");
    }
}
