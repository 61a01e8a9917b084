// ABOUTME: Workflow orchestrator driving step graphs through the task executor
// ABOUTME: Admits ready steps up to the parallel limit and supports pause, resume, cancel and checkpoints

use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::checkpoint::WorkflowCheckpoint;
use super::condition::{evaluate, ConditionScope};
use super::graph::StepGraph;
use super::template::TemplateRenderer;
use crate::engine::error::{EngineError, Result};
use crate::engine::executor::TaskExecutor;
use crate::model::{
    Condition, ExecutionStatus, OnFailure, StepKind, TaskStatus, TaskTemplate, Workflow,
    WorkflowProgress, WorkflowStatus, WorkflowStep,
};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_concurrent_workflows: usize,
    pub wait_poll_interval: Duration,
    pub auto_checkpoint: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: 10,
            wait_poll_interval: Duration::from_millis(100),
            auto_checkpoint: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Run,
    Pause,
    Cancel,
}

enum StepOutcome {
    Completed(Option<Value>),
    Failed(String),
    Interrupted,
}

struct WorkflowHandle {
    id: String,
    state: RwLock<Workflow>,
    control: Mutex<Control>,
    token: Mutex<CancellationToken>,
    last_result: Mutex<Option<Value>>,
    active: AtomicBool,
}

impl WorkflowHandle {
    fn new(workflow: Workflow) -> Self {
        Self {
            id: workflow.id.clone(),
            state: RwLock::new(workflow),
            control: Mutex::new(Control::Run),
            token: Mutex::new(CancellationToken::new()),
            last_result: Mutex::new(None),
            active: AtomicBool::new(false),
        }
    }

    fn control(&self) -> Control {
        *self.control.lock()
    }
}

pub struct WorkflowOrchestrator {
    executor: Arc<TaskExecutor>,
    renderer: TemplateRenderer,
    config: OrchestratorConfig,
    workflows: Mutex<HashMap<String, Arc<WorkflowHandle>>>,
}

impl WorkflowOrchestrator {
    pub fn new(executor: Arc<TaskExecutor>, config: OrchestratorConfig) -> Self {
        Self {
            executor,
            renderer: TemplateRenderer::new(),
            config,
            workflows: Mutex::new(HashMap::new()),
        }
    }

    /// Run a workflow to a terminal or paused state and return the final snapshot
    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.id, workflow_name = %workflow.name))]
    pub async fn execute_workflow(&self, mut workflow: Workflow) -> Result<Workflow> {
        StepGraph::validate(&workflow.steps)?;

        for step in &mut workflow.steps {
            if step.status == TaskStatus::Running {
                step.reset();
            }
        }
        workflow.status = WorkflowStatus::Running;
        workflow.started_at = Some(Utc::now());
        workflow.completed_at = None;
        workflow.error = None;

        let handle = {
            let mut workflows = self.workflows.lock();
            if workflows
                .get(&workflow.id)
                .is_some_and(|h| h.active.load(Ordering::SeqCst))
            {
                return Err(EngineError::validation(format!(
                    "Workflow '{}' is already running",
                    workflow.id
                )));
            }
            self.check_capacity(&workflows)?;

            let handle = Arc::new(WorkflowHandle::new(workflow));
            handle.active.store(true, Ordering::SeqCst);
            workflows.insert(handle.id.clone(), Arc::clone(&handle));
            handle
        };

        info!("Starting workflow {}", handle.id);
        Ok(self.drive(&handle).await)
    }

    /// Continue a paused or restored workflow
    pub async fn resume_workflow(&self, workflow_id: &str) -> Result<Workflow> {
        let handle = {
            let workflows = self.workflows.lock();
            let handle = workflows
                .get(workflow_id)
                .cloned()
                .ok_or_else(|| EngineError::WorkflowNotFound {
                    workflow_id: workflow_id.to_string(),
                })?;

            if handle.active.load(Ordering::SeqCst) {
                return Err(EngineError::validation(format!(
                    "Workflow '{}' is already running",
                    workflow_id
                )));
            }
            if handle.control() == Control::Cancel {
                return Err(EngineError::validation(format!(
                    "Workflow '{}' was cancelled",
                    workflow_id
                )));
            }
            self.check_capacity(&workflows)?;
            handle.active.store(true, Ordering::SeqCst);
            handle
        };

        {
            let mut workflow = handle.state.write().await;
            if workflow.status.is_terminal() {
                handle.active.store(false, Ordering::SeqCst);
                return Err(EngineError::validation(format!(
                    "Workflow '{}' already finished as {}",
                    workflow_id, workflow.status
                )));
            }
            for step in &mut workflow.steps {
                if step.status == TaskStatus::Running {
                    step.reset();
                }
            }
            workflow.status = WorkflowStatus::Running;
            if workflow.started_at.is_none() {
                workflow.started_at = Some(Utc::now());
            }
        }

        *handle.control.lock() = Control::Run;
        *handle.token.lock() = CancellationToken::new();

        info!("Resuming workflow {}", workflow_id);
        Ok(self.drive(&handle).await)
    }

    /// Stop admitting steps and interrupt in-flight tasks; interrupted steps return to PENDING
    pub async fn pause_workflow(&self, workflow_id: &str) -> Result<()> {
        let handle = self.handle(workflow_id)?;
        self.interrupt(&handle, Control::Pause, WorkflowStatus::Paused, "workflow paused")
            .await
    }

    /// Terminally cancel a workflow and its in-flight tasks
    pub async fn cancel_workflow(&self, workflow_id: &str) -> Result<()> {
        let handle = self.handle(workflow_id)?;
        self.interrupt(&handle, Control::Cancel, WorkflowStatus::Cancelled, "workflow cancelled")
            .await
    }

    pub async fn workflow_status(&self, workflow_id: &str) -> Result<Workflow> {
        let handle = self.handle(workflow_id)?;
        let workflow = handle.state.read().await.clone();
        Ok(workflow)
    }

    pub async fn progress(&self, workflow_id: &str) -> Result<WorkflowProgress> {
        let handle = self.handle(workflow_id)?;
        let progress = handle.state.read().await.progress();
        Ok(progress)
    }

    pub fn workflow_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workflows.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn active_workflows(&self) -> usize {
        self.workflows
            .lock()
            .values()
            .filter(|h| h.active.load(Ordering::SeqCst))
            .count()
    }

    pub async fn create_checkpoint(&self, workflow_id: &str) -> Result<WorkflowCheckpoint> {
        let handle = self.handle(workflow_id)?;
        let mut workflow = handle.state.write().await;
        workflow.create_checkpoint()
    }

    /// Register `workflow` with state restored from `checkpoint`; call `resume_workflow` to continue it
    pub async fn restore_workflow(
        &self,
        mut workflow: Workflow,
        checkpoint: &WorkflowCheckpoint,
    ) -> Result<String> {
        StepGraph::validate(&workflow.steps)?;
        workflow.restore_from_checkpoint(checkpoint)?;

        let paused = workflow.status == WorkflowStatus::Paused;
        let cancelled = workflow.status == WorkflowStatus::Cancelled;
        let workflow_id = workflow.id.clone();

        let mut workflows = self.workflows.lock();
        if workflows
            .get(&workflow_id)
            .is_some_and(|h| h.active.load(Ordering::SeqCst))
        {
            return Err(EngineError::validation(format!(
                "Workflow '{}' is already running",
                workflow_id
            )));
        }

        let handle = WorkflowHandle::new(workflow);
        if paused {
            *handle.control.lock() = Control::Pause;
        } else if cancelled {
            *handle.control.lock() = Control::Cancel;
        }
        workflows.insert(workflow_id.clone(), Arc::new(handle));

        info!("Restored workflow {} from checkpoint", workflow_id);
        Ok(workflow_id)
    }

    fn handle(&self, workflow_id: &str) -> Result<Arc<WorkflowHandle>> {
        self.workflows
            .lock()
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| EngineError::WorkflowNotFound {
                workflow_id: workflow_id.to_string(),
            })
    }

    fn check_capacity(&self, workflows: &HashMap<String, Arc<WorkflowHandle>>) -> Result<()> {
        let active = workflows
            .values()
            .filter(|h| h.active.load(Ordering::SeqCst))
            .count();
        if active >= self.config.max_concurrent_workflows {
            return Err(EngineError::Capacity {
                resource: "concurrent workflows".to_string(),
                limit: self.config.max_concurrent_workflows,
            });
        }
        Ok(())
    }

    async fn interrupt(
        &self,
        handle: &WorkflowHandle,
        control: Control,
        idle_status: WorkflowStatus,
        reason: &str,
    ) -> Result<()> {
        {
            let workflow = handle.state.read().await;
            if workflow.status.is_terminal() {
                return Err(EngineError::validation(format!(
                    "Workflow '{}' already finished as {}",
                    handle.id, workflow.status
                )));
            }
        }

        *handle.control.lock() = control;
        handle.token.lock().cancel();
        self.executor.cancel_workflow(&handle.id, reason);
        info!("Workflow {}: {}", handle.id, reason);

        if !handle.active.load(Ordering::SeqCst) {
            let mut workflow = handle.state.write().await;
            workflow.status = idle_status;
            if control == Control::Cancel {
                for step in &mut workflow.steps {
                    if !step.status.is_terminal() && step.status != TaskStatus::Failed {
                        step.status = TaskStatus::Cancelled;
                    }
                }
                workflow.completed_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn drive(&self, handle: &Arc<WorkflowHandle>) -> Workflow {
        let token = handle.token.lock().clone();
        self.seed_last_result(handle).await;

        let mut in_flight = FuturesUnordered::new();

        loop {
            if token.is_cancelled() {
                break;
            }

            let (ready, limit) = {
                let workflow = handle.state.read().await;
                if workflow.fatal_failure().is_some() {
                    break;
                }
                (workflow.ready_steps(), workflow.max_parallel_tasks.max(1))
            };

            for step_id in ready {
                if in_flight.len() >= limit {
                    break;
                }
                let Some(step) = self.start_step(handle, &step_id).await else {
                    continue;
                };
                let token = token.clone();
                in_flight.push(async move {
                    let path = vec![step.id.clone()];
                    let outcome = self.execute_step(handle, &step, &path, &token).await;
                    (step.id, outcome)
                });
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                _ = token.cancelled() => break,
                Some((step_id, outcome)) = in_flight.next() => {
                    let fatal = self.finish_step(handle, &step_id, outcome).await;
                    if fatal {
                        token.cancel();
                        self.executor.cancel_workflow(&handle.id, "workflow failed");
                    }
                }
            }
        }

        if !in_flight.is_empty() {
            self.executor
                .cancel_workflow(&handle.id, "workflow interrupted");
            while let Some((step_id, outcome)) = in_flight.next().await {
                self.finish_step(handle, &step_id, outcome).await;
            }
        }

        self.finalize(handle).await
    }

    async fn seed_last_result(&self, handle: &WorkflowHandle) {
        let workflow = handle.state.read().await;
        let latest = workflow
            .steps
            .iter()
            .filter(|s| s.status == TaskStatus::Completed && s.result.is_some())
            .max_by_key(|s| s.completed_at)
            .and_then(|s| s.result.clone());
        *handle.last_result.lock() = latest;
    }

    async fn start_step(&self, handle: &WorkflowHandle, step_id: &str) -> Option<WorkflowStep> {
        let mut workflow = handle.state.write().await;
        let step = workflow.step_mut(step_id)?;
        step.reset();
        step.status = TaskStatus::Running;
        step.started_at = Some(Utc::now());
        debug!("Starting step {} ({:?})", step.id, step.step_type());
        Some(step.clone())
    }

    /// Record a finished top-level step; returns true when the failure is fatal
    async fn finish_step(&self, handle: &WorkflowHandle, step_id: &str, outcome: StepOutcome) -> bool {
        let control = handle.control();
        let mut workflow = handle.state.write().await;
        let Some(step) = workflow.step_mut(step_id) else {
            return false;
        };

        apply_outcome(step, &outcome, control);
        let fatal = matches!(outcome, StepOutcome::Failed(_)) && step.on_failure == OnFailure::Fail;
        match &outcome {
            StepOutcome::Completed(_) => info!("Step {} completed", step_id),
            StepOutcome::Failed(message) if fatal => warn!("Step {} failed: {}", step_id, message),
            StepOutcome::Failed(message) => {
                info!("Step {} failed and is skipped: {}", step_id, message)
            }
            StepOutcome::Interrupted => debug!("Step {} interrupted", step_id),
        }

        if self.config.auto_checkpoint {
            if let Err(e) = workflow.create_checkpoint() {
                warn!("Checkpoint for workflow {} failed: {}", handle.id, e);
            }
        }
        fatal
    }

    async fn finalize(&self, handle: &WorkflowHandle) -> Workflow {
        let control = handle.control();
        let mut workflow = handle.state.write().await;

        match control {
            Control::Cancel => {
                workflow.status = WorkflowStatus::Cancelled;
                for step in &mut workflow.steps {
                    if matches!(step.status, TaskStatus::Pending | TaskStatus::Running) {
                        step.status = TaskStatus::Cancelled;
                    }
                }
            }
            Control::Pause => {
                workflow.status = WorkflowStatus::Paused;
                for step in &mut workflow.steps {
                    if step.status == TaskStatus::Running {
                        step.reset();
                    }
                }
            }
            Control::Run => {
                if let Some(failed) = workflow.fatal_failure() {
                    let message = format!(
                        "Step '{}' failed: {}",
                        failed.id,
                        failed.error.as_deref().unwrap_or("unknown error")
                    );
                    workflow.status = WorkflowStatus::Failed;
                    workflow.error = Some(message);
                } else if workflow.is_complete() {
                    workflow.status = WorkflowStatus::Completed;
                } else {
                    workflow.status = WorkflowStatus::Failed;
                    workflow.error = Some("Workflow has steps that can never become ready".to_string());
                }
            }
        }

        if workflow.status.is_terminal() {
            workflow.completed_at = Some(Utc::now());
        }
        if self.config.auto_checkpoint {
            if let Err(e) = workflow.create_checkpoint() {
                warn!("Checkpoint for workflow {} failed: {}", handle.id, e);
            }
        }

        handle.active.store(false, Ordering::SeqCst);
        info!("Workflow {} finished as {}", handle.id, workflow.status);
        workflow.clone()
    }

    /// Run a sub-step and record its outcome at `parent` + its id in the step tree
    async fn run_child(
        &self,
        handle: &WorkflowHandle,
        parent: &[String],
        child: &WorkflowStep,
        token: &CancellationToken,
    ) -> StepOutcome {
        let mut path = parent.to_vec();
        path.push(child.id.clone());

        {
            let mut workflow = handle.state.write().await;
            if let Some(step) = workflow.nested_step_mut(&path) {
                step.reset();
                step.status = TaskStatus::Running;
                step.started_at = Some(Utc::now());
            }
        }

        let outcome = self.execute_step(handle, child, &path, token).await;

        let control = handle.control();
        let mut workflow = handle.state.write().await;
        if let Some(step) = workflow.nested_step_mut(&path) {
            apply_outcome(step, &outcome, control);
        }
        outcome
    }

    fn execute_step<'a>(
        &'a self,
        handle: &'a WorkflowHandle,
        step: &'a WorkflowStep,
        path: &'a [String],
        token: &'a CancellationToken,
    ) -> BoxFuture<'a, StepOutcome> {
        async move {
            if token.is_cancelled() {
                return StepOutcome::Interrupted;
            }

            match &step.kind {
                StepKind::Task { task } => self.run_task_step(handle, step, task, token).await,
                StepKind::Parallel { sub_steps } => {
                    let outcomes =
                        join_all(sub_steps.iter().map(|s| self.run_child(handle, path, s, token))).await;

                    let mut results = Vec::with_capacity(outcomes.len());
                    let mut failures = Vec::new();
                    for (child, outcome) in sub_steps.iter().zip(outcomes) {
                        match outcome {
                            StepOutcome::Interrupted => return StepOutcome::Interrupted,
                            StepOutcome::Completed(result) => results.push(result.unwrap_or(Value::Null)),
                            StepOutcome::Failed(message) => {
                                results.push(Value::Null);
                                if child.on_failure == OnFailure::Fail {
                                    failures.push(format!("{}: {}", child.id, message));
                                }
                            }
                        }
                    }

                    if failures.is_empty() {
                        StepOutcome::Completed(Some(Value::Array(results)))
                    } else {
                        StepOutcome::Failed(format!("parallel sub-steps failed: {}", failures.join("; ")))
                    }
                }
                StepKind::Sequential { sub_steps } => {
                    self.run_sequence(handle, path, sub_steps, token).await
                }
                StepKind::Conditional {
                    condition,
                    true_steps,
                    false_steps,
                } => {
                    let branch = self.check(handle, condition).await;
                    debug!("Condition of step {} evaluated to {}", step.id, branch);
                    let steps = if branch { true_steps } else { false_steps };
                    match self.run_sequence(handle, path, steps, token).await {
                        StepOutcome::Completed(result) => StepOutcome::Completed(Some(json!({
                            "branch": branch,
                            "result": result,
                        }))),
                        other => other,
                    }
                }
                StepKind::Loop {
                    loop_condition,
                    loop_steps,
                    max_iterations,
                } => {
                    let mut iterations = 0;
                    let mut last = None;
                    while iterations < *max_iterations && self.check(handle, loop_condition).await {
                        match self.run_sequence(handle, path, loop_steps, token).await {
                            StepOutcome::Completed(result) => last = result,
                            other => return other,
                        }
                        iterations += 1;
                    }
                    if iterations == *max_iterations {
                        debug!("Loop step {} stopped at max_iterations {}", step.id, max_iterations);
                    }
                    StepOutcome::Completed(Some(json!({
                        "iterations": iterations,
                        "result": last,
                    })))
                }
                StepKind::Wait {
                    wait_seconds,
                    wait_condition,
                } => {
                    self.run_wait(handle, step, *wait_seconds, wait_condition.as_ref(), token)
                        .await
                }
            }
        }
        .boxed()
    }

    /// Run steps in order, stopping at the first fatal failure
    async fn run_sequence(
        &self,
        handle: &WorkflowHandle,
        parent: &[String],
        steps: &[WorkflowStep],
        token: &CancellationToken,
    ) -> StepOutcome {
        let mut last = None;
        for child in steps {
            match self.run_child(handle, parent, child, token).await {
                StepOutcome::Completed(result) => last = result,
                StepOutcome::Failed(message) if child.on_failure == OnFailure::Skip => {
                    debug!("Sub-step {} failed and is skipped: {}", child.id, message);
                }
                StepOutcome::Failed(message) => {
                    return StepOutcome::Failed(format!("step '{}' failed: {}", child.id, message))
                }
                StepOutcome::Interrupted => return StepOutcome::Interrupted,
            }
        }
        StepOutcome::Completed(last)
    }

    async fn run_task_step(
        &self,
        handle: &WorkflowHandle,
        step: &WorkflowStep,
        template: &TaskTemplate,
        token: &CancellationToken,
    ) -> StepOutcome {
        let task = {
            let workflow = handle.state.read().await;
            match self.renderer.instantiate(template, &workflow, &step.id) {
                Ok(task) => task,
                Err(e) => return StepOutcome::Failed(e.to_string()),
            }
        };
        let task_id = task.id.clone();

        let execution = {
            let run = self
                .executor
                .execute_with_retries(task, template.agent_id.as_deref());
            tokio::pin!(run);

            tokio::select! {
                result = &mut run => result,
                _ = token.cancelled() => loop {
                    // the attempt may not be registered yet; keep cancelling until it settles
                    self.executor.cancel(&task_id, "workflow interrupted");
                    tokio::select! {
                        result = &mut run => break result,
                        _ = tokio::time::sleep(self.config.wait_poll_interval) => {}
                    }
                },
            }
        };

        // the step records the outcome; drop the per-run task
        self.executor.scheduler().remove_task(&task_id).await;
        self.executor.forget(&task_id);

        let execution = match execution {
            Ok(execution) => execution,
            Err(e) if token.is_cancelled() => {
                debug!("Task step {} interrupted before it ran: {}", step.id, e);
                return StepOutcome::Interrupted;
            }
            Err(e) => return StepOutcome::Failed(e.to_string()),
        };

        if execution.status == ExecutionStatus::Completed {
            let result = execution.result.clone().unwrap_or(Value::Null);
            if let Some(vars) = result.get("variables").and_then(Value::as_object) {
                let mut workflow = handle.state.write().await;
                for (key, value) in vars {
                    workflow.variables.insert(key.clone(), value.clone());
                }
            }
            *handle.last_result.lock() = Some(result.clone());
            return StepOutcome::Completed(Some(result));
        }

        if token.is_cancelled() {
            return StepOutcome::Interrupted;
        }

        StepOutcome::Failed(
            execution
                .error_message()
                .map(str::to_string)
                .unwrap_or_else(|| format!("task finished as {}", execution.status)),
        )
    }

    async fn run_wait(
        &self,
        handle: &WorkflowHandle,
        step: &WorkflowStep,
        wait_seconds: Option<f64>,
        condition: Option<&Condition>,
        token: &CancellationToken,
    ) -> StepOutcome {
        let limit = match wait_seconds.map(Duration::try_from_secs_f64).transpose() {
            Ok(limit) => limit,
            Err(e) => {
                return StepOutcome::Failed(format!(
                    "wait step '{}' has an invalid duration: {}",
                    step.id, e
                ))
            }
        };

        let Some(condition) = condition else {
            let delay = limit.unwrap_or_default();
            return tokio::select! {
                _ = token.cancelled() => StepOutcome::Interrupted,
                _ = tokio::time::sleep(delay) => StepOutcome::Completed(None),
            };
        };

        let deadline = limit.map(|l| tokio::time::Instant::now() + l);
        loop {
            if self.check(handle, condition).await {
                return StepOutcome::Completed(None);
            }
            if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                return StepOutcome::Failed(format!(
                    "wait condition of step '{}' not met within {:?}",
                    step.id,
                    limit.unwrap_or_default()
                ));
            }
            tokio::select! {
                _ = token.cancelled() => return StepOutcome::Interrupted,
                _ = tokio::time::sleep(self.config.wait_poll_interval) => {}
            }
        }
    }

    async fn check(&self, handle: &WorkflowHandle, condition: &Condition) -> bool {
        let last_result = handle.last_result.lock().clone();
        let workflow = handle.state.read().await;
        let scope = ConditionScope {
            result: last_result.as_ref(),
            variables: &workflow.variables,
            context: &workflow.context,
        };
        evaluate(condition, &scope)
    }
}

fn apply_outcome(step: &mut WorkflowStep, outcome: &StepOutcome, control: Control) {
    match outcome {
        StepOutcome::Completed(result) => {
            step.status = TaskStatus::Completed;
            step.result = result.clone();
            step.completed_at = Some(Utc::now());
        }
        StepOutcome::Failed(message) => {
            step.status = TaskStatus::Failed;
            step.error = Some(message.clone());
            step.completed_at = Some(Utc::now());
        }
        StepOutcome::Interrupted if control == Control::Pause => step.reset(),
        StepOutcome::Interrupted => {
            step.status = TaskStatus::Cancelled;
            step.completed_at = Some(Utc::now());
        }
    }
}
