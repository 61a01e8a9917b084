// ABOUTME: Command implementations for the taskweave CLI
// ABOUTME: Loads task files and workflow definitions, validates them and renders execution plans

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::Path;
use tracing::info;

use super::config::Config;
use crate::engine::{DependencyResolver, ExecutionPlan};
use crate::model::{Task, Workflow};
use crate::workflow::StepGraph;

#[derive(Debug, Deserialize)]
pub struct TaskFile {
    #[serde(default)]
    pub tasks: Vec<Task>,
}

/// Parse a task file from YAML
pub fn parse_task_file(content: &str) -> Result<Vec<Task>> {
    let file: TaskFile = serde_yaml::from_str(content)?;
    Ok(file.tasks)
}

pub async fn load_task_file(path: &Path) -> Result<Vec<Task>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read task file '{}'", path.display()))?;
    parse_task_file(&content).with_context(|| format!("Failed to parse '{}'", path.display()))
}

pub async fn load_workflow(path: &Path) -> Result<Workflow> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read workflow '{}'", path.display()))?;
    Workflow::from_yaml(&content).with_context(|| format!("Failed to parse '{}'", path.display()))
}

/// Register every task, then report all dependency problems at once
pub fn build_resolver(tasks: Vec<Task>) -> Result<DependencyResolver> {
    let mut resolver = DependencyResolver::new();
    let mut seen = HashSet::new();

    for task in &tasks {
        if !seen.insert(task.id.clone()) {
            anyhow::bail!("Duplicate task id '{}'", task.id);
        }
    }
    for task in tasks {
        resolver.add_task(task);
    }

    let mut problems: Vec<String> = Vec::new();
    for task in resolver.tasks() {
        for error in resolver.validate_dependencies(task) {
            let message = error.to_string();
            if !problems.contains(&message) {
                problems.push(message);
            }
        }
    }

    if !problems.is_empty() {
        anyhow::bail!("Invalid task dependencies:\n  {}", problems.join("\n  "));
    }
    Ok(resolver)
}

pub fn render_plan(plan: &ExecutionPlan) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Execution plan: {} task(s) in {} phase(s), max parallelism {}",
        plan.total_tasks,
        plan.execution_depth(),
        plan.max_parallelism()
    );
    for (index, phase) in plan.phases.iter().enumerate() {
        let _ = writeln!(out, "  Phase {}:", index + 1);
        for group in &phase.groups {
            let _ = writeln!(out, "    [{}]", group.join(", "));
        }
    }
    out
}

pub async fn validate_tasks(path: &Path) -> Result<()> {
    info!("Validating task file: {}", path.display());

    let tasks = load_task_file(path).await?;
    let resolver = build_resolver(tasks)?;
    let order = resolver.execution_order(None)?;

    println!("✓ Task file '{}' is valid", path.display());
    println!("  Tasks: {}", resolver.len());
    println!("  Roots: {}", resolver.root_tasks().join(", "));
    println!("  Order: {}", order.join(" -> "));
    Ok(())
}

pub async fn validate_workflow(path: &Path) -> Result<()> {
    info!("Validating workflow: {}", path.display());

    let workflow = load_workflow(path).await?;
    let graph = StepGraph::validate(&workflow.steps)?;
    let layers = graph.execution_layers()?;

    println!("✓ Workflow '{}' is valid", workflow.name);
    println!("  Steps: {}", graph.len());
    println!("  Layers: {}", layers.len());
    println!("  Variables: {}", workflow.variables.len());
    Ok(())
}

pub async fn plan_tasks(path: &Path, dot: bool) -> Result<()> {
    let tasks = load_task_file(path).await?;
    let resolver = build_resolver(tasks)?;

    if dot {
        println!("{}", resolver.to_dot());
        return Ok(());
    }

    let plan = resolver.optimize_execution_plan(None)?;
    print!("{}", render_plan(&plan));
    Ok(())
}

pub fn show_config(config: &Config) -> Result<()> {
    print!("{}", serde_yaml::to_string(config)?);
    Ok(())
}
