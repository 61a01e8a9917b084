// ABOUTME: Task registry, dependency validation and execution planning
// ABOUTME: Handles cycle detection, topological ordering and parallel execution phases

use indexmap::IndexMap;
use petgraph::dot::{Config, Dot};
use petgraph::Graph;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use super::error::{EngineError, Result};
use crate::model::{Task, TaskPriority, TaskStatus};

/// Registry of known tasks and the dependency edges between them
#[derive(Debug, Default)]
pub struct DependencyResolver {
    tasks: IndexMap<String, Task>,
    // dependency id -> ids of tasks that depend on it, kept even while the dependency is unregistered
    dependents: HashMap<String, BTreeSet<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPhase {
    pub groups: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub phases: Vec<ExecutionPhase>,
    pub total_tasks: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub name: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
}

/// Edge from a dependency to the task that waits on it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyGraphView {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task, wiring reverse edges in both directions
    pub fn add_task(&mut self, mut task: Task) {
        if self.tasks.contains_key(&task.id) {
            self.remove_task(&task.id);
        }

        for dep in &task.depends_on {
            self.dependents
                .entry(dep.clone())
                .or_default()
                .insert(task.id.clone());
            if let Some(dep_task) = self.tasks.get_mut(dep) {
                dep_task.blocks.insert(task.id.clone());
            }
        }

        task.blocks = self.dependents.get(&task.id).cloned().unwrap_or_default();
        self.tasks.insert(task.id.clone(), task);
    }

    pub fn remove_task(&mut self, task_id: &str) -> Option<Task> {
        let task = self.tasks.shift_remove(task_id)?;

        for dep in &task.depends_on {
            if let Some(set) = self.dependents.get_mut(dep) {
                set.remove(task_id);
                if set.is_empty() {
                    self.dependents.remove(dep);
                }
            }
            if let Some(dep_task) = self.tasks.get_mut(dep) {
                dep_task.blocks.remove(task_id);
            }
        }

        Some(task)
    }

    /// Replace a registered task, re-deriving its edges
    pub fn update_task(&mut self, task: Task) -> Result<()> {
        if !self.tasks.contains_key(&task.id) {
            return Err(EngineError::TaskNotFound { task_id: task.id });
        }
        self.add_task(task);
        Ok(())
    }

    pub fn get(&self, task_id: &str) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    pub fn get_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.get_mut(task_id)
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Report missing dependencies, self-dependencies and cycles reachable from `task`
    pub fn validate_dependencies(&self, task: &Task) -> Vec<EngineError> {
        let mut errors = Vec::new();

        for dep in &task.depends_on {
            if dep == &task.id {
                errors.push(EngineError::validation(format!(
                    "Task '{}' depends on itself",
                    task.id
                )));
            } else if !self.tasks.contains_key(dep) {
                errors.push(EngineError::validation(format!(
                    "Task '{}' depends on unknown task '{}'",
                    task.id, dep
                )));
            }
        }

        if let Some(path) = self.find_cycle(task) {
            errors.push(EngineError::CircularDependency { path });
        }

        errors
    }

    fn dependencies_of<'a>(&'a self, task_id: &str, root: &'a Task) -> Option<&'a BTreeSet<String>> {
        if task_id == root.id {
            Some(&root.depends_on)
        } else {
            self.tasks.get(task_id).map(|t| &t.depends_on)
        }
    }

    fn find_cycle(&self, root: &Task) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        let mut on_path = HashSet::new();
        self.visit(&root.id, root, &mut visited, &mut path, &mut on_path)
    }

    fn visit(
        &self,
        node: &str,
        root: &Task,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
        on_path: &mut HashSet<String>,
    ) -> Option<Vec<String>> {
        path.push(node.to_string());
        on_path.insert(node.to_string());

        if let Some(deps) = self.dependencies_of(node, root) {
            for dep in deps {
                if dep == node {
                    continue;
                }
                if on_path.contains(dep) {
                    if let Some(start) = path.iter().position(|n| n == dep) {
                        let mut cycle = path[start..].to_vec();
                        cycle.push(dep.clone());
                        return Some(cycle);
                    }
                }
                if visited.contains(dep) || self.dependencies_of(dep, root).is_none() {
                    continue;
                }
                if let Some(cycle) = self.visit(dep, root, visited, path, on_path) {
                    return Some(cycle);
                }
            }
        }

        path.pop();
        on_path.remove(node);
        visited.insert(node.to_string());
        None
    }

    fn scope(&self, task_ids: Option<&[String]>) -> Result<Vec<String>> {
        match task_ids {
            Some(ids) => {
                let mut seen = HashSet::new();
                let mut scoped = Vec::with_capacity(ids.len());
                for id in ids {
                    if !self.tasks.contains_key(id) {
                        return Err(EngineError::TaskNotFound {
                            task_id: id.clone(),
                        });
                    }
                    if seen.insert(id.clone()) {
                        scoped.push(id.clone());
                    }
                }
                Ok(scoped)
            }
            None => Ok(self.tasks.keys().cloned().collect()),
        }
    }

    /// Topological order (Kahn's algorithm) over the given ids, or every registered task
    pub fn execution_order(&self, task_ids: Option<&[String]>) -> Result<Vec<String>> {
        let ids = self.scope(task_ids)?;
        let members: HashSet<&str> = ids.iter().map(String::as_str).collect();

        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        for id in &ids {
            let degree = self.tasks[id.as_str()]
                .depends_on
                .iter()
                .filter(|dep| *dep != id && members.contains(dep.as_str()))
                .count();
            in_degree.insert(id.as_str(), degree);
        }

        let mut queue: VecDeque<&str> = ids
            .iter()
            .map(String::as_str)
            .filter(|id| in_degree[id] == 0)
            .collect();

        let mut order = Vec::with_capacity(ids.len());
        while let Some(current) = queue.pop_front() {
            order.push(current.to_string());

            for blocked in &self.tasks[current].blocks {
                if blocked == current {
                    continue;
                }
                if let Some(degree) = in_degree.get_mut(blocked.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(blocked.as_str());
                    }
                }
            }
        }

        if order.len() < ids.len() {
            let emitted: HashSet<&String> = order.iter().collect();
            let remainder = ids.iter().filter(|id| !emitted.contains(id)).cloned().collect();
            return Err(EngineError::CircularDependency { path: remainder });
        }

        Ok(order)
    }

    /// Pending tasks whose dependencies are all in `completed`
    pub fn ready_tasks(&self, completed: &HashSet<String>) -> Vec<&Task> {
        self.tasks
            .values()
            .filter(|task| task.status == TaskStatus::Pending)
            .filter(|task| task.depends_on.iter().all(|dep| completed.contains(dep)))
            .collect()
    }

    /// Whether every dependency of `task_id` is registered and COMPLETED
    pub fn dependencies_satisfied(&self, task_id: &str) -> bool {
        self.tasks.get(task_id).is_some_and(|task| {
            task.depends_on.iter().all(|dep| {
                self.tasks
                    .get(dep)
                    .is_some_and(|d| d.status == TaskStatus::Completed)
            })
        })
    }

    /// True when no member of the set must be ordered relative to another member
    pub fn can_execute_parallel(&self, task_ids: &[String]) -> bool {
        for (i, a) in task_ids.iter().enumerate() {
            for b in task_ids.iter().skip(i + 1) {
                if a == b {
                    continue;
                }
                if let Some(task) = self.tasks.get(a) {
                    if task.depends_on.contains(b) || task.blocks.contains(b) {
                        return false;
                    }
                }
                if self.has_dependency_path(a, b) || self.has_dependency_path(b, a) {
                    return false;
                }
            }
        }
        true
    }

    /// Check if `from_task` depends on `to_task` directly or transitively
    pub fn has_dependency_path(&self, from_task: &str, to_task: &str) -> bool {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(from_task.to_string());
        visited.insert(from_task.to_string());

        while let Some(current) = queue.pop_front() {
            let Some(task) = self.tasks.get(&current) else {
                continue;
            };
            for dep in &task.depends_on {
                if dep == to_task {
                    return true;
                }
                if visited.insert(dep.clone()) {
                    queue.push_back(dep.clone());
                }
            }
        }

        false
    }

    /// Group tasks into sequential phases of mutually parallel-safe groups
    pub fn optimize_execution_plan(&self, task_ids: Option<&[String]>) -> Result<ExecutionPlan> {
        let order = self.execution_order(task_ids)?;
        let members: HashSet<String> = order.iter().cloned().collect();
        let total_tasks = order.len();

        let mut satisfied: HashSet<String> = HashSet::new();
        let mut remaining = order;
        let mut phases = Vec::new();

        while !remaining.is_empty() {
            let (ready, rest): (Vec<String>, Vec<String>) =
                remaining.into_iter().partition(|id| {
                    self.tasks[id.as_str()]
                        .depends_on
                        .iter()
                        .filter(|dep| members.contains(*dep))
                        .all(|dep| satisfied.contains(dep))
                });

            if ready.is_empty() {
                // unreachable once execution_order succeeded
                break;
            }

            let mut groups: Vec<Vec<String>> = Vec::new();
            for id in &ready {
                let slot = groups.iter_mut().find(|group| {
                    let mut candidate = (*group).clone();
                    candidate.push(id.clone());
                    self.can_execute_parallel(&candidate)
                });
                match slot {
                    Some(group) => group.push(id.clone()),
                    None => groups.push(vec![id.clone()]),
                }
            }

            satisfied.extend(ready);
            remaining = rest;
            phases.push(ExecutionPhase { groups });
        }

        Ok(ExecutionPlan {
            phases,
            total_tasks,
        })
    }

    /// Get all tasks that depend on the given task
    pub fn dependents(&self, task_id: &str) -> Vec<String> {
        self.tasks
            .get(task_id)
            .map(|t| t.blocks.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Get all tasks that the given task depends on
    pub fn dependencies(&self, task_id: &str) -> Vec<String> {
        self.tasks
            .get(task_id)
            .map(|t| t.depends_on.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Get tasks that have no dependencies (root tasks)
    pub fn root_tasks(&self) -> Vec<String> {
        self.tasks
            .values()
            .filter(|t| t.depends_on.is_empty())
            .map(|t| t.id.clone())
            .collect()
    }

    /// Get tasks that no other tasks depend on (leaf tasks)
    pub fn leaf_tasks(&self) -> Vec<String> {
        self.tasks
            .values()
            .filter(|t| t.blocks.is_empty())
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn dependency_graph(&self) -> DependencyGraphView {
        let nodes = self
            .tasks
            .values()
            .map(|t| GraphNode {
                id: t.id.clone(),
                name: t.name.clone(),
                status: t.status,
                priority: t.priority,
            })
            .collect();

        let edges = self
            .tasks
            .values()
            .flat_map(|t| {
                t.depends_on.iter().map(move |dep| GraphEdge {
                    from: dep.clone(),
                    to: t.id.clone(),
                })
            })
            .collect();

        DependencyGraphView { nodes, edges }
    }

    /// Render the registry as a Graphviz digraph
    pub fn to_dot(&self) -> String {
        let mut graph = Graph::<String, ()>::new();
        let mut indices = HashMap::new();

        for task in self.tasks.values() {
            indices.insert(task.id.clone(), graph.add_node(task.id.clone()));
        }
        for task in self.tasks.values() {
            for dep in &task.depends_on {
                if let (Some(&from), Some(&to)) = (indices.get(dep), indices.get(&task.id)) {
                    graph.add_edge(from, to, ());
                }
            }
        }

        format!("{:?}", Dot::with_config(&graph, &[Config::EdgeNoLabel]))
    }
}

impl ExecutionPlan {
    /// Flatten each phase into one batch of task ids
    pub fn batches(&self) -> Vec<Vec<String>> {
        self.phases
            .iter()
            .map(|phase| phase.groups.iter().flatten().cloned().collect())
            .collect()
    }

    /// Get the maximum parallelism level (largest group size)
    pub fn max_parallelism(&self) -> usize {
        self.phases
            .iter()
            .flat_map(|phase| phase.groups.iter())
            .map(Vec::len)
            .max()
            .unwrap_or(0)
    }

    /// Get the total number of execution phases
    pub fn execution_depth(&self) -> usize {
        self.phases.len()
    }

    pub fn contains_task(&self, task_id: &str) -> bool {
        self.phase_index(task_id).is_some()
    }

    /// Get the phase index for a specific task
    pub fn phase_index(&self, task_id: &str) -> Option<usize> {
        self.phases.iter().position(|phase| {
            phase
                .groups
                .iter()
                .any(|group| group.iter().any(|id| id == task_id))
        })
    }

    /// Get all tasks that will execute before the given task
    pub fn predecessors(&self, task_id: &str) -> Vec<String> {
        match self.phase_index(task_id) {
            Some(index) => self
                .batches()
                .into_iter()
                .take(index)
                .flatten()
                .collect(),
            None => Vec::new(),
        }
    }
}
