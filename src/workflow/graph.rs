// ABOUTME: Step dependency graph for a single workflow
// ABOUTME: Validates step references and cycles and derives parallel execution layers

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::NodeIndex;
use petgraph::{Direction, Graph};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::engine::error::{EngineError, Result};
use crate::model::{StepKind, WorkflowStep};

pub struct StepGraph {
    graph: Graph<String, ()>,
    step_indices: HashMap<String, NodeIndex>,
}

impl StepGraph {
    /// Build the graph, rejecting duplicate ids and unknown dependencies
    pub fn from_steps(steps: &[WorkflowStep]) -> Result<Self> {
        let mut graph = Graph::new();
        let mut step_indices = HashMap::new();

        for step in steps {
            if step_indices.contains_key(&step.id) {
                return Err(EngineError::validation(format!(
                    "Duplicate step id '{}'",
                    step.id
                )));
            }
            let node = graph.add_node(step.id.clone());
            step_indices.insert(step.id.clone(), node);
        }

        for step in steps {
            let step_node = step_indices[&step.id];
            for dependency in &step.depends_on {
                if dependency == &step.id {
                    return Err(EngineError::validation(format!(
                        "Step '{}' depends on itself",
                        step.id
                    )));
                }
                let Some(&dep_node) = step_indices.get(dependency) else {
                    return Err(EngineError::validation(format!(
                        "Step '{}' depends on unknown step '{}'",
                        step.id, dependency
                    )));
                };
                graph.add_edge(dep_node, step_node, ());
            }
        }

        Ok(Self {
            graph,
            step_indices,
        })
    }

    /// Build and fully validate the steps of a workflow, nested constructs included
    pub fn validate(steps: &[WorkflowStep]) -> Result<Self> {
        let graph = Self::from_steps(steps)?;
        graph.check_acyclic()?;
        for step in steps {
            validate_nested(step)?;
        }
        Ok(graph)
    }

    pub fn check_acyclic(&self) -> Result<()> {
        toposort(&self.graph, None).map(|_| ()).map_err(|cycle| {
            let node = cycle.node_id();
            let component = tarjan_scc(&self.graph)
                .into_iter()
                .find(|scc| scc.contains(&node))
                .unwrap_or_else(|| vec![node]);

            let mut path: Vec<String> = component
                .iter()
                .rev()
                .map(|idx| self.graph[*idx].clone())
                .collect();
            if let Some(first) = path.first().cloned() {
                path.push(first);
            }
            EngineError::CircularDependency { path }
        })
    }

    /// Steps grouped into layers that may run concurrently
    pub fn execution_layers(&self) -> Result<Vec<Vec<String>>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| EngineError::CircularDependency {
            path: vec![self.graph[cycle.node_id()].clone()],
        })?;

        let mut layers = Vec::new();
        let mut done: HashSet<NodeIndex> = HashSet::new();
        let mut remaining = sorted;

        while !remaining.is_empty() {
            let (ready, rest): (Vec<NodeIndex>, Vec<NodeIndex>) =
                remaining.into_iter().partition(|&node| {
                    self.graph
                        .neighbors_directed(node, Direction::Incoming)
                        .all(|dep| done.contains(&dep))
                });

            if ready.is_empty() {
                break;
            }

            done.extend(ready.iter().copied());
            layers.push(ready.iter().map(|&n| self.graph[n].clone()).collect());
            remaining = rest;
        }

        Ok(layers)
    }

    pub fn dependents(&self, step_id: &str) -> Vec<String> {
        match self.step_indices.get(step_id) {
            Some(&node) => self
                .graph
                .neighbors_directed(node, Direction::Outgoing)
                .map(|n| self.graph[n].clone())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.step_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.step_indices.is_empty()
    }
}

fn validate_nested(step: &WorkflowStep) -> Result<()> {
    let mut seen = HashSet::new();
    for child in step.children() {
        if !seen.insert(child.id.as_str()) {
            return Err(EngineError::validation(format!(
                "Step '{}' has duplicate sub-step id '{}'",
                step.id, child.id
            )));
        }
    }

    let children: &[WorkflowStep] = match &step.kind {
        StepKind::Parallel { sub_steps } | StepKind::Sequential { sub_steps } => sub_steps,
        StepKind::Loop {
            loop_steps,
            max_iterations,
            ..
        } => {
            if *max_iterations == 0 {
                return Err(EngineError::validation(format!(
                    "Loop step '{}' must allow at least one iteration",
                    step.id
                )));
            }
            loop_steps
        }
        StepKind::Conditional {
            true_steps,
            false_steps,
            ..
        } => {
            for child in true_steps.iter().chain(false_steps) {
                validate_nested(child)?;
            }
            return Ok(());
        }
        StepKind::Wait {
            wait_seconds,
            wait_condition,
        } => {
            if wait_seconds.is_none() && wait_condition.is_none() {
                return Err(EngineError::validation(format!(
                    "Wait step '{}' needs wait_seconds or wait_condition",
                    step.id
                )));
            }
            if wait_seconds.is_some_and(|s| Duration::try_from_secs_f64(s).is_err()) {
                return Err(EngineError::validation(format!(
                    "Wait step '{}' has an invalid duration",
                    step.id
                )));
            }
            return Ok(());
        }
        StepKind::Task { .. } => return Ok(()),
    };

    for child in children {
        validate_nested(child)?;
    }
    Ok(())
}
