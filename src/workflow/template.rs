// ABOUTME: Handlebars rendering of step task templates
// ABOUTME: Substitutes workflow variables and context into task names, types and metadata

use handlebars::Handlebars;
use serde_json::Value;

use crate::engine::error::{EngineError, Result};
use crate::model::{Metadata, Task, TaskTemplate, Workflow};

#[derive(Clone)]
pub struct TemplateRenderer {
    handlebars: Handlebars<'static>,
}

impl TemplateRenderer {
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(false);
        handlebars.set_dev_mode(false);
        // rendered values feed task payloads, not HTML
        handlebars.register_escape_fn(handlebars::no_escape);
        Self { handlebars }
    }

    /// Render a template string with the given data
    pub fn render(&self, template: &str, data: &Value) -> Result<String> {
        if !template.contains("{{") {
            return Ok(template.to_string());
        }
        self.handlebars
            .render_template(template, data)
            .map_err(|e| EngineError::Template(e.to_string()))
    }

    /// Recursively resolve templates in JSON values
    pub fn render_value(&self, value: &Value, data: &Value) -> Result<Value> {
        match value {
            Value::String(s) => Ok(Value::String(self.render(s, data)?)),
            Value::Array(items) => items
                .iter()
                .map(|v| self.render_value(v, data))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut resolved = serde_json::Map::with_capacity(map.len());
                for (key, v) in map {
                    resolved.insert(key.clone(), self.render_value(v, data)?);
                }
                Ok(Value::Object(resolved))
            }
            other => Ok(other.clone()),
        }
    }

    /// Build a fresh task for a TASK step from its template and the workflow's current data
    pub fn instantiate(&self, template: &TaskTemplate, workflow: &Workflow, step_id: &str) -> Result<Task> {
        let data = workflow.template_data();

        let metadata = match self.render_value(&template.metadata.to_value(), &data)? {
            value @ Value::Object(_) => Metadata::from_value(&value).unwrap_or_default(),
            _ => Metadata::new(),
        };

        let mut task = Task::new(
            self.render(&template.name, &data)?,
            self.render(&template.task_type, &data)?,
        )
        .with_priority(template.priority)
        .with_retries(template.max_retries, template.retry_delay);

        task.timeout = template.timeout;
        task.metadata = metadata;
        task.metadata.insert("step_id", step_id);
        task.workflow_id = Some(workflow.id.clone());
        Ok(task)
    }
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}
