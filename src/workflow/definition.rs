//! Declarative workflow documents (TOML) and DAG validation.
//!
//! A workflow is an ordered list of steps; each step names an agent and at
//! most one predecessor (`input_from`) whose output map becomes its input.
//! Validation rejects duplicate ids, unknown references, and cycles before
//! any step executes.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Output rendering format for delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Markdown,
    Plaintext,
}

/// `[workflow]` header block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowMeta {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
}

/// One `[[steps]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    /// Registered agent name to invoke.
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Predecessor step id; omitted (or "external") means the run's initial
    /// input feeds this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_from: Option<String>,
    /// Output fields the agent must produce; missing fields fail the step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub config: serde_json::Map<String, serde_json::Value>,
}

impl StepDefinition {
    /// The effective dependency, with the literal "external" normalized away.
    pub fn dependency(&self) -> Option<&str> {
        match self.input_from.as_deref() {
            None | Some("external") => None,
            Some(dep) => Some(dep),
        }
    }
}

/// `[input]` schema entry: a required (or optional) initial-input field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputField {
    #[serde(rename = "type", default)]
    pub field_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

/// `[output]` block: which step outputs the finished run exposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default)]
    pub format: OutputFormat,
    /// Dotted paths into step outputs, e.g. `ingested.metadata.page_count`.
    #[serde(default)]
    pub fields: Vec<String>,
}

/// A parsed workflow document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub workflow: WorkflowMeta,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub input: HashMap<String, InputField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputSpec>,
}

impl WorkflowDefinition {
    pub fn from_toml(text: &str) -> Result<Self, ValidationError> {
        let def: Self = toml::from_str(text).map_err(|e| ValidationError::Parse(e.to_string()))?;
        def.validate()?;
        Ok(def)
    }

    pub fn from_file(path: &Path) -> Result<Self, ValidationError> {
        let text = std::fs::read_to_string(path).map_err(|e| ValidationError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&text)
    }

    pub fn to_toml(&self) -> Result<String, ValidationError> {
        toml::to_string_pretty(self).map_err(|e| ValidationError::Parse(e.to_string()))
    }

    /// Index of each step id.
    pub fn step_index(&self) -> HashMap<&str, usize> {
        self.steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect()
    }

    /// Structural validation: non-empty, unique ids, resolvable references,
    /// acyclic. Runs before any step executes; failure has no side effects.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let workflow = &self.workflow.name;

        if self.steps.is_empty() {
            return Err(ValidationError::Empty {
                workflow: workflow.clone(),
            });
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(ValidationError::DuplicateStepId {
                    workflow: workflow.clone(),
                    step: step.id.clone(),
                });
            }
        }

        let index = self.step_index();
        for step in &self.steps {
            if let Some(dep) = step.dependency() {
                if !index.contains_key(dep) {
                    return Err(ValidationError::UnknownReference {
                        workflow: workflow.clone(),
                        step: step.id.clone(),
                        reference: dep.to_string(),
                    });
                }
                if dep == step.id {
                    return Err(ValidationError::Cycle {
                        workflow: workflow.clone(),
                        step: step.id.clone(),
                    });
                }
            }
        }

        // Kahn's algorithm; anything left over sits on a cycle.
        let mut indegree = vec![0_usize; self.steps.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.steps.len()];
        for (i, step) in self.steps.iter().enumerate() {
            if let Some(dep) = step.dependency() {
                let d = index[dep];
                indegree[i] += 1;
                dependents[d].push(i);
            }
        }
        let mut queue: Vec<usize> = (0..self.steps.len()).filter(|&i| indegree[i] == 0).collect();
        let mut visited = 0_usize;
        while let Some(i) = queue.pop() {
            visited += 1;
            for &dep in &dependents[i] {
                indegree[dep] -= 1;
                if indegree[dep] == 0 {
                    queue.push(dep);
                }
            }
        }
        if visited != self.steps.len() {
            let stuck = self
                .steps
                .iter()
                .enumerate()
                .find(|(i, _)| indegree[*i] > 0)
                .map(|(_, s)| s.id.clone())
                .unwrap_or_default();
            return Err(ValidationError::Cycle {
                workflow: workflow.clone(),
                step: stuck,
            });
        }

        Ok(())
    }

    /// Check that the initial input carries every required `[input]` field.
    pub fn validate_initial_input(
        &self,
        initial_input: &serde_json::Value,
    ) -> Result<(), ValidationError> {
        for (field, schema) in &self.input {
            if schema.required && initial_input.get(field).is_none() {
                return Err(ValidationError::MissingInputField {
                    field: field.clone(),
                });
            }
        }
        Ok(())
    }

    /// Direct dependents of each step, by index.
    pub fn dependents(&self) -> Vec<Vec<usize>> {
        let index = self.step_index();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.steps.len()];
        for (i, step) in self.steps.iter().enumerate() {
            if let Some(dep) = step.dependency() {
                dependents[index[dep]].push(i);
            }
        }
        dependents
    }

    /// Steps nothing depends on — the run's terminal branches.
    pub fn leaf_indices(&self) -> Vec<usize> {
        let dependents = self.dependents();
        (0..self.steps.len())
            .filter(|&i| dependents[i].is_empty())
            .collect()
    }
}

/// Resolve a dotted path (`step.field.nested`) against per-step output maps.
pub fn resolve_dotted<'a>(
    step_outputs: &'a HashMap<String, serde_json::Value>,
    path: &str,
) -> Option<&'a serde_json::Value> {
    let mut segments = path.split('.');
    let step = segments.next()?;
    let mut current = step_outputs.get(step)?;
    for segment in segments {
        current = current.get(segment)?;
    }
    Some(current)
}
