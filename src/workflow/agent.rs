//! Agent abstraction and the startup-time registry.
//!
//! Agents are the pluggable unit of work a step invokes. The registry is
//! populated once during startup and read-only afterwards, so lookups are
//! plain `HashMap` reads behind an `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::AgentError;

/// A named unit of work. Input is the predecessor's output map (or the run's
/// initial input for root steps); config is the step's static `config` table.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn invoke(
        &self,
        input: &serde_json::Value,
        config: &serde_json::Value,
    ) -> Result<serde_json::Map<String, serde_json::Value>, AgentError>;
}

/// Lookup table of agents by name.
#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the builtin agents.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(IngestAgent));
        registry.register(Arc::new(TemplateAgent));
        registry
    }

    /// Register an agent. A duplicate name replaces the earlier entry.
    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        let name = agent.name().to_string();
        if self.agents.insert(name.clone(), agent).is_some() {
            warn!(agent = %name, "Agent registered twice, replacing earlier entry");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.agents.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

// ── Builtin agents ──────────────────────────────────────────────────────────

/// Normalizes a triggering message into a document plus metadata.
///
/// Output: `document` (trimmed body text) and `metadata` (sender, subject,
/// attachment and word counts).
pub struct IngestAgent;

#[async_trait]
impl Agent for IngestAgent {
    fn name(&self) -> &str {
        "ingest"
    }

    fn description(&self) -> &str {
        "Normalize an inbound message into a document with metadata"
    }

    async fn invoke(
        &self,
        input: &serde_json::Value,
        _config: &serde_json::Value,
    ) -> Result<serde_json::Map<String, serde_json::Value>, AgentError> {
        let body = input
            .get("body")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AgentError::InvalidInput {
                agent: "ingest".into(),
                reason: "missing string field 'body'".into(),
            })?;
        let document = body.trim().to_string();

        let attachment_count = input
            .get("attachments")
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0);

        let metadata = serde_json::json!({
            "sender": input.get("sender").cloned().unwrap_or_default(),
            "subject": input.get("subject").cloned().unwrap_or_default(),
            "attachment_count": attachment_count,
            "word_count": document.split_whitespace().count(),
        });

        let mut output = serde_json::Map::new();
        output.insert("document".into(), serde_json::Value::String(document));
        output.insert("metadata".into(), metadata);
        Ok(output)
    }
}

/// Renders a configured template, substituting `{path}` placeholders with
/// dotted-path lookups into the input map.
///
/// Output: `rendered`.
pub struct TemplateAgent;

impl TemplateAgent {
    fn lookup<'a>(input: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
        let mut current = input;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current)
    }

    fn render(template: &str, input: &serde_json::Value) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            match rest[open + 1..].find('}') {
                Some(close) => {
                    let path = &rest[open + 1..open + 1 + close];
                    match Self::lookup(input, path) {
                        Some(serde_json::Value::String(s)) => out.push_str(s),
                        Some(value) => out.push_str(&value.to_string()),
                        // Unresolvable placeholders pass through verbatim.
                        None => {
                            out.push('{');
                            out.push_str(path);
                            out.push('}');
                        }
                    }
                    rest = &rest[open + close + 2..];
                }
                None => {
                    out.push_str(&rest[open..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

#[async_trait]
impl Agent for TemplateAgent {
    fn name(&self) -> &str {
        "template"
    }

    fn description(&self) -> &str {
        "Render a configured template over the step input"
    }

    async fn invoke(
        &self,
        input: &serde_json::Value,
        config: &serde_json::Value,
    ) -> Result<serde_json::Map<String, serde_json::Value>, AgentError> {
        let template = config
            .get("template")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AgentError::InvalidInput {
                agent: "template".into(),
                reason: "missing config field 'template'".into(),
            })?;

        let mut output = serde_json::Map::new();
        output.insert(
            "rendered".into(),
            serde_json::Value::String(Self::render(template, input)),
        );
        Ok(output)
    }
}
