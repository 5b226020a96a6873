//! Workflow definitions, agents, and the DAG execution engine.

pub mod agent;
pub mod definition;
pub mod engine;
pub mod run;

pub use agent::{Agent, AgentRegistry, IngestAgent, TemplateAgent};
pub use definition::{
    InputField, OutputFormat, OutputSpec, StepDefinition, WorkflowDefinition, WorkflowMeta,
    resolve_dotted,
};
pub use engine::{CancelToken, CompletionHandler, RunContext, WorkflowEngine};
pub use run::{RunStatus, StepResult, StepStatus, WorkflowRun};
