//! mailflow — email-triggered workflow automation.
//!
//! An inbox watcher polls a mailbox for new trigger messages, a rule-based
//! router maps each message to a declarative workflow document, a DAG engine
//! executes the workflow's agent steps, and a delivery adapter mails the
//! rendered result back out.

pub mod config;
pub mod delivery;
pub mod error;
pub mod inbox;
pub mod orchestrator;
pub mod router;
pub mod workflow;

pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, PipelineStats};
