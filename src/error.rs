//! Error types for mailflow.
//!
//! Each component converts its local failures to a typed error at the
//! boundary. Only load-time validation errors surface synchronously to the
//! caller; connectivity, agent, and delivery failures are captured into
//! results and never crash the process.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Inbox watcher error: {0}")]
    Watcher(#[from] WatcherError),

    #[error("Routing error: {0}")]
    Router(#[from] RouterError),

    #[error("Workflow validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Inbox watcher errors. `Connect` and `Timeout` are retried with backoff;
/// `AuthExpired` triggers one credential refresh cycle before escalating.
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("Inbox connection failed: {0}")]
    Connect(String),

    #[error("Inbox operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Inbox credentials expired or rejected: {0}")]
    AuthExpired(String),

    #[error("Inbox protocol error: {0}")]
    Protocol(String),

    #[error("Retry budget exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

impl WatcherError {
    /// Whether this failure class is retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Timeout(_))
    }
}

/// Routing configuration errors. Malformed regexes inside a rule are *not*
/// errors — they degrade to always-false predicates at compile time.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("Failed to read routing config {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Failed to parse routing config: {0}")]
    Parse(String),
}

/// Workflow document validation errors. Fatal at load time; reported before
/// any step executes.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Failed to read workflow {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Failed to parse workflow document: {0}")]
    Parse(String),

    #[error("Workflow '{workflow}' has duplicate step id '{step}'")]
    DuplicateStepId { workflow: String, step: String },

    #[error("Workflow '{workflow}' step '{step}' references unknown step '{reference}'")]
    UnknownReference {
        workflow: String,
        step: String,
        reference: String,
    },

    #[error("Workflow '{workflow}' has a dependency cycle involving step '{step}'")]
    Cycle { workflow: String, step: String },

    #[error("Workflow '{workflow}' has no steps")]
    Empty { workflow: String },

    #[error("Workflow '{workflow}' step '{step}' names unregistered agent '{agent}'")]
    UnknownAgent {
        workflow: String,
        step: String,
        agent: String,
    },

    #[error("Initial input is missing required field '{field}'")]
    MissingInputField { field: String },
}

/// Agent invocation errors, captured per step into the run record.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Agent '{0}' is not registered")]
    NotRegistered(String),

    #[error("Agent '{agent}' failed: {reason}")]
    Failed { agent: String, reason: String },

    #[error("Agent '{agent}' output missing declared field '{field}'")]
    OutputMissing { agent: String, field: String },

    #[error("Agent '{agent}' invalid input: {reason}")]
    InvalidInput { agent: String, reason: String },
}

/// Delivery transport errors. Never propagate into a finalized run; they are
/// recorded on the receipt only.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to build message: {0}")]
    Build(String),

    #[error("Transport send failed: {0}")]
    Send(String),

    #[error("Transport connect timed out after {0:?}")]
    Timeout(Duration),
}

/// Result type alias for mailflow.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_and_timeout_are_transient() {
        assert!(WatcherError::Connect("refused".into()).is_transient());
        assert!(WatcherError::Timeout(Duration::from_secs(30)).is_transient());
        assert!(!WatcherError::AuthExpired("401".into()).is_transient());
        assert!(!WatcherError::Protocol("bad greeting".into()).is_transient());
    }

    #[test]
    fn validation_error_display_names_workflow_and_step() {
        let err = ValidationError::UnknownReference {
            workflow: "digest".into(),
            step: "render".into(),
            reference: "missing".into(),
        };
        let text = err.to_string();
        assert!(text.contains("digest"));
        assert!(text.contains("render"));
        assert!(text.contains("missing"));
    }
}
