//! Run records: per-step results and the run-level outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// An upstream dependency did not succeed; the step never ran.
    Skipped,
    /// The run was aborted before the step started.
    Cancelled,
    TimedOut,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// Outcome of one step within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    /// Agent output map; empty object until the step succeeds.
    pub output: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepResult {
    pub fn pending(step_id: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Pending,
            output: serde_json::Value::Object(serde_json::Map::new()),
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Run-level outcome, derived from step statuses once all work has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    /// Some branches succeeded, some did not.
    Partial,
    /// Every terminal branch ended without success.
    Failed,
    Cancelled,
}

/// A single execution of a workflow, triggered by one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub workflow: String,
    /// Id of the inbound message that triggered this run.
    pub trigger_message_id: String,
    pub initial_input: serde_json::Value,
    /// Step results in declaration order.
    pub steps: Vec<StepResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    pub fn new(
        workflow: &str,
        trigger_message_id: &str,
        initial_input: serde_json::Value,
        step_ids: impl IntoIterator<Item = impl AsRef<str>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow: workflow.to_string(),
            trigger_message_id: trigger_message_id.to_string(),
            initial_input,
            steps: step_ids
                .into_iter()
                .map(|id| StepResult::pending(id.as_ref()))
                .collect(),
            status: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.status.is_some()
    }

    /// Seal the run. A second call is a logic error and is ignored so the
    /// first recorded outcome always stands.
    pub fn finalize(&mut self, status: RunStatus) {
        if self.is_finalized() {
            debug_assert!(false, "run finalized twice");
            return;
        }
        self.status = Some(status);
        self.completed_at = Some(Utc::now());
    }

    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_and_running_are_not_terminal() {
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
        for s in [
            StepStatus::Succeeded,
            StepStatus::Failed,
            StepStatus::Skipped,
            StepStatus::Cancelled,
            StepStatus::TimedOut,
        ] {
            assert!(s.is_terminal());
        }
    }

    #[test]
    fn finalize_is_exactly_once() {
        let mut run = WorkflowRun::new("wf", "m-1", serde_json::json!({}), ["a"]);
        assert!(!run.is_finalized());
        run.finalize(RunStatus::Succeeded);
        let completed = run.completed_at;
        assert_eq!(run.status, Some(RunStatus::Succeeded));

        // Release builds ignore a second finalize.
        if !cfg!(debug_assertions) {
            run.finalize(RunStatus::Failed);
            assert_eq!(run.status, Some(RunStatus::Succeeded));
            assert_eq!(run.completed_at, completed);
        }
    }

    #[test]
    fn run_serializes_with_step_statuses() {
        let run = WorkflowRun::new("wf", "m-1", serde_json::json!({"body": "x"}), ["a", "b"]);
        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["workflow"], "wf");
        assert_eq!(json["steps"][0]["status"], "pending");
        assert_eq!(json["steps"][1]["step_id"], "b");
    }
}
