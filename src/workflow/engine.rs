//! DAG executor: dependency-ordered, bounded-concurrency step scheduling.
//!
//! Steps become ready the moment their dependency succeeds; ready steps are
//! always started in declaration order, so runs are reproducible. A slow
//! agent blocks only its own step and downstream dependents. A step whose
//! dependency did not succeed is skipped, transitively. Once all work stops
//! the run is finalized exactly once and the completion handler fires.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::config::EngineSettings;
use crate::error::{AgentError, ValidationError};
use crate::workflow::agent::AgentRegistry;
use crate::workflow::definition::WorkflowDefinition;
use crate::workflow::run::{RunStatus, StepResult, StepStatus, WorkflowRun};

/// Cooperative cancellation. Steps already running finish naturally (or hit
/// their timeout); steps not yet started are marked cancelled.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Invoked exactly once per run, after finalization, for every terminal
/// outcome including cancellation. Panics are caught and logged.
#[async_trait]
pub trait CompletionHandler: Send + Sync {
    async fn on_complete(&self, run: &WorkflowRun);
}

/// Per-run execution context.
#[derive(Clone, Default)]
pub struct RunContext {
    pub trigger_message_id: String,
    pub cancel: CancelToken,
    pub on_complete: Option<Arc<dyn CompletionHandler>>,
}

impl RunContext {
    pub fn for_message(trigger_message_id: &str) -> Self {
        Self {
            trigger_message_id: trigger_message_id.to_string(),
            ..Self::default()
        }
    }
}

struct StepOutcome {
    status: StepStatus,
    output: serde_json::Value,
    error: Option<String>,
    started_at: chrono::DateTime<Utc>,
    finished_at: chrono::DateTime<Utc>,
}

/// Executes workflow definitions against the agent registry.
pub struct WorkflowEngine {
    registry: Arc<AgentRegistry>,
    settings: EngineSettings,
}

impl WorkflowEngine {
    pub fn new(registry: Arc<AgentRegistry>, settings: EngineSettings) -> Self {
        Self { registry, settings }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Execute one run. Validation failures surface synchronously, before
    /// any step runs; everything after that is captured into the run record.
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        initial_input: serde_json::Value,
        ctx: RunContext,
    ) -> Result<WorkflowRun, ValidationError> {
        definition.validate()?;
        for step in &definition.steps {
            if !self.registry.contains(&step.agent) {
                return Err(ValidationError::UnknownAgent {
                    workflow: definition.workflow.name.clone(),
                    step: step.id.clone(),
                    agent: step.agent.clone(),
                });
            }
        }
        definition.validate_initial_input(&initial_input)?;

        let mut run = WorkflowRun::new(
            &definition.workflow.name,
            &ctx.trigger_message_id,
            initial_input,
            definition.steps.iter().map(|s| s.id.as_str()),
        );
        info!(
            run_id = %run.id,
            workflow = %run.workflow,
            steps = definition.steps.len(),
            "Workflow run started"
        );

        let index = definition.step_index();
        let deps: Vec<Option<usize>> = definition
            .steps
            .iter()
            .map(|s| s.dependency().map(|d| index[d]))
            .collect();
        let dependents = definition.dependents();

        let semaphore = Arc::new(Semaphore::new(self.settings.step_concurrency));
        let mut in_flight: FuturesUnordered<BoxFuture<'_, (usize, StepOutcome)>> =
            FuturesUnordered::new();
        let mut aborted = false;

        loop {
            if ctx.cancel.is_cancelled() && !aborted {
                cancel_pending(&mut run.steps);
                aborted = true;
            }
            if !aborted {
                // Ready steps start in declaration order.
                for idx in 0..run.steps.len() {
                    let ready = run.steps[idx].status == StepStatus::Pending
                        && deps[idx]
                            .map(|d| run.steps[d].status == StepStatus::Succeeded)
                            .unwrap_or(true);
                    if ready {
                        run.steps[idx].status = StepStatus::Running;
                        in_flight.push(self.spawn_step(definition, &run, idx, &semaphore));
                    }
                }
            }

            let Some((idx, outcome)) = in_flight.next().await else {
                break;
            };

            let step = &mut run.steps[idx];
            step.status = outcome.status;
            step.output = outcome.output;
            step.error = outcome.error;
            step.started_at = Some(outcome.started_at);
            step.finished_at = Some(outcome.finished_at);

            if matches!(outcome.status, StepStatus::Failed | StepStatus::TimedOut) {
                warn!(
                    run_id = %run.id,
                    step = %run.steps[idx].step_id,
                    status = ?outcome.status,
                    error = run.steps[idx].error.as_deref().unwrap_or(""),
                    "Step did not succeed"
                );
                skip_dependents(idx, &dependents, &mut run.steps);
                if self.settings.strict_fail && !aborted {
                    cancel_pending(&mut run.steps);
                    aborted = true;
                }
            }
        }

        // Post-validation this is unreachable, but never leave a step pending.
        cancel_pending(&mut run.steps);

        let status = overall_status(definition, &run, ctx.cancel.is_cancelled());
        run.finalize(status);
        info!(
            run_id = %run.id,
            workflow = %run.workflow,
            status = ?status,
            "Workflow run finished"
        );

        if let Some(handler) = &ctx.on_complete {
            notify(handler.as_ref(), &run).await;
        }

        Ok(run)
    }

    fn spawn_step<'a>(
        &'a self,
        definition: &WorkflowDefinition,
        run: &WorkflowRun,
        idx: usize,
        semaphore: &Arc<Semaphore>,
    ) -> BoxFuture<'a, (usize, StepOutcome)> {
        let step = &definition.steps[idx];
        let agent = self.registry.get(&step.agent);
        let agent_name = step.agent.clone();
        let declared_outputs = step.outputs.clone();
        let config = serde_json::Value::Object(step.config.clone());
        let input = match step.dependency() {
            None => run.initial_input.clone(),
            Some(dep) => run
                .step(dep)
                .map(|s| s.output.clone())
                .unwrap_or(serde_json::Value::Null),
        };
        let timeout = self.settings.step_timeout;
        let semaphore = semaphore.clone();

        async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let started_at = Utc::now();

            let result = match &agent {
                Some(agent) => tokio::time::timeout(timeout, agent.invoke(&input, &config))
                    .await
                    .map_err(|_| None)
                    .and_then(|r| r.map_err(Some)),
                None => Err(Some(AgentError::NotRegistered(agent_name.clone()))),
            };
            let finished_at = Utc::now();

            let outcome = match result {
                Ok(map) => match declared_outputs.iter().find(|f| !map.contains_key(*f)) {
                    Some(missing) => StepOutcome {
                        status: StepStatus::Failed,
                        output: serde_json::Value::Object(serde_json::Map::new()),
                        error: Some(
                            AgentError::OutputMissing {
                                agent: agent_name,
                                field: missing.clone(),
                            }
                            .to_string(),
                        ),
                        started_at,
                        finished_at,
                    },
                    None => StepOutcome {
                        status: StepStatus::Succeeded,
                        output: serde_json::Value::Object(map),
                        error: None,
                        started_at,
                        finished_at,
                    },
                },
                Err(Some(err)) => StepOutcome {
                    status: StepStatus::Failed,
                    output: serde_json::Value::Object(serde_json::Map::new()),
                    error: Some(err.to_string()),
                    started_at,
                    finished_at,
                },
                // Timeout elapsed before the agent returned.
                Err(None) => StepOutcome {
                    status: StepStatus::TimedOut,
                    output: serde_json::Value::Object(serde_json::Map::new()),
                    error: Some(format!("step timed out after {timeout:?}")),
                    started_at,
                    finished_at,
                },
            };
            (idx, outcome)
        }
        .boxed()
    }
}

/// Transitively mark pending dependents of a non-succeeded step as skipped.
fn skip_dependents(idx: usize, dependents: &[Vec<usize>], steps: &mut [StepResult]) {
    let mut stack = dependents[idx].to_vec();
    while let Some(i) = stack.pop() {
        if steps[i].status == StepStatus::Pending {
            steps[i].status = StepStatus::Skipped;
            steps[i].error = Some("upstream step did not succeed".into());
            stack.extend_from_slice(&dependents[i]);
        }
    }
}

fn cancel_pending(steps: &mut [StepResult]) {
    for step in steps {
        if step.status == StepStatus::Pending {
            step.status = StepStatus::Cancelled;
        }
    }
}

/// Succeeded when every step succeeded; failed when no terminal branch
/// produced a success; partial otherwise.
fn overall_status(definition: &WorkflowDefinition, run: &WorkflowRun, cancelled: bool) -> RunStatus {
    if cancelled {
        return RunStatus::Cancelled;
    }
    if run
        .steps
        .iter()
        .all(|s| s.status == StepStatus::Succeeded)
    {
        return RunStatus::Succeeded;
    }
    let any_leaf_succeeded = definition
        .leaf_indices()
        .into_iter()
        .any(|i| run.steps[i].status == StepStatus::Succeeded);
    if any_leaf_succeeded {
        RunStatus::Partial
    } else {
        RunStatus::Failed
    }
}

async fn notify(handler: &dyn CompletionHandler, run: &WorkflowRun) {
    let outcome = AssertUnwindSafe(handler.on_complete(run)).catch_unwind().await;
    if let Err(panic) = outcome {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".into());
        error!(run_id = %run.id, %reason, "Completion handler panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use crate::workflow::agent::Agent;

    struct EchoAgent;

    #[async_trait]
    impl Agent for EchoAgent {
        fn name(&self) -> &str {
            "echo"
        }

        async fn invoke(
            &self,
            input: &serde_json::Value,
            _config: &serde_json::Value,
        ) -> Result<serde_json::Map<String, serde_json::Value>, AgentError> {
            let mut out = serde_json::Map::new();
            out.insert("value".into(), input.clone());
            Ok(out)
        }
    }

    struct FailAgent;

    #[async_trait]
    impl Agent for FailAgent {
        fn name(&self) -> &str {
            "fail"
        }

        async fn invoke(
            &self,
            _input: &serde_json::Value,
            _config: &serde_json::Value,
        ) -> Result<serde_json::Map<String, serde_json::Value>, AgentError> {
            Err(AgentError::Failed {
                agent: "fail".into(),
                reason: "boom".into(),
            })
        }
    }

    struct SlowAgent(Duration);

    #[async_trait]
    impl Agent for SlowAgent {
        fn name(&self) -> &str {
            "slow"
        }

        async fn invoke(
            &self,
            _input: &serde_json::Value,
            _config: &serde_json::Value,
        ) -> Result<serde_json::Map<String, serde_json::Value>, AgentError> {
            tokio::time::sleep(self.0).await;
            Ok(serde_json::Map::new())
        }
    }

    struct WrongOutputAgent;

    #[async_trait]
    impl Agent for WrongOutputAgent {
        fn name(&self) -> &str {
            "wrong"
        }

        async fn invoke(
            &self,
            _input: &serde_json::Value,
            _config: &serde_json::Value,
        ) -> Result<serde_json::Map<String, serde_json::Value>, AgentError> {
            let mut out = serde_json::Map::new();
            out.insert("unexpected".into(), serde_json::json!(1));
            Ok(out)
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        calls: AtomicUsize,
        last_status: std::sync::Mutex<Option<RunStatus>>,
    }

    #[async_trait]
    impl CompletionHandler for RecordingHandler {
        async fn on_complete(&self, run: &WorkflowRun) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_status.lock().unwrap() = run.status;
        }
    }

    struct PanickyHandler;

    #[async_trait]
    impl CompletionHandler for PanickyHandler {
        async fn on_complete(&self, _run: &WorkflowRun) {
            panic!("handler exploded");
        }
    }

    fn registry() -> Arc<AgentRegistry> {
        let mut r = AgentRegistry::new();
        r.register(Arc::new(EchoAgent));
        r.register(Arc::new(FailAgent));
        r.register(Arc::new(SlowAgent(Duration::from_millis(250))));
        r.register(Arc::new(WrongOutputAgent));
        Arc::new(r)
    }

    fn engine() -> WorkflowEngine {
        WorkflowEngine::new(registry(), EngineSettings::default())
    }

    fn definition(doc: &str) -> WorkflowDefinition {
        WorkflowDefinition::from_toml(doc).unwrap()
    }

    const CHAIN: &str = r#"
        [workflow]
        name = "chain"
        version = "1"

        [[steps]]
        id = "a"
        agent = "echo"

        [[steps]]
        id = "b"
        agent = "echo"
        input_from = "a"

        [[steps]]
        id = "c"
        agent = "echo"
        input_from = "b"
    "#;

    #[tokio::test]
    async fn chain_runs_in_dependency_order() {
        let run = engine()
            .execute(
                &definition(CHAIN),
                serde_json::json!({"body": "x"}),
                RunContext::for_message("m-1"),
            )
            .await
            .unwrap();

        assert_eq!(run.status, Some(RunStatus::Succeeded));
        for step in &run.steps {
            assert_eq!(step.status, StepStatus::Succeeded);
        }
        // Each step starts only after its dependency finished.
        let a_done = run.step("a").unwrap().finished_at.unwrap();
        let b_start = run.step("b").unwrap().started_at.unwrap();
        let b_done = run.step("b").unwrap().finished_at.unwrap();
        let c_start = run.step("c").unwrap().started_at.unwrap();
        assert!(b_start >= a_done);
        assert!(c_start >= b_done);
    }

    // A failed step skips its dependents; an independent branch still runs.
    #[tokio::test]
    async fn failure_skips_dependents_but_not_siblings() {
        let doc = r#"
            [workflow]
            name = "branchy"
            version = "1"

            [[steps]]
            id = "broken"
            agent = "fail"

            [[steps]]
            id = "downstream"
            agent = "echo"
            input_from = "broken"

            [[steps]]
            id = "sibling"
            agent = "echo"
        "#;
        let run = engine()
            .execute(
                &definition(doc),
                serde_json::json!({}),
                RunContext::for_message("m-2"),
            )
            .await
            .unwrap();

        assert_eq!(run.step("broken").unwrap().status, StepStatus::Failed);
        assert_eq!(run.step("downstream").unwrap().status, StepStatus::Skipped);
        assert_eq!(run.step("sibling").unwrap().status, StepStatus::Succeeded);
        assert_eq!(run.status, Some(RunStatus::Partial));
    }

    #[tokio::test]
    async fn all_branches_failing_fails_the_run() {
        let doc = r#"
            [workflow]
            name = "doomed"
            version = "1"

            [[steps]]
            id = "first"
            agent = "fail"

            [[steps]]
            id = "second"
            agent = "echo"
            input_from = "first"
        "#;
        let run = engine()
            .execute(
                &definition(doc),
                serde_json::json!({}),
                RunContext::for_message("m-3"),
            )
            .await
            .unwrap();

        assert_eq!(run.status, Some(RunStatus::Failed));
    }

    #[tokio::test]
    async fn slow_step_times_out() {
        let doc = r#"
            [workflow]
            name = "sluggish"
            version = "1"

            [[steps]]
            id = "crawl"
            agent = "slow"

            [[steps]]
            id = "after"
            agent = "echo"
            input_from = "crawl"
        "#;
        let settings = EngineSettings {
            step_timeout: Duration::from_millis(20),
            ..EngineSettings::default()
        };
        let run = WorkflowEngine::new(registry(), settings)
            .execute(
                &definition(doc),
                serde_json::json!({}),
                RunContext::for_message("m-4"),
            )
            .await
            .unwrap();

        assert_eq!(run.step("crawl").unwrap().status, StepStatus::TimedOut);
        assert_eq!(run.step("after").unwrap().status, StepStatus::Skipped);
        assert_eq!(run.status, Some(RunStatus::Failed));
    }

    #[tokio::test]
    async fn missing_declared_output_fails_the_step() {
        let doc = r#"
            [workflow]
            name = "contract"
            version = "1"

            [[steps]]
            id = "only"
            agent = "wrong"
            outputs = ["expected"]
        "#;
        let run = engine()
            .execute(
                &definition(doc),
                serde_json::json!({}),
                RunContext::for_message("m-5"),
            )
            .await
            .unwrap();

        let step = run.step("only").unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert!(step.error.as_deref().unwrap().contains("expected"));
    }

    #[tokio::test]
    async fn strict_fail_cancels_unstarted_steps() {
        let doc = r#"
            [workflow]
            name = "strict"
            version = "1"

            [[steps]]
            id = "bad"
            agent = "fail"

            [[steps]]
            id = "crawl"
            agent = "slow"

            [[steps]]
            id = "after"
            agent = "echo"
            input_from = "crawl"
        "#;
        let settings = EngineSettings {
            strict_fail: true,
            ..EngineSettings::default()
        };
        let run = WorkflowEngine::new(registry(), settings)
            .execute(
                &definition(doc),
                serde_json::json!({}),
                RunContext::for_message("m-6"),
            )
            .await
            .unwrap();

        assert_eq!(run.step("bad").unwrap().status, StepStatus::Failed);
        // The already-running step finishes naturally; its unstarted
        // dependent is cancelled by the abort.
        assert_eq!(run.step("crawl").unwrap().status, StepStatus::Succeeded);
        assert_eq!(run.step("after").unwrap().status, StepStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_before_start_marks_everything_cancelled() {
        let ctx = RunContext::for_message("m-7");
        ctx.cancel.cancel();
        let handler = Arc::new(RecordingHandler::default());
        let ctx = RunContext {
            on_complete: Some(handler.clone()),
            ..ctx
        };

        let run = engine()
            .execute(&definition(CHAIN), serde_json::json!({}), ctx)
            .await
            .unwrap();

        assert_eq!(run.status, Some(RunStatus::Cancelled));
        for step in &run.steps {
            assert_eq!(step.status, StepStatus::Cancelled);
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *handler.last_status.lock().unwrap(),
            Some(RunStatus::Cancelled)
        );
    }

    #[tokio::test]
    async fn completion_handler_fires_once_on_success() {
        let handler = Arc::new(RecordingHandler::default());
        let ctx = RunContext {
            trigger_message_id: "m-8".into(),
            on_complete: Some(handler.clone()),
            ..RunContext::default()
        };

        engine()
            .execute(&definition(CHAIN), serde_json::json!({}), ctx)
            .await
            .unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *handler.last_status.lock().unwrap(),
            Some(RunStatus::Succeeded)
        );
    }

    #[tokio::test]
    async fn panicking_handler_does_not_poison_the_run() {
        let ctx = RunContext {
            trigger_message_id: "m-9".into(),
            on_complete: Some(Arc::new(PanickyHandler)),
            ..RunContext::default()
        };

        let run = engine()
            .execute(&definition(CHAIN), serde_json::json!({}), ctx)
            .await
            .unwrap();
        assert_eq!(run.status, Some(RunStatus::Succeeded));
    }

    #[tokio::test]
    async fn unknown_agent_is_a_synchronous_validation_error() {
        let doc = r#"
            [workflow]
            name = "ghost"
            version = "1"

            [[steps]]
            id = "only"
            agent = "does-not-exist"
        "#;
        let err = engine()
            .execute(
                &definition(doc),
                serde_json::json!({}),
                RunContext::for_message("m-10"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ValidationError::UnknownAgent { .. }));
    }

    #[tokio::test]
    async fn repeated_runs_yield_identical_step_outcomes() {
        let doc = r#"
            [workflow]
            name = "repeat"
            version = "1"

            [[steps]]
            id = "a"
            agent = "echo"

            [[steps]]
            id = "b"
            agent = "fail"

            [[steps]]
            id = "c"
            agent = "echo"
            input_from = "b"
        "#;
        let def = definition(doc);
        let eng = engine();

        let mut outcomes = Vec::new();
        for i in 0..5 {
            let run = eng
                .execute(
                    &def,
                    serde_json::json!({}),
                    RunContext::for_message(&format!("m-{i}")),
                )
                .await
                .unwrap();
            outcomes.push((
                run.steps.iter().map(|s| s.status).collect::<Vec<_>>(),
                run.status,
            ));
        }
        for outcome in &outcomes[1..] {
            assert_eq!(outcome, &outcomes[0]);
        }
    }
}
