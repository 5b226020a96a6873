//! Pipeline orchestrator: watcher → router → engine → delivery.
//!
//! Owns the end-to-end flow for both one-shot and continuous modes. The
//! inbox checkpoint is persisted after each handled message (at-least-once),
//! workflow documents are cached read-mostly, and a global semaphore caps
//! runs in flight. Shutdown stops intake and drains in-flight runs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::delivery::{Attribution, DeliveryAdapter};
use crate::error::{ConfigError, Result, ValidationError};
use crate::inbox::{Checkpoint, InboundMessage, InboxWatcher};
use crate::router::WorkflowRouter;
use crate::workflow::{RunContext, RunStatus, WorkflowDefinition, WorkflowEngine};

/// Counters snapshot, reported at exit and on demand.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub messages_seen: u64,
    pub runs_succeeded: u64,
    pub runs_partial: u64,
    pub runs_failed: u64,
    pub runs_cancelled: u64,
    pub deliveries_sent: u64,
    pub deliveries_failed: u64,
    pub workflow_load_failures: u64,
}

#[derive(Default)]
struct StatCounters {
    messages_seen: AtomicU64,
    runs_succeeded: AtomicU64,
    runs_partial: AtomicU64,
    runs_failed: AtomicU64,
    runs_cancelled: AtomicU64,
    deliveries_sent: AtomicU64,
    deliveries_failed: AtomicU64,
    workflow_load_failures: AtomicU64,
}

impl StatCounters {
    fn record_run(&self, status: Option<RunStatus>) {
        let counter = match status {
            Some(RunStatus::Succeeded) => &self.runs_succeeded,
            Some(RunStatus::Partial) => &self.runs_partial,
            Some(RunStatus::Cancelled) => &self.runs_cancelled,
            Some(RunStatus::Failed) | None => &self.runs_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            messages_seen: self.messages_seen.load(Ordering::Relaxed),
            runs_succeeded: self.runs_succeeded.load(Ordering::Relaxed),
            runs_partial: self.runs_partial.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            runs_cancelled: self.runs_cancelled.load(Ordering::Relaxed),
            deliveries_sent: self.deliveries_sent.load(Ordering::Relaxed),
            deliveries_failed: self.deliveries_failed.load(Ordering::Relaxed),
            workflow_load_failures: self.workflow_load_failures.load(Ordering::Relaxed),
        }
    }
}

/// Read-mostly cache of validated workflow documents, keyed by path.
pub struct WorkflowLibrary {
    dir: PathBuf,
    cache: RwLock<HashMap<PathBuf, Arc<WorkflowDefinition>>>,
}

impl WorkflowLibrary {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Load (and cache) the document at `workflow_path`, relative to the
    /// library directory. Validation runs once, at load.
    pub fn load(&self, workflow_path: &str) -> std::result::Result<Arc<WorkflowDefinition>, ValidationError> {
        let full = self.dir.join(workflow_path);
        if let Some(def) = self
            .cache
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&full)
        {
            return Ok(def.clone());
        }
        let def = Arc::new(WorkflowDefinition::from_file(&full)?);
        self.cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(full, def.clone());
        Ok(def)
    }

    /// Drop cached documents so edited files are re-read on next use.
    pub fn invalidate(&self) {
        self.cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

struct Inner {
    watcher: InboxWatcher,
    router: WorkflowRouter,
    library: WorkflowLibrary,
    engine: WorkflowEngine,
    delivery: DeliveryAdapter,
    checkpoint_path: PathBuf,
    /// Highest checkpoint persisted so far; out-of-order run completions
    /// must never move the file backwards.
    highwater: Mutex<Checkpoint>,
    max_concurrent_runs: usize,
    stats: StatCounters,
}

impl Inner {
    /// Route, execute, and deliver one message. Only workflow load/validation
    /// failures surface as errors; run and delivery failures are recorded in
    /// the stats and the logs.
    async fn process(&self, message: InboundMessage) -> std::result::Result<(), ValidationError> {
        self.stats.messages_seen.fetch_add(1, Ordering::Relaxed);

        let workflow_path = self.router.route(&message);
        info!(
            message_id = %message.id,
            sender = %message.sender,
            workflow = %workflow_path,
            "Message routed"
        );

        let definition = match self.library.load(&workflow_path) {
            Ok(def) => def,
            Err(e) => {
                self.stats
                    .workflow_load_failures
                    .fetch_add(1, Ordering::Relaxed);
                error!(workflow = %workflow_path, error = %e, "Workflow failed to load");
                return Err(e);
            }
        };

        let run = match self
            .engine
            .execute(
                &definition,
                initial_input(&message),
                RunContext::for_message(&message.id),
            )
            .await
        {
            Ok(run) => run,
            Err(e) => {
                self.stats
                    .workflow_load_failures
                    .fetch_add(1, Ordering::Relaxed);
                error!(workflow = %workflow_path, error = %e, "Workflow rejected at validation");
                return Err(e);
            }
        };
        self.stats.record_run(run.status);

        let attribution = Attribution {
            sender: message.sender.clone(),
            subject: message.subject.clone(),
        };
        let receipt = self.delivery.deliver(&run, &definition, &attribution).await;
        let counter = if receipt.sent {
            &self.stats.deliveries_sent
        } else {
            &self.stats.deliveries_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Persist `checkpoint` unless a later one is already on disk.
    fn persist_checkpoint(&self, checkpoint: Checkpoint) -> std::io::Result<()> {
        let mut highwater = self
            .highwater
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let advances = checkpoint.uid_validity != highwater.uid_validity
            || checkpoint.last_uid > highwater.last_uid;
        if advances {
            checkpoint.save(&self.checkpoint_path)?;
            *highwater = checkpoint;
        }
        Ok(())
    }

    fn load_checkpoint(&self) -> std::io::Result<Checkpoint> {
        let checkpoint = Checkpoint::load(&self.checkpoint_path)?;
        *self
            .highwater
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = checkpoint;
        Ok(checkpoint)
    }
}

/// The assembled pipeline.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        watcher: InboxWatcher,
        router: WorkflowRouter,
        engine: WorkflowEngine,
        delivery: DeliveryAdapter,
        workflows_dir: impl Into<PathBuf>,
        checkpoint_path: impl Into<PathBuf>,
        max_concurrent_runs: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                watcher,
                router,
                library: WorkflowLibrary::new(workflows_dir),
                engine,
                delivery,
                checkpoint_path: checkpoint_path.into(),
                highwater: Mutex::new(Checkpoint::default()),
                max_concurrent_runs: max_concurrent_runs.max(1),
                stats: StatCounters::default(),
            }),
        }
    }

    pub fn stats(&self) -> PipelineStats {
        self.inner.stats.snapshot()
    }

    /// Whether the inbox is in a degraded state (retry budget exhausted).
    pub fn is_degraded(&self) -> bool {
        self.inner.watcher.is_degraded()
    }

    /// Swap in new routing rules and drop cached workflow documents.
    pub fn reload_routing(&self, config: crate::router::RoutingConfig) {
        self.inner.router.reload(config);
        self.inner.library.invalidate();
    }

    /// One-shot mode: poll once, process every new message sequentially,
    /// and exit. A workflow load/validation failure is reported as an error
    /// after the whole batch is drained, so one bad document cannot wedge
    /// the checkpoint behind a poison message.
    pub async fn run_once(&self) -> Result<PipelineStats> {
        let inner = &self.inner;
        let checkpoint = inner.load_checkpoint().map_err(ConfigError::Io)?;
        let batch = inner.watcher.poll(checkpoint).await?;
        info!(messages = batch.messages.len(), "One-shot poll complete");

        let mut first_failure: Option<ValidationError> = None;
        for (message, message_checkpoint) in batch.messages {
            let outcome = inner.process(message).await;
            inner
                .persist_checkpoint(message_checkpoint)
                .map_err(ConfigError::Io)?;
            if let Err(e) = outcome {
                first_failure.get_or_insert(e);
            }
        }
        inner
            .persist_checkpoint(batch.checkpoint)
            .map_err(ConfigError::Io)?;

        match first_failure {
            Some(e) => Err(e.into()),
            None => Ok(inner.stats.snapshot()),
        }
    }

    /// Continuous mode: stream messages and dispatch each to a concurrent
    /// run, capped by `max_concurrent_runs`. Flipping `stop` to true stops
    /// intake; in-flight runs finish before this returns.
    pub async fn run_forever(
        &self,
        mut stop: tokio::sync::watch::Receiver<bool>,
    ) -> Result<PipelineStats> {
        let inner = self.inner.clone();
        let checkpoint = inner.load_checkpoint().map_err(ConfigError::Io)?;
        let mut stream = inner.watcher.watch(checkpoint);
        let semaphore = Arc::new(Semaphore::new(inner.max_concurrent_runs));
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                item = stream.next() => {
                    let Some((message, message_checkpoint)) = item else {
                        break;
                    };
                    // Back-pressure: intake waits when at capacity.
                    let permit = semaphore.clone().acquire_owned().await.ok();
                    let task_inner = inner.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        if let Err(e) = task_inner.process(message).await {
                            error!(error = %e, "Message skipped after load failure");
                        }
                        if let Err(e) = task_inner.persist_checkpoint(message_checkpoint) {
                            error!(error = %e, "Failed to persist checkpoint");
                        }
                    });
                    while tasks.try_join_next().is_some() {}
                }
            }
        }

        drop(stream);
        info!(in_flight = tasks.len(), "Stop requested, draining in-flight runs");
        while tasks.join_next().await.is_some() {}
        Ok(inner.stats.snapshot())
    }
}

/// The initial input a triggering message contributes to its run.
fn initial_input(message: &InboundMessage) -> serde_json::Value {
    serde_json::json!({
        "message_id": message.id,
        "sender": message.sender,
        "subject": message.subject,
        "body": message.body,
        "attachments": message.attachments,
        "received_at": message.received_at,
    })
}
