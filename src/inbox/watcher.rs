//! Checkpointed inbox watcher.
//!
//! Wraps an [`InboxSource`] with the retry and health policy the pipeline
//! needs: transient connectivity failures retry with exponential backoff,
//! an exhausted budget degrades health instead of killing the process, and
//! expired credentials get exactly one refresh-and-retry cycle per poll
//! before escalating.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::Stream;
use tracing::{debug, error, info, warn};

use crate::config::PollRetryConfig;
use crate::error::WatcherError;
use crate::inbox::message::{Checkpoint, InboundMessage};
use crate::inbox::source::{FetchBatch, InboxSource};

/// Stream of `(message, checkpoint)` pairs for continuous mode. The caller
/// persists each checkpoint after handling its message (at-least-once).
pub type MessageStream = Pin<Box<dyn Stream<Item = (InboundMessage, Checkpoint)> + Send>>;

/// Exponential backoff schedule for transient poll failures.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based), capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis = self.base_delay.as_millis() as f64 * factor;
        Duration::from_millis(millis as u64).min(self.max_delay)
    }
}

impl From<&PollRetryConfig> for BackoffPolicy {
    fn from(cfg: &PollRetryConfig) -> Self {
        Self {
            base_delay: cfg.base_delay,
            multiplier: cfg.multiplier,
            max_delay: cfg.max_delay,
            max_attempts: cfg.max_attempts,
        }
    }
}

/// Detects new trigger messages since a checkpoint.
#[derive(Clone)]
pub struct InboxWatcher {
    source: Arc<dyn InboxSource>,
    backoff: BackoffPolicy,
    poll_interval: Duration,
    degraded: Arc<AtomicBool>,
}

impl InboxWatcher {
    pub fn new(source: Arc<dyn InboxSource>, backoff: BackoffPolicy, poll_interval: Duration) -> Self {
        Self {
            source,
            backoff,
            poll_interval,
            degraded: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether the last poll exhausted its retry budget.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Fetch the delta since `checkpoint`.
    ///
    /// Transient failures retry under the backoff policy; exhausting the
    /// budget returns an *empty* batch with the checkpoint unchanged and
    /// flips the health flag — the process stays up. Auth expiry triggers one
    /// credential refresh, then escalates as an error.
    pub async fn poll(&self, checkpoint: Checkpoint) -> Result<FetchBatch, WatcherError> {
        let mut refreshed = false;
        let mut attempt: u32 = 0;
        let mut last_error = String::new();

        loop {
            attempt += 1;
            match self.source.fetch_since(checkpoint).await {
                Ok(batch) => {
                    if self.degraded.swap(false, Ordering::Relaxed) {
                        info!(source = self.source.name(), "Inbox connectivity recovered");
                    }
                    debug!(
                        source = self.source.name(),
                        messages = batch.messages.len(),
                        last_uid = batch.checkpoint.last_uid,
                        "Poll complete"
                    );
                    return Ok(batch);
                }
                Err(e) if e.is_transient() => {
                    last_error = e.to_string();
                    if attempt >= self.backoff.max_attempts {
                        break;
                    }
                    let delay = self.backoff.delay_for(attempt);
                    warn!(
                        source = self.source.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient poll failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(WatcherError::AuthExpired(reason)) if !refreshed => {
                    warn!(
                        source = self.source.name(),
                        reason = %reason,
                        "Credentials rejected, attempting one refresh"
                    );
                    self.source.refresh_credentials().await?;
                    refreshed = true;
                    // Refresh retry does not consume the backoff budget.
                    attempt -= 1;
                }
                Err(e) => return Err(e),
            }
        }

        // HEALTH_DEGRADED: non-fatal, checkpoint untouched.
        self.degraded.store(true, Ordering::Relaxed);
        error!(
            source = self.source.name(),
            attempts = attempt,
            last_error = %last_error,
            "Poll retry budget exhausted, marking inbox degraded"
        );
        Ok(FetchBatch {
            messages: Vec::new(),
            checkpoint,
        })
    }

    /// Continuous mode: poll on an interval and stream each message with the
    /// checkpoint covering it. The stream ends when the consumer drops it.
    pub fn watch(&self, checkpoint: Checkpoint) -> MessageStream {
        let (tx, rx) = tokio::sync::mpsc::channel::<(InboundMessage, Checkpoint)>(64);
        let watcher = self.clone();

        tokio::spawn(async move {
            info!(
                source = watcher.source.name(),
                interval_secs = watcher.poll_interval.as_secs(),
                "Inbox watch loop started"
            );
            let mut tick = tokio::time::interval(watcher.poll_interval);
            let mut cursor = checkpoint;

            loop {
                tick.tick().await;

                let batch = match watcher.poll(cursor).await {
                    Ok(batch) => batch,
                    Err(e) => {
                        // Per-poll failure never stops continuous mode.
                        error!(error = %e, "Poll failed, continuing");
                        continue;
                    }
                };

                // Advance the cursor only as messages are handed off; the
                // final batch checkpoint covers filtered/malformed mail.
                for (message, message_checkpoint) in batch.messages {
                    if tx.send((message, message_checkpoint)).await.is_err() {
                        info!("Watch consumer dropped, stopping inbox loop");
                        return;
                    }
                    cursor = message_checkpoint;
                }
                cursor = batch.checkpoint;
            }
        });

        Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx))
    }
}
