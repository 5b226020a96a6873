//! Inbox source trait — pure I/O seam between the watcher and a mailbox.
//!
//! The production implementation is IMAP; tests plug in scripted sources.

use async_trait::async_trait;

use crate::error::WatcherError;
use crate::inbox::message::{Checkpoint, InboundMessage};

/// One delta fetch: messages newer than the requested checkpoint, each paired
/// with the checkpoint value that covers it.
///
/// The per-message checkpoint lets the caller persist progress after every
/// hand-off, giving at-least-once delivery without re-fetching the batch.
#[derive(Debug, Default)]
pub struct FetchBatch {
    pub messages: Vec<(InboundMessage, Checkpoint)>,
    /// Position after the whole batch, valid even when `messages` is empty
    /// (e.g. only malformed or filtered mail arrived).
    pub checkpoint: Checkpoint,
}

/// A mailbox the watcher can poll incrementally.
#[async_trait]
pub trait InboxSource: Send + Sync {
    /// Source name for logging ("imap", "mock").
    fn name(&self) -> &str;

    /// Fetch only messages past `checkpoint` — never a full re-scan.
    ///
    /// Malformed individual messages must be logged and skipped while the
    /// returned checkpoint still advances past them.
    async fn fetch_since(&self, checkpoint: Checkpoint) -> Result<FetchBatch, WatcherError>;

    /// Attempt to refresh expired credentials.
    ///
    /// Called at most once per poll when `fetch_since` reports
    /// [`WatcherError::AuthExpired`]. Sources without refreshable credentials
    /// keep the default and let the error escalate.
    async fn refresh_credentials(&self) -> Result<(), WatcherError> {
        Err(WatcherError::AuthExpired(
            "credential refresh not supported by this source".into(),
        ))
    }
}
