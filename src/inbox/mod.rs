//! Inbox watching: checkpointed delta polling over a pluggable source.

pub mod imap;
pub mod message;
pub mod source;
pub mod watcher;

pub use imap::ImapSource;
pub use message::{Attachment, Checkpoint, InboundMessage};
pub use source::{FetchBatch, InboxSource};
pub use watcher::{BackoffPolicy, InboxWatcher, MessageStream};
