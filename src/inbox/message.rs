//! Inbound message and checkpoint value types.
//!
//! The checkpoint is an explicit value the caller persists between watcher
//! invocations — never hidden watcher state — so resumption is testable.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single attachment on an inbound message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub size_bytes: usize,
}

/// Normalized trigger event consumed by the router.
///
/// Created by the inbox watcher, consumed once by the router, then
/// discardable. Immutable after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Channel-native id (Message-ID header) or a generated UUID.
    pub id: String,
    /// Sender address, e.g. `legal@example.com`.
    pub sender: String,
    pub subject: Option<String>,
    pub body: String,
    pub attachments: Vec<Attachment>,
    /// Raw channel metadata (headers, UID, reply hints).
    pub metadata: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// The domain part of the sender address, lowercased.
    pub fn sender_domain(&self) -> Option<String> {
        self.sender
            .rsplit_once('@')
            .map(|(_, domain)| domain.to_lowercase())
    }

    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }
}

/// Persisted marker of the last successfully processed inbox position.
///
/// For IMAP this is the mailbox UIDVALIDITY plus the highest UID handed to
/// the router. A UIDVALIDITY change invalidates `last_uid`; the source resets
/// it to zero and re-fetches (duplicates are tolerated downstream).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub uid_validity: u32,
    pub last_uid: u32,
}

impl Checkpoint {
    pub fn new(uid_validity: u32, last_uid: u32) -> Self {
        Self {
            uid_validity,
            last_uid,
        }
    }

    /// Advance past `uid`, keeping the checkpoint monotonic.
    pub fn advanced_to(self, uid: u32) -> Self {
        Self {
            uid_validity: self.uid_validity,
            last_uid: self.last_uid.max(uid),
        }
    }

    /// Load from a JSON file; a missing file yields the default (fresh start).
    pub fn load(path: &Path) -> std::io::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    /// Persist as JSON, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, text)
    }
}
