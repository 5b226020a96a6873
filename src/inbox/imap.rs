//! IMAP inbox source — raw IMAP over TLS, UID-delta fetches.
//!
//! Unlike a naive unseen-flag poller this never re-scans the mailbox: the
//! checkpoint carries `(UIDVALIDITY, last UID)` and each poll issues
//! `UID SEARCH <last+1>:*`. No `\Seen` flags are written; progress lives
//! entirely in the checkpoint, so an operator reading the same mailbox does
//! not interfere with the pipeline.

use std::io::Write as IoWrite;
use std::net::TcpStream;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

use crate::config::InboxConfig;
use crate::error::WatcherError;
use crate::inbox::message::{Attachment, Checkpoint, InboundMessage};
use crate::inbox::source::{FetchBatch, InboxSource};

/// IMAP-backed inbox source.
pub struct ImapSource {
    config: InboxConfig,
    /// Live password; replaced by `refresh_credentials`.
    password: RwLock<SecretString>,
}

impl ImapSource {
    pub fn new(config: InboxConfig) -> Self {
        let password = RwLock::new(config.password.clone());
        Self { config, password }
    }

    fn current_password(&self) -> SecretString {
        self.password
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl InboxSource for ImapSource {
    fn name(&self) -> &str {
        "imap"
    }

    async fn fetch_since(&self, checkpoint: Checkpoint) -> Result<FetchBatch, WatcherError> {
        let config = self.config.clone();
        let password = self.current_password();

        let raw = tokio::task::spawn_blocking(move || fetch_delta(&config, &password, checkpoint))
            .await
            .map_err(|e| WatcherError::Protocol(format!("fetch task panicked: {e}")))??;

        let mut batch = FetchBatch {
            messages: Vec::with_capacity(raw.emails.len()),
            checkpoint: raw.checkpoint,
        };
        let mut cursor = Checkpoint::new(raw.checkpoint.uid_validity, checkpoint.last_uid);
        if checkpoint.uid_validity != raw.checkpoint.uid_validity {
            cursor.last_uid = 0;
        }

        for (uid, raw_email) in raw.emails {
            cursor = cursor.advanced_to(uid);
            match parse_email(&raw_email, uid) {
                Some(msg) => {
                    if msg.sender.eq_ignore_ascii_case(&self.config.username) {
                        tracing::debug!(sender = %msg.sender, uid, "Skipping self-sent message");
                        continue;
                    }
                    if !is_sender_allowed(&self.config.allowed_senders, &msg.sender) {
                        tracing::warn!(sender = %msg.sender, uid, "Blocked sender, skipping");
                        continue;
                    }
                    batch.messages.push((msg, cursor));
                }
                None => {
                    // Malformed mail must not block the cursor.
                    tracing::warn!(uid, "Unparseable message, skipping past it");
                }
            }
        }

        Ok(batch)
    }

    /// Re-read `MAILFLOW_IMAP_PASSWORD` — supports secrets rotated in place
    /// by the process supervisor.
    async fn refresh_credentials(&self) -> Result<(), WatcherError> {
        let fresh = std::env::var("MAILFLOW_IMAP_PASSWORD").map_err(|_| {
            WatcherError::AuthExpired("MAILFLOW_IMAP_PASSWORD no longer set".into())
        })?;
        let mut guard = self
            .password
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = SecretString::from(fresh);
        tracing::info!("Refreshed IMAP credentials from environment");
        Ok(())
    }
}

// ── Blocking IMAP session ───────────────────────────────────────────

struct RawBatch {
    /// `(uid, raw RFC822 text)` in ascending UID order.
    emails: Vec<(u32, String)>,
    checkpoint: Checkpoint,
}

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

fn connect_tls(config: &InboxConfig) -> Result<TlsStream, WatcherError> {
    let tcp = TcpStream::connect((&*config.imap_host, config.imap_port))
        .map_err(|e| WatcherError::Connect(format!("{}:{}: {e}", config.imap_host, config.imap_port)))?;
    tcp.set_read_timeout(Some(Duration::from_secs(30)))
        .map_err(|e| WatcherError::Connect(e.to_string()))?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = std::sync::Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name = rustls::pki_types::ServerName::try_from(config.imap_host.clone())
        .map_err(|e| WatcherError::Connect(format!("invalid server name: {e}")))?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)
        .map_err(|e| WatcherError::Connect(e.to_string()))?;
    Ok(rustls::StreamOwned::new(conn, tcp))
}

fn read_line(tls: &mut TlsStream) -> Result<String, WatcherError> {
    let mut buf = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        match std::io::Read::read(tls, &mut byte) {
            Ok(0) => return Err(WatcherError::Connect("connection closed".into())),
            Ok(_) => {
                buf.push(byte[0]);
                if buf.ends_with(b"\r\n") {
                    return Ok(String::from_utf8_lossy(&buf).to_string());
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(WatcherError::Timeout(Duration::from_secs(30)));
            }
            Err(e) => return Err(WatcherError::Connect(e.to_string())),
        }
    }
}

fn send_cmd(tls: &mut TlsStream, tag: &str, cmd: &str) -> Result<Vec<String>, WatcherError> {
    let full = format!("{tag} {cmd}\r\n");
    IoWrite::write_all(tls, full.as_bytes()).map_err(|e| WatcherError::Connect(e.to_string()))?;
    IoWrite::flush(tls).map_err(|e| WatcherError::Connect(e.to_string()))?;
    let mut lines = Vec::new();
    loop {
        let line = read_line(tls)?;
        let done = line.starts_with(tag);
        lines.push(line);
        if done {
            break;
        }
    }
    Ok(lines)
}

/// Run one delta fetch (blocking — call on `spawn_blocking`).
fn fetch_delta(
    config: &InboxConfig,
    password: &SecretString,
    checkpoint: Checkpoint,
) -> Result<RawBatch, WatcherError> {
    let mut tls = connect_tls(config)?;
    let _greeting = read_line(&mut tls)?;

    let login = send_cmd(
        &mut tls,
        "A1",
        &format!(
            "LOGIN \"{}\" \"{}\"",
            config.username,
            password.expose_secret()
        ),
    )?;
    if !login.last().is_some_and(|l| l.contains("OK")) {
        return Err(WatcherError::AuthExpired(
            login.last().cloned().unwrap_or_default().trim().to_string(),
        ));
    }

    let select = send_cmd(&mut tls, "A2", &format!("SELECT \"{}\"", config.mailbox))?;
    let uid_validity = parse_uid_validity(&select)
        .ok_or_else(|| WatcherError::Protocol("SELECT response missing UIDVALIDITY".into()))?;

    // A UIDVALIDITY change invalidates every stored UID.
    let last_uid = if uid_validity == checkpoint.uid_validity {
        checkpoint.last_uid
    } else {
        tracing::warn!(
            old = checkpoint.uid_validity,
            new = uid_validity,
            "UIDVALIDITY changed, resetting checkpoint"
        );
        0
    };

    let search = send_cmd(
        &mut tls,
        "A3",
        &format!("UID SEARCH UID {}:*", last_uid.saturating_add(1)),
    )?;
    // `n:*` matches the highest-UID message even when n exceeds it, so
    // filter out anything at or below the checkpoint.
    let uids: Vec<u32> = parse_search_uids(&search)
        .into_iter()
        .filter(|&uid| uid > last_uid)
        .collect();

    let mut emails = Vec::with_capacity(uids.len());
    let mut tag_counter = 4_u32;
    let mut new_checkpoint = Checkpoint::new(uid_validity, last_uid);

    for uid in uids {
        let tag = format!("A{tag_counter}");
        tag_counter += 1;
        let fetch = send_cmd(&mut tls, &tag, &format!("UID FETCH {uid} (RFC822)"))?;

        let raw: String = fetch
            .iter()
            .skip(1)
            .take(fetch.len().saturating_sub(2))
            .cloned()
            .collect();

        emails.push((uid, raw));
        new_checkpoint = new_checkpoint.advanced_to(uid);
    }

    let tag = format!("A{tag_counter}");
    let _ = send_cmd(&mut tls, &tag, "LOGOUT");

    Ok(RawBatch {
        emails,
        checkpoint: new_checkpoint,
    })
}

// ── Response parsing (public within the crate for tests) ────────────

/// Pull UIDVALIDITY out of a SELECT response.
fn parse_uid_validity(lines: &[String]) -> Option<u32> {
    for line in lines {
        if let Some(pos) = line.find("[UIDVALIDITY ") {
            let rest = &line[pos + "[UIDVALIDITY ".len()..];
            let end = rest.find(']')?;
            return rest[..end].trim().parse().ok();
        }
    }
    None
}

/// Pull UIDs out of a `* SEARCH ...` response, ascending.
fn parse_search_uids(lines: &[String]) -> Vec<u32> {
    let mut uids: Vec<u32> = Vec::new();
    for line in lines {
        if let Some(rest) = line.strip_prefix("* SEARCH") {
            uids.extend(rest.split_whitespace().filter_map(|t| t.parse::<u32>().ok()));
        }
    }
    uids.sort_unstable();
    uids
}

/// Parse a raw RFC822 message into an [`InboundMessage`].
///
/// Returns `None` when the mail is unparseable; the caller logs and skips.
pub(crate) fn parse_email(raw: &str, uid: u32) -> Option<InboundMessage> {
    let parsed = MessageParser::default().parse(raw.as_bytes())?;

    let sender = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())?;

    let subject = parsed.subject().map(|s| s.to_string());
    let body = extract_text(&parsed);

    let attachments: Vec<Attachment> = parsed
        .attachments()
        .map(|part| Attachment {
            name: MimeHeaders::attachment_name(part)
                .unwrap_or("unnamed")
                .to_string(),
            mime_type: MimeHeaders::content_type(part)
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            size_bytes: part.contents().len(),
        })
        .collect();

    let id = parsed
        .message_id()
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("gen-{}", Uuid::new_v4()));

    let received_at = parsed
        .date()
        .and_then(|d| {
            Utc.with_ymd_and_hms(
                d.year as i32,
                u32::from(d.month),
                u32::from(d.day),
                u32::from(d.hour),
                u32::from(d.minute),
                u32::from(d.second),
            )
            .single()
        })
        .unwrap_or_else(Utc::now);

    Some(InboundMessage {
        id,
        sender,
        subject,
        body,
        attachments,
        metadata: serde_json::json!({ "uid": uid, "channel": "imap" }),
        received_at,
    })
}

/// Extract readable text, preferring the plaintext part over stripped HTML.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    String::new()
}

/// Strip HTML tags and normalize whitespace (basic).
pub(crate) fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Check a sender against the allowlist.
///
/// - Empty list → deny all
/// - `*` → allow all
/// - `@domain.com` or `domain.com` → domain match
/// - `user@domain.com` → exact email match
pub fn is_sender_allowed(allowed: &[String], email: &str) -> bool {
    if allowed.is_empty() {
        return false;
    }
    if allowed.iter().any(|a| a == "*") {
        return true;
    }
    let email_lower = email.to_lowercase();
    allowed.iter().any(|a| {
        if a.starts_with('@') {
            email_lower.ends_with(&a.to_lowercase())
        } else if a.contains('@') {
            a.eq_ignore_ascii_case(email)
        } else {
            email_lower.ends_with(&format!("@{}", a.to_lowercase()))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Allowlist ───────────────────────────────────────────────────

    #[test]
    fn allowlist_empty_denies_all() {
        assert!(!is_sender_allowed(&[], "anyone@example.com"));
    }

    #[test]
    fn allowlist_wildcard_allows_all() {
        let allowed = vec!["*".to_string()];
        assert!(is_sender_allowed(&allowed, "anyone@example.com"));
    }

    #[test]
    fn allowlist_exact_and_domain_entries() {
        let allowed = vec![
            "admin@company.com".to_string(),
            "@trusted.org".to_string(),
            "partner.io".to_string(),
        ];
        assert!(is_sender_allowed(&allowed, "admin@company.com"));
        assert!(is_sender_allowed(&allowed, "Admin@Company.com"));
        assert!(is_sender_allowed(&allowed, "anyone@trusted.org"));
        assert!(is_sender_allowed(&allowed, "ceo@partner.io"));
        assert!(!is_sender_allowed(&allowed, "random@evil.com"));
    }

    // ── Protocol parsing ────────────────────────────────────────────

    #[test]
    fn uid_validity_parsed_from_select() {
        let lines = vec![
            "* 17 EXISTS\r\n".to_string(),
            "* OK [UIDVALIDITY 1712345678] UIDs valid\r\n".to_string(),
            "A2 OK [READ-WRITE] SELECT completed\r\n".to_string(),
        ];
        assert_eq!(parse_uid_validity(&lines), Some(1_712_345_678));
    }

    #[test]
    fn uid_validity_missing_is_none() {
        let lines = vec!["A2 OK SELECT completed\r\n".to_string()];
        assert_eq!(parse_uid_validity(&lines), None);
    }

    #[test]
    fn search_uids_parsed_and_sorted() {
        let lines = vec![
            "* SEARCH 105 101 103\r\n".to_string(),
            "A3 OK SEARCH completed\r\n".to_string(),
        ];
        assert_eq!(parse_search_uids(&lines), vec![101, 103, 105]);
    }

    #[test]
    fn search_empty_result() {
        let lines = vec![
            "* SEARCH\r\n".to_string(),
            "A3 OK SEARCH completed\r\n".to_string(),
        ];
        assert!(parse_search_uids(&lines).is_empty());
    }

    // ── Email parsing ───────────────────────────────────────────────

    const SAMPLE: &str = "Message-ID: <abc123@example.com>\r\n\
        From: Alice <alice@example.com>\r\n\
        To: inbox@mailflow.dev\r\n\
        Subject: Quarterly report\r\n\
        Date: Wed, 15 Jan 2025 10:30:00 +0000\r\n\
        Content-Type: text/plain\r\n\
        \r\n\
        Please find the report attached.\r\n";

    #[test]
    fn parse_email_extracts_fields() {
        let msg = parse_email(SAMPLE, 42).unwrap();
        assert_eq!(msg.id, "abc123@example.com");
        assert_eq!(msg.sender, "alice@example.com");
        assert_eq!(msg.subject.as_deref(), Some("Quarterly report"));
        assert!(msg.body.contains("report attached"));
        assert_eq!(msg.metadata["uid"], 42);
    }

    #[test]
    fn parse_email_garbage_is_none() {
        // No From header — unusable as a trigger.
        assert!(parse_email("\x00\x01\x02", 1).is_none());
    }

    // ── HTML stripping ──────────────────────────────────────────────

    #[test]
    fn strip_html_basic() {
        assert_eq!(strip_html("<p>Hello</p>"), "Hello");
        assert_eq!(
            strip_html("<div><b>Bold</b> and <i>italic</i></div>"),
            "Bold and italic"
        );
        assert_eq!(strip_html("No HTML here"), "No HTML here");
    }
}
