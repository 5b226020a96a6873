//! Outbound delivery over SMTP, behind a pluggable transport seam.
//!
//! Delivery is strictly post-run: the adapter reads a finalized run, renders
//! it, and records the outcome on a receipt. A send failure never touches
//! the run record.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::SmtpConfig;
use crate::delivery::format::{Attribution, render_body, render_subject};
use crate::error::DeliveryError;
use crate::workflow::definition::WorkflowDefinition;
use crate::workflow::run::WorkflowRun;

pub const DEFAULT_WRAP_WIDTH: usize = 72;

/// A rendered outbound message, ready for a transport.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub run_id: Uuid,
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub run_id: Uuid,
    pub recipient: String,
    pub sent: bool,
    pub error: Option<String>,
    pub sent_at: DateTime<Utc>,
}

/// Transport seam; the real implementation speaks SMTP, tests substitute
/// an in-memory one.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn send(&self, request: &DeliveryRequest) -> Result<(), DeliveryError>;
}

/// SMTP transport backed by lettre's blocking client on the blocking pool.
pub struct SmtpDelivery {
    config: SmtpConfig,
}

impl SmtpDelivery {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DeliveryTransport for SmtpDelivery {
    async fn send(&self, request: &DeliveryRequest) -> Result<(), DeliveryError> {
        let from: Mailbox =
            self.config
                .from_address
                .parse()
                .map_err(|e| DeliveryError::InvalidAddress {
                    address: self.config.from_address.clone(),
                    reason: format!("{e}"),
                })?;
        let to: Mailbox = request
            .recipient
            .parse()
            .map_err(|e| DeliveryError::InvalidAddress {
                address: request.recipient.clone(),
                reason: format!("{e}"),
            })?;

        let email = Message::builder()
            .from(from)
            .to(to)
            .subject(&request.subject)
            .header(ContentType::TEXT_PLAIN)
            .body(request.body.clone())
            .map_err(|e| DeliveryError::Build(e.to_string()))?;

        let config = self.config.clone();
        tokio::task::spawn_blocking(move || {
            let transport = if config.tls {
                SmtpTransport::relay(&config.smtp_host)
                    .map_err(|e| DeliveryError::Send(e.to_string()))?
                    .port(config.smtp_port)
                    .credentials(Credentials::new(
                        config.username.clone(),
                        config.password.expose_secret().to_string(),
                    ))
                    .timeout(Some(config.send_timeout))
                    .build()
            } else {
                SmtpTransport::builder_dangerous(&config.smtp_host)
                    .port(config.smtp_port)
                    .timeout(Some(config.send_timeout))
                    .build()
            };
            transport
                .send(&email)
                .map_err(|e| DeliveryError::Send(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| DeliveryError::Send(format!("send task failed: {e}")))?
    }
}

/// Renders finalized runs and hands them to the transport.
pub struct DeliveryAdapter {
    transport: Arc<dyn DeliveryTransport>,
    recipient: String,
    wrap_width: usize,
}

impl DeliveryAdapter {
    pub fn new(transport: Arc<dyn DeliveryTransport>, recipient: &str) -> Self {
        Self {
            transport,
            recipient: recipient.to_string(),
            wrap_width: DEFAULT_WRAP_WIDTH,
        }
    }

    pub fn with_wrap_width(mut self, wrap_width: usize) -> Self {
        self.wrap_width = wrap_width;
        self
    }

    /// Deliver one finalized run. Failures are captured on the receipt; the
    /// run itself is read-only here.
    pub async fn deliver(
        &self,
        run: &WorkflowRun,
        definition: &WorkflowDefinition,
        attribution: &Attribution,
    ) -> DeliveryReceipt {
        let request = DeliveryRequest {
            run_id: run.id,
            recipient: self.recipient.clone(),
            subject: render_subject(run),
            body: render_body(run, definition, attribution, self.wrap_width),
        };

        match self.transport.send(&request).await {
            Ok(()) => {
                info!(run_id = %run.id, recipient = %request.recipient, "Delivery sent");
                DeliveryReceipt {
                    run_id: run.id,
                    recipient: request.recipient,
                    sent: true,
                    error: None,
                    sent_at: Utc::now(),
                }
            }
            Err(err) => {
                warn!(run_id = %run.id, error = %err, "Delivery failed");
                DeliveryReceipt {
                    run_id: run.id,
                    recipient: request.recipient,
                    sent: false,
                    error: Some(err.to_string()),
                    sent_at: Utc::now(),
                }
            }
        }
    }
}
