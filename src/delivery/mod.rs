//! Delivery of finalized runs back out over email.

pub mod format;
pub mod smtp;

pub use format::{Attribution, render_body, render_subject};
pub use smtp::{
    DEFAULT_WRAP_WIDTH, DeliveryAdapter, DeliveryReceipt, DeliveryRequest, DeliveryTransport,
    SmtpDelivery,
};
