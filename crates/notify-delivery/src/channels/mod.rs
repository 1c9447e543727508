//! Built-in delivery channels.

pub mod email;
pub mod webhook;

pub use email::{EmailChannel, EmailPayload};
pub use webhook::{WebhookChannel, WebhookConfig, WebhookPayload};
