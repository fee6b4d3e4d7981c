//! Notification dispatch: templated reviewer and administrator messages
//! with bounded immediate retry and an append-only delivery ledger.

mod dispatcher;
mod template;

pub use dispatcher::{Dispatcher, NotificationChannel, WebhookChannel, testing};
pub use template::{Message, NotificationContext, render, review_link};
