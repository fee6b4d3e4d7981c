//! Message templates for reviewer and administrator notices.
//!
//! Every message carries the recipient, the run identifier, the relevant
//! deadline, and a stable review link so a reviewer can act from the
//! message alone.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::NotificationKind;

/// A rendered message ready for a channel to deliver.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub subject: String,
    pub body: String,
}

/// Context threaded from the scheduler into a rendered message.
#[derive(Debug, Clone)]
pub struct NotificationContext {
    pub run_id: Uuid,
    pub assignment_id: Option<Uuid>,
    pub kind: NotificationKind,
    pub recipient: String,
    /// Administrator contact for the run; degraded-delivery alerts go here.
    pub admin_contact: String,
    pub deadline: Option<DateTime<Utc>>,
    pub review_link: String,
}

fn deadline_line(deadline: Option<DateTime<Utc>>) -> String {
    match deadline {
        Some(d) => format!("Deadline: {}", d.to_rfc3339()),
        None => "Deadline: n/a".to_string(),
    }
}

/// Render the message for a notification context.
pub fn render(ctx: &NotificationContext) -> Message {
    let deadline = deadline_line(ctx.deadline);
    match ctx.kind {
        NotificationKind::Assignment => Message {
            subject: format!("Review assigned: run {}", ctx.run_id),
            body: format!(
                "You are the active reviewer for run {}.\n{}\nReview: {}",
                ctx.run_id, deadline, ctx.review_link
            ),
        },
        NotificationKind::Reminder => Message {
            subject: format!("Review reminder: run {}", ctx.run_id),
            body: format!(
                "Your review of run {} is still open and the deadline is approaching.\n{}\nReview: {}",
                ctx.run_id, deadline, ctx.review_link
            ),
        },
        NotificationKind::AutoApproveNotice => Message {
            subject: format!("Review auto-approved: run {}", ctx.run_id),
            body: format!(
                "A review step on run {} passed its deadline and was auto-approved; the next reviewer has been activated.\n{}\nReview: {}",
                ctx.run_id, deadline, ctx.review_link
            ),
        },
        NotificationKind::HoldNotice => Message {
            subject: format!("URGENT - final review held: run {}", ctx.run_id),
            body: format!(
                "The final review of run {} passed its deadline and is on hold. The run will not complete until a decision is recorded.\n{}\nReview: {}",
                ctx.run_id, deadline, ctx.review_link
            ),
        },
        NotificationKind::Timeout => Message {
            subject: format!("Review SLA missed: run {}", ctx.run_id),
            body: format!(
                "A reviewer on run {} missed the SLA; the step was auto-approved and the chain advanced.\n{}\nReview: {}",
                ctx.run_id, deadline, ctx.review_link
            ),
        },
        NotificationKind::Escalation => Message {
            subject: format!("Run escalated: {}", ctx.run_id),
            body: format!(
                "Run {} stopped automatic processing and needs human intervention.\nReview: {}",
                ctx.run_id, ctx.review_link
            ),
        },
        NotificationKind::DegradedDelivery => Message {
            subject: format!("Notification delivery degraded: run {}", ctx.run_id),
            body: format!(
                "A notification for run {} could not be delivered to {} after all retries.\nReview: {}",
                ctx.run_id, ctx.recipient, ctx.review_link
            ),
        },
    }
}

/// Stable review link for a run, independent of assignment churn.
pub fn review_link(base_url: &str, run_id: Uuid) -> String {
    format!("{}/runs/{}/review", base_url.trim_end_matches('/'), run_id)
}
