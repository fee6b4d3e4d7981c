//! Notification dispatcher.
//!
//! Sends templated messages through a pluggable channel with a small
//! immediate retry budget. Every attempt lands in the append-only ledger;
//! a permanently failed delivery raises a degraded-delivery alert on the
//! administrator channel but never fails the workflow transition that
//! triggered it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::errors::DispatchError;
use crate::model::{NotificationKind, NotificationRecord};
use crate::notify::template::{self, Message, NotificationContext};
use crate::review::clock::Clock;
use crate::store::StoreHandle;

/// Maximum delivery attempts per send: the initial attempt plus two
/// immediate retries.
const MAX_ATTEMPTS: u32 = 3;

/// A message transport. Implementations are external collaborators
/// (webhook, chat, email); the dispatcher only needs delivery outcomes.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, recipient: &str, message: &Message) -> Result<(), DispatchError>;
}

/// Channel that posts messages to a webhook endpoint. Production adapter.
pub struct WebhookChannel {
    client: reqwest::Client,
    endpoint: String,
}

impl WebhookChannel {
    pub fn new(client: reqwest::Client, endpoint: &str) -> Self {
        Self {
            client,
            endpoint: endpoint.to_string(),
        }
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, recipient: &str, message: &Message) -> Result<(), DispatchError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({
                "recipient": recipient,
                "subject": message.subject,
                "body": message.body,
            }))
            .send()
            .await
            .map_err(|e| DispatchError {
                recipient: recipient.to_string(),
                message: e.to_string(),
                retryable: true,
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DispatchError {
                recipient: recipient.to_string(),
                message: format!("webhook returned {}", status),
                retryable: status.is_server_error(),
            })
        }
    }
}

/// Sends templated notifications and records every attempt.
pub struct Dispatcher {
    channel: Arc<dyn NotificationChannel>,
    store: StoreHandle,
    clock: Arc<dyn Clock>,
    /// Pause between immediate retries.
    retry_backoff: Duration,
}

impl Dispatcher {
    pub fn new(channel: Arc<dyn NotificationChannel>, store: StoreHandle, clock: Arc<dyn Clock>) -> Self {
        Self {
            channel,
            store,
            clock,
            retry_backoff: Duration::from_millis(250),
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Attempt delivery, retrying transient failures immediately.
    ///
    /// Returns the record of the final attempt. Never returns an error:
    /// a permanently failed delivery is reported to the administrator and
    /// must not block the scheduler's state transition.
    pub async fn send(&self, ctx: &NotificationContext) -> NotificationRecord {
        let record = self.try_deliver(ctx, &ctx.recipient).await;

        if !record.success {
            warn!(
                run_id = %ctx.run_id,
                kind = %ctx.kind,
                recipient = %ctx.recipient,
                "notification delivery degraded, alerting administrator"
            );
            let degraded = NotificationContext {
                kind: NotificationKind::DegradedDelivery,
                ..ctx.clone()
            };
            // One shot, no recursion: a failed degraded alert is only logged.
            let _ = self.try_deliver(&degraded, &ctx.admin_contact).await;
        }

        record
    }

    async fn try_deliver(&self, ctx: &NotificationContext, recipient: &str) -> NotificationRecord {
        let message = template::render(ctx);
        let mut attempt = 1;

        loop {
            match self.channel.deliver(recipient, &message).await {
                Ok(()) => {
                    let mut record = self.record_for(ctx, recipient, attempt, None);
                    record.success = true;
                    self.append(&record).await;
                    return record;
                }
                Err(err) => {
                    let record =
                        self.record_for(ctx, recipient, attempt, Some(err.message.clone()));
                    self.append(&record).await;
                    if !err.retryable || attempt == MAX_ATTEMPTS {
                        return record;
                    }
                    attempt += 1;
                    tokio::time::sleep(self.retry_backoff).await;
                }
            }
        }
    }

    fn record_for(
        &self,
        ctx: &NotificationContext,
        recipient: &str,
        attempt: u32,
        error: Option<String>,
    ) -> NotificationRecord {
        NotificationRecord {
            run_id: ctx.run_id,
            assignment_id: ctx.assignment_id,
            kind: ctx.kind,
            channel: self.channel.name().to_string(),
            recipient: recipient.to_string(),
            success: false,
            attempt,
            sent_at: self.clock.now(),
            error,
        }
    }

    async fn append(&self, record: &NotificationRecord) {
        let record = record.clone();
        if let Err(e) = self.store.call(move |s| s.append_notification(&record)).await {
            warn!("failed to append notification record: {}", e);
        }
    }
}

pub mod testing {
    //! Fake channels for deterministic tests.

    use super::*;
    use std::sync::Mutex;

    /// Channel that fails the first `fail_first` deliveries, then succeeds.
    /// With `retryable: false` every failure is permanent.
    pub struct FakeChannel {
        pub fail_first: u32,
        pub retryable: bool,
        delivered: Mutex<Vec<(String, Message)>>,
        calls: Mutex<u32>,
    }

    impl FakeChannel {
        pub fn reliable() -> Self {
            Self {
                fail_first: 0,
                retryable: true,
                delivered: Mutex::new(Vec::new()),
                calls: Mutex::new(0),
            }
        }

        pub fn flaky(fail_first: u32) -> Self {
            Self {
                fail_first,
                retryable: true,
                delivered: Mutex::new(Vec::new()),
                calls: Mutex::new(0),
            }
        }

        pub fn dead() -> Self {
            Self {
                fail_first: u32::MAX,
                retryable: false,
                delivered: Mutex::new(Vec::new()),
                calls: Mutex::new(0),
            }
        }

        pub fn delivered(&self) -> Vec<(String, Message)> {
            self.delivered.lock().unwrap().clone()
        }

        pub fn call_count(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl NotificationChannel for FakeChannel {
        fn name(&self) -> &str {
            "fake"
        }

        async fn deliver(&self, recipient: &str, message: &Message) -> Result<(), DispatchError> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if *calls <= self.fail_first {
                return Err(DispatchError {
                    recipient: recipient.to_string(),
                    message: "simulated delivery failure".to_string(),
                    retryable: self.retryable,
                });
            }
            self.delivered
                .lock()
                .unwrap()
                .push((recipient.to_string(), message.clone()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeChannel;
    use super::*;
    use crate::model::NotificationKind;
    use crate::review::clock::SystemClock;
    use crate::store::CheckpointStore;
    use uuid::Uuid;

    fn dispatcher(channel: Arc<FakeChannel>) -> (Dispatcher, StoreHandle) {
        let store = StoreHandle::new(CheckpointStore::open_in_memory().unwrap());
        let dispatcher = Dispatcher::new(channel, store.clone(), Arc::new(SystemClock))
            .with_retry_backoff(Duration::from_millis(0));
        (dispatcher, store)
    }

    fn ctx(run_id: Uuid) -> NotificationContext {
        NotificationContext {
            run_id,
            assignment_id: Some(Uuid::new_v4()),
            kind: NotificationKind::Assignment,
            recipient: "alice".into(),
            admin_contact: "admin".into(),
            deadline: None,
            review_link: "https://review.example".into(),
        }
    }

    #[tokio::test]
    async fn test_first_attempt_success() {
        let channel = Arc::new(FakeChannel::reliable());
        let (dispatcher, _store) = dispatcher(channel.clone());

        let record = dispatcher.send(&ctx(Uuid::new_v4())).await;
        assert!(record.success);
        assert_eq!(record.attempt, 1);
        assert_eq!(channel.call_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_then_succeeds() {
        let run_id = Uuid::new_v4();
        let channel = Arc::new(FakeChannel::flaky(2));
        let (dispatcher, store) = dispatcher(channel.clone());

        let record = dispatcher.send(&ctx(run_id)).await;
        assert!(record.success);
        assert_eq!(record.attempt, 3);
        assert_eq!(channel.call_count(), 3);

        // All three attempts are in the ledger.
        let records = store.call(move |s| s.load_notifications(run_id)).await.unwrap();
        assert_eq!(records.len(), 3);
        assert!(!records[0].success);
        assert!(!records[1].success);
        assert!(records[2].success);
    }

    #[tokio::test]
    async fn test_permanent_failure_stops_retrying() {
        let channel = Arc::new(FakeChannel::dead());
        let (dispatcher, _store) = dispatcher(channel.clone());

        let record = dispatcher.send(&ctx(Uuid::new_v4())).await;
        assert!(!record.success);
        assert_eq!(record.attempt, 1);
        // One attempt for the message plus one for the degraded alert.
        assert_eq!(channel.call_count(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_raise_degraded_alert() {
        let run_id = Uuid::new_v4();
        // Fails the 3 message attempts; the 4th call (degraded alert) lands.
        let channel = Arc::new(FakeChannel::flaky(3));
        let (dispatcher, store) = dispatcher(channel.clone());

        let record = dispatcher.send(&ctx(run_id)).await;
        assert!(!record.success);
        assert_eq!(record.attempt, 3);

        let delivered = channel.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, "admin");
        assert!(delivered[0].1.subject.contains("degraded"));

        let records = store.call(move |s| s.load_notifications(run_id)).await.unwrap();
        let degraded: Vec<_> = records
            .iter()
            .filter(|r| r.kind == NotificationKind::DegradedDelivery)
            .collect();
        assert_eq!(degraded.len(), 1);
        assert!(degraded[0].success);
    }
}
