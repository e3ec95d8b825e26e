//! Queued, signed, retrying webhook delivery.
//!
//! One delivery row per (event, subscribed webhook). Attempts run on a
//! bounded worker pool; when the in-memory queue is full the row simply
//! stays `pending` and the periodic sweeper re-attempts it. Per-delivery
//! failure is never surfaced to the publisher — it is visible only through
//! the delivery rows.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::AppConfig;
use crate::db::models::{DeliveryStatus, Webhook, WebhookDelivery};
use crate::db::Database;
use crate::errors::EngineError;
use crate::events::{wire_body, Event, EventBus};
use crate::webhooks::{self, sign_payload, USER_AGENT};

/// Byte caps for persisted response/error text.
const MAX_RESPONSE_BODY: usize = 1000;
const MAX_ERROR_MESSAGE: usize = 500;

/// Truncate to at most `max_bytes` without splitting a UTF-8 character.
fn truncate_bytes(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[derive(Clone)]
pub struct WebhookDispatcher {
    db: Database,
    clock: Clock,
    config: AppConfig,
    client: reqwest::Client,
    jobs_tx: mpsc::Sender<i64>,
    queue_overflows: Arc<AtomicU64>,
}

impl WebhookDispatcher {
    /// Build the dispatcher and its job queue. Hand the receiver to
    /// [`WebhookDispatcher::spawn_workers`].
    pub fn new(db: Database, clock: Clock, config: AppConfig) -> (Self, mpsc::Receiver<i64>) {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.webhook_timeout_secs))
            .build()
            .expect("HTTP client construction cannot fail with static options");
        let (jobs_tx, jobs_rx) = mpsc::channel(config.webhook_queue_capacity);
        (
            Self {
                db,
                clock,
                config,
                client,
                jobs_tx,
                queue_overflows: Arc::new(AtomicU64::new(0)),
            },
            jobs_rx,
        )
    }

    /// Times the bounded queue was full and a delivery was left to the sweeper.
    pub fn queue_overflows(&self) -> u64 {
        self.queue_overflows.load(Ordering::Relaxed)
    }

    /// Fan one bus event out to every subscribed webhook: create the
    /// delivery rows, then queue an immediate attempt for each.
    pub async fn handle_event(&self, event: &Event) -> Result<usize, EngineError> {
        let event_type = event.payload.event_type();
        let subscribed = webhooks::webhooks_for_event(&self.db, event_type).await?;
        if subscribed.is_empty() {
            return Ok(0);
        }

        let body = wire_body(event);
        let mut created = 0;
        for webhook in &subscribed {
            let delivery_id =
                webhooks::create_delivery(&self.db, webhook.id, event_type, &body, self.clock.now())
                    .await?;
            created += 1;

            if self.jobs_tx.try_send(delivery_id).is_err() {
                // Row is already pending; the sweeper will pick it up.
                self.queue_overflows.fetch_add(1, Ordering::Relaxed);
                debug!(delivery = delivery_id, "Delivery queue full, deferring to sweeper");
            }
        }

        info!(event = event_type, deliveries = created, "Dispatched event to webhooks");
        Ok(created)
    }

    /// Attempt one delivery by id. Missing or terminal rows are skipped.
    pub async fn deliver(&self, delivery_id: i64) {
        let delivery = match webhooks::delivery_by_id(&self.db, delivery_id).await {
            Ok(Some(d)) => d,
            Ok(None) => return,
            Err(e) => {
                warn!(delivery = delivery_id, error = %e, "Failed to load delivery");
                return;
            }
        };
        if delivery.status == DeliveryStatus::Delivered
            || delivery.retry_count >= self.config.webhook_max_retries
        {
            return;
        }

        let webhook = match webhooks::webhook_by_id(&self.db, delivery.webhook_id).await {
            Ok(Some(w)) => w,
            Ok(None) => {
                self.mark_abandoned(&delivery, "webhook was deleted").await;
                return;
            }
            Err(e) => {
                warn!(delivery = delivery_id, error = %e, "Failed to load webhook");
                return;
            }
        };
        if !webhook.is_active {
            self.mark_abandoned(&delivery, "webhook is inactive").await;
            return;
        }

        self.attempt(&webhook, &delivery).await;
    }

    async fn attempt(&self, webhook: &Webhook, delivery: &WebhookDelivery) {
        let signature = sign_payload(&delivery.payload, &webhook.secret);

        let response = self
            .client
            .post(&webhook.url)
            .header("Content-Type", "application/json")
            .header("X-Webhook-Signature", signature)
            .header("X-Webhook-Event", &delivery.event_type)
            .header("X-Webhook-Delivery", delivery.id.to_string())
            .header("User-Agent", USER_AGENT)
            .body(delivery.payload.clone())
            .send()
            .await;

        match response {
            Ok(resp) => {
                let status = resp.status().as_u16() as i64;
                let body = resp.text().await.unwrap_or_default();
                if (200..300).contains(&status) {
                    self.mark_delivered(delivery, status, &body).await;
                } else {
                    self.fail_attempt(delivery, Some(status), Some(&body), &format!("HTTP {status}"))
                        .await;
                }
            }
            Err(e) => {
                self.fail_attempt(delivery, None, None, &e.to_string()).await;
            }
        }
    }

    async fn mark_delivered(&self, delivery: &WebhookDelivery, status_code: i64, body: &str) {
        let result = sqlx::query(
            "UPDATE webhook_deliveries \
             SET status = ?, status_code = ?, response_body = ?, error_message = NULL, delivered_at = ? \
             WHERE id = ?",
        )
        .bind(DeliveryStatus::Delivered)
        .bind(status_code)
        .bind(truncate_bytes(body, MAX_RESPONSE_BODY))
        .bind(self.clock.now())
        .bind(delivery.id)
        .execute(&self.db.pool)
        .await;

        match result {
            Ok(_) => info!(delivery = delivery.id, status_code, "Webhook delivery succeeded"),
            Err(e) => warn!(delivery = delivery.id, error = %e, "Failed to record delivery success"),
        }
    }

    /// Record a failed attempt: bump the retry counter, then either schedule
    /// the next retry or mark the delivery terminally failed.
    async fn fail_attempt(
        &self,
        delivery: &WebhookDelivery,
        status_code: Option<i64>,
        body: Option<&str>,
        error: &str,
    ) {
        let retry_count = delivery.retry_count + 1;
        let exhausted = retry_count >= self.config.webhook_max_retries;
        let next_retry_at = if exhausted {
            None
        } else {
            Some(
                self.clock.now()
                    + ChronoDuration::seconds(self.config.retry_delay_secs(retry_count)),
            )
        };
        let status = if exhausted {
            DeliveryStatus::Failed
        } else {
            DeliveryStatus::Pending
        };

        let result = sqlx::query(
            "UPDATE webhook_deliveries \
             SET status = ?, status_code = ?, response_body = ?, error_message = ?, \
                 retry_count = ?, next_retry_at = ? \
             WHERE id = ?",
        )
        .bind(status)
        .bind(status_code)
        .bind(body.map(|b| truncate_bytes(b, MAX_RESPONSE_BODY).to_string()))
        .bind(truncate_bytes(error, MAX_ERROR_MESSAGE))
        .bind(retry_count)
        .bind(next_retry_at)
        .bind(delivery.id)
        .execute(&self.db.pool)
        .await;

        match result {
            Ok(_) => warn!(
                delivery = delivery.id,
                retry_count,
                terminal = exhausted,
                error,
                "Webhook delivery failed"
            ),
            Err(e) => warn!(delivery = delivery.id, error = %e, "Failed to record delivery failure"),
        }
    }

    /// Terminally fail a delivery whose webhook can no longer receive it.
    async fn mark_abandoned(&self, delivery: &WebhookDelivery, reason: &str) {
        let result = sqlx::query(
            "UPDATE webhook_deliveries SET status = ?, error_message = ?, retry_count = ? WHERE id = ?",
        )
        .bind(DeliveryStatus::Failed)
        .bind(reason)
        .bind(self.config.webhook_max_retries)
        .bind(delivery.id)
        .execute(&self.db.pool)
        .await;
        if let Err(e) = result {
            warn!(delivery = delivery.id, error = %e, "Failed to abandon delivery");
        }
    }

    /// Spawn the delivery worker pool sharing one job queue.
    pub fn spawn_workers(
        &self,
        jobs_rx: mpsc::Receiver<i64>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let jobs_rx = Arc::new(Mutex::new(jobs_rx));
        (0..self.config.webhook_workers.max(1))
            .map(|worker| {
                let dispatcher = self.clone();
                let jobs_rx = jobs_rx.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        let job = {
                            let mut rx = jobs_rx.lock().await;
                            tokio::select! {
                                _ = shutdown.changed() => break,
                                job = rx.recv() => job,
                            }
                        };
                        match job {
                            Some(delivery_id) => dispatcher.deliver(delivery_id).await,
                            None => break,
                        }
                    }
                    debug!(worker, "Webhook worker stopped");
                })
            })
            .collect()
    }

    /// Spawn the retry sweeper: re-attempts due deliveries that the queue
    /// missed or that are waiting out a backoff.
    pub fn spawn_sweeper(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(dispatcher.config.webhook_sweep_secs));
            interval.tick().await; // first tick is immediate — skip it
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = interval.tick() => dispatcher.sweep().await,
                }
            }
            info!("Webhook sweeper stopped");
        })
    }

    /// One sweep pass: attempt every due delivery.
    pub async fn sweep(&self) {
        let due = match webhooks::pending_deliveries(
            &self.db,
            self.clock.now(),
            self.config.webhook_max_retries,
            100,
        )
        .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "Webhook sweep query failed");
                return;
            }
        };

        for delivery in due {
            self.deliver(delivery.id).await;
        }
    }

    /// Spawn the bus subscriber that turns events into delivery rows.
    pub fn spawn_subscriber(
        &self,
        bus: &EventBus,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let dispatcher = self.clone();
        let bus = bus.clone();
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    received = rx.recv() => match received {
                        Ok(event) => {
                            if let Err(e) = dispatcher.handle_event(&event).await {
                                warn!(error = %e, "Webhook dispatch failed for event");
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            bus.note_lagged(n);
                            warn!(lost = n, "Webhook subscriber lagged, events dropped");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            info!("Webhook subscriber stopped");
        })
    }
}
