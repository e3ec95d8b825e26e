//! Webhook subscriptions: signing, secrets, CRUD and delivery records.
//!
//! Payloads are signed with HMAC-SHA256 over the exact body bytes; receivers
//! verify with constant-time comparison. Delivery itself lives in
//! [`dispatcher`].

pub mod dispatcher;

use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::info;

use crate::db::models::{Actor, DeliveryStatus, Webhook, WebhookDelivery};
use crate::db::Database;
use crate::errors::EngineError;

type HmacSha256 = Hmac<Sha256>;

/// User-Agent sent on every delivery attempt.
pub const USER_AGENT: &str = "ResourceReserver-Webhook/1.0";

/// Max lengths for user-provided webhook fields.
pub const MAX_URL: usize = 2048;
pub const MAX_DESCRIPTION: usize = 4096;

/// Event types the core emits, with a short description for the catalog
/// endpoint.
pub const EVENT_TYPES: &[(&str, &str)] = &[
    ("reservation.created", "A reservation was created"),
    ("reservation.cancelled", "A reservation was cancelled"),
    ("reservation.updated", "A reservation changed state"),
    ("reservation.expired", "A reservation passed its end time"),
    ("resource.created", "A resource was added"),
    ("resource.updated", "A resource's properties changed"),
    ("resource.unavailable", "A resource became unavailable"),
    ("resource.available", "A resource became available again"),
    ("waitlist.offer", "A freed slot was offered to a waitlist entry"),
    ("waitlist.accepted", "A waitlist offer was accepted"),
    ("waitlist.expired", "A waitlist offer expired unaccepted"),
];

pub fn is_known_event_type(event_type: &str) -> bool {
    EVENT_TYPES.iter().any(|(t, _)| *t == event_type)
}

/// Generate a signing secret: 32 random bytes, URL-safe base64, no padding.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// `"sha256=" + hex(HMAC_SHA256(secret, payload))`.
pub fn sign_payload(payload: &str, secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(payload.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time signature check.
pub fn verify_signature(payload: &str, secret: &str, signature: &str) -> bool {
    let expected = sign_payload(payload, secret);
    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}

fn validate_url(url: &str) -> Result<(), EngineError> {
    if url.is_empty() || url.len() > MAX_URL {
        return Err(EngineError::Validation(format!(
            "url must be 1-{MAX_URL} characters"
        )));
    }
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(EngineError::Validation(
            "url must be an http or https endpoint".into(),
        ));
    }
    Ok(())
}

fn validate_events(events: &[String]) -> Result<String, EngineError> {
    if events.is_empty() {
        return Err(EngineError::Validation(
            "webhook must subscribe to at least one event type".into(),
        ));
    }
    for event in events {
        if !is_known_event_type(event) {
            return Err(EngineError::Validation(format!(
                "unknown event type: {event}"
            )));
        }
    }
    Ok(serde_json::to_string(events).expect("string list serializes"))
}

fn validate_description(description: Option<&str>) -> Result<(), EngineError> {
    if let Some(d) = description {
        if d.len() > MAX_DESCRIPTION {
            return Err(EngineError::Validation(format!(
                "description exceeds maximum length of {MAX_DESCRIPTION} characters"
            )));
        }
    }
    Ok(())
}

/// Register a webhook. The secret is generated server-side and returned on
/// the row — it is shown to the owner once.
pub async fn create_webhook(
    db: &Database,
    owner_user_id: i64,
    url: &str,
    events: &[String],
    description: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Webhook, EngineError> {
    validate_url(url)?;
    let events_json = validate_events(events)?;
    validate_description(description)?;

    let secret = generate_secret();
    let result = sqlx::query(
        "INSERT INTO webhooks (owner_user_id, url, secret, events, is_active, description, created_at) \
         VALUES (?, ?, ?, ?, 1, ?, ?)",
    )
    .bind(owner_user_id)
    .bind(url)
    .bind(&secret)
    .bind(&events_json)
    .bind(description)
    .bind(now)
    .execute(&db.pool)
    .await?;

    let webhook = webhook_by_id(db, result.last_insert_rowid())
        .await?
        .ok_or(EngineError::NotFound("webhook"))?;
    info!(webhook = webhook.id, owner = owner_user_id, "Created webhook");
    Ok(webhook)
}

pub async fn webhook_by_id(db: &Database, id: i64) -> Result<Option<Webhook>, EngineError> {
    let row = sqlx::query_as::<_, Webhook>("SELECT * FROM webhooks WHERE id = ?")
        .bind(id)
        .fetch_optional(&db.pool)
        .await?;
    Ok(row)
}

pub async fn list_webhooks(db: &Database, owner_user_id: i64) -> Result<Vec<Webhook>, EngineError> {
    let rows = sqlx::query_as::<_, Webhook>(
        "SELECT * FROM webhooks WHERE owner_user_id = ? ORDER BY created_at DESC",
    )
    .bind(owner_user_id)
    .fetch_all(&db.pool)
    .await?;
    Ok(rows)
}

async fn owned_webhook(db: &Database, actor: &Actor, id: i64) -> Result<Webhook, EngineError> {
    let webhook = webhook_by_id(db, id)
        .await?
        .ok_or(EngineError::NotFound("webhook"))?;
    if webhook.owner_user_id != actor.id && !actor.is_admin {
        return Err(EngineError::Forbidden(
            "you can only manage your own webhooks".into(),
        ));
    }
    Ok(webhook)
}

/// Partial update; the secret is never changed here.
#[derive(Debug, Clone, Default)]
pub struct WebhookUpdate {
    pub url: Option<String>,
    pub events: Option<Vec<String>>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
}

pub async fn update_webhook(
    db: &Database,
    actor: &Actor,
    webhook_id: i64,
    update: WebhookUpdate,
) -> Result<Webhook, EngineError> {
    let current = owned_webhook(db, actor, webhook_id).await?;

    let url = update.url.unwrap_or(current.url);
    validate_url(&url)?;
    let events_json = match update.events {
        Some(events) => validate_events(&events)?,
        None => current.events,
    };
    let description = update.description.or(current.description);
    validate_description(description.as_deref())?;
    let is_active = update.is_active.unwrap_or(current.is_active);

    sqlx::query(
        "UPDATE webhooks SET url = ?, events = ?, description = ?, is_active = ? WHERE id = ?",
    )
    .bind(&url)
    .bind(&events_json)
    .bind(&description)
    .bind(is_active)
    .bind(webhook_id)
    .execute(&db.pool)
    .await?;

    webhook_by_id(db, webhook_id)
        .await?
        .ok_or(EngineError::NotFound("webhook"))
}

/// Replace the signing secret; the old one stops verifying immediately.
pub async fn regenerate_secret(
    db: &Database,
    actor: &Actor,
    webhook_id: i64,
) -> Result<Webhook, EngineError> {
    owned_webhook(db, actor, webhook_id).await?;

    let secret = generate_secret();
    sqlx::query("UPDATE webhooks SET secret = ? WHERE id = ?")
        .bind(&secret)
        .bind(webhook_id)
        .execute(&db.pool)
        .await?;

    info!(webhook = webhook_id, "Regenerated webhook secret");
    webhook_by_id(db, webhook_id)
        .await?
        .ok_or(EngineError::NotFound("webhook"))
}

/// Delete a webhook and its delivery history.
pub async fn delete_webhook(
    db: &Database,
    actor: &Actor,
    webhook_id: i64,
) -> Result<(), EngineError> {
    owned_webhook(db, actor, webhook_id).await?;

    sqlx::query("DELETE FROM webhook_deliveries WHERE webhook_id = ?")
        .bind(webhook_id)
        .execute(&db.pool)
        .await?;
    sqlx::query("DELETE FROM webhooks WHERE id = ?")
        .bind(webhook_id)
        .execute(&db.pool)
        .await?;

    info!(webhook = webhook_id, "Deleted webhook");
    Ok(())
}

/// All active webhooks subscribed to `event_type`. The events column is a
/// JSON list, so the subscription filter runs here rather than in SQL.
pub async fn webhooks_for_event(
    db: &Database,
    event_type: &str,
) -> Result<Vec<Webhook>, EngineError> {
    let rows = sqlx::query_as::<_, Webhook>("SELECT * FROM webhooks WHERE is_active = 1")
        .fetch_all(&db.pool)
        .await?;
    Ok(rows
        .into_iter()
        .filter(|w| w.is_subscribed(event_type))
        .collect())
}

/// Create a `pending` delivery row holding the exact wire body to send.
pub async fn create_delivery(
    db: &Database,
    webhook_id: i64,
    event_type: &str,
    body: &str,
    now: DateTime<Utc>,
) -> Result<i64, EngineError> {
    let result = sqlx::query(
        "INSERT INTO webhook_deliveries (webhook_id, event_type, payload, status, retry_count, created_at) \
         VALUES (?, ?, ?, ?, 0, ?)",
    )
    .bind(webhook_id)
    .bind(event_type)
    .bind(body)
    .bind(DeliveryStatus::Pending)
    .bind(now)
    .execute(&db.pool)
    .await?;
    Ok(result.last_insert_rowid())
}

pub async fn delivery_by_id(
    db: &Database,
    id: i64,
) -> Result<Option<WebhookDelivery>, EngineError> {
    let row = sqlx::query_as::<_, WebhookDelivery>("SELECT * FROM webhook_deliveries WHERE id = ?")
        .bind(id)
        .fetch_optional(&db.pool)
        .await?;
    Ok(row)
}

/// Deliveries eligible for (re)attempt: not yet terminal, under the retry
/// cap, and due (or never scheduled).
pub async fn pending_deliveries(
    db: &Database,
    now: DateTime<Utc>,
    max_retries: i64,
    limit: i64,
) -> Result<Vec<WebhookDelivery>, EngineError> {
    let rows = sqlx::query_as::<_, WebhookDelivery>(
        "SELECT * FROM webhook_deliveries \
         WHERE status IN ('pending', 'failed') AND retry_count < ? \
         AND (next_retry_at IS NULL OR next_retry_at <= ?) \
         ORDER BY created_at ASC LIMIT ?",
    )
    .bind(max_retries)
    .bind(now)
    .bind(limit)
    .fetch_all(&db.pool)
    .await?;
    Ok(rows)
}

/// Most recent deliveries for a webhook, newest first.
pub async fn delivery_history(
    db: &Database,
    webhook_id: i64,
    limit: i64,
) -> Result<Vec<WebhookDelivery>, EngineError> {
    let rows = sqlx::query_as::<_, WebhookDelivery>(
        "SELECT * FROM webhook_deliveries WHERE webhook_id = ? \
         ORDER BY created_at DESC, id DESC LIMIT ?",
    )
    .bind(webhook_id)
    .bind(limit)
    .fetch_all(&db.pool)
    .await?;
    Ok(rows)
}
