//! In-app notifications and the event-driven push pipeline.
//!
//! [`notify_user`] persists the durable notification row — the row is
//! visible in the user's list before it returns. [`handle_event`] maps bus
//! events to notification rows and socket messages; it runs on the
//! subscriber task and never propagates failures back to the publisher.

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::db::models::{Notification, NotificationKind};
use crate::db::store::{self, Page};
use crate::db::Database;
use crate::errors::EngineError;
use crate::events::{Event, EventPayload};
use crate::Core;

/// Persist an in-app notification with `read = false` and return the row.
pub async fn notify_user(
    db: &Database,
    user_id: i64,
    kind: NotificationKind,
    title: &str,
    message: &str,
    link: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Notification, EngineError> {
    let result = sqlx::query(
        "INSERT INTO notifications (user_id, type, title, message, link, read, created_at) \
         VALUES (?, ?, ?, ?, ?, 0, ?)",
    )
    .bind(user_id)
    .bind(kind)
    .bind(title)
    .bind(message)
    .bind(link)
    .bind(now)
    .execute(&db.pool)
    .await?;

    let row = sqlx::query_as::<_, Notification>("SELECT * FROM notifications WHERE id = ?")
        .bind(result.last_insert_rowid())
        .fetch_one(&db.pool)
        .await?;
    Ok(row)
}

pub async fn list_notifications(
    db: &Database,
    user_id: i64,
    unread_only: bool,
    page: Page,
) -> Result<Vec<Notification>, EngineError> {
    let rows = sqlx::query_as::<_, Notification>(
        "SELECT * FROM notifications \
         WHERE user_id = ? AND (? = 0 OR read = 0) \
         ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
    )
    .bind(user_id)
    .bind(unread_only)
    .bind(page.limit.clamp(1, 200))
    .bind(page.offset)
    .fetch_all(&db.pool)
    .await?;
    Ok(rows)
}

pub async fn mark_read(
    db: &Database,
    user_id: i64,
    notification_id: i64,
) -> Result<Notification, EngineError> {
    let result = sqlx::query("UPDATE notifications SET read = 1 WHERE id = ? AND user_id = ?")
        .bind(notification_id)
        .bind(user_id)
        .execute(&db.pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(EngineError::NotFound("notification"));
    }

    let row = sqlx::query_as::<_, Notification>("SELECT * FROM notifications WHERE id = ?")
        .bind(notification_id)
        .fetch_one(&db.pool)
        .await?;
    Ok(row)
}

pub async fn mark_all_read(db: &Database, user_id: i64) -> Result<u64, EngineError> {
    let result = sqlx::query("UPDATE notifications SET read = 1 WHERE user_id = ? AND read = 0")
        .bind(user_id)
        .execute(&db.pool)
        .await?;
    Ok(result.rows_affected())
}

async fn resource_name(core: &Core, resource_id: i64) -> String {
    match store::resource_by_id(&core.db.pool, resource_id).await {
        Ok(Some(resource)) => resource.name,
        _ => "Resource".to_string(),
    }
}

/// Map one bus event to its in-app notification and socket push.
///
/// Best-effort by contract: a failed write is logged and swallowed — the
/// booking that produced the event is already committed.
pub async fn handle_event(core: &Core, event: &Event) {
    let result = match &event.payload {
        EventPayload::ReservationCreated {
            reservation_id,
            user_id,
            resource_id,
            start_time,
            end_time,
        } => {
            let name = resource_name(core, *resource_id).await;
            core.hub
                .send_to_user(
                    *user_id,
                    json!({
                        "type": "reservation_created",
                        "reservation_id": reservation_id,
                        "resource_id": resource_id,
                        "start_time": start_time.to_rfc3339(),
                        "end_time": end_time.to_rfc3339(),
                    }),
                )
                .await;
            notify_user(
                &core.db,
                *user_id,
                NotificationKind::ReservationConfirmed,
                "Reservation confirmed",
                &format!(
                    "{} booked from {} to {}",
                    name,
                    start_time.to_rfc3339(),
                    end_time.to_rfc3339()
                ),
                Some(&format!("/reservations/{reservation_id}")),
                event.timestamp,
            )
            .await
            .map(|_| ())
        }

        EventPayload::ReservationCancelled {
            reservation_id,
            user_id,
            resource_id,
            cancelled_at,
            ..
        } => {
            let name = resource_name(core, *resource_id).await;
            core.hub
                .send_to_user(
                    *user_id,
                    json!({
                        "type": "reservation_cancelled",
                        "reservation_id": reservation_id,
                        "resource_id": resource_id,
                        "status": "cancelled",
                        "cancelled_at": cancelled_at.to_rfc3339(),
                    }),
                )
                .await;
            notify_user(
                &core.db,
                *user_id,
                NotificationKind::ReservationCancelled,
                "Reservation cancelled",
                &format!("Reservation for {name} was cancelled."),
                Some(&format!("/reservations/{reservation_id}")),
                event.timestamp,
            )
            .await
            .map(|_| ())
        }

        EventPayload::WaitlistOffer {
            entry_id,
            user_id,
            resource_id,
            offer_expires_at,
            ..
        } => {
            let name = resource_name(core, *resource_id).await;
            core.hub
                .send_to_user(
                    *user_id,
                    json!({
                        "type": "waitlist_offer",
                        "waitlist_id": entry_id,
                        "resource_id": resource_id,
                        "resource_name": name,
                        "expires_at": offer_expires_at.to_rfc3339(),
                    }),
                )
                .await;
            notify_user(
                &core.db,
                *user_id,
                NotificationKind::ResourceAvailable,
                "Slot available!",
                &format!(
                    "{} is now available! Accept within {} minutes.",
                    name, core.config.offer_ttl_minutes
                ),
                Some(&format!("/waitlist/{entry_id}/accept")),
                event.timestamp,
            )
            .await
            .map(|_| ())
        }

        EventPayload::WaitlistExpired { user_id, .. } => notify_user(
            &core.db,
            *user_id,
            NotificationKind::SystemAnnouncement,
            "Offer expired",
            "Your waitlist offer has expired.",
            None,
            event.timestamp,
        )
        .await
        .map(|_| ()),

        EventPayload::ResourceAvailable { resource_id, .. } => {
            core.hub
                .broadcast(json!({
                    "type": "resource_status_changed",
                    "resource_id": resource_id,
                    "status": "available",
                }))
                .await;
            Ok(())
        }

        EventPayload::ResourceUnavailable { resource_id, .. } => {
            core.hub
                .broadcast(json!({
                    "type": "resource_status_changed",
                    "resource_id": resource_id,
                    "status": "unavailable",
                }))
                .await;
            Ok(())
        }

        EventPayload::ResourceUpdated { resource_id, name } => {
            core.hub
                .broadcast(json!({
                    "type": "resource_updated",
                    "resource_id": resource_id,
                    "name": name,
                }))
                .await;
            Ok(())
        }

        // Expiry is silent; the waitlist and webhook paths cover the rest.
        EventPayload::ReservationExpired { .. }
        | EventPayload::ReservationUpdated { .. }
        | EventPayload::ResourceCreated { .. }
        | EventPayload::WaitlistAccepted { .. } => Ok(()),
    };

    if let Err(e) = result {
        warn!(
            event = event.payload.event_type(),
            error = %e,
            "Failed to persist notification for event"
        );
    }
}

/// Spawn the notification subscriber task. Call once after `Core` is built.
pub fn spawn_subscriber(core: Core, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    let mut rx = core.bus.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = rx.recv() => match received {
                    Ok(event) => handle_event(&core, &event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        core.bus.note_lagged(n);
                        warn!(lost = n, "Notification subscriber lagged, events dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        info!("Notification subscriber stopped");
    })
}
