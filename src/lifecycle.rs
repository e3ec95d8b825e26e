//! Periodic lifecycle tasks: expire past-end reservations, expire stale
//! waitlist offers, auto-reset unavailable resources, fire reminders.
//!
//! One long-running loop, ticking every `tick_interval_secs`. A failing
//! step is logged and never stops the loop; each scan is bounded by the
//! configured batch size. The loop is cancellable and finishes the current
//! tick before exiting.

use chrono::Duration;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::booking::waitlist;
use crate::db::models::{NotificationKind, ReservationStatus, ResourceStatus};
use crate::db::store;
use crate::errors::EngineError;
use crate::events::EventPayload;
use crate::notify;
use crate::resources;
use crate::Core;

/// Run one scheduler tick: the four steps in order, each best-effort.
pub async fn tick(core: &Core) {
    if let Err(e) = expire_reservations(core).await {
        warn!(error = %e, "Lifecycle step failed: expire reservations");
    }
    match waitlist::expire_stale_offers(core).await {
        Ok(0) => {}
        Ok(n) => info!(count = n, "Expired stale waitlist offers"),
        Err(e) => warn!(error = %e, "Lifecycle step failed: expire waitlist offers"),
    }
    if let Err(e) = auto_reset_resources(core).await {
        warn!(error = %e, "Lifecycle step failed: auto-reset resources");
    }
    if let Err(e) = fire_reminders(core).await {
        warn!(error = %e, "Lifecycle step failed: reminders");
    }
}

/// Step 1: flip `active` reservations whose end has passed to `expired`.
async fn expire_reservations(core: &Core) -> Result<usize, EngineError> {
    let batch = core.config.lifecycle_batch_size;
    let mut total = 0usize;

    loop {
        let now = core.clock.now();
        let due = store::due_expirations(&core.db.pool, now, batch).await?;
        if due.is_empty() {
            break;
        }
        let count = due.len();

        core.db
            .with_tx(|tx| {
                let due = &due;
                Box::pin(async move {
                    for reservation in due {
                        sqlx::query(
                            "UPDATE reservations SET status = ? WHERE id = ? AND status = ?",
                        )
                        .bind(ReservationStatus::Expired)
                        .bind(reservation.id)
                        .bind(ReservationStatus::Active)
                        .execute(&mut **tx)
                        .await?;
                        store::log_action(
                            tx,
                            reservation.id,
                            "expired",
                            None,
                            &format!("Reservation automatically expired at {now}"),
                            now,
                        )
                        .await?;
                    }
                    Ok(())
                })
            })
            .await?;

        for reservation in &due {
            core.bus.publish(EventPayload::ReservationExpired {
                reservation_id: reservation.id,
                user_id: reservation.user_id,
                resource_id: reservation.resource_id,
            });
        }

        // A resource whose covering reservation just expired leaves in_use.
        let mut affected: Vec<i64> = due.iter().map(|r| r.resource_id).collect();
        affected.sort_unstable();
        affected.dedup();
        for resource_id in affected {
            let change = core
                .db
                .with_tx(|tx| {
                    Box::pin(
                        async move { resources::refresh_status(tx, resource_id, now).await },
                    )
                })
                .await?;
            if let Some(change) = &change {
                resources::publish_status_change(core, change);
            }
        }

        total += count;
        if (count as i64) < batch {
            break;
        }
    }

    if total > 0 {
        core.cache.invalidate_resources().await;
        info!(count = total, "Expired past-end reservations");
    }
    Ok(total)
}

/// Step 3: return manually-disabled resources to service once their
/// `auto_reset_hours` have elapsed. Schedule-induced unavailability has no
/// `unavailable_since` and is never reset here.
async fn auto_reset_resources(core: &Core) -> Result<usize, EngineError> {
    let now = core.clock.now();
    let candidates =
        store::auto_reset_candidates(&core.db.pool, core.config.lifecycle_batch_size).await?;

    let mut reset = 0usize;
    for resource in candidates {
        let Some(since) = resource.unavailable_since else {
            continue;
        };
        if now - since < Duration::hours(resource.auto_reset_hours) {
            continue;
        }

        let resource_id = resource.id;
        core.db
            .with_tx(|tx| {
                Box::pin(async move {
                    store::lock_resource(tx, resource_id).await?;
                    sqlx::query(
                        "UPDATE resources SET status = ?, unavailable_since = NULL, \
                         unavailable_reason = NULL, updated_at = ? \
                         WHERE id = ? AND status = ?",
                    )
                    .bind(ResourceStatus::Available)
                    .bind(now)
                    .bind(resource_id)
                    .bind(ResourceStatus::Unavailable)
                    .execute(&mut **tx)
                    .await?;
                    Ok(())
                })
            })
            .await?;

        info!(target: "audit", action = "resource.auto_reset", resource = resource.id, "Auto-reset resource to available");
        core.bus.publish(EventPayload::ResourceAvailable {
            resource_id: resource.id,
            name: resource.name.clone(),
        });
        reset += 1;
    }

    if reset > 0 {
        core.cache.invalidate_resources().await;
    }
    Ok(reset)
}

/// Step 4: write reminders for reservations starting within the owner's
/// reminder window. A non-positive `reminder_hours` disables reminders for
/// that user.
async fn fire_reminders(core: &Core) -> Result<usize, EngineError> {
    let now = core.clock.now();
    let candidates =
        store::reminder_candidates(&core.db.pool, now, core.config.lifecycle_batch_size).await?;

    let mut sent = 0usize;
    for candidate in candidates {
        if candidate.reminder_hours <= 0 {
            continue;
        }
        let lead = candidate.start_time - now;
        if lead > Duration::hours(candidate.reminder_hours) {
            continue;
        }

        let resource_name = match store::resource_by_id(&core.db.pool, candidate.resource_id).await
        {
            Ok(Some(r)) => r.name,
            _ => "Resource".to_string(),
        };
        if let Err(e) = notify::notify_user(
            &core.db,
            candidate.user_id,
            NotificationKind::ReservationReminder,
            "Upcoming reservation",
            &format!(
                "Reminder: {} from {} to {}",
                resource_name,
                candidate.start_time.to_rfc3339(),
                candidate.end_time.to_rfc3339()
            ),
            Some(&format!("/reservations/{}", candidate.id)),
            now,
        )
        .await
        {
            warn!(reservation = candidate.id, error = %e, "Failed to write reminder");
            continue;
        }
        core.hub
            .send_to_user(
                candidate.user_id,
                json!({
                    "type": "reservation_reminder",
                    "reservation_id": candidate.id,
                    "resource_id": candidate.resource_id,
                    "start_time": candidate.start_time.to_rfc3339(),
                }),
            )
            .await;

        sqlx::query("UPDATE reservations SET reminder_sent = 1 WHERE id = ?")
            .bind(candidate.id)
            .execute(&core.db.pool)
            .await?;
        sent += 1;
    }

    if sent > 0 {
        debug!(count = sent, "Sent reservation reminders");
    }
    Ok(sent)
}

/// Spawn the scheduler loop. Flipping the shutdown signal stops it after
/// the in-flight tick completes.
pub fn spawn(core: Core, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(core.config.tick_interval_secs));
        interval.tick().await; // first tick is immediate — skip it
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => tick(&core).await,
            }
        }
        info!("Lifecycle scheduler stopped");
    })
}
