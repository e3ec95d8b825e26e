//! Waitlist engine: queue per resource, offer/expiry lifecycle.
//!
//! Positions are 1-based and kept dense across `waiting` entries of a
//! resource: an entry leaving the waiting set (offered, cancelled) releases
//! its position and everything behind it moves up. At most one outstanding
//! offer exists per freed window; when an offer lapses or loses the race to
//! book, the same window is re-offered to the next matching waiter.

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::booking::{self, BookingRequest};
use crate::db::models::{Actor, NotificationKind, Reservation, WaitlistEntry, WaitlistStatus};
use crate::db::store::{self, Page, Tx};
use crate::errors::EngineError;
use crate::events::EventPayload;
use crate::notify;
use crate::Core;

#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub resource_id: i64,
    pub desired_start: DateTime<Utc>,
    pub desired_end: DateTime<Utc>,
    pub flexible_time: bool,
}

/// Decrement waiting positions behind a vacated slot, keeping 1..N dense.
async fn release_position(tx: &mut Tx, resource_id: i64, position: i64) -> Result<(), EngineError> {
    sqlx::query(
        "UPDATE waitlist_entries SET position = position - 1 \
         WHERE resource_id = ? AND status = ? AND position > ?",
    )
    .bind(resource_id)
    .bind(WaitlistStatus::Waiting)
    .bind(position)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn entry_in_tx(tx: &mut Tx, entry_id: i64) -> Result<WaitlistEntry, EngineError> {
    sqlx::query_as::<_, WaitlistEntry>("SELECT * FROM waitlist_entries WHERE id = ?")
        .bind(entry_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(EngineError::NotFound("waitlist entry"))
}

/// Join the waitlist for a resource and window. One live entry per
/// `(user, resource, window)`.
pub async fn join(
    core: &Core,
    actor: &Actor,
    req: &JoinRequest,
) -> Result<WaitlistEntry, EngineError> {
    if req.desired_end <= req.desired_start {
        return Err(EngineError::Validation(
            "end time must be after start time".into(),
        ));
    }
    let now = core.clock.now();

    let entry = core
        .db
        .with_tx(|tx| {
            Box::pin(async move {
                store::lock_resource(tx, req.resource_id).await?;

                let duplicate: Option<(i64,)> = sqlx::query_as(
                    "SELECT id FROM waitlist_entries \
                     WHERE resource_id = ? AND user_id = ? \
                     AND desired_start = ? AND desired_end = ? \
                     AND status IN ('waiting', 'offered') LIMIT 1",
                )
                .bind(req.resource_id)
                .bind(actor.id)
                .bind(req.desired_start)
                .bind(req.desired_end)
                .fetch_optional(&mut **tx)
                .await?;
                if duplicate.is_some() {
                    return Err(EngineError::Validation(
                        "already on the waitlist for this time slot".into(),
                    ));
                }

                let (waiting_count,): (i64,) = sqlx::query_as(
                    "SELECT COUNT(*) FROM waitlist_entries WHERE resource_id = ? AND status = ?",
                )
                .bind(req.resource_id)
                .bind(WaitlistStatus::Waiting)
                .fetch_one(&mut **tx)
                .await?;

                let result = sqlx::query(
                    "INSERT INTO waitlist_entries \
                     (resource_id, user_id, desired_start, desired_end, flexible_time, status, position, created_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(req.resource_id)
                .bind(actor.id)
                .bind(req.desired_start)
                .bind(req.desired_end)
                .bind(req.flexible_time)
                .bind(WaitlistStatus::Waiting)
                .bind(waiting_count + 1)
                .bind(now)
                .execute(&mut **tx)
                .await?;

                entry_in_tx(tx, result.last_insert_rowid()).await
            })
        })
        .await?;

    info!(target: "audit", action = "waitlist.join", actor = actor.id, entry = entry.id, position = entry.position, "Joined waitlist");

    let resource_name = match store::resource_by_id(&core.db.pool, req.resource_id).await {
        Ok(Some(r)) => r.name,
        _ => "Resource".to_string(),
    };
    if let Err(e) = notify::notify_user(
        &core.db,
        actor.id,
        NotificationKind::SystemAnnouncement,
        "Joined waitlist",
        &format!(
            "You're #{} on the waitlist for {resource_name}",
            entry.position
        ),
        Some(&format!("/waitlist/{}", entry.id)),
        now,
    )
    .await
    {
        warn!(entry = entry.id, error = %e, "Failed to write waitlist join notification");
    }

    Ok(entry)
}

/// Leave the waitlist; remaining waiting positions are compacted.
pub async fn leave(
    core: &Core,
    actor: &Actor,
    entry_id: i64,
) -> Result<WaitlistEntry, EngineError> {
    let entry = core
        .db
        .with_tx(|tx| {
            Box::pin(async move {
                let entry = entry_in_tx(tx, entry_id).await?;
                if entry.user_id != actor.id && !actor.is_admin {
                    return Err(EngineError::Forbidden(
                        "you can only manage your own waitlist entries".into(),
                    ));
                }
                store::lock_resource(tx, entry.resource_id).await?;
                let entry = entry_in_tx(tx, entry_id).await?;
                if !matches!(
                    entry.status,
                    WaitlistStatus::Waiting | WaitlistStatus::Offered
                ) {
                    return Err(EngineError::AlreadyResolved(
                        "waitlist entry is no longer active".into(),
                    ));
                }

                sqlx::query("UPDATE waitlist_entries SET status = ? WHERE id = ?")
                    .bind(WaitlistStatus::Cancelled)
                    .bind(entry_id)
                    .execute(&mut **tx)
                    .await?;
                if entry.status == WaitlistStatus::Waiting {
                    release_position(tx, entry.resource_id, entry.position).await?;
                }

                entry_in_tx(tx, entry_id).await
            })
        })
        .await?;

    info!(target: "audit", action = "waitlist.leave", actor = actor.id, entry = entry.id, "Left waitlist");
    Ok(entry)
}

/// Offer a freed `[start, end)` window to the first matching waiter.
///
/// A waiter matches when the desired window equals the freed window exactly,
/// or overlaps it and the entry is flexible. Only one entry is offered per
/// call, and never while another offer for an overlapping window is open.
pub async fn check_and_offer_slot(
    core: &Core,
    resource_id: i64,
    freed_start: DateTime<Utc>,
    freed_end: DateTime<Utc>,
) -> Result<Option<WaitlistEntry>, EngineError> {
    let now = core.clock.now();
    let ttl = Duration::minutes(core.config.offer_ttl_minutes);

    let offered = core
        .db
        .with_tx(|tx| {
            Box::pin(async move {
                store::lock_resource(tx, resource_id).await?;

                let (open_offers,): (i64,) = sqlx::query_as(
                    "SELECT COUNT(*) FROM waitlist_entries \
                     WHERE resource_id = ? AND status = ? \
                     AND desired_start <= ? AND desired_end >= ?",
                )
                .bind(resource_id)
                .bind(WaitlistStatus::Offered)
                .bind(freed_end)
                .bind(freed_start)
                .fetch_one(&mut **tx)
                .await?;
                if open_offers > 0 {
                    return Ok(None);
                }

                let candidates = sqlx::query_as::<_, WaitlistEntry>(
                    "SELECT * FROM waitlist_entries \
                     WHERE resource_id = ? AND status = ? \
                     AND desired_start <= ? AND desired_end >= ? \
                     ORDER BY position ASC",
                )
                .bind(resource_id)
                .bind(WaitlistStatus::Waiting)
                .bind(freed_end)
                .bind(freed_start)
                .fetch_all(&mut **tx)
                .await?;

                let Some(entry) = candidates.into_iter().find(|e| {
                    let exact = e.desired_start == freed_start && e.desired_end == freed_end;
                    exact || e.flexible_time
                }) else {
                    return Ok(None);
                };

                sqlx::query(
                    "UPDATE waitlist_entries SET status = ?, offered_at = ?, offer_expires_at = ? \
                     WHERE id = ?",
                )
                .bind(WaitlistStatus::Offered)
                .bind(now)
                .bind(now + ttl)
                .bind(entry.id)
                .execute(&mut **tx)
                .await?;
                release_position(tx, resource_id, entry.position).await?;

                Ok(Some(entry_in_tx(tx, entry.id).await?))
            })
        })
        .await?;

    if let Some(entry) = &offered {
        info!(target: "audit", action = "waitlist.offer", entry = entry.id, user = entry.user_id, "Offered freed slot to waiter");
        core.bus.publish(EventPayload::WaitlistOffer {
            entry_id: entry.id,
            user_id: entry.user_id,
            resource_id: entry.resource_id,
            desired_start: entry.desired_start,
            desired_end: entry.desired_end,
            offer_expires_at: entry
                .offer_expires_at
                .unwrap_or(now + ttl),
        });
    }
    Ok(offered)
}

/// Accept an open offer, converting it into a reservation.
///
/// Losing the race (someone booked the window meanwhile) expires the entry
/// and re-offers the window to the next waiter; the conflict surfaces to the
/// caller.
pub async fn accept(
    core: &Core,
    actor: &Actor,
    entry_id: i64,
) -> Result<Reservation, EngineError> {
    let now = core.clock.now();
    let entry = store::waitlist_entry_by_id(&core.db.pool, entry_id)
        .await?
        .ok_or(EngineError::NotFound("waitlist entry"))?;
    if entry.user_id != actor.id {
        return Err(EngineError::Forbidden(
            "you can only accept your own offers".into(),
        ));
    }
    if entry.status != WaitlistStatus::Offered {
        return Err(EngineError::AlreadyResolved(
            "no active offer for this waitlist entry".into(),
        ));
    }
    if entry.offer_expires_at.is_some_and(|expires| now > expires) {
        expire_entry(core, &entry).await?;
        return Err(EngineError::OfferExpired);
    }

    let request = BookingRequest::new(entry.resource_id, entry.desired_start, entry.desired_end);
    match booking::create_reservation(core, actor, &request).await {
        Ok(reservation) => {
            sqlx::query("UPDATE waitlist_entries SET status = ? WHERE id = ?")
                .bind(WaitlistStatus::Fulfilled)
                .bind(entry_id)
                .execute(&core.db.pool)
                .await?;

            info!(target: "audit", action = "waitlist.accept", actor = actor.id, entry = entry_id, reservation = reservation.id, "Waitlist offer accepted");
            core.bus.publish(EventPayload::WaitlistAccepted {
                entry_id,
                user_id: entry.user_id,
                resource_id: entry.resource_id,
                reservation_id: reservation.id,
            });
            Ok(reservation)
        }
        Err(err @ EngineError::Conflict(_)) => {
            // Someone else booked the window while the offer was open.
            expire_entry(core, &entry).await?;
            Err(err)
        }
        Err(other) => Err(other),
    }
}

/// Expire one offered entry, tell the bus, and give the window to the next
/// matching waiter.
async fn expire_entry(core: &Core, entry: &WaitlistEntry) -> Result<(), EngineError> {
    let result = sqlx::query("UPDATE waitlist_entries SET status = ? WHERE id = ? AND status = ?")
        .bind(WaitlistStatus::Expired)
        .bind(entry.id)
        .bind(WaitlistStatus::Offered)
        .execute(&core.db.pool)
        .await?;
    if result.rows_affected() == 0 {
        return Ok(());
    }

    info!(target: "audit", action = "waitlist.expire", entry = entry.id, user = entry.user_id, "Waitlist offer expired");
    core.bus.publish(EventPayload::WaitlistExpired {
        entry_id: entry.id,
        user_id: entry.user_id,
        resource_id: entry.resource_id,
    });

    if let Err(e) =
        check_and_offer_slot(core, entry.resource_id, entry.desired_start, entry.desired_end).await
    {
        warn!(entry = entry.id, error = %e, "Re-offer after expiry failed");
    }
    Ok(())
}

/// Expire every offer past its TTL; each freed window is re-offered to the
/// next waiter in line. Invoked by the lifecycle scheduler.
pub async fn expire_stale_offers(core: &Core) -> Result<usize, EngineError> {
    let now = core.clock.now();
    let stale = sqlx::query_as::<_, WaitlistEntry>(
        "SELECT * FROM waitlist_entries \
         WHERE status = ? AND offer_expires_at < ? \
         ORDER BY offer_expires_at ASC LIMIT ?",
    )
    .bind(WaitlistStatus::Offered)
    .bind(now)
    .bind(core.config.lifecycle_batch_size)
    .fetch_all(&core.db.pool)
    .await?;

    let mut expired = 0;
    for entry in &stale {
        expire_entry(core, entry).await?;
        expired += 1;
    }
    Ok(expired)
}

/// Waiting entries for a resource in queue order.
pub async fn waiting_entries(
    core: &Core,
    resource_id: i64,
) -> Result<Vec<WaitlistEntry>, EngineError> {
    let rows = sqlx::query_as::<_, WaitlistEntry>(
        "SELECT * FROM waitlist_entries WHERE resource_id = ? AND status = ? ORDER BY position ASC",
    )
    .bind(resource_id)
    .bind(WaitlistStatus::Waiting)
    .fetch_all(&core.db.pool)
    .await?;
    Ok(rows)
}

/// A user's waitlist entries; live ones only unless `include_resolved`.
pub async fn entries_for_user(
    core: &Core,
    user_id: i64,
    include_resolved: bool,
    page: Page,
) -> Result<Vec<WaitlistEntry>, EngineError> {
    let rows = sqlx::query_as::<_, WaitlistEntry>(
        "SELECT * FROM waitlist_entries \
         WHERE user_id = ? AND (? = 1 OR status IN ('waiting', 'offered')) \
         ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
    )
    .bind(user_id)
    .bind(include_resolved)
    .bind(page.limit.clamp(1, 200))
    .bind(page.offset)
    .fetch_all(&core.db.pool)
    .await?;
    Ok(rows)
}
