//! The conflict-free reservation allocator.
//!
//! Every booking mutation runs under `with_tx` holding the resource lock, so
//! reservation state transitions for a single resource are globally
//! serialized. Conflict detection is the single store primitive
//! [`store::find_overlapping_reservations`]; a non-empty result aborts the
//! transaction with the overlapping windows attached.

pub mod approvals;
pub mod recurrence;
pub mod waitlist;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{info, warn};

use crate::db::models::{
    Actor, ApprovalStatus, NotificationKind, Reservation, ReservationStatus,
};
use crate::db::store::{self, NewReservation};
use crate::errors::EngineError;
use crate::events::EventPayload;
use crate::notify;
use crate::resources::{self, StatusChange};
use crate::Core;

use recurrence::RecurrenceRule;

/// Duration bounds: single bookings 15 minutes to 24 hours; the bulk import
/// path stretches the cap to 7 days.
const MIN_DURATION_MINUTES: i64 = 15;
const MAX_SINGLE_HOURS: i64 = 24;
const MAX_IMPORT_DAYS: i64 = 7;

#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub resource_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Forwarded to the approval request on approval-gated resources.
    pub request_message: Option<String>,
}

impl BookingRequest {
    pub fn new(resource_id: i64, start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        Self {
            resource_id,
            start_time,
            end_time,
            request_message: None,
        }
    }
}

fn validate_window(
    now: DateTime<Utc>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    max: Duration,
    max_label: &str,
    require_future: bool,
) -> Result<(), EngineError> {
    if end <= start {
        return Err(EngineError::Validation(
            "end time must be after start time".into(),
        ));
    }
    if require_future && start <= now {
        return Err(EngineError::Validation(
            "cannot create reservations in the past".into(),
        ));
    }
    let duration = end - start;
    if duration < Duration::minutes(MIN_DURATION_MINUTES) {
        return Err(EngineError::Validation(format!(
            "minimum reservation duration is {MIN_DURATION_MINUTES} minutes"
        )));
    }
    if duration > max {
        return Err(EngineError::Validation(format!(
            "reservations cannot exceed {max_label}"
        )));
    }
    Ok(())
}

struct CreateOutcome {
    reservation: Reservation,
    resource_name: String,
    /// (approval request id, approver user id) on approval-gated resources.
    approval: Option<(i64, i64)>,
    status_change: Option<StatusChange>,
}

/// Create a reservation, or a pending approval request when the resource is
/// approval-gated. See the contract in the module docs for the check order.
pub async fn create_reservation(
    core: &Core,
    actor: &Actor,
    req: &BookingRequest,
) -> Result<Reservation, EngineError> {
    let now = core.clock.now();
    validate_window(
        now,
        req.start_time,
        req.end_time,
        Duration::hours(MAX_SINGLE_HOURS),
        "24 hours",
        true,
    )?;

    let actor_owned = *actor;
    let outcome = core
        .db
        .with_tx(|tx| {
            let req = req.clone();
            let actor = actor_owned;
            Box::pin(async move {
                store::lock_resource(tx, req.resource_id).await?;
                let resource = store::resource_by_id(&mut **tx, req.resource_id)
                    .await?
                    .ok_or(EngineError::NotFound("resource"))?;
                if let Some(reason) = resources::booking_blocked_reason(&resource, now) {
                    return Err(EngineError::Validation(reason.into()));
                }

                let overlapping = store::find_overlapping_reservations(
                    &mut **tx,
                    req.resource_id,
                    req.start_time,
                    req.end_time,
                    None,
                )
                .await?;
                if !overlapping.is_empty() {
                    return Err(EngineError::Conflict(store::conflict_windows(&overlapping)));
                }

                if resource.requires_approval {
                    let approver_id = resource
                        .default_approver_id
                        .ok_or(EngineError::NoApproverConfigured)?;

                    let reservation_id = store::insert_reservation(
                        tx,
                        &NewReservation {
                            user_id: actor.id,
                            resource_id: req.resource_id,
                            start_time: req.start_time,
                            end_time: req.end_time,
                            status: ReservationStatus::PendingApproval,
                            created_at: now,
                            recurrence_rule_id: None,
                            parent_reservation_id: None,
                            is_recurring_instance: false,
                        },
                    )
                    .await?;

                    let result = sqlx::query(
                        "INSERT INTO approval_requests \
                         (reservation_id, approver_id, status, request_message, created_at) \
                         VALUES (?, ?, ?, ?, ?)",
                    )
                    .bind(reservation_id)
                    .bind(approver_id)
                    .bind(ApprovalStatus::Pending)
                    .bind(req.request_message.as_deref())
                    .bind(now)
                    .execute(&mut **tx)
                    .await?;

                    store::log_action(
                        tx,
                        reservation_id,
                        "requested",
                        Some(actor.id),
                        &format!(
                            "Requested {} from {} to {} (pending approval)",
                            resource.name, req.start_time, req.end_time
                        ),
                        now,
                    )
                    .await?;

                    let reservation = store::reservation_by_id(&mut **tx, reservation_id)
                        .await?
                        .ok_or(EngineError::NotFound("reservation"))?;
                    return Ok(CreateOutcome {
                        reservation,
                        resource_name: resource.name,
                        approval: Some((result.last_insert_rowid(), approver_id)),
                        status_change: None,
                    });
                }

                let reservation_id = store::insert_reservation(
                    tx,
                    &NewReservation {
                        user_id: actor.id,
                        resource_id: req.resource_id,
                        start_time: req.start_time,
                        end_time: req.end_time,
                        status: ReservationStatus::Active,
                        created_at: now,
                        recurrence_rule_id: None,
                        parent_reservation_id: None,
                        is_recurring_instance: false,
                    },
                )
                .await?;
                store::log_action(
                    tx,
                    reservation_id,
                    "created",
                    Some(actor.id),
                    &format!(
                        "Reserved {} from {} to {}",
                        resource.name, req.start_time, req.end_time
                    ),
                    now,
                )
                .await?;
                let status_change = resources::refresh_status(tx, req.resource_id, now).await?;

                let reservation = store::reservation_by_id(&mut **tx, reservation_id)
                    .await?
                    .ok_or(EngineError::NotFound("reservation"))?;
                Ok(CreateOutcome {
                    reservation,
                    resource_name: resource.name,
                    approval: None,
                    status_change,
                })
            })
        })
        .await?;

    core.cache.invalidate_resources().await;
    let reservation = outcome.reservation;

    match outcome.approval {
        Some((approval_id, approver_id)) => {
            info!(target: "audit", action = "reservation.request", actor = actor.id, reservation = reservation.id, approval = approval_id, "Created approval-gated reservation request");
            notify_approver(core, actor, &reservation, &outcome.resource_name, approval_id, approver_id)
                .await;
        }
        None => {
            info!(target: "audit", action = "reservation.create", actor = actor.id, reservation = reservation.id, "Created reservation");
            core.bus.publish(EventPayload::ReservationCreated {
                reservation_id: reservation.id,
                user_id: reservation.user_id,
                resource_id: reservation.resource_id,
                start_time: reservation.start_time,
                end_time: reservation.end_time,
            });
            if let Some(change) = &outcome.status_change {
                resources::publish_status_change(core, change);
            }
        }
    }
    Ok(reservation)
}

/// Notify the designated approver, in-app and on their sockets. There is no
/// bus event type for approval requests, so this bypasses the bus.
async fn notify_approver(
    core: &Core,
    requester: &Actor,
    reservation: &Reservation,
    resource_name: &str,
    approval_id: i64,
    approver_id: i64,
) {
    let requester_name = match store::user_by_id(&core.db.pool, requester.id).await {
        Ok(Some(user)) => user.username,
        _ => format!("user {}", requester.id),
    };

    if let Err(e) = notify::notify_user(
        &core.db,
        approver_id,
        NotificationKind::SystemAnnouncement,
        "Approval Request",
        &format!("{requester_name} is requesting to reserve {resource_name}"),
        Some(&format!("/approvals/{approval_id}")),
        core.clock.now(),
    )
    .await
    {
        warn!(approval = approval_id, error = %e, "Failed to notify approver");
    }

    core.hub
        .send_to_user(
            approver_id,
            json!({
                "type": "approval_request",
                "approval_id": approval_id,
                "reservation_id": reservation.id,
                "resource_name": resource_name,
                "requester": requester_name,
            }),
        )
        .await;
}

/// Cancel a reservation. Owners cancel their own; admins cancel any.
/// Cancelling an active reservation frees its window for the waitlist.
pub async fn cancel_reservation(
    core: &Core,
    actor: &Actor,
    reservation_id: i64,
    reason: Option<&str>,
) -> Result<Reservation, EngineError> {
    let now = core.clock.now();
    let actor = *actor;
    let reason = reason.map(|r| r.to_string());

    let (reservation, was_active, status_change) = core
        .db
        .with_tx(|tx| {
            let reason = reason.clone();
            Box::pin(async move {
                let current = store::reservation_by_id(&mut **tx, reservation_id)
                    .await?
                    .ok_or(EngineError::NotFound("reservation"))?;
                if current.user_id != actor.id && !actor.is_admin {
                    return Err(EngineError::Forbidden(
                        "you can only cancel your own reservations".into(),
                    ));
                }

                // Re-read under the resource lock; status may have moved.
                store::lock_resource(tx, current.resource_id).await?;
                let current = store::reservation_by_id(&mut **tx, reservation_id)
                    .await?
                    .ok_or(EngineError::NotFound("reservation"))?;
                if current.status == ReservationStatus::Cancelled {
                    return Err(EngineError::AlreadyResolved(
                        "reservation is already cancelled".into(),
                    ));
                }
                let was_active = current.status == ReservationStatus::Active;
                let was_pending = current.status == ReservationStatus::PendingApproval;

                sqlx::query(
                    "UPDATE reservations SET status = ?, cancelled_at = ?, cancellation_reason = ? \
                     WHERE id = ?",
                )
                .bind(ReservationStatus::Cancelled)
                .bind(now)
                .bind(reason.as_deref())
                .bind(reservation_id)
                .execute(&mut **tx)
                .await?;

                if was_pending {
                    sqlx::query(
                        "UPDATE approval_requests SET status = ?, response_message = ?, responded_at = ? \
                         WHERE reservation_id = ? AND status = ?",
                    )
                    .bind(ApprovalStatus::Rejected)
                    .bind("Cancelled by requester")
                    .bind(now)
                    .bind(reservation_id)
                    .bind(ApprovalStatus::Pending)
                    .execute(&mut **tx)
                    .await?;
                }

                let details = match reason.as_deref() {
                    Some(r) => format!("Cancelled reservation (Reason: {r})"),
                    None => "Cancelled reservation".to_string(),
                };
                store::log_action(tx, reservation_id, "cancelled", Some(actor.id), &details, now)
                    .await?;

                let status_change =
                    resources::refresh_status(tx, current.resource_id, now).await?;
                let updated = store::reservation_by_id(&mut **tx, reservation_id)
                    .await?
                    .ok_or(EngineError::NotFound("reservation"))?;
                Ok((updated, was_active, status_change))
            })
        })
        .await?;

    core.cache.invalidate_resources().await;
    info!(target: "audit", action = "reservation.cancel", actor = actor.id, reservation = reservation.id, "Cancelled reservation");

    core.bus.publish(EventPayload::ReservationCancelled {
        reservation_id: reservation.id,
        user_id: reservation.user_id,
        resource_id: reservation.resource_id,
        start_time: reservation.start_time,
        end_time: reservation.end_time,
        cancelled_at: now,
    });
    if let Some(change) = &status_change {
        resources::publish_status_change(core, change);
    }

    // Only an active reservation held the slot; offer the freed window.
    if was_active {
        if let Err(e) = waitlist::check_and_offer_slot(
            core,
            reservation.resource_id,
            reservation.start_time,
            reservation.end_time,
        )
        .await
        {
            warn!(resource = reservation.resource_id, error = %e, "Waitlist offer after cancel failed");
        }
    }

    Ok(reservation)
}

/// Admin-only bulk/import path: accepts past windows and durations up to
/// 7 days, still conflict-checked and audited.
pub async fn import_reservation(
    core: &Core,
    actor: &Actor,
    target_user_id: i64,
    req: &BookingRequest,
) -> Result<Reservation, EngineError> {
    if !actor.is_admin {
        return Err(EngineError::Forbidden(
            "only admins can import reservations".into(),
        ));
    }
    let now = core.clock.now();
    validate_window(
        now,
        req.start_time,
        req.end_time,
        Duration::days(MAX_IMPORT_DAYS),
        "7 days",
        false,
    )?;

    let actor_owned = *actor;
    let (reservation, status_change) = core
        .db
        .with_tx(|tx| {
            let req = req.clone();
            let actor = actor_owned;
            Box::pin(async move {
                store::lock_resource(tx, req.resource_id).await?;
                let resource = store::resource_by_id(&mut **tx, req.resource_id)
                    .await?
                    .ok_or(EngineError::NotFound("resource"))?;

                let overlapping = store::find_overlapping_reservations(
                    &mut **tx,
                    req.resource_id,
                    req.start_time,
                    req.end_time,
                    None,
                )
                .await?;
                if !overlapping.is_empty() {
                    return Err(EngineError::Conflict(store::conflict_windows(&overlapping)));
                }

                let reservation_id = store::insert_reservation(
                    tx,
                    &NewReservation {
                        user_id: target_user_id,
                        resource_id: req.resource_id,
                        start_time: req.start_time,
                        end_time: req.end_time,
                        status: ReservationStatus::Active,
                        created_at: now,
                        recurrence_rule_id: None,
                        parent_reservation_id: None,
                        is_recurring_instance: false,
                    },
                )
                .await?;
                store::log_action(
                    tx,
                    reservation_id,
                    "imported",
                    Some(actor.id),
                    &format!(
                        "Imported reservation of {} for user {} from {} to {}",
                        resource.name, target_user_id, req.start_time, req.end_time
                    ),
                    now,
                )
                .await?;
                let status_change = resources::refresh_status(tx, req.resource_id, now).await?;

                let reservation = store::reservation_by_id(&mut **tx, reservation_id)
                    .await?
                    .ok_or(EngineError::NotFound("reservation"))?;
                Ok((reservation, status_change))
            })
        })
        .await?;

    core.cache.invalidate_resources().await;
    info!(target: "audit", action = "reservation.import", actor = actor.id, reservation = reservation.id, "Imported reservation");

    core.bus.publish(EventPayload::ReservationCreated {
        reservation_id: reservation.id,
        user_id: reservation.user_id,
        resource_id: reservation.resource_id,
        start_time: reservation.start_time,
        end_time: reservation.end_time,
    });
    if let Some(change) = &status_change {
        resources::publish_status_change(core, change);
    }
    Ok(reservation)
}

/// Create a recurring series: every generated occurrence is validated
/// against existing reservations before any row is inserted — partial
/// series are never created.
pub async fn create_recurring_series(
    core: &Core,
    actor: &Actor,
    req: &BookingRequest,
    rule: &RecurrenceRule,
) -> Result<Vec<Reservation>, EngineError> {
    let now = core.clock.now();
    validate_window(
        now,
        req.start_time,
        req.end_time,
        Duration::hours(MAX_SINGLE_HOURS),
        "24 hours",
        true,
    )?;
    let occurrences = recurrence::expand(req.start_time, req.end_time, rule)?;

    let actor_owned = *actor;
    let (series, status_change) = core
        .db
        .with_tx(|tx| {
            let occurrences = occurrences.clone();
            let req = req.clone();
            let rule = rule.clone();
            let actor = actor_owned;
            Box::pin(async move {
                store::lock_resource(tx, req.resource_id).await?;
                let resource = store::resource_by_id(&mut **tx, req.resource_id)
                    .await?
                    .ok_or(EngineError::NotFound("resource"))?;
                if let Some(reason) = resources::booking_blocked_reason(&resource, now) {
                    return Err(EngineError::Validation(reason.into()));
                }
                if resource.requires_approval {
                    return Err(EngineError::Validation(
                        "recurring series cannot target approval-gated resources".into(),
                    ));
                }

                for (occ_start, occ_end) in &occurrences {
                    let overlapping = store::find_overlapping_reservations(
                        &mut **tx,
                        req.resource_id,
                        *occ_start,
                        *occ_end,
                        None,
                    )
                    .await?;
                    if !overlapping.is_empty() {
                        return Err(EngineError::Conflict(store::conflict_windows(&overlapping)));
                    }
                }

                let days_of_week = if rule.days_of_week.is_empty() {
                    None
                } else {
                    Some(serde_json::to_string(&rule.days_of_week).expect("u8 list serializes"))
                };
                let rule_id = sqlx::query(
                    "INSERT INTO recurrence_rules \
                     (frequency, interval, days_of_week, end_type, end_date, occurrence_count, created_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(rule.frequency)
                .bind(rule.interval as i64)
                .bind(days_of_week)
                .bind(rule.end_type)
                .bind(rule.end_date)
                .bind(rule.occurrence_count.map(|c| c as i64))
                .bind(now)
                .execute(&mut **tx)
                .await?
                .last_insert_rowid();

                let mut series = Vec::with_capacity(occurrences.len());
                let mut parent_id: Option<i64> = None;
                for (idx, (occ_start, occ_end)) in occurrences.iter().enumerate() {
                    let reservation_id = store::insert_reservation(
                        tx,
                        &NewReservation {
                            user_id: actor.id,
                            resource_id: req.resource_id,
                            start_time: *occ_start,
                            end_time: *occ_end,
                            status: ReservationStatus::Active,
                            created_at: now,
                            recurrence_rule_id: Some(rule_id),
                            parent_reservation_id: parent_id,
                            is_recurring_instance: idx > 0,
                        },
                    )
                    .await?;
                    if parent_id.is_none() {
                        parent_id = Some(reservation_id);
                    }
                    store::log_action(
                        tx,
                        reservation_id,
                        "created",
                        Some(actor.id),
                        &format!("Created recurring reservation #{}", idx + 1),
                        now,
                    )
                    .await?;
                    let reservation = store::reservation_by_id(&mut **tx, reservation_id)
                        .await?
                        .ok_or(EngineError::NotFound("reservation"))?;
                    series.push(reservation);
                }

                let status_change = resources::refresh_status(tx, req.resource_id, now).await?;
                Ok((series, status_change))
            })
        })
        .await?;

    core.cache.invalidate_resources().await;
    info!(
        target: "audit",
        action = "reservation.create_series",
        actor = actor.id,
        occurrences = series.len(),
        "Created recurring series"
    );

    // One event for the series, anchored on the first occurrence; a
    // per-occurrence fan-out would flood subscribers with up to 100 events.
    if let Some(parent) = series.first() {
        core.bus.publish(EventPayload::ReservationCreated {
            reservation_id: parent.id,
            user_id: parent.user_id,
            resource_id: parent.resource_id,
            start_time: parent.start_time,
            end_time: parent.end_time,
        });
    }
    if let Some(change) = &status_change {
        resources::publish_status_change(core, change);
    }
    Ok(series)
}
