//! Two-step commit for bookings on approval-gated resources.
//!
//! An approval-gated booking is inserted as `pending_approval` together with
//! its ApprovalRequest (see `booking::create_reservation`). The designated
//! approver resolves it here. Approving re-runs the conflict check against
//! `active` reservations — windows booked while the request was pending win,
//! and the reservation is rejected with "conflict on approval". Terminal
//! approval states are immutable.

use serde_json::json;
use tracing::{info, warn};

use crate::db::models::{
    Actor, ApprovalRequest, ApprovalStatus, NotificationKind, Reservation, ReservationStatus,
};
use crate::db::store::{self, Tx};
use crate::errors::EngineError;
use crate::events::EventPayload;
use crate::notify;
use crate::resources::{self, StatusChange};
use crate::Core;

pub async fn approval_by_id(
    core: &Core,
    approval_id: i64,
) -> Result<Option<ApprovalRequest>, EngineError> {
    let row = sqlx::query_as::<_, ApprovalRequest>("SELECT * FROM approval_requests WHERE id = ?")
        .bind(approval_id)
        .fetch_optional(&core.db.pool)
        .await?;
    Ok(row)
}

/// Pending requests awaiting a given approver, oldest first.
pub async fn pending_for_approver(
    core: &Core,
    approver_id: i64,
) -> Result<Vec<ApprovalRequest>, EngineError> {
    let rows = sqlx::query_as::<_, ApprovalRequest>(
        "SELECT * FROM approval_requests WHERE approver_id = ? AND status = ? \
         ORDER BY created_at ASC, id ASC",
    )
    .bind(approver_id)
    .bind(ApprovalStatus::Pending)
    .fetch_all(&core.db.pool)
    .await?;
    Ok(rows)
}

async fn approval_in_tx(tx: &mut Tx, approval_id: i64) -> Result<ApprovalRequest, EngineError> {
    sqlx::query_as::<_, ApprovalRequest>("SELECT * FROM approval_requests WHERE id = ?")
        .bind(approval_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(EngineError::NotFound("approval request"))
}

fn ensure_pending(approval: &ApprovalRequest) -> Result<(), EngineError> {
    if approval.status != ApprovalStatus::Pending {
        return Err(EngineError::AlreadyResolved(format!(
            "request has already been {}",
            approval.status.as_str()
        )));
    }
    Ok(())
}

async fn resolve_approval(
    tx: &mut Tx,
    approval_id: i64,
    status: ApprovalStatus,
    response_message: Option<&str>,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<(), EngineError> {
    sqlx::query(
        "UPDATE approval_requests SET status = ?, response_message = ?, responded_at = ? WHERE id = ?",
    )
    .bind(status)
    .bind(response_message)
    .bind(now)
    .bind(approval_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn set_reservation_status(
    tx: &mut Tx,
    reservation_id: i64,
    status: ReservationStatus,
) -> Result<(), EngineError> {
    sqlx::query("UPDATE reservations SET status = ? WHERE id = ?")
        .bind(status)
        .bind(reservation_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

enum ApproveOutcome {
    Approved {
        approval: ApprovalRequest,
        reservation: Reservation,
        status_change: Option<StatusChange>,
    },
    ConflictOnApproval {
        approval: ApprovalRequest,
        reservation: Reservation,
    },
}

/// Approve a pending request. The reservation becomes `active` unless a
/// conflicting active booking appeared while it was pending, in which case
/// both the reservation and the request end `rejected`.
pub async fn approve(
    core: &Core,
    actor: &Actor,
    approval_id: i64,
    response_message: Option<&str>,
) -> Result<ApprovalRequest, EngineError> {
    let now = core.clock.now();
    let actor_owned = *actor;
    let response_message = response_message.map(|m| m.to_string());

    let outcome = core
        .db
        .with_tx(|tx| {
            let actor = actor_owned;
            let response_message = response_message.clone();
            Box::pin(async move {
                let approval = approval_in_tx(tx, approval_id).await?;
                if approval.approver_id != actor.id {
                    return Err(EngineError::Forbidden(
                        "you are not the designated approver for this request".into(),
                    ));
                }
                ensure_pending(&approval)?;

                let reservation = store::reservation_by_id(&mut **tx, approval.reservation_id)
                    .await?
                    .ok_or(EngineError::NotFound("reservation"))?;

                // Serialize against concurrent bookings, then re-check state.
                store::lock_resource(tx, reservation.resource_id).await?;
                let approval = approval_in_tx(tx, approval_id).await?;
                ensure_pending(&approval)?;

                let overlapping = store::find_overlapping_reservations(
                    &mut **tx,
                    reservation.resource_id,
                    reservation.start_time,
                    reservation.end_time,
                    Some(reservation.id),
                )
                .await?;

                if !overlapping.is_empty() {
                    set_reservation_status(tx, reservation.id, ReservationStatus::Rejected).await?;
                    resolve_approval(
                        tx,
                        approval_id,
                        ApprovalStatus::Rejected,
                        Some("conflict on approval"),
                        now,
                    )
                    .await?;
                    store::log_action(
                        tx,
                        reservation.id,
                        "rejected",
                        Some(actor.id),
                        "Approval failed: conflict on approval",
                        now,
                    )
                    .await?;

                    let approval = approval_in_tx(tx, approval_id).await?;
                    let reservation = store::reservation_by_id(&mut **tx, reservation.id)
                        .await?
                        .ok_or(EngineError::NotFound("reservation"))?;
                    return Ok(ApproveOutcome::ConflictOnApproval {
                        approval,
                        reservation,
                    });
                }

                resolve_approval(
                    tx,
                    approval_id,
                    ApprovalStatus::Approved,
                    response_message.as_deref(),
                    now,
                )
                .await?;
                set_reservation_status(tx, reservation.id, ReservationStatus::Active).await?;
                store::log_action(
                    tx,
                    reservation.id,
                    "approved",
                    Some(actor.id),
                    "Reservation approved",
                    now,
                )
                .await?;
                let status_change =
                    resources::refresh_status(tx, reservation.resource_id, now).await?;

                let approval = approval_in_tx(tx, approval_id).await?;
                let reservation = store::reservation_by_id(&mut **tx, reservation.id)
                    .await?
                    .ok_or(EngineError::NotFound("reservation"))?;
                Ok(ApproveOutcome::Approved {
                    approval,
                    reservation,
                    status_change,
                })
            })
        })
        .await?;

    core.cache.invalidate_resources().await;

    match outcome {
        ApproveOutcome::Approved {
            approval,
            reservation,
            status_change,
        } => {
            info!(target: "audit", action = "approval.approve", actor = actor.id, approval = approval.id, reservation = reservation.id, "Approved reservation request");
            let resource_name = resource_name(core, reservation.resource_id).await;
            notify_requester(
                core,
                &reservation,
                NotificationKind::ReservationConfirmed,
                "Reservation Approved",
                &format!("Your reservation for {resource_name} has been approved!"),
            )
            .await;
            core.hub
                .send_to_user(
                    reservation.user_id,
                    json!({
                        "type": "reservation_approved",
                        "reservation_id": reservation.id,
                        "approval_id": approval.id,
                        "resource_name": resource_name,
                    }),
                )
                .await;
            core.bus.publish(EventPayload::ReservationUpdated {
                reservation_id: reservation.id,
                user_id: reservation.user_id,
                resource_id: reservation.resource_id,
                status: ReservationStatus::Active,
            });
            if let Some(change) = &status_change {
                resources::publish_status_change(core, change);
            }
            Ok(approval)
        }
        ApproveOutcome::ConflictOnApproval {
            approval,
            reservation,
        } => {
            info!(target: "audit", action = "approval.conflict", actor = actor.id, approval = approval.id, reservation = reservation.id, "Approval rejected by conflict");
            let resource_name = resource_name(core, reservation.resource_id).await;
            notify_requester(
                core,
                &reservation,
                NotificationKind::ReservationCancelled,
                "Reservation Rejected",
                &format!(
                    "Your reservation for {resource_name} was rejected. Reason: conflict on approval"
                ),
            )
            .await;
            core.hub
                .send_to_user(
                    reservation.user_id,
                    json!({
                        "type": "reservation_rejected",
                        "reservation_id": reservation.id,
                        "approval_id": approval.id,
                        "resource_name": resource_name,
                        "reason": "conflict on approval",
                    }),
                )
                .await;
            core.bus.publish(EventPayload::ReservationUpdated {
                reservation_id: reservation.id,
                user_id: reservation.user_id,
                resource_id: reservation.resource_id,
                status: ReservationStatus::Rejected,
            });
            Ok(approval)
        }
    }
}

/// Reject a pending request; the reservation ends `rejected`.
pub async fn reject(
    core: &Core,
    actor: &Actor,
    approval_id: i64,
    response_message: Option<&str>,
) -> Result<ApprovalRequest, EngineError> {
    let now = core.clock.now();
    let actor_owned = *actor;
    let response_message = response_message.map(|m| m.to_string());

    let (approval, reservation) = core
        .db
        .with_tx(|tx| {
            let actor = actor_owned;
            let response_message = response_message.clone();
            Box::pin(async move {
                let approval = approval_in_tx(tx, approval_id).await?;
                if approval.approver_id != actor.id {
                    return Err(EngineError::Forbidden(
                        "you are not the designated approver for this request".into(),
                    ));
                }
                ensure_pending(&approval)?;

                let reservation = store::reservation_by_id(&mut **tx, approval.reservation_id)
                    .await?
                    .ok_or(EngineError::NotFound("reservation"))?;
                store::lock_resource(tx, reservation.resource_id).await?;

                resolve_approval(
                    tx,
                    approval_id,
                    ApprovalStatus::Rejected,
                    response_message.as_deref(),
                    now,
                )
                .await?;
                set_reservation_status(tx, reservation.id, ReservationStatus::Rejected).await?;
                store::log_action(
                    tx,
                    reservation.id,
                    "rejected",
                    Some(actor.id),
                    "Reservation request rejected",
                    now,
                )
                .await?;

                let approval = approval_in_tx(tx, approval_id).await?;
                let reservation = store::reservation_by_id(&mut **tx, reservation.id)
                    .await?
                    .ok_or(EngineError::NotFound("reservation"))?;
                Ok((approval, reservation))
            })
        })
        .await?;

    core.cache.invalidate_resources().await;
    info!(target: "audit", action = "approval.reject", actor = actor.id, approval = approval.id, reservation = reservation.id, "Rejected reservation request");

    let resource_name = resource_name(core, reservation.resource_id).await;
    let reason_suffix = match response_message.as_deref() {
        Some(reason) => format!(" Reason: {reason}"),
        None => String::new(),
    };
    notify_requester(
        core,
        &reservation,
        NotificationKind::ReservationCancelled,
        "Reservation Rejected",
        &format!("Your reservation for {resource_name} was rejected.{reason_suffix}"),
    )
    .await;
    core.hub
        .send_to_user(
            reservation.user_id,
            json!({
                "type": "reservation_rejected",
                "reservation_id": reservation.id,
                "approval_id": approval.id,
                "resource_name": resource_name,
                "reason": response_message,
            }),
        )
        .await;
    core.bus.publish(EventPayload::ReservationCancelled {
        reservation_id: reservation.id,
        user_id: reservation.user_id,
        resource_id: reservation.resource_id,
        start_time: reservation.start_time,
        end_time: reservation.end_time,
        cancelled_at: now,
    });
    Ok(approval)
}

/// Requester withdraws a still-pending request: the ApprovalRequest ends
/// `rejected` ("Cancelled by requester") and the reservation `cancelled`.
pub async fn cancel_pending(
    core: &Core,
    actor: &Actor,
    approval_id: i64,
) -> Result<ApprovalRequest, EngineError> {
    let now = core.clock.now();
    let actor_owned = *actor;

    let (approval, reservation) = core
        .db
        .with_tx(|tx| {
            let actor = actor_owned;
            Box::pin(async move {
                let approval = approval_in_tx(tx, approval_id).await?;
                let reservation = store::reservation_by_id(&mut **tx, approval.reservation_id)
                    .await?
                    .ok_or(EngineError::NotFound("reservation"))?;
                if reservation.user_id != actor.id {
                    return Err(EngineError::Forbidden(
                        "you can only cancel your own requests".into(),
                    ));
                }
                ensure_pending(&approval)?;

                store::lock_resource(tx, reservation.resource_id).await?;
                resolve_approval(
                    tx,
                    approval_id,
                    ApprovalStatus::Rejected,
                    Some("Cancelled by requester"),
                    now,
                )
                .await?;
                sqlx::query(
                    "UPDATE reservations SET status = ?, cancelled_at = ?, cancellation_reason = ? \
                     WHERE id = ?",
                )
                .bind(ReservationStatus::Cancelled)
                .bind(now)
                .bind("Cancelled pending approval")
                .bind(reservation.id)
                .execute(&mut **tx)
                .await?;
                store::log_action(
                    tx,
                    reservation.id,
                    "cancelled",
                    Some(actor.id),
                    "Cancelled pending approval request",
                    now,
                )
                .await?;

                let approval = approval_in_tx(tx, approval_id).await?;
                let reservation = store::reservation_by_id(&mut **tx, reservation.id)
                    .await?
                    .ok_or(EngineError::NotFound("reservation"))?;
                Ok((approval, reservation))
            })
        })
        .await?;

    core.cache.invalidate_resources().await;
    info!(target: "audit", action = "approval.cancel", actor = actor.id, approval = approval.id, "Requester cancelled pending request");

    core.bus.publish(EventPayload::ReservationCancelled {
        reservation_id: reservation.id,
        user_id: reservation.user_id,
        resource_id: reservation.resource_id,
        start_time: reservation.start_time,
        end_time: reservation.end_time,
        cancelled_at: now,
    });
    Ok(approval)
}

async fn resource_name(core: &Core, resource_id: i64) -> String {
    match store::resource_by_id(&core.db.pool, resource_id).await {
        Ok(Some(resource)) => resource.name,
        _ => "Resource".to_string(),
    }
}

async fn notify_requester(
    core: &Core,
    reservation: &Reservation,
    kind: NotificationKind,
    title: &str,
    message: &str,
) {
    if let Err(e) = notify::notify_user(
        &core.db,
        reservation.user_id,
        kind,
        title,
        message,
        Some(&format!("/reservations/{}", reservation.id)),
        core.clock.now(),
    )
    .await
    {
        warn!(reservation = reservation.id, error = %e, "Failed to notify requester");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    use crate::booking::{self, BookingRequest};
    use crate::engine_tests::harness::{
        seed_approval_resource, seed_resource, seed_user, test_core,
    };

    async fn pending_request(
        core: &crate::Core,
        requester: &Actor,
        approver: &Actor,
    ) -> (i64, ApprovalRequest) {
        let resource = seed_approval_resource(core, "Gated Room", approver.id).await;
        let now = core.clock.now();
        let reservation = booking::create_reservation(
            core,
            requester,
            &BookingRequest::new(resource, now + Duration::hours(1), now + Duration::hours(2)),
        )
        .await
        .unwrap();
        assert_eq!(reservation.status, ReservationStatus::PendingApproval);

        let approvals = pending_for_approver(core, approver.id).await.unwrap();
        assert_eq!(approvals.len(), 1);
        (resource, approvals[0].clone())
    }

    #[tokio::test]
    async fn approve_activates_the_reservation() {
        let core = test_core().await;
        let requester = seed_user(&core, "alice", false).await;
        let approver = seed_user(&core, "boss", false).await;
        let (_, approval) = pending_request(&core, &requester, &approver).await;

        let resolved = approve(&core, &approver, approval.id, Some("go ahead"))
            .await
            .unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Approved);
        assert_eq!(resolved.responded_at, Some(core.clock.now()));
        assert_eq!(resolved.response_message.as_deref(), Some("go ahead"));

        let reservation = store::reservation_by_id(&core.db.pool, approval.reservation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reservation.status, ReservationStatus::Active);
    }

    #[tokio::test]
    async fn only_the_designated_approver_may_resolve() {
        let core = test_core().await;
        let requester = seed_user(&core, "alice", false).await;
        let approver = seed_user(&core, "boss", false).await;
        let outsider = seed_user(&core, "mallory", false).await;
        let (_, approval) = pending_request(&core, &requester, &approver).await;

        let err = approve(&core, &outsider, approval.id, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Forbidden(_)));
        let err = reject(&core, &outsider, approval.id, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Forbidden(_)));
    }

    #[tokio::test]
    async fn terminal_requests_are_immutable() {
        let core = test_core().await;
        let requester = seed_user(&core, "alice", false).await;
        let approver = seed_user(&core, "boss", false).await;
        let (_, approval) = pending_request(&core, &requester, &approver).await;

        approve(&core, &approver, approval.id, None).await.unwrap();
        let resolved = approval_by_id(&core, approval.id).await.unwrap().unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Approved);

        let err = approve(&core, &approver, approval.id, None).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyResolved(_)));
        let err = reject(&core, &approver, approval.id, None).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyResolved(_)));
        let err = cancel_pending(&core, &requester, approval.id).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyResolved(_)));
    }

    #[tokio::test]
    async fn reject_marks_reservation_rejected() {
        let core = test_core().await;
        let requester = seed_user(&core, "alice", false).await;
        let approver = seed_user(&core, "boss", false).await;
        let (_, approval) = pending_request(&core, &requester, &approver).await;
        let mut rx = core.bus.subscribe();

        let resolved = reject(&core, &approver, approval.id, Some("room is being painted"))
            .await
            .unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Rejected);

        let reservation = store::reservation_by_id(&core.db.pool, approval.reservation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reservation.status, ReservationStatus::Rejected);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.payload.event_type(), "reservation.cancelled");
    }

    #[tokio::test]
    async fn requester_can_withdraw_while_pending() {
        let core = test_core().await;
        let requester = seed_user(&core, "alice", false).await;
        let approver = seed_user(&core, "boss", false).await;
        let (_, approval) = pending_request(&core, &requester, &approver).await;

        let resolved = cancel_pending(&core, &requester, approval.id).await.unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Rejected);
        assert_eq!(
            resolved.response_message.as_deref(),
            Some("Cancelled by requester")
        );

        let reservation = store::reservation_by_id(&core.db.pool, approval.reservation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reservation.status, ReservationStatus::Cancelled);
    }

    #[tokio::test]
    async fn withdraw_is_requester_only() {
        let core = test_core().await;
        let requester = seed_user(&core, "alice", false).await;
        let approver = seed_user(&core, "boss", false).await;
        let (_, approval) = pending_request(&core, &requester, &approver).await;

        let err = cancel_pending(&core, &approver, approval.id).await.unwrap_err();
        assert!(matches!(err, EngineError::Forbidden(_)));
    }

    #[tokio::test]
    async fn approve_rechecks_conflicts_and_rejects() {
        let core = test_core().await;
        let requester = seed_user(&core, "alice", false).await;
        let approver = seed_user(&core, "boss", false).await;
        let admin = seed_user(&core, "root", true).await;
        let other = seed_user(&core, "bob", false).await;
        let (resource, approval) = pending_request(&core, &requester, &approver).await;

        // While pending, an overlapping active booking lands via import.
        let now = core.clock.now();
        booking::import_reservation(
            &core,
            &admin,
            other.id,
            &BookingRequest::new(
                resource,
                now + Duration::minutes(90),
                now + Duration::minutes(150),
            ),
        )
        .await
        .unwrap();

        let resolved = approve(&core, &approver, approval.id, None).await.unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Rejected);
        assert_eq!(
            resolved.response_message.as_deref(),
            Some("conflict on approval")
        );

        let reservation = store::reservation_by_id(&core.db.pool, approval.reservation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reservation.status, ReservationStatus::Rejected);
    }

    #[tokio::test]
    async fn unrelated_resource_does_not_block_approval() {
        let core = test_core().await;
        let requester = seed_user(&core, "alice", false).await;
        let approver = seed_user(&core, "boss", false).await;
        let (_, approval) = pending_request(&core, &requester, &approver).await;

        // A busy sibling resource is irrelevant to the re-check.
        let other_resource = seed_resource(&core, "Other Room").await;
        let now = core.clock.now();
        booking::create_reservation(
            &core,
            &requester,
            &BookingRequest::new(
                other_resource,
                now + Duration::hours(1),
                now + Duration::hours(2),
            ),
        )
        .await
        .unwrap();

        let resolved = approve(&core, &approver, approval.id, None).await.unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Approved);
    }
}
