//! Transactional persistence primitives shared by the booking components.
//!
//! Everything that must be mutually exclusive for a resource goes through
//! [`Database::with_tx`] + [`lock_resource`]: the lock promotes the SQLite
//! transaction to a write transaction, which serializes all booking writers.
//! Conflict detection has exactly one implementation here,
//! [`find_overlapping_reservations`]; the allocator, the approval re-check,
//! the import path and series validation all call it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use sqlx::{Sqlite, Transaction};
use tracing::warn;

use crate::db::models::{
    Reservation, ReservationStatus, Resource, User, WaitlistEntry,
};
use crate::db::Database;
use crate::errors::{ConflictWindow, EngineError};

pub type Tx = Transaction<'static, Sqlite>;

/// Max attempts for a write transaction before a transient error surfaces.
const MAX_TX_ATTEMPTS: u32 = 3;
/// Base backoff between attempts; multiplied by the attempt number (100/200/300 ms).
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

const RESERVATION_COLS: &str = "id, user_id, resource_id, start_time, end_time, status, \
     created_at, cancelled_at, cancellation_reason, recurrence_rule_id, \
     parent_reservation_id, is_recurring_instance, reminder_sent";

impl Database {
    /// Run `op` inside a transaction: commit on success, roll back on any
    /// failure. Transient errors (SQLITE_BUSY, SQLITE_LOCKED, pool
    /// exhaustion) retry the whole transaction up to 3 times with
    /// 100/200/300 ms backoff; all other errors propagate unchanged.
    pub async fn with_tx<T, F>(&self, mut op: F) -> Result<T, EngineError>
    where
        F: for<'t> FnMut(&'t mut Tx) -> BoxFuture<'t, Result<T, EngineError>>,
    {
        let mut attempt = 1u32;
        loop {
            let result = async {
                let mut tx = self.pool.begin().await.map_err(EngineError::from)?;
                let value = op(&mut tx).await?;
                tx.commit().await.map_err(EngineError::from)?;
                Ok(value)
            }
            .await;

            match result {
                Err(err @ EngineError::Transient(_)) if attempt < MAX_TX_ATTEMPTS => {
                    warn!(attempt, error = %err, "Transient store error, retrying transaction");
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Acquire the booking write lock for `resource_id` inside `tx`.
///
/// SQLite has no row-level locks; the no-op touch promotes the transaction
/// to a write transaction, so concurrent booking writers queue behind it.
/// Fails with `NotFound` when the resource does not exist.
pub async fn lock_resource(tx: &mut Tx, resource_id: i64) -> Result<(), EngineError> {
    let result = sqlx::query("UPDATE resources SET id = id WHERE id = ?")
        .bind(resource_id)
        .execute(&mut **tx)
        .await?;

    if result.rows_affected() == 0 {
        return Err(EngineError::NotFound("resource"));
    }
    Ok(())
}

/// All `active` reservations on `resource_id` whose half-open window
/// intersects `[start, end)`: `existing.end > start AND existing.start < end`.
pub async fn find_overlapping_reservations<'e, E>(
    executor: E,
    resource_id: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    exclude_reservation: Option<i64>,
) -> Result<Vec<Reservation>, EngineError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT {RESERVATION_COLS} FROM reservations \
         WHERE resource_id = ? AND status = ? \
         AND end_time > ? AND start_time < ? \
         AND id != COALESCE(?, -1) \
         ORDER BY start_time ASC"
    );
    let rows = sqlx::query_as::<_, Reservation>(&sql)
        .bind(resource_id)
        .bind(ReservationStatus::Active)
        .bind(start)
        .bind(end)
        .bind(exclude_reservation)
        .fetch_all(executor)
        .await?;
    Ok(rows)
}

/// Caller-facing windows for a set of overlapping reservations.
pub fn conflict_windows(overlapping: &[Reservation]) -> Vec<ConflictWindow> {
    overlapping
        .iter()
        .map(|r| ConflictWindow {
            start: r.start_time,
            end: r.end_time,
        })
        .collect()
}

/// The `active` reservation covering `now` on this resource, if any.
pub async fn active_reservation_covering<'e, E>(
    executor: E,
    resource_id: i64,
    now: DateTime<Utc>,
) -> Result<Option<Reservation>, EngineError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT {RESERVATION_COLS} FROM reservations \
         WHERE resource_id = ? AND status = ? AND start_time <= ? AND end_time > ? \
         LIMIT 1"
    );
    let row = sqlx::query_as::<_, Reservation>(&sql)
        .bind(resource_id)
        .bind(ReservationStatus::Active)
        .bind(now)
        .bind(now)
        .fetch_optional(executor)
        .await?;
    Ok(row)
}

pub async fn resource_by_id<'e, E>(executor: E, id: i64) -> Result<Option<Resource>, EngineError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, Resource>("SELECT * FROM resources WHERE id = ?")
        .bind(id)
        .fetch_optional(executor)
        .await?;
    Ok(row)
}

pub async fn reservation_by_id<'e, E>(
    executor: E,
    id: i64,
) -> Result<Option<Reservation>, EngineError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {RESERVATION_COLS} FROM reservations WHERE id = ?");
    let row = sqlx::query_as::<_, Reservation>(&sql)
        .bind(id)
        .fetch_optional(executor)
        .await?;
    Ok(row)
}

pub async fn user_by_id<'e, E>(executor: E, id: i64) -> Result<Option<User>, EngineError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(executor)
        .await?;
    Ok(row)
}

pub async fn waitlist_entry_by_id<'e, E>(
    executor: E,
    id: i64,
) -> Result<Option<WaitlistEntry>, EngineError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, WaitlistEntry>("SELECT * FROM waitlist_entries WHERE id = ?")
        .bind(id)
        .fetch_optional(executor)
        .await?;
    Ok(row)
}

/// Fields for a new reservation row; ids are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewReservation {
    pub user_id: i64,
    pub resource_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub recurrence_rule_id: Option<i64>,
    pub parent_reservation_id: Option<i64>,
    pub is_recurring_instance: bool,
}

pub async fn insert_reservation(tx: &mut Tx, new: &NewReservation) -> Result<i64, EngineError> {
    let result = sqlx::query(
        "INSERT INTO reservations \
         (user_id, resource_id, start_time, end_time, status, created_at, \
          recurrence_rule_id, parent_reservation_id, is_recurring_instance) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(new.user_id)
    .bind(new.resource_id)
    .bind(new.start_time)
    .bind(new.end_time)
    .bind(new.status)
    .bind(new.created_at)
    .bind(new.recurrence_rule_id)
    .bind(new.parent_reservation_id)
    .bind(new.is_recurring_instance)
    .execute(&mut **tx)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Append an entry to the reservation audit trail. The trail is append-only;
/// cancellation and expiry are recorded here, never as deletions.
pub async fn log_action(
    tx: &mut Tx,
    reservation_id: i64,
    action: &str,
    user_id: Option<i64>,
    details: &str,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    sqlx::query(
        "INSERT INTO reservation_history (reservation_id, action, user_id, details, created_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(reservation_id)
    .bind(action)
    .bind(user_id)
    .bind(details)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Offset pagination for listing endpoints. Limits are clamped to 1..=200.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Page {
    fn clamped_limit(&self) -> i64 {
        self.limit.clamp(1, 200)
    }
}

pub async fn reservations_for_user<'e, E>(
    executor: E,
    user_id: i64,
    status: Option<ReservationStatus>,
    page: Page,
) -> Result<Vec<Reservation>, EngineError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT {RESERVATION_COLS} FROM reservations \
         WHERE user_id = ? AND (? IS NULL OR status = ?) \
         ORDER BY start_time DESC LIMIT ? OFFSET ?"
    );
    let rows = sqlx::query_as::<_, Reservation>(&sql)
        .bind(user_id)
        .bind(status)
        .bind(status)
        .bind(page.clamped_limit())
        .bind(page.offset)
        .fetch_all(executor)
        .await?;
    Ok(rows)
}

pub async fn reservations_for_resource<'e, E>(
    executor: E,
    resource_id: i64,
    status: Option<ReservationStatus>,
    range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    page: Page,
) -> Result<Vec<Reservation>, EngineError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let (range_start, range_end) = match range {
        Some((s, e)) => (Some(s), Some(e)),
        None => (None, None),
    };
    let sql = format!(
        "SELECT {RESERVATION_COLS} FROM reservations \
         WHERE resource_id = ? AND (? IS NULL OR status = ?) \
         AND (? IS NULL OR end_time > ?) AND (? IS NULL OR start_time < ?) \
         ORDER BY start_time ASC LIMIT ? OFFSET ?"
    );
    let rows = sqlx::query_as::<_, Reservation>(&sql)
        .bind(resource_id)
        .bind(status)
        .bind(status)
        .bind(range_start)
        .bind(range_start)
        .bind(range_end)
        .bind(range_end)
        .bind(page.clamped_limit())
        .bind(page.offset)
        .fetch_all(executor)
        .await?;
    Ok(rows)
}

/// Active reservations whose end has passed, oldest first, for the scheduler.
pub async fn due_expirations<'e, E>(
    executor: E,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<Reservation>, EngineError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "SELECT {RESERVATION_COLS} FROM reservations \
         WHERE status = ? AND end_time < ? \
         ORDER BY end_time ASC LIMIT ?"
    );
    let rows = sqlx::query_as::<_, Reservation>(&sql)
        .bind(ReservationStatus::Active)
        .bind(now)
        .bind(limit)
        .fetch_all(executor)
        .await?;
    Ok(rows)
}

/// A reservation that may be due a reminder, joined with its owner's
/// reminder preference. The hours bound is applied in Rust.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ReminderCandidate {
    pub id: i64,
    pub user_id: i64,
    pub resource_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub reminder_hours: i64,
}

pub async fn reminder_candidates<'e, E>(
    executor: E,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<ReminderCandidate>, EngineError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query_as::<_, ReminderCandidate>(
        "SELECT r.id, r.user_id, r.resource_id, r.start_time, r.end_time, u.reminder_hours \
         FROM reservations r JOIN users u ON u.id = r.user_id \
         WHERE r.status = ? AND r.reminder_sent = 0 AND r.start_time > ? \
         ORDER BY r.start_time ASC LIMIT ?",
    )
    .bind(ReservationStatus::Active)
    .bind(now)
    .bind(limit)
    .fetch_all(executor)
    .await?;
    Ok(rows)
}

/// Manually-disabled resources eligible for auto-reset; the elapsed-hours
/// check is applied in Rust. Schedule-induced unavailability has a null
/// `unavailable_since` and never appears here.
pub async fn auto_reset_candidates<'e, E>(
    executor: E,
    limit: i64,
) -> Result<Vec<Resource>, EngineError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query_as::<_, Resource>(
        "SELECT * FROM resources \
         WHERE status = 'unavailable' AND unavailable_since IS NOT NULL \
         ORDER BY unavailable_since ASC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(executor)
    .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, h, m, 0).unwrap()
    }

    async fn seed_user(db: &Database, name: &str) -> i64 {
        sqlx::query("INSERT INTO users (username, is_admin, reminder_hours, created_at) VALUES (?, 0, 24, ?)")
            .bind(name)
            .bind(t(0, 0))
            .execute(&db.pool)
            .await
            .unwrap()
            .last_insert_rowid()
    }

    async fn seed_resource(db: &Database, name: &str) -> i64 {
        sqlx::query(
            "INSERT INTO resources (name, available, status, auto_reset_hours, requires_approval, tags, created_at, updated_at) \
             VALUES (?, 1, 'available', 24, 0, '[]', ?, ?)",
        )
        .bind(name)
        .bind(t(0, 0))
        .bind(t(0, 0))
        .execute(&db.pool)
        .await
        .unwrap()
        .last_insert_rowid()
    }

    async fn seed_reservation(
        db: &Database,
        user_id: i64,
        resource_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        status: ReservationStatus,
    ) -> i64 {
        let mut tx = db.pool.begin().await.unwrap();
        let id = insert_reservation(
            &mut tx,
            &NewReservation {
                user_id,
                resource_id,
                start_time: start,
                end_time: end,
                status,
                created_at: t(0, 0),
                recurrence_rule_id: None,
                parent_reservation_id: None,
                is_recurring_instance: false,
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        id
    }

    #[tokio::test]
    async fn lock_resource_missing_is_not_found() {
        let db = Database::test_db().await;
        let err = db
            .with_tx(|tx| Box::pin(async move { lock_resource(tx, 9999).await }))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound("resource")));
    }

    #[tokio::test]
    async fn with_tx_commits_on_success() {
        let db = Database::test_db().await;
        let user = seed_user(&db, "alice").await;
        let resource = seed_resource(&db, "Room A").await;

        let id = db
            .with_tx(|tx| {
                Box::pin(async move {
                    lock_resource(tx, resource).await?;
                    insert_reservation(
                        tx,
                        &NewReservation {
                            user_id: user,
                            resource_id: resource,
                            start_time: t(10, 0),
                            end_time: t(11, 0),
                            status: ReservationStatus::Active,
                            created_at: t(9, 0),
                            recurrence_rule_id: None,
                            parent_reservation_id: None,
                            is_recurring_instance: false,
                        },
                    )
                    .await
                })
            })
            .await
            .unwrap();

        let row = reservation_by_id(&db.pool, id).await.unwrap().unwrap();
        assert_eq!(row.status, ReservationStatus::Active);
    }

    #[tokio::test]
    async fn with_tx_rolls_back_on_error() {
        let db = Database::test_db().await;
        let user = seed_user(&db, "alice").await;
        let resource = seed_resource(&db, "Room A").await;

        let result: Result<(), EngineError> = db
            .with_tx(|tx| {
                Box::pin(async move {
                    insert_reservation(
                        tx,
                        &NewReservation {
                            user_id: user,
                            resource_id: resource,
                            start_time: t(10, 0),
                            end_time: t(11, 0),
                            status: ReservationStatus::Active,
                            created_at: t(9, 0),
                            recurrence_rule_id: None,
                            parent_reservation_id: None,
                            is_recurring_instance: false,
                        },
                    )
                    .await?;
                    Err(EngineError::Validation("forced failure".into()))
                })
            })
            .await;

        assert!(result.is_err());
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM reservations")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }

    #[tokio::test]
    async fn overlap_detects_intersection() {
        let db = Database::test_db().await;
        let user = seed_user(&db, "alice").await;
        let resource = seed_resource(&db, "Room A").await;
        seed_reservation(&db, user, resource, t(10, 0), t(11, 0), ReservationStatus::Active).await;

        let hits =
            find_overlapping_reservations(&db.pool, resource, t(10, 30), t(11, 30), None)
                .await
                .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn overlap_ignores_adjacent_windows() {
        let db = Database::test_db().await;
        let user = seed_user(&db, "alice").await;
        let resource = seed_resource(&db, "Room A").await;
        seed_reservation(&db, user, resource, t(10, 0), t(11, 0), ReservationStatus::Active).await;

        // Back-to-back: [11:00, 12:00) does not intersect [10:00, 11:00)
        let hits = find_overlapping_reservations(&db.pool, resource, t(11, 0), t(12, 0), None)
            .await
            .unwrap();
        assert!(hits.is_empty());

        let hits = find_overlapping_reservations(&db.pool, resource, t(9, 0), t(10, 0), None)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn overlap_ignores_non_active_statuses() {
        let db = Database::test_db().await;
        let user = seed_user(&db, "alice").await;
        let resource = seed_resource(&db, "Room A").await;
        seed_reservation(&db, user, resource, t(10, 0), t(11, 0), ReservationStatus::Cancelled)
            .await;
        seed_reservation(
            &db,
            user,
            resource,
            t(10, 0),
            t(11, 0),
            ReservationStatus::PendingApproval,
        )
        .await;

        let hits = find_overlapping_reservations(&db.pool, resource, t(10, 0), t(11, 0), None)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn overlap_excludes_given_reservation() {
        let db = Database::test_db().await;
        let user = seed_user(&db, "alice").await;
        let resource = seed_resource(&db, "Room A").await;
        let id =
            seed_reservation(&db, user, resource, t(10, 0), t(11, 0), ReservationStatus::Active)
                .await;

        let hits =
            find_overlapping_reservations(&db.pool, resource, t(10, 0), t(11, 0), Some(id))
                .await
                .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn overlap_is_scoped_to_the_resource() {
        let db = Database::test_db().await;
        let user = seed_user(&db, "alice").await;
        let room_a = seed_resource(&db, "Room A").await;
        let room_b = seed_resource(&db, "Room B").await;
        seed_reservation(&db, user, room_a, t(10, 0), t(11, 0), ReservationStatus::Active).await;

        let hits = find_overlapping_reservations(&db.pool, room_b, t(10, 0), t(11, 0), None)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn due_expirations_returns_past_end_active_only() {
        let db = Database::test_db().await;
        let user = seed_user(&db, "alice").await;
        let resource = seed_resource(&db, "Room A").await;
        let past =
            seed_reservation(&db, user, resource, t(8, 0), t(9, 0), ReservationStatus::Active)
                .await;
        seed_reservation(&db, user, resource, t(12, 0), t(13, 0), ReservationStatus::Active).await;
        seed_reservation(&db, user, resource, t(6, 0), t(7, 0), ReservationStatus::Expired).await;

        let due = due_expirations(&db.pool, t(10, 0), 200).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, past);
    }

    #[tokio::test]
    async fn active_covering_matches_half_open_interval() {
        let db = Database::test_db().await;
        let user = seed_user(&db, "alice").await;
        let resource = seed_resource(&db, "Room A").await;
        seed_reservation(&db, user, resource, t(10, 0), t(11, 0), ReservationStatus::Active).await;

        assert!(active_reservation_covering(&db.pool, resource, t(10, 0))
            .await
            .unwrap()
            .is_some());
        assert!(active_reservation_covering(&db.pool, resource, t(10, 59))
            .await
            .unwrap()
            .is_some());
        // end is exclusive
        assert!(active_reservation_covering(&db.pool, resource, t(11, 0))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn reservations_for_user_filters_and_pages() {
        let db = Database::test_db().await;
        let alice = seed_user(&db, "alice").await;
        let bob = seed_user(&db, "bob").await;
        let resource = seed_resource(&db, "Room A").await;
        seed_reservation(&db, alice, resource, t(10, 0), t(11, 0), ReservationStatus::Active)
            .await;
        seed_reservation(&db, alice, resource, t(12, 0), t(13, 0), ReservationStatus::Cancelled)
            .await;
        seed_reservation(&db, bob, resource, t(14, 0), t(15, 0), ReservationStatus::Active).await;

        let all = reservations_for_user(&db.pool, alice, None, Page::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let active = reservations_for_user(
            &db.pool,
            alice,
            Some(ReservationStatus::Active),
            Page::default(),
        )
        .await
        .unwrap();
        assert_eq!(active.len(), 1);

        let paged = reservations_for_user(
            &db.pool,
            alice,
            None,
            Page {
                limit: 1,
                offset: 1,
            },
        )
        .await
        .unwrap();
        assert_eq!(paged.len(), 1);
    }

    #[tokio::test]
    async fn reservations_for_resource_range_query() {
        let db = Database::test_db().await;
        let user = seed_user(&db, "alice").await;
        let resource = seed_resource(&db, "Room A").await;
        seed_reservation(&db, user, resource, t(8, 0), t(9, 0), ReservationStatus::Active).await;
        let mid =
            seed_reservation(&db, user, resource, t(10, 0), t(11, 0), ReservationStatus::Active)
                .await;
        seed_reservation(&db, user, resource, t(14, 0), t(15, 0), ReservationStatus::Active).await;

        let rows = reservations_for_resource(
            &db.pool,
            resource,
            Some(ReservationStatus::Active),
            Some((t(9, 30), t(12, 0))),
            Page::default(),
        )
        .await
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, mid);
    }

    #[tokio::test]
    async fn log_action_appends_history() {
        let db = Database::test_db().await;
        let user = seed_user(&db, "alice").await;
        let resource = seed_resource(&db, "Room A").await;
        let id =
            seed_reservation(&db, user, resource, t(10, 0), t(11, 0), ReservationStatus::Active)
                .await;

        db.with_tx(|tx| {
            Box::pin(async move {
                log_action(tx, id, "created", Some(user), "Reserved Room A", t(9, 0)).await
            })
        })
        .await
        .unwrap();

        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT action, details FROM reservation_history WHERE reservation_id = ?",
        )
        .bind(id)
        .fetch_all(&db.pool)
        .await
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, "created");
    }

    #[tokio::test]
    async fn reminder_candidates_join_user_preference() {
        let db = Database::test_db().await;
        let user = seed_user(&db, "alice").await;
        sqlx::query("UPDATE users SET reminder_hours = 2 WHERE id = ?")
            .bind(user)
            .execute(&db.pool)
            .await
            .unwrap();
        let resource = seed_resource(&db, "Room A").await;
        seed_reservation(&db, user, resource, t(12, 0), t(13, 0), ReservationStatus::Active).await;

        let candidates = reminder_candidates(&db.pool, t(10, 0), 200).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].reminder_hours, 2);
    }
}
