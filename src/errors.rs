use chrono::{DateTime, Utc};
use thiserror::Error;

/// An active reservation window that overlaps a requested booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl std::fmt::Display for ConflictWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to {}",
            self.start.format("%H:%M"),
            self.end.format("%H:%M")
        )
    }
}

fn join_windows(windows: &[ConflictWindow]) -> String {
    windows
        .iter()
        .map(|w| w.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors surfaced by the booking core.
///
/// Transient store errors (SQLITE_BUSY, pool exhaustion) are retried inside
/// `Database::with_tx`; everything else propagates unchanged to the caller.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Forbidden(String),

    #[error("time slot conflicts with existing reservations: {}", join_windows(.0))]
    Conflict(Vec<ConflictWindow>),

    #[error("{0}")]
    AlreadyResolved(String),

    #[error("waitlist offer has expired")]
    OfferExpired,

    #[error("resource requires approval but no default approver is configured")]
    NoApproverConfigured,

    #[error("storage temporarily unavailable")]
    Transient(#[source] sqlx::Error),

    #[error("storage failure")]
    Store(#[source] sqlx::Error),
}

/// User-visible error category at the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    Gone,
    Internal,
}

impl EngineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            EngineError::Validation(_) | EngineError::NoApproverConfigured => {
                ErrorCategory::BadRequest
            }
            EngineError::NotFound(_) => ErrorCategory::NotFound,
            EngineError::Forbidden(_) => ErrorCategory::Forbidden,
            EngineError::Conflict(_) | EngineError::AlreadyResolved(_) => ErrorCategory::Conflict,
            EngineError::OfferExpired => ErrorCategory::Gone,
            EngineError::Transient(_) | EngineError::Store(_) => ErrorCategory::Internal,
        }
    }

    /// Whether the caller may retry the operation as-is.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }
}

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6) surface as database errors;
/// pool exhaustion surfaces as PoolTimedOut. Both are retryable.
fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("5") | Some("6"))
                || db.message().contains("database is locked")
                || db.message().contains("database table is locked")
        }
        _ => false,
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        if is_transient_sqlx(&err) {
            EngineError::Transient(err)
        } else {
            EngineError::Store(err)
        }
    }
}
