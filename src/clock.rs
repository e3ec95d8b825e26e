use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

/// Source of "now" in UTC.
///
/// Every component reads time through a `Clock` handle instead of calling
/// `Utc::now()` directly, so tests can substitute a controllable clock and
/// drive timeout-dependent behaviour (offer expiry, auto-reset, reminders)
/// deterministically.
///
/// Cloning is cheap — fixed clocks share their instant via Arc.
#[derive(Debug, Clone)]
pub struct Clock {
    /// Microseconds since the Unix epoch when pinned; None reads wall-clock.
    fixed: Option<Arc<AtomicI64>>,
}

impl Clock {
    /// A clock that reads the real wall clock.
    pub fn system() -> Self {
        Self { fixed: None }
    }

    /// A clock pinned to `start`, advanced manually via [`Clock::advance`].
    pub fn fixed(start: DateTime<Utc>) -> Self {
        Self {
            fixed: Some(Arc::new(AtomicI64::new(start.timestamp_micros()))),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        match &self.fixed {
            Some(micros) => DateTime::from_timestamp_micros(micros.load(Ordering::SeqCst))
                .expect("fixed clock holds a valid timestamp"),
            None => Utc::now(),
        }
    }

    /// Move a fixed clock forward (or backward, with a negative duration).
    /// Has no effect on a system clock.
    pub fn advance(&self, delta: Duration) {
        if let Some(micros) = &self.fixed {
            micros.fetch_add(
                delta.num_microseconds().unwrap_or(i64::MAX),
                Ordering::SeqCst,
            );
        }
    }
}
