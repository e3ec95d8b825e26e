use anyhow::Result;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// SQLite database URL
    pub database_url: String,

    /// Lifecycle scheduler tick interval in seconds (env: LIFECYCLE_TICK_SECS)
    pub tick_interval_secs: u64,

    /// Batch size for per-tick scans: expirations, reminders (env: LIFECYCLE_BATCH_SIZE)
    pub lifecycle_batch_size: i64,

    /// Minutes a waitlist offer stays open (env: WAITLIST_OFFER_TTL_MINUTES)
    pub offer_ttl_minutes: i64,

    /// Default reminder lead time in hours; per-user override respected
    /// (env: REMINDER_HOURS)
    pub reminder_hours_default: i64,

    /// Max delivery attempts per webhook delivery (env: WEBHOOK_MAX_RETRIES)
    pub webhook_max_retries: i64,

    /// Seconds to wait before each retry, indexed by retry count
    /// (env: WEBHOOK_RETRY_DELAYS, comma-separated)
    pub webhook_retry_delays_secs: Vec<i64>,

    /// Hard timeout for a single webhook POST (env: WEBHOOK_TIMEOUT_SECS)
    pub webhook_timeout_secs: u64,

    /// Webhook delivery worker count (env: WEBHOOK_WORKERS)
    pub webhook_workers: usize,

    /// Bounded in-memory delivery queue; overflow falls back to the sweeper
    /// (env: WEBHOOK_QUEUE_CAPACITY)
    pub webhook_queue_capacity: usize,

    /// Seconds between webhook retry sweeps (env: WEBHOOK_SWEEP_SECS)
    pub webhook_sweep_secs: u64,
}

const DEFAULT_RETRY_DELAYS: [i64; 5] = [60, 300, 900, 3600, 7200];

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:///data/reserver.db".into()),
            tick_interval_secs: env_parse("LIFECYCLE_TICK_SECS", 60),
            lifecycle_batch_size: env_parse("LIFECYCLE_BATCH_SIZE", 200),
            offer_ttl_minutes: env_parse("WAITLIST_OFFER_TTL_MINUTES", 30),
            reminder_hours_default: env_parse("REMINDER_HOURS", 24),
            webhook_max_retries: env_parse("WEBHOOK_MAX_RETRIES", 5),
            webhook_retry_delays_secs: std::env::var("WEBHOOK_RETRY_DELAYS")
                .ok()
                .map(|v| parse_delay_table(&v))
                .unwrap_or_else(|| DEFAULT_RETRY_DELAYS.to_vec()),
            webhook_timeout_secs: env_parse("WEBHOOK_TIMEOUT_SECS", 30),
            webhook_workers: env_parse("WEBHOOK_WORKERS", 8),
            webhook_queue_capacity: env_parse("WEBHOOK_QUEUE_CAPACITY", 256),
            webhook_sweep_secs: env_parse("WEBHOOK_SWEEP_SECS", 30),
        })
    }

    /// Delay before retry number `retry_count` (1-based), clamped to the
    /// last table entry.
    pub fn retry_delay_secs(&self, retry_count: i64) -> i64 {
        let idx = (retry_count.max(1) as usize - 1).min(self.webhook_retry_delays_secs.len() - 1);
        self.webhook_retry_delays_secs[idx]
    }
}

/// Parse a comma-separated delay table, falling back to the default on any
/// malformed or empty input.
fn parse_delay_table(raw: &str) -> Vec<i64> {
    let parsed: Vec<i64> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .filter(|&d| d > 0)
        .collect();
    if parsed.is_empty() {
        DEFAULT_RETRY_DELAYS.to_vec()
    } else {
        parsed
    }
}

/// Build an `AppConfig` with all fields defaulted, for tests. Override
/// specific fields via struct update syntax.
#[cfg(test)]
pub(crate) fn test_config() -> AppConfig {
    AppConfig {
        database_url: "sqlite::memory:".into(),
        tick_interval_secs: 60,
        lifecycle_batch_size: 200,
        offer_ttl_minutes: 30,
        reminder_hours_default: 24,
        webhook_max_retries: 5,
        webhook_retry_delays_secs: DEFAULT_RETRY_DELAYS.to_vec(),
        webhook_timeout_secs: 30,
        webhook_workers: 8,
        webhook_queue_capacity: 256,
        webhook_sweep_secs: 30,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        test_config()
    }

    #[test]
    fn retry_delay_follows_the_table() {
        let cfg = base_config();
        assert_eq!(cfg.retry_delay_secs(1), 60);
        assert_eq!(cfg.retry_delay_secs(2), 300);
        assert_eq!(cfg.retry_delay_secs(3), 900);
        assert_eq!(cfg.retry_delay_secs(4), 3600);
        assert_eq!(cfg.retry_delay_secs(5), 7200);
    }

    #[test]
    fn retry_delay_clamps_past_the_table_end() {
        let cfg = base_config();
        assert_eq!(cfg.retry_delay_secs(6), 7200);
        assert_eq!(cfg.retry_delay_secs(100), 7200);
    }

    #[test]
    fn retry_delay_clamps_below_one() {
        let cfg = base_config();
        assert_eq!(cfg.retry_delay_secs(0), 60);
    }

    #[test]
    fn delay_table_parses_comma_separated_values() {
        assert_eq!(parse_delay_table("10, 20,30"), vec![10, 20, 30]);
    }

    #[test]
    fn delay_table_rejects_garbage() {
        assert_eq!(parse_delay_table("abc,,-5"), DEFAULT_RETRY_DELAYS.to_vec());
        assert_eq!(parse_delay_table(""), DEFAULT_RETRY_DELAYS.to_vec());
    }

    #[test]
    fn delay_table_keeps_valid_entries_among_garbage() {
        assert_eq!(parse_delay_table("15,abc,45"), vec![15, 45]);
    }
}
