//! Counting gate over a fixed window, shared across all workers.
//!
//! The gate only admits or denies; it never queues or smooths excess.
//! Deferring a denied job is the executor's responsibility.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;

use crate::db::Db;
use crate::error::Result;
use crate::telemetry::metrics;

/// Shared key gating calls to the external API.
pub const EXTERNAL_API_KEY: &str = "external_api";

/// Default gate: 10 operations per 60-second window.
pub const DEFAULT_LIMIT: i64 = 10;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// A counting gate over a fixed time window, keyed by arbitrary strings.
/// Safe under concurrent callers from any number of worker processes:
/// the increment-and-read is a single database statement.
#[derive(Clone)]
pub struct RateLimiter {
    db: Arc<Db>,
    limit: i64,
    window: Duration,
}

impl RateLimiter {
    pub fn new(db: Arc<Db>, limit: i64, window: Duration) -> Self {
        Self { db, limit, window }
    }

    pub fn with_defaults(db: Arc<Db>) -> Self {
        Self::new(db, DEFAULT_LIMIT, DEFAULT_WINDOW)
    }

    /// Count one operation against `key`. True iff the post-increment
    /// count is still within the limit for the current window.
    pub async fn is_allowed(&self, key: &str) -> Result<bool> {
        let count = self.db.bump_rate_counter(key, self.window).await?;
        let allowed = count <= self.limit;
        metrics::rate_limit_checks().add(
            1,
            &[
                KeyValue::new("key", key.to_string()),
                KeyValue::new("decision", if allowed { "allow" } else { "deny" }),
            ],
        );
        Ok(allowed)
    }
}
