//! Rate-limit counters: one atomic upsert per check.

use std::time::Duration;

use crate::error::Result;

impl super::Db {
    /// Increment the counter for `key`, resetting it (and re-arming the
    /// window) if the current window has elapsed. Returns the
    /// post-increment count.
    ///
    /// Runs as a single statement: concurrent callers cannot interleave
    /// the read and the write, and the window cannot be armed twice.
    pub async fn bump_rate_counter(&self, key: &str, window: Duration) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO rate_limits AS rl (key, count, window_started_at)
             VALUES ($1, 1, now())
             ON CONFLICT (key) DO UPDATE SET
                 count = CASE
                     WHEN now() - rl.window_started_at >= make_interval(secs => $2) THEN 1
                     ELSE rl.count + 1
                 END,
                 window_started_at = CASE
                     WHEN now() - rl.window_started_at >= make_interval(secs => $2) THEN now()
                     ELSE rl.window_started_at
                 END
             RETURNING count",
        )
        .bind(key)
        .bind(window.as_secs_f64())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }
}
