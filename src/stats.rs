//! Daily rollup maintenance on top of a [`StatStore`].
//!
//! The aggregator itself holds no state: atomicity of the read-modify-write
//! lives in the store (a single-statement upsert on the SQLite worker
//! thread, one mutex in `MemoryStore`), so concurrent completions for the
//! same `(user, day)` cannot lose updates.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use log::info;

use crate::{models::DailyStat, store::StatStore};

#[derive(Clone)]
pub struct StatsAggregator {
    store: Arc<dyn StatStore>,
}

impl StatsAggregator {
    pub fn new(store: Arc<dyn StatStore>) -> Self {
        Self { store }
    }

    /// Folds one closed session into the day's rollup, creating the row with
    /// `total_focus_secs = duration, total_sessions = 1` on first use.
    pub async fn accumulate(
        &self,
        user_id: &str,
        day: NaiveDate,
        duration_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<DailyStat> {
        let stat = self
            .store
            .upsert_daily_stat(user_id, day, duration_secs, now)
            .await?;
        info!(
            "Accumulated {duration_secs}s for {user_id} on {day}: {}s over {} sessions",
            stat.total_focus_secs, stat.total_sessions
        );
        Ok(stat)
    }

    /// The day's rollup, or the zero value when nothing has been recorded.
    pub async fn daily_stat(
        &self,
        user_id: &str,
        day: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<DailyStat> {
        let stat = self.store.fetch_daily_stat(user_id, day).await?;
        Ok(stat.unwrap_or_else(|| DailyStat::empty(user_id, day, now)))
    }

    /// Days with recorded activity between the bounds (inclusive), ascending.
    /// Consumers treat missing days as zero.
    pub async fn stats_range(
        &self,
        user_id: &str,
        start_day: NaiveDate,
        end_day: NaiveDate,
    ) -> Result<Vec<DailyStat>> {
        self.store
            .fetch_stats_range(user_id, start_day, end_day)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::Database, store::MemoryStore};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    #[tokio::test]
    async fn missing_day_reads_as_zero() {
        let aggregator = StatsAggregator::new(Arc::new(MemoryStore::new()));
        let stat = aggregator.daily_stat("u1", day(1), t0()).await.unwrap();
        assert_eq!(stat.total_focus_secs, 0);
        assert_eq!(stat.total_sessions, 0);
        assert_eq!(stat.completed_tasks, 0);
    }

    #[tokio::test]
    async fn accumulate_creates_then_adds() {
        let aggregator = StatsAggregator::new(Arc::new(MemoryStore::new()));

        let first = aggregator.accumulate("u1", day(1), 600, t0()).await.unwrap();
        assert_eq!(first.total_focus_secs, 600);
        assert_eq!(first.total_sessions, 1);

        let second = aggregator.accumulate("u1", day(1), 900, t0()).await.unwrap();
        assert_eq!(second.total_focus_secs, 1500);
        assert_eq!(second.total_sessions, 2);

        // A different day starts fresh.
        let other = aggregator.accumulate("u1", day(2), 42, t0()).await.unwrap();
        assert_eq!(other.total_focus_secs, 42);
        assert_eq!(other.total_sessions, 1);
    }

    async fn hammer_concurrently(aggregator: StatsAggregator) {
        let durations: Vec<u64> = (1..=8).map(|i| i * 100).collect();
        let expected: u64 = durations.iter().sum();

        let mut handles = Vec::new();
        for duration in durations {
            let aggregator = aggregator.clone();
            handles.push(tokio::spawn(async move {
                aggregator.accumulate("u1", day(1), duration, t0()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stat = aggregator.daily_stat("u1", day(1), t0()).await.unwrap();
        assert_eq!(stat.total_focus_secs, expected);
        assert_eq!(stat.total_sessions, 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_accumulates_lose_nothing_in_memory() {
        hammer_concurrently(StatsAggregator::new(Arc::new(MemoryStore::new()))).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_accumulates_lose_nothing_in_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("focusflow.sqlite3")).unwrap();
        hammer_concurrently(StatsAggregator::new(Arc::new(db))).await;
    }
}
