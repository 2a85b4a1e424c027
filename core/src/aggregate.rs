use anyhow::Result;
use chrono::{Days, NaiveDate};

use crate::models::DailyHealthRecord;
use crate::provider::ExternalMetricsProvider;
use crate::store::DailyRecordStore;

/// Length of the trailing step window, ending at (and including) the day.
pub const WEEK_DAYS: u64 = 7;

/// First day of the trailing week ending at `day`.
#[must_use]
pub fn week_start(day: NaiveDate) -> NaiveDate {
    day.checked_sub_days(Days::new(WEEK_DAYS - 1))
        .unwrap_or(NaiveDate::MIN)
}

/// Sum of stored steps over `[day-6, day]`; missing days and days without
/// steps count as 0.
pub fn cached_week_total(store: &dyn DailyRecordStore, day: NaiveDate) -> Result<i64> {
    let records = store.fetch_range(week_start(day), day)?;
    Ok(records.iter().filter_map(|r| r.metrics().steps).sum())
}

/// Week total for `record.day` with `record` standing in for whatever the
/// store currently holds for that day. Used to refresh the cache on save.
pub fn week_total_with(store: &dyn DailyRecordStore, record: &DailyHealthRecord) -> Result<i64> {
    let others: i64 = store
        .fetch_range(week_start(record.day), record.day)?
        .iter()
        .filter(|r| r.day != record.day)
        .filter_map(|r| r.metrics().steps)
        .sum();
    Ok(others + record.metrics().steps.unwrap_or(0))
}

/// Week total read straight from the provider, one day at a time from
/// `day-6` up to `day`.
///
/// `on_progress` receives each day with the running total after it. A day
/// whose fetch fails counts as 0.
pub async fn live_week_total(
    provider: &dyn ExternalMetricsProvider,
    day: NaiveDate,
    mut on_progress: impl FnMut(NaiveDate, i64) + Send,
) -> i64 {
    let mut total = 0;
    for current in week_start(day).iter_days().take_while(|d| *d <= day) {
        match provider.steps_for_day(current).await {
            Ok(steps) => total += steps,
            Err(e) => tracing::warn!(day = %current, error = %e, "step fetch failed, counting as 0"),
        }
        on_progress(current, total);
    }
    total
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::backfill;
    use crate::db::Database;
    use crate::models::TrackedEdit;
    use crate::test_support::{FakeProvider, day};

    fn store_with_steps(steps: &[(u32, Option<i64>)]) -> Mutex<Database> {
        let store = Mutex::new(Database::open_in_memory().unwrap());
        for (d, s) in steps {
            let mut record = DailyHealthRecord::new(day(*d));
            record.apply_edit(TrackedEdit::Steps(*s));
            store.insert(&record).unwrap();
        }
        store
    }

    #[test]
    fn test_week_start() {
        assert_eq!(week_start(day(10)), day(4));
    }

    #[test]
    fn test_cached_week_total_counts_gaps_as_zero() {
        let store = store_with_steps(&[(3, Some(9999)), (4, Some(1000)), (6, None), (10, Some(500))]);
        // day 3 is outside the window, day 6 has no steps, days 5/7/8/9 are missing
        assert_eq!(cached_week_total(&store, day(10)).unwrap(), 1500);
    }

    #[tokio::test]
    async fn test_week_total_sums_partial_week() {
        let store = store_with_steps(&[(7, Some(3000)), (9, Some(5000))]);
        assert_eq!(cached_week_total(&store, day(10)).unwrap(), 8000);

        let provider = FakeProvider::new()
            .with_steps(day(7), 3000)
            .with_steps(day(9), 5000);
        assert_eq!(live_week_total(&provider, day(10), |_, _| {}).await, 8000);
    }

    #[test]
    fn test_cached_week_total_empty_store() {
        let store = Mutex::new(Database::open_in_memory().unwrap());
        assert_eq!(cached_week_total(&store, day(10)).unwrap(), 0);
    }

    #[test]
    fn test_week_total_with_substitutes_record() {
        let store = store_with_steps(&[(8, Some(2000)), (10, Some(100))]);
        let mut edited = store.fetch_by_day(day(10)).unwrap().unwrap();
        edited.apply_edit(TrackedEdit::Steps(Some(700)));
        assert_eq!(week_total_with(&store, &edited).unwrap(), 2700);

        let unsaved = DailyHealthRecord::new(day(9));
        assert_eq!(week_total_with(&store, &unsaved).unwrap(), 2000);
    }

    #[tokio::test]
    async fn test_live_week_total_reports_running_totals() {
        let mut provider = FakeProvider::new();
        for d in 4..=10 {
            provider = provider.with_steps(day(d), i64::from(d) * 100);
        }

        let mut progress = Vec::new();
        let total = live_week_total(&provider, day(10), |d, t| progress.push((d, t))).await;

        assert_eq!(total, 4900);
        assert_eq!(progress.len(), 7);
        assert_eq!(progress[0], (day(4), 400));
        assert_eq!(progress[6], (day(10), 4900));
    }

    #[tokio::test]
    async fn test_live_week_total_failed_day_counts_zero() {
        let provider = FakeProvider::new()
            .with_steps(day(9), 1000)
            .with_steps(day(10), 2000)
            .failing_day(day(9));
        let total = live_week_total(&provider, day(10), |_, _| {}).await;
        assert_eq!(total, 2000);
    }

    #[tokio::test]
    async fn test_live_matches_cached_after_backfill() {
        let store = store_with_steps(&[(1, Some(300))]);
        let mut provider = FakeProvider::new();
        for d in 2..=12 {
            provider = provider.with_steps(day(d), i64::from(d) * 250);
        }

        let cancel = std::sync::atomic::AtomicBool::new(false);
        backfill::run(&store, &provider, day(12), &cancel, |_| {})
            .await
            .unwrap();

        for d in 8..=12 {
            let live = live_week_total(&provider, day(d), |_, _| {}).await;
            let cached = cached_week_total(&store, day(d)).unwrap();
            assert_eq!(live, cached, "mismatch for {}", day(d));
            let stored = store.fetch_by_day(day(d)).unwrap().unwrap();
            assert_eq!(stored.week_total_steps_cache(), Some(cached));
        }
    }
}
