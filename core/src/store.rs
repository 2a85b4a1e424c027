use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use chrono::NaiveDate;

use crate::db::Database;
use crate::models::DailyHealthRecord;

/// Persistent collection of daily records, at most one per calendar day.
///
/// Each call is atomic with respect to other calls on the same store: a
/// record's values and provenance flags are always written together.
pub trait DailyRecordStore: Send + Sync {
    /// All records, newest day first.
    fn fetch_all(&self) -> Result<Vec<DailyHealthRecord>>;
    fn fetch_by_day(&self, day: NaiveDate) -> Result<Option<DailyHealthRecord>>;
    /// Records with `start <= day <= end`, oldest first.
    fn fetch_range(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<DailyHealthRecord>>;
    /// Insert a new record. Fails if the day is already present.
    fn insert(&self, record: &DailyHealthRecord) -> Result<()>;
    /// Persist every field of an existing record.
    fn save(&self, record: &mut DailyHealthRecord) -> Result<()>;
    fn delete(&self, id: &str) -> Result<bool>;

    fn earliest_day(&self) -> Result<Option<NaiveDate>> {
        Ok(self.fetch_all()?.last().map(|r| r.day))
    }
}

fn lock(db: &Mutex<Database>) -> MutexGuard<'_, Database> {
    db.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DailyRecordStore for Mutex<Database> {
    fn fetch_all(&self) -> Result<Vec<DailyHealthRecord>> {
        lock(self).list_records(None)
    }

    fn fetch_by_day(&self, day: NaiveDate) -> Result<Option<DailyHealthRecord>> {
        lock(self).get_record_by_day(day)
    }

    fn fetch_range(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<DailyHealthRecord>> {
        lock(self).records_in_range(start, end)
    }

    fn insert(&self, record: &DailyHealthRecord) -> Result<()> {
        lock(self).insert_record(record)
    }

    fn save(&self, record: &mut DailyHealthRecord) -> Result<()> {
        lock(self).update_record(record)
    }

    fn delete(&self, id: &str) -> Result<bool> {
        lock(self).delete_record(id)
    }

    fn earliest_day(&self) -> Result<Option<NaiveDate>> {
        lock(self).earliest_day()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, d).unwrap()
    }

    #[test]
    fn test_mutex_store_roundtrip() {
        let store = Mutex::new(Database::open_in_memory().unwrap());
        let mut record = DailyHealthRecord::new(day(4));
        store.insert(&record).unwrap();

        record.details.went_to_gym = true;
        store.save(&mut record).unwrap();

        let fetched = store.fetch_by_day(day(4)).unwrap().unwrap();
        assert!(fetched.details.went_to_gym);
        assert_eq!(store.fetch_all().unwrap().len(), 1);
        assert_eq!(store.earliest_day().unwrap(), Some(day(4)));

        assert!(store.delete(&record.id).unwrap());
        assert!(store.fetch_all().unwrap().is_empty());
    }

    #[test]
    fn test_fetch_range_through_trait() {
        let store = Mutex::new(Database::open_in_memory().unwrap());
        for d in [1, 2, 5, 9] {
            store.insert(&DailyHealthRecord::new(day(d))).unwrap();
        }
        let range = store.fetch_range(day(2), day(8)).unwrap();
        assert_eq!(
            range.iter().map(|r| r.day).collect::<Vec<_>>(),
            vec![day(2), day(5)]
        );
    }
}
