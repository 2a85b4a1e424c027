use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{Local, NaiveDate, NaiveTime};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params};

use crate::models::{
    BloodPressure, DailyHealthRecord, HeartRateStats, Provenance, RecordDetails, SleepDuration,
    StressLevel, TrackedMetrics,
};

const RECORD_COLUMNS: &str = "id, day, steps, glucose, ketones, bp_systolic, bp_diastolic,
    weight, sleep_hours, sleep_minutes, hr_min, hr_max, hr_avg,
    steps_synced, glucose_synced, ketones_synced, blood_pressure_synced, weight_synced,
    sleep_synced, heart_rate_synced,
    stress_level, walked_am, walked_pm, went_to_gym, light_therapy,
    wake_time, first_meal_time, last_meal_time, notes, weather,
    week_total_steps_cache, created_at, updated_at";

const TIME_FORMAT: &str = "%H:%M";

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS daily_records (
                    id TEXT PRIMARY KEY NOT NULL,
                    day TEXT NOT NULL UNIQUE,
                    steps INTEGER,
                    glucose REAL,
                    ketones REAL,
                    bp_systolic INTEGER,
                    bp_diastolic INTEGER,
                    weight REAL,
                    sleep_hours INTEGER,
                    sleep_minutes INTEGER,
                    hr_min REAL,
                    hr_max REAL,
                    hr_avg REAL,
                    steps_synced INTEGER NOT NULL DEFAULT 0,
                    glucose_synced INTEGER NOT NULL DEFAULT 0,
                    ketones_synced INTEGER NOT NULL DEFAULT 0,
                    blood_pressure_synced INTEGER NOT NULL DEFAULT 0,
                    weight_synced INTEGER NOT NULL DEFAULT 0,
                    sleep_synced INTEGER NOT NULL DEFAULT 0,
                    heart_rate_synced INTEGER NOT NULL DEFAULT 0,
                    stress_level TEXT,
                    walked_am INTEGER NOT NULL DEFAULT 0,
                    walked_pm INTEGER NOT NULL DEFAULT 0,
                    went_to_gym INTEGER NOT NULL DEFAULT 0,
                    light_therapy INTEGER NOT NULL DEFAULT 0,
                    wake_time TEXT,
                    first_meal_time TEXT,
                    last_meal_time TEXT,
                    notes TEXT,
                    weather TEXT,
                    week_total_steps_cache INTEGER,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_daily_records_day ON daily_records(day);

                PRAGMA user_version = 1;",
            )?;
        }

        if version < 2 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS user_settings (
                    key TEXT PRIMARY KEY NOT NULL,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
                );

                PRAGMA user_version = 2;",
            )?;
        }

        Ok(())
    }

    // --- Row mapping helpers ---

    fn record_from_row(row: &rusqlite::Row) -> rusqlite::Result<DailyHealthRecord> {
        let day: String = row.get(1)?;
        let blood_pressure = match (row.get::<_, Option<i64>>(5)?, row.get::<_, Option<i64>>(6)?) {
            (Some(systolic), Some(diastolic)) => Some(BloodPressure {
                systolic,
                diastolic,
            }),
            _ => None,
        };
        let sleep = match (row.get::<_, Option<i64>>(8)?, row.get::<_, Option<i64>>(9)?) {
            (Some(hours), Some(minutes)) => Some(SleepDuration { hours, minutes }),
            _ => None,
        };
        let heart_rate = match (
            row.get::<_, Option<f64>>(10)?,
            row.get::<_, Option<f64>>(11)?,
            row.get::<_, Option<f64>>(12)?,
        ) {
            (Some(min), Some(max), Some(avg)) => Some(HeartRateStats { min, max, avg }),
            _ => None,
        };
        let stress_level = row
            .get::<_, Option<String>>(20)?
            .map(|s| {
                s.parse::<StressLevel>()
                    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(20, Type::Text, e.into()))
            })
            .transpose()?;

        Ok(DailyHealthRecord {
            id: row.get(0)?,
            day: parse_day_column(1, &day)?,
            metrics: TrackedMetrics {
                steps: row.get(2)?,
                glucose: row.get(3)?,
                ketones: row.get(4)?,
                blood_pressure,
                weight: row.get(7)?,
                sleep,
                heart_rate,
            },
            provenance: Provenance {
                steps: row.get(13)?,
                glucose: row.get(14)?,
                ketones: row.get(15)?,
                blood_pressure: row.get(16)?,
                weight: row.get(17)?,
                sleep: row.get(18)?,
                heart_rate: row.get(19)?,
            },
            details: RecordDetails {
                stress_level,
                walked_am: row.get(21)?,
                walked_pm: row.get(22)?,
                went_to_gym: row.get(23)?,
                light_therapy: row.get(24)?,
                wake_time: parse_time_column(25, row.get(25)?)?,
                first_meal_time: parse_time_column(26, row.get(26)?)?,
                last_meal_time: parse_time_column(27, row.get(27)?)?,
                notes: row.get(28)?,
                weather: row.get(29)?,
            },
            week_total_steps_cache: row.get(30)?,
            created_at: row.get(31)?,
            updated_at: row.get(32)?,
        })
    }

    // --- Daily records ---

    /// Insert a new record. Fails if a record for the same day already exists.
    pub fn insert_record(&self, record: &DailyHealthRecord) -> Result<()> {
        if self.get_record_by_day(record.day)?.is_some() {
            bail!("A record for {} already exists", record.day);
        }

        let m = &record.metrics;
        let p = &record.provenance;
        let d = &record.details;
        self.conn
            .execute(
                &format!(
                    "INSERT INTO daily_records ({RECORD_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                             ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28,
                             ?29, ?30, ?31, ?32, ?33)"
                ),
                params![
                    record.id,
                    record.day.format("%Y-%m-%d").to_string(),
                    m.steps,
                    m.glucose,
                    m.ketones,
                    m.blood_pressure.map(|bp| bp.systolic),
                    m.blood_pressure.map(|bp| bp.diastolic),
                    m.weight,
                    m.sleep.map(|s| s.hours),
                    m.sleep.map(|s| s.minutes),
                    m.heart_rate.map(|hr| hr.min),
                    m.heart_rate.map(|hr| hr.max),
                    m.heart_rate.map(|hr| hr.avg),
                    p.steps,
                    p.glucose,
                    p.ketones,
                    p.blood_pressure,
                    p.weight,
                    p.sleep,
                    p.heart_rate,
                    d.stress_level.map(StressLevel::as_str),
                    d.walked_am,
                    d.walked_pm,
                    d.went_to_gym,
                    d.light_therapy,
                    format_time(d.wake_time),
                    format_time(d.first_meal_time),
                    format_time(d.last_meal_time),
                    d.notes,
                    d.weather,
                    record.week_total_steps_cache,
                    record.created_at,
                    record.updated_at,
                ],
            )
            .with_context(|| format!("Failed to insert record for {}", record.day))?;
        Ok(())
    }

    /// Overwrite every stored field of an existing record in one statement.
    pub fn update_record(&self, record: &mut DailyHealthRecord) -> Result<()> {
        let now = Local::now().to_rfc3339();
        let m = &record.metrics;
        let p = &record.provenance;
        let d = &record.details;
        let rows = self
            .conn
            .execute(
                "UPDATE daily_records SET
                    day = ?2, steps = ?3, glucose = ?4, ketones = ?5,
                    bp_systolic = ?6, bp_diastolic = ?7, weight = ?8,
                    sleep_hours = ?9, sleep_minutes = ?10,
                    hr_min = ?11, hr_max = ?12, hr_avg = ?13,
                    steps_synced = ?14, glucose_synced = ?15, ketones_synced = ?16,
                    blood_pressure_synced = ?17, weight_synced = ?18, sleep_synced = ?19,
                    heart_rate_synced = ?20,
                    stress_level = ?21, walked_am = ?22, walked_pm = ?23,
                    went_to_gym = ?24, light_therapy = ?25,
                    wake_time = ?26, first_meal_time = ?27, last_meal_time = ?28,
                    notes = ?29, weather = ?30, week_total_steps_cache = ?31,
                    updated_at = ?32
                 WHERE id = ?1",
                params![
                    record.id,
                    record.day.format("%Y-%m-%d").to_string(),
                    m.steps,
                    m.glucose,
                    m.ketones,
                    m.blood_pressure.map(|bp| bp.systolic),
                    m.blood_pressure.map(|bp| bp.diastolic),
                    m.weight,
                    m.sleep.map(|s| s.hours),
                    m.sleep.map(|s| s.minutes),
                    m.heart_rate.map(|hr| hr.min),
                    m.heart_rate.map(|hr| hr.max),
                    m.heart_rate.map(|hr| hr.avg),
                    p.steps,
                    p.glucose,
                    p.ketones,
                    p.blood_pressure,
                    p.weight,
                    p.sleep,
                    p.heart_rate,
                    d.stress_level.map(StressLevel::as_str),
                    d.walked_am,
                    d.walked_pm,
                    d.went_to_gym,
                    d.light_therapy,
                    format_time(d.wake_time),
                    format_time(d.first_meal_time),
                    format_time(d.last_meal_time),
                    d.notes,
                    d.weather,
                    record.week_total_steps_cache,
                    now,
                ],
            )
            .with_context(|| format!("Failed to update record for {}", record.day))?;
        if rows == 0 {
            bail!("Record {} not found", record.id);
        }
        record.updated_at = now;
        Ok(())
    }

    pub fn get_record_by_day(&self, day: NaiveDate) -> Result<Option<DailyHealthRecord>> {
        let record = self
            .conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM daily_records WHERE day = ?1"),
                params![day.format("%Y-%m-%d").to_string()],
                Self::record_from_row,
            )
            .optional()
            .with_context(|| format!("Failed to load record for {day}"))?;
        Ok(record)
    }

    /// All records, newest day first.
    pub fn list_records(&self, limit: Option<usize>) -> Result<Vec<DailyHealthRecord>> {
        let limit = limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM daily_records ORDER BY day DESC LIMIT ?1"
        ))?;
        let records = stmt
            .query_map(params![limit], Self::record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list records")?;
        Ok(records)
    }

    /// Records with `start <= day <= end`, oldest first.
    pub fn records_in_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyHealthRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM daily_records
             WHERE day >= ?1 AND day <= ?2
             ORDER BY day ASC"
        ))?;
        let records = stmt
            .query_map(
                params![
                    start.format("%Y-%m-%d").to_string(),
                    end.format("%Y-%m-%d").to_string()
                ],
                Self::record_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("Failed to load records from {start} to {end}"))?;
        Ok(records)
    }

    pub fn delete_record(&self, id: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM daily_records WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    pub fn earliest_day(&self) -> Result<Option<NaiveDate>> {
        let day: Option<String> =
            self.conn
                .query_row("SELECT MIN(day) FROM daily_records", [], |row| row.get(0))?;
        day.map(|d| {
            NaiveDate::parse_from_str(&d, "%Y-%m-%d")
                .with_context(|| format!("Invalid stored day '{d}'"))
        })
        .transpose()
    }

    pub fn set_week_total_cache(&self, id: &str, total: Option<i64>) -> Result<()> {
        self.conn.execute(
            "UPDATE daily_records SET week_total_steps_cache = ?1 WHERE id = ?2",
            params![total, id],
        )?;
        Ok(())
    }

    /// Weight of the earliest (`latest == false`) or latest record that has one.
    pub fn boundary_weight(&self, latest: bool) -> Result<Option<(NaiveDate, f64)>> {
        let order = if latest { "DESC" } else { "ASC" };
        let row: Option<(String, f64)> = self
            .conn
            .query_row(
                &format!(
                    "SELECT day, weight FROM daily_records
                     WHERE weight IS NOT NULL ORDER BY day {order} LIMIT 1"
                ),
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(d, w)| {
            let day = NaiveDate::parse_from_str(&d, "%Y-%m-%d")
                .with_context(|| format!("Invalid stored day '{d}'"))?;
            Ok((day, w))
        })
        .transpose()
    }

    // --- Settings ---

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let now = Local::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO user_settings (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM user_settings WHERE key = ?1")?;
        let mut rows = stmt.query(params![key])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row.get(0)?))
        } else {
            Ok(None)
        }
    }

    pub fn delete_setting(&self, key: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM user_settings WHERE key = ?1", params![key])?;
        Ok(rows > 0)
    }
}

fn parse_day_column(idx: usize, value: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_time_column(idx: usize, value: Option<String>) -> rusqlite::Result<Option<NaiveTime>> {
    value
        .map(|v| {
            NaiveTime::parse_from_str(&v, TIME_FORMAT).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
            })
        })
        .transpose()
}

fn format_time(time: Option<NaiveTime>) -> Option<String> {
    time.map(|t| t.format(TIME_FORMAT).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TrackedEdit;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, d).unwrap()
    }

    fn full_record() -> DailyHealthRecord {
        let mut record = DailyHealthRecord::new(day(10));
        record.metrics = TrackedMetrics {
            steps: Some(8450),
            glucose: Some(98.5),
            ketones: Some(0.8),
            blood_pressure: Some(BloodPressure {
                systolic: 118,
                diastolic: 76,
            }),
            weight: Some(182.4),
            sleep: Some(SleepDuration {
                hours: 7,
                minutes: 20,
            }),
            heart_rate: Some(HeartRateStats {
                min: 52.0,
                max: 141.0,
                avg: 71.5,
            }),
        };
        record.provenance.steps = true;
        record.provenance.sleep = true;
        record.details = RecordDetails {
            stress_level: Some(StressLevel::Medium),
            walked_am: true,
            walked_pm: false,
            went_to_gym: true,
            light_therapy: true,
            wake_time: NaiveTime::from_hms_opt(6, 45, 0),
            first_meal_time: NaiveTime::from_hms_opt(11, 0, 0),
            last_meal_time: NaiveTime::from_hms_opt(19, 30, 0),
            notes: Some("Felt good".to_string()),
            weather: Some("Sunny, 24°C".to_string()),
        };
        record.week_total_steps_cache = Some(40210);
        record
    }

    #[test]
    fn test_insert_and_get_record() {
        let db = Database::open_in_memory().unwrap();
        let record = full_record();
        db.insert_record(&record).unwrap();

        let fetched = db.get_record_by_day(day(10)).unwrap().unwrap();
        assert_eq!(fetched, record);
    }

    #[test]
    fn test_get_missing_record() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_record_by_day(day(1)).unwrap().is_none());
    }

    #[test]
    fn test_insert_duplicate_day_fails() {
        let db = Database::open_in_memory().unwrap();
        db.insert_record(&DailyHealthRecord::new(day(3))).unwrap();
        let err = db
            .insert_record(&DailyHealthRecord::new(day(3)))
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn test_update_record() {
        let db = Database::open_in_memory().unwrap();
        let mut record = full_record();
        db.insert_record(&record).unwrap();

        record.apply_edit(TrackedEdit::Steps(Some(9000)));
        record.apply_edit(TrackedEdit::BloodPressure(None));
        record.details.notes = None;
        db.update_record(&mut record).unwrap();

        let fetched = db.get_record_by_day(day(10)).unwrap().unwrap();
        assert_eq!(fetched.metrics().steps, Some(9000));
        assert!(!fetched.provenance().steps);
        assert!(fetched.provenance().sleep);
        assert!(fetched.metrics().blood_pressure.is_none());
        assert!(fetched.details.notes.is_none());
        assert_eq!(fetched.updated_at, record.updated_at);
    }

    #[test]
    fn test_update_missing_record_fails() {
        let db = Database::open_in_memory().unwrap();
        let mut record = DailyHealthRecord::new(day(4));
        assert!(db.update_record(&mut record).is_err());
    }

    #[test]
    fn test_list_records_newest_first() {
        let db = Database::open_in_memory().unwrap();
        for d in [5, 1, 9, 3] {
            db.insert_record(&DailyHealthRecord::new(day(d))).unwrap();
        }

        let days: Vec<NaiveDate> = db
            .list_records(None)
            .unwrap()
            .into_iter()
            .map(|r| r.day)
            .collect();
        assert_eq!(days, vec![day(9), day(5), day(3), day(1)]);

        let limited = db.list_records(Some(2)).unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].day, day(9));
    }

    #[test]
    fn test_records_in_range() {
        let db = Database::open_in_memory().unwrap();
        for d in 1..=10 {
            db.insert_record(&DailyHealthRecord::new(day(d))).unwrap();
        }
        let records = db.records_in_range(day(4), day(7)).unwrap();
        let days: Vec<NaiveDate> = records.iter().map(|r| r.day).collect();
        assert_eq!(days, vec![day(4), day(5), day(6), day(7)]);
    }

    #[test]
    fn test_delete_record() {
        let db = Database::open_in_memory().unwrap();
        let record = DailyHealthRecord::new(day(2));
        db.insert_record(&record).unwrap();

        assert!(db.delete_record(&record.id).unwrap());
        assert!(!db.delete_record(&record.id).unwrap());
        assert!(db.get_record_by_day(day(2)).unwrap().is_none());
    }

    #[test]
    fn test_earliest_day() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.earliest_day().unwrap().is_none());
        db.insert_record(&DailyHealthRecord::new(day(8))).unwrap();
        db.insert_record(&DailyHealthRecord::new(day(2))).unwrap();
        assert_eq!(db.earliest_day().unwrap(), Some(day(2)));
    }

    #[test]
    fn test_set_week_total_cache() {
        let db = Database::open_in_memory().unwrap();
        let record = DailyHealthRecord::new(day(6));
        db.insert_record(&record).unwrap();
        db.set_week_total_cache(&record.id, Some(1234)).unwrap();
        let fetched = db.get_record_by_day(day(6)).unwrap().unwrap();
        assert_eq!(fetched.week_total_steps_cache(), Some(1234));
    }

    #[test]
    fn test_boundary_weight() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.boundary_weight(false).unwrap().is_none());

        db.insert_record(&DailyHealthRecord::new(day(1))).unwrap();
        for (d, w) in [(2, 190.0), (5, 186.5)] {
            let mut record = DailyHealthRecord::new(day(d));
            record.apply_edit(TrackedEdit::Weight(Some(w)));
            db.insert_record(&record).unwrap();
        }

        assert_eq!(db.boundary_weight(false).unwrap(), Some((day(2), 190.0)));
        assert_eq!(db.boundary_weight(true).unwrap(), Some((day(5), 186.5)));
    }

    #[test]
    fn test_settings_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_setting("weight_target").unwrap().is_none());

        db.set_setting("weight_target", "175").unwrap();
        assert_eq!(
            db.get_setting("weight_target").unwrap().as_deref(),
            Some("175")
        );

        db.set_setting("weight_target", "170").unwrap();
        assert_eq!(
            db.get_setting("weight_target").unwrap().as_deref(),
            Some("170")
        );

        assert!(db.delete_setting("weight_target").unwrap());
        assert!(!db.delete_setting("weight_target").unwrap());
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daybook.db");
        {
            let db = Database::open(&path).unwrap();
            db.insert_record(&DailyHealthRecord::new(day(1))).unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert!(db.get_record_by_day(day(1)).unwrap().is_some());
    }
}
