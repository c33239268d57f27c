use crate::aggregate::Aggregate;
use crate::entity::{Entity, SourceKind};
use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt row for {id}: {detail}")]
    Corrupt { id: String, detail: String },
    #[error("refusing to store invalid record: {0}")]
    Invalid(String),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Per-entity cache row consulted before every evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckedRecord {
    pub canonical_id: String,
    pub last_checked_at: DateTime<Utc>,
    pub last_score: f64,
    pub checked_count: u64,
}

impl CheckedRecord {
    /// True once `cool_down` has fully elapsed since the last check.
    /// A `last_checked_at` in the future never counts as elapsed.
    pub fn cool_down_elapsed(&self, cool_down: Duration, now: DateTime<Utc>) -> bool {
        match (now - self.last_checked_at).to_std() {
            Ok(elapsed) => elapsed >= cool_down,
            Err(_) => false,
        }
    }
}

/// One flag event. An entity can accumulate several of these over time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspiciousRecord {
    pub canonical_id: String,
    pub source_kind: SourceKind,
    pub title: Option<String>,
    pub provider_id: Option<i64>,
    pub first_seen_at: DateTime<Utc>,
    pub sample_size: usize,
    pub aggregate: Aggregate,
    pub reason: String,
    pub raw_metadata: serde_json::Value,
}

impl SuspiciousRecord {
    pub fn new(
        entity: &Entity,
        aggregate: Aggregate,
        reason: String,
        raw_metadata: serde_json::Value,
        first_seen_at: DateTime<Utc>,
    ) -> Self {
        Self {
            canonical_id: entity.canonical_id().to_string(),
            source_kind: entity.source_kind,
            title: entity.display_title.clone(),
            provider_id: entity.provider_id,
            first_seen_at,
            sample_size: aggregate.count,
            aggregate,
            reason,
            raw_metadata,
        }
    }

    pub fn validate(&self) -> Result<(), PersistenceError> {
        if self.sample_size != self.aggregate.count {
            return Err(PersistenceError::Invalid(format!(
                "sample_size {} does not match aggregate count {}",
                self.sample_size, self.aggregate.count
            )));
        }
        let Aggregate {
            mean, median, p90, ..
        } = self.aggregate;
        for (name, value) in [("mean", mean), ("median", median), ("p90", p90)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(PersistenceError::Invalid(format!(
                    "{name} {value} outside [0, 1]"
                )));
            }
        }
        Ok(())
    }
}

/// Tracks when each entity was last evaluated.
pub trait DedupCache: Send + Sync {
    fn checked_record(&self, canonical_id: &str) -> Result<Option<CheckedRecord>, PersistenceError>;

    /// Upsert the cache row: stamp `now`, store `score`, bump `checked_count`.
    fn record_check_at(
        &self,
        canonical_id: &str,
        score: f64,
        now: DateTime<Utc>,
    ) -> Result<CheckedRecord, PersistenceError>;

    fn should_evaluate_at(
        &self,
        canonical_id: &str,
        cool_down: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        Ok(match self.checked_record(canonical_id)? {
            Some(record) => record.cool_down_elapsed(cool_down, now),
            None => true,
        })
    }

    fn should_evaluate(&self, canonical_id: &str, cool_down: Duration) -> Result<bool, PersistenceError> {
        self.should_evaluate_at(canonical_id, cool_down, Utc::now())
    }

    fn record_check(&self, canonical_id: &str, score: f64) -> Result<CheckedRecord, PersistenceError> {
        self.record_check_at(canonical_id, score, Utc::now())
    }
}

/// Append-only sink for flagged entities.
pub trait ResultStore: Send + Sync {
    fn append(&self, record: &SuspiciousRecord) -> Result<(), PersistenceError>;

    fn records_for(&self, canonical_id: &str) -> Result<Vec<SuspiciousRecord>, PersistenceError>;
}

/// SQLite-backed implementation of both stores sharing one connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(db_path: &str) -> anyhow::Result<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {db_path}"))?;
        Self::init_database(&conn).context("Failed to initialise schema")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_database(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_database(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS checked_records (
                canonical_id TEXT PRIMARY KEY,
                last_checked_at TEXT NOT NULL,
                last_score REAL NOT NULL,
                checked_count INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS suspicious_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                canonical_id TEXT NOT NULL,
                source_kind TEXT NOT NULL,
                title TEXT,
                provider_id INTEGER,
                first_seen_at TEXT NOT NULL,
                sample_size INTEGER NOT NULL,
                avg_prob REAL NOT NULL,
                median_prob REAL NOT NULL,
                pct90_prob REAL NOT NULL,
                reason TEXT NOT NULL,
                raw_metadata TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_suspicious_canonical
                ON suspicious_records (canonical_id);",
        )
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, PersistenceError>,
    ) -> Result<T, PersistenceError> {
        let conn = self.conn.lock().map_err(|_| PersistenceError::Poisoned)?;
        f(&conn)
    }
}

fn parse_timestamp(id: &str, raw: &str) -> Result<DateTime<Utc>, PersistenceError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| PersistenceError::Corrupt {
            id: id.to_string(),
            detail: format!("bad timestamp '{raw}': {e}"),
        })
}

fn checked_from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, f64, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

impl DedupCache for SqliteStore {
    fn checked_record(&self, canonical_id: &str) -> Result<Option<CheckedRecord>, PersistenceError> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT canonical_id, last_checked_at, last_score, checked_count
                     FROM checked_records WHERE canonical_id = ?1",
                    params![canonical_id],
                    checked_from_row,
                )
                .optional()?;

            row.map(
                |(id, checked_at, last_score, checked_count)| -> Result<_, PersistenceError> {
                    Ok(CheckedRecord {
                        last_checked_at: parse_timestamp(&id, &checked_at)?,
                        canonical_id: id,
                        last_score,
                        checked_count: checked_count.max(0) as u64,
                    })
                },
            )
            .transpose()
        })
    }

    fn record_check_at(
        &self,
        canonical_id: &str,
        score: f64,
        now: DateTime<Utc>,
    ) -> Result<CheckedRecord, PersistenceError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO checked_records (canonical_id, last_checked_at, last_score, checked_count)
                 VALUES (?1, ?2, ?3, 1)
                 ON CONFLICT(canonical_id) DO UPDATE SET
                    last_checked_at = excluded.last_checked_at,
                    last_score = excluded.last_score,
                    checked_count = checked_records.checked_count + 1",
                params![canonical_id, now.to_rfc3339(), score],
            )?;
            Ok(())
        })?;

        self.checked_record(canonical_id)?
            .ok_or_else(|| PersistenceError::Corrupt {
                id: canonical_id.to_string(),
                detail: "row missing after upsert".to_string(),
            })
    }
}

impl ResultStore for SqliteStore {
    fn append(&self, record: &SuspiciousRecord) -> Result<(), PersistenceError> {
        record.validate()?;
        let metadata = serde_json::to_string(&record.raw_metadata)?;

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO suspicious_records
                 (canonical_id, source_kind, title, provider_id, first_seen_at, sample_size,
                  avg_prob, median_prob, pct90_prob, reason, raw_metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    record.canonical_id,
                    record.source_kind.as_str(),
                    record.title,
                    record.provider_id,
                    record.first_seen_at.to_rfc3339(),
                    record.sample_size as i64,
                    record.aggregate.mean,
                    record.aggregate.median,
                    record.aggregate.p90,
                    record.reason,
                    metadata,
                ],
            )?;
            Ok(())
        })
    }

    fn records_for(&self, canonical_id: &str) -> Result<Vec<SuspiciousRecord>, PersistenceError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT canonical_id, source_kind, title, provider_id, first_seen_at, sample_size,
                        avg_prob, median_prob, pct90_prob, reason, raw_metadata
                 FROM suspicious_records WHERE canonical_id = ?1 ORDER BY id",
            )?;

            #[allow(clippy::type_complexity)]
            let rows: Vec<(
                String,
                String,
                Option<String>,
                Option<i64>,
                String,
                i64,
                f64,
                f64,
                f64,
                String,
                String,
            )> = stmt
                .query_map(params![canonical_id], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                        row.get(9)?,
                        row.get(10)?,
                    ))
                })?
                .collect::<Result<_, _>>()?;

            rows.into_iter()
                .map(
                    |(id, kind, title, provider_id, seen, size, mean, median, p90, reason, meta)|
                     -> Result<SuspiciousRecord, PersistenceError> {
                        let source_kind =
                            SourceKind::parse(&kind).ok_or_else(|| PersistenceError::Corrupt {
                                id: id.clone(),
                                detail: format!("unknown source kind '{kind}'"),
                            })?;
                        let count = size.max(0) as usize;
                        Ok(SuspiciousRecord {
                            first_seen_at: parse_timestamp(&id, &seen)?,
                            canonical_id: id,
                            source_kind,
                            title,
                            provider_id,
                            sample_size: count,
                            aggregate: Aggregate {
                                mean,
                                median,
                                p90,
                                count,
                            },
                            reason,
                            raw_metadata: serde_json::from_str(&meta)?,
                        })
                    },
                )
                .collect()
        })
    }
}

/// Volatile store used for dry runs; nothing outlives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    checked: Mutex<HashMap<String, CheckedRecord>>,
    suspicious: Mutex<Vec<SuspiciousRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn suspicious_count(&self) -> usize {
        self.suspicious.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl DedupCache for MemoryStore {
    fn checked_record(&self, canonical_id: &str) -> Result<Option<CheckedRecord>, PersistenceError> {
        let checked = self.checked.lock().map_err(|_| PersistenceError::Poisoned)?;
        Ok(checked.get(canonical_id).cloned())
    }

    fn record_check_at(
        &self,
        canonical_id: &str,
        score: f64,
        now: DateTime<Utc>,
    ) -> Result<CheckedRecord, PersistenceError> {
        let mut checked = self.checked.lock().map_err(|_| PersistenceError::Poisoned)?;
        let record = checked
            .entry(canonical_id.to_string())
            .and_modify(|r| {
                r.last_checked_at = now;
                r.last_score = score;
                r.checked_count += 1;
            })
            .or_insert_with(|| CheckedRecord {
                canonical_id: canonical_id.to_string(),
                last_checked_at: now,
                last_score: score,
                checked_count: 1,
            });
        Ok(record.clone())
    }
}

impl ResultStore for MemoryStore {
    fn append(&self, record: &SuspiciousRecord) -> Result<(), PersistenceError> {
        record.validate()?;
        let mut suspicious = self.suspicious.lock().map_err(|_| PersistenceError::Poisoned)?;
        suspicious.push(record.clone());
        Ok(())
    }

    fn records_for(&self, canonical_id: &str) -> Result<Vec<SuspiciousRecord>, PersistenceError> {
        let suspicious = self.suspicious.lock().map_err(|_| PersistenceError::Poisoned)?;
        Ok(suspicious
            .iter()
            .filter(|r| r.canonical_id == canonical_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    fn flagged_record(id: &str) -> SuspiciousRecord {
        let entity = Entity::new(id, SourceKind::Messaging)
            .with_title("Easy Loans")
            .with_provider_id(99);
        let aggregate = Aggregate {
            mean: 0.58,
            median: 0.9,
            p90: 0.9,
            count: 5,
        };
        SuspiciousRecord::new(
            &entity,
            aggregate,
            "avg:0.580 pct90:0.900".to_string(),
            json!({"sample_count": 5}),
            at(12),
        )
    }

    fn stores() -> Vec<(&'static str, Box<dyn DedupCache>)> {
        vec![
            ("sqlite", Box::new(SqliteStore::open_in_memory().unwrap())),
            ("memory", Box::new(MemoryStore::new())),
        ]
    }

    #[test]
    fn test_should_evaluate_without_record() {
        for (name, cache) in stores() {
            assert!(cache.should_evaluate_at("fresh", DAY, at(0)).unwrap(), "{name}");
        }
    }

    #[test]
    fn test_should_evaluate_respects_cool_down() {
        for (name, cache) in stores() {
            cache.record_check_at("chan", 0.3, at(0)).unwrap();
            assert!(!cache.should_evaluate_at("chan", Duration::from_secs(3 * 3600), at(2)).unwrap(), "{name}");
            assert!(cache.should_evaluate_at("chan", Duration::from_secs(3 * 3600), at(3)).unwrap(), "{name}");
            assert!(cache.should_evaluate_at("chan", Duration::from_secs(3 * 3600), at(5)).unwrap(), "{name}");
        }
    }

    #[test]
    fn test_future_check_never_elapsed() {
        for (name, cache) in stores() {
            cache.record_check_at("chan", 0.3, at(10)).unwrap();
            assert!(!cache.should_evaluate_at("chan", Duration::ZERO, at(9)).unwrap(), "{name}");
        }
    }

    #[test]
    fn test_record_check_increments() {
        for (name, cache) in stores() {
            let first = cache.record_check_at("chan", 0.4, at(1)).unwrap();
            assert_eq!(first.checked_count, 1, "{name}");

            let second = cache.record_check_at("chan", 0.4, at(2)).unwrap();
            assert_eq!(second.checked_count, 2, "{name}");
            assert_eq!(second.last_checked_at, at(2), "{name}");
            assert_eq!(second.last_score, 0.4, "{name}");

            let third = cache.record_check_at("chan", 0.9, at(3)).unwrap();
            assert_eq!(third.checked_count, 3, "{name}");
            assert_eq!(third.last_score, 0.9, "{name}");
        }
    }

    #[test]
    fn test_record_check_with_wall_clock() {
        let store = MemoryStore::new();
        store.record_check("chan", 0.1).unwrap();
        assert!(!store.should_evaluate("chan", DAY).unwrap());
        assert!(store.should_evaluate("chan", Duration::ZERO).unwrap());
    }

    #[test]
    fn test_sqlite_append_and_read_back() {
        let store = SqliteStore::open_in_memory().unwrap();
        let record = flagged_record("easyloans");
        store.append(&record).unwrap();
        store.append(&record).unwrap();

        let stored = store.records_for("easyloans").unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0], record);
        assert!(store.records_for("other").unwrap().is_empty());
    }

    #[test]
    fn test_append_rejects_mismatched_sample_size() {
        let mut record = flagged_record("bad");
        record.sample_size = 4;
        let store = MemoryStore::new();
        assert!(matches!(store.append(&record), Err(PersistenceError::Invalid(_))));
        assert_eq!(store.suspicious_count(), 0);
    }

    #[test]
    fn test_append_rejects_out_of_range_aggregate() {
        let mut record = flagged_record("bad");
        record.aggregate.p90 = 1.2;
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(matches!(store.append(&record), Err(PersistenceError::Invalid(_))));
    }

    #[test]
    fn test_sqlite_file_persists_between_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("scout.db");
        let path = path.to_str().unwrap();

        {
            let store = SqliteStore::open(path).unwrap();
            store.record_check_at("chan", 0.2, at(1)).unwrap();
            store.append(&flagged_record("chan")).unwrap();
        }

        let store = SqliteStore::open(path).unwrap();
        let record = store.checked_record("chan").unwrap().unwrap();
        assert_eq!(record.checked_count, 1);
        assert_eq!(record.last_checked_at, at(1));
        assert_eq!(store.records_for("chan").unwrap().len(), 1);
    }
}
