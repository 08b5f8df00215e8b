//! SQLite-backed qualification store.
//!
//! Stage records are written as generations: a replace inserts the new
//! rows, swaps the phase's pointer in `phase_generations` and drops the
//! previous generation, all inside one transaction. Reads always join
//! through the pointer.
//!
//! The same database also holds the run audit trail and the execution
//! tracker's recommendations and positions.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{QualificationStore, RecordFilter, RecordSort, RunAuditEntry, RunKind};
use crate::execution::{Position, PositionStatus, Recommendation, RecommendationStatus};
use crate::funnel::{Phase, StageRecord};

// ============================================================================
// Database Schema
// ============================================================================

const CREATE_TABLES_SQL: &str = r#"
-- Stage records, one generation per phase is current
CREATE TABLE IF NOT EXISTS stage_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    phase TEXT NOT NULL,
    generation INTEGER NOT NULL,
    symbol TEXT NOT NULL,
    run_id TEXT NOT NULL,
    run_at TEXT NOT NULL,
    composite REAL NOT NULL,
    percentile_rank REAL NOT NULL,
    filters_passed INTEGER NOT NULL,
    qualifies INTEGER NOT NULL,
    document TEXT NOT NULL,
    UNIQUE(phase, generation, symbol)
);

CREATE INDEX IF NOT EXISTS idx_stage_records_phase_gen
ON stage_records(phase, generation, qualifies);

-- Current generation pointer per phase
CREATE TABLE IF NOT EXISTS phase_generations (
    phase TEXT PRIMARY KEY,
    generation INTEGER NOT NULL,
    run_id TEXT NOT NULL,
    record_count INTEGER NOT NULL,
    replaced_at TEXT NOT NULL
);

-- Stage and funnel results
CREATE TABLE IF NOT EXISTS run_audit (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    phase TEXT,
    success INTEGER NOT NULL,
    recorded_at TEXT NOT NULL,
    document TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_run_audit_run
ON run_audit(run_id);

-- Recommendation cards
CREATE TABLE IF NOT EXISTS recommendations (
    id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    document TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_recommendations_status
ON recommendations(status, created_at DESC);

-- Tracked positions
CREATE TABLE IF NOT EXISTS positions (
    id TEXT PRIMARY KEY,
    recommendation_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    status TEXT NOT NULL,
    opened_at TEXT NOT NULL,
    document TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_positions_status
ON positions(status);
"#;

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current generation of one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub phase: Phase,
    pub generation: i64,
    pub run_id: String,
    pub record_count: usize,
    pub qualified_count: usize,
    pub replaced_at: String,
}

// ============================================================================
// SQLite Store
// ============================================================================

pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
    audit_retention: usize,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path, audit_retention: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let conn = Connection::open(path).context("Failed to open qualification store")?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .context("Failed to set database pragmas")?;

        let store = Self::with_connection(conn, audit_retention)?;
        info!(db_path = %path.display(), "Initialized qualification store");
        Ok(store)
    }

    /// Private in-memory database.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory store")?;
        Self::with_connection(conn, 500)
    }

    fn with_connection(conn: Connection, audit_retention: usize) -> Result<Self> {
        conn.execute_batch(CREATE_TABLES_SQL)
            .context("Failed to create database tables")?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            audit_retention: audit_retention.max(1),
        })
    }

    // ========================================================================
    // Phase Summaries
    // ========================================================================

    /// Current generation info for every phase that has one.
    pub async fn phase_summaries(&self) -> Result<Vec<PhaseSummary>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            r#"
            SELECT g.phase, g.generation, g.run_id, g.record_count, g.replaced_at,
                   (SELECT COUNT(*) FROM stage_records r
                    WHERE r.phase = g.phase AND r.generation = g.generation AND r.qualifies = 1)
            FROM phase_generations g
            "#,
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            let (phase, generation, run_id, record_count, replaced_at, qualified) = row?;
            let Ok(phase) = phase.parse::<Phase>() else {
                continue;
            };
            summaries.push(PhaseSummary {
                phase,
                generation,
                run_id,
                record_count: record_count as usize,
                qualified_count: qualified as usize,
                replaced_at,
            });
        }
        summaries.sort_by_key(|s| s.phase);
        Ok(summaries)
    }

    // ========================================================================
    // Recommendations
    // ========================================================================

    /// Insert new drafts, dropping earlier drafts of the same symbols.
    pub async fn replace_drafts(&self, drafts: &[Recommendation]) -> Result<usize> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let mut replaced = 0;
        for rec in drafts {
            replaced += tx.execute(
                "DELETE FROM recommendations WHERE symbol = ?1 AND status = ?2",
                params![rec.symbol, RecommendationStatus::Draft.as_str()],
            )?;
            insert_recommendation(&tx, rec)?;
        }
        tx.commit().context("Failed to commit recommendation drafts")?;

        debug!(count = drafts.len(), replaced, "Saved recommendation drafts");
        Ok(drafts.len())
    }

    pub async fn save_recommendation(&self, rec: &Recommendation) -> Result<()> {
        let db = self.db.lock().await;
        insert_recommendation(&db, rec)
    }

    pub async fn get_recommendation(&self, id: &str) -> Result<Option<Recommendation>> {
        let db = self.db.lock().await;
        let json: Option<String> = db
            .query_row(
                "SELECT document FROM recommendations WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).context("Corrupt recommendation document"))
            .transpose()
    }

    /// Recommendations newest first, optionally by status.
    pub async fn list_recommendations(
        &self,
        status: Option<RecommendationStatus>,
    ) -> Result<Vec<Recommendation>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT document FROM recommendations
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY created_at DESC, id ASC",
        )?;
        let rows = stmt.query_map(params![status.map(|s| s.as_str())], |row| {
            row.get::<_, String>(0)
        })?;
        decode_documents(rows)
    }

    // ========================================================================
    // Positions
    // ========================================================================

    pub async fn save_position(&self, position: &Position) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            r#"
            INSERT OR REPLACE INTO positions
            (id, recommendation_id, symbol, status, opened_at, document)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                position.id,
                position.recommendation_id,
                position.symbol,
                position.status.as_str(),
                timestamp(&position.opened_at),
                serde_json::to_string(position)?,
            ],
        )?;
        Ok(())
    }

    pub async fn get_position(&self, id: &str) -> Result<Option<Position>> {
        let db = self.db.lock().await;
        let json: Option<String> = db
            .query_row("SELECT document FROM positions WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        json.map(|j| serde_json::from_str(&j).context("Corrupt position document"))
            .transpose()
    }

    /// Positions oldest first; `open_only` skips closed ones.
    pub async fn list_positions(&self, open_only: bool) -> Result<Vec<Position>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT document FROM positions
             WHERE ?1 = 0 OR status != ?2
             ORDER BY opened_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(
            params![open_only, PositionStatus::Closed.as_str()],
            |row| row.get::<_, String>(0),
        )?;
        decode_documents(rows)
    }
}

fn insert_recommendation(conn: &Connection, rec: &Recommendation) -> Result<()> {
    conn.execute(
        r#"
        INSERT OR REPLACE INTO recommendations
        (id, symbol, status, created_at, document)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
        params![
            rec.id,
            rec.symbol,
            rec.status.as_str(),
            timestamp(&rec.created_at),
            serde_json::to_string(rec)?,
        ],
    )?;
    Ok(())
}

fn decode_documents<T, I>(rows: I) -> Result<Vec<T>>
where
    T: serde::de::DeserializeOwned,
    I: Iterator<Item = rusqlite::Result<String>>,
{
    rows.map(|row| {
        let json = row?;
        serde_json::from_str(&json).context("Corrupt stored document")
    })
    .collect()
}

fn order_clause(sort: RecordSort) -> &'static str {
    match sort {
        RecordSort::CompositeDesc => "r.composite DESC, r.percentile_rank DESC",
        RecordSort::PercentileDesc => "r.percentile_rank DESC, r.symbol ASC",
        RecordSort::Symbol => "r.symbol ASC",
    }
}

const CURRENT_RECORDS_SQL: &str = r#"
    FROM stage_records r
    JOIN phase_generations g ON g.phase = r.phase AND g.generation = r.generation
    WHERE r.phase = ?1
      AND r.run_at = (
          SELECT MAX(x.run_at) FROM stage_records x
          WHERE x.phase = r.phase AND x.generation = r.generation AND x.symbol = r.symbol
      )
      AND (?2 = 0 OR r.qualifies = 1)
      AND (?3 IS NULL OR r.composite >= ?3)
"#;

#[async_trait]
impl QualificationStore for SqliteStore {
    async fn replace_all(&self, phase: Phase, run_id: &str, records: &[StageRecord]) -> Result<usize> {
        let mut db = self.db.lock().await;
        let tx = db.transaction().context("Failed to begin generation swap")?;

        let generation: i64 = tx.query_row(
            "SELECT COALESCE((SELECT generation FROM phase_generations WHERE phase = ?1), 0) + 1",
            params![phase.as_str()],
            |row| row.get(0),
        )?;

        {
            let mut stmt = tx.prepare(
                r#"
                INSERT OR REPLACE INTO stage_records
                (phase, generation, symbol, run_id, run_at, composite, percentile_rank,
                 filters_passed, qualifies, document)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
            )?;
            for record in records {
                stmt.execute(params![
                    phase.as_str(),
                    generation,
                    record.symbol,
                    record.run_id,
                    timestamp(&record.run_at),
                    record.composite,
                    record.percentile_rank,
                    record.filters_passed as i64,
                    record.qualifies,
                    serde_json::to_string(record)?,
                ])?;
            }
        }

        tx.execute(
            r#"
            INSERT OR REPLACE INTO phase_generations
            (phase, generation, run_id, record_count, replaced_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                phase.as_str(),
                generation,
                run_id,
                records.len() as i64,
                timestamp(&Utc::now()),
            ],
        )?;

        let dropped = tx.execute(
            "DELETE FROM stage_records WHERE phase = ?1 AND generation < ?2",
            params![phase.as_str(), generation],
        )?;

        tx.commit().context("Failed to commit generation swap")?;

        info!(
            phase = %phase,
            run_id = %run_id,
            generation,
            written = records.len(),
            dropped,
            "Replaced phase records"
        );
        Ok(records.len())
    }

    async fn find_latest_per_identifier(
        &self,
        phase: Phase,
        filter: &RecordFilter,
        sort: RecordSort,
    ) -> Result<Vec<StageRecord>> {
        let db = self.db.lock().await;
        let sql = format!(
            "SELECT r.document {CURRENT_RECORDS_SQL} ORDER BY {}",
            order_clause(sort)
        );
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt.query_map(
            params![phase.as_str(), filter.qualified_only, filter.min_composite],
            |row| row.get::<_, String>(0),
        )?;

        let mut records: Vec<StageRecord> = decode_documents(rows)?;
        if let Some(ref symbols) = filter.symbols {
            records.retain(|r| symbols.contains(&r.symbol));
        }
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn count(&self, phase: Phase, filter: &RecordFilter) -> Result<usize> {
        if filter.symbols.is_some() {
            let unlimited = RecordFilter {
                limit: None,
                ..filter.clone()
            };
            return Ok(self
                .find_latest_per_identifier(phase, &unlimited, RecordSort::Symbol)
                .await?
                .len());
        }

        let db = self.db.lock().await;
        let count: i64 = db.query_row(
            &format!("SELECT COUNT(*) {CURRENT_RECORDS_SQL}"),
            params![phase.as_str(), filter.qualified_only, filter.min_composite],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    async fn record_run(&self, entry: &RunAuditEntry) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            r#"
            INSERT INTO run_audit (run_id, kind, phase, success, recorded_at, document)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                entry.run_id,
                entry.kind.as_str(),
                entry.phase.map(|p| p.as_str()),
                entry.success,
                timestamp(&entry.recorded_at),
                serde_json::to_string(entry)?,
            ],
        )?;
        db.execute(
            "DELETE FROM run_audit WHERE id NOT IN
             (SELECT id FROM run_audit ORDER BY id DESC LIMIT ?1)",
            params![self.audit_retention as i64],
        )?;
        debug!(run_id = %entry.run_id, kind = entry.kind.as_str(), "Recorded run audit entry");
        Ok(())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunAuditEntry>> {
        let db = self.db.lock().await;
        let mut stmt =
            db.prepare("SELECT document FROM run_audit ORDER BY id DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;
        decode_documents(rows)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funnel::GateResult;
    use tempfile::tempdir;

    fn record(symbol: &str, composite: f64, qualifies: bool) -> StageRecord {
        StageRecord {
            symbol: symbol.to_string(),
            phase: Phase::Momentum,
            run_id: "run-1".to_string(),
            run_at: Utc::now(),
            metrics: serde_json::json!({ "return_3m": composite / 10.0 }),
            components: Vec::new(),
            composite,
            percentile_rank: composite,
            gates: vec![GateResult {
                name: "min_return".into(),
                passed: qualifies,
            }],
            filters_passed: usize::from(qualifies),
            required_minimum: 1,
            qualifies,
            context: serde_json::json!({ "regime": "bullish" }),
        }
    }

    #[tokio::test]
    async fn test_replace_and_read_sorted() {
        let store = SqliteStore::in_memory().unwrap();
        let records = vec![
            record("AAA", 40.0, false),
            record("BBB", 90.0, true),
            record("CCC", 70.0, true),
        ];
        assert_eq!(store.replace_all(Phase::Momentum, "run-1", &records).await.unwrap(), 3);

        let all = store
            .find_latest_per_identifier(Phase::Momentum, &RecordFilter::default(), RecordSort::CompositeDesc)
            .await
            .unwrap();
        let symbols: Vec<_> = all.iter().map(|r| r.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["BBB", "CCC", "AAA"]);
        assert_eq!(all[0], records[1]);

        let qualified = store
            .find_latest_per_identifier(Phase::Momentum, &RecordFilter::qualified(), RecordSort::Symbol)
            .await
            .unwrap();
        assert_eq!(qualified.len(), 2);
        assert_eq!(store.count(Phase::Momentum, &RecordFilter::qualified()).await.unwrap(), 2);
        assert_eq!(store.count(Phase::Universe, &RecordFilter::default()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_new_generation_replaces_old() {
        let store = SqliteStore::in_memory().unwrap();
        store
            .replace_all(Phase::Momentum, "run-1", &[record("AAA", 50.0, true), record("BBB", 60.0, true)])
            .await
            .unwrap();
        store
            .replace_all(Phase::Momentum, "run-2", &[record("CCC", 55.0, true)])
            .await
            .unwrap();

        let current = store
            .find_latest_per_identifier(Phase::Momentum, &RecordFilter::default(), RecordSort::Symbol)
            .await
            .unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].symbol, "CCC");

        let summaries = store.phase_summaries().await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].generation, 2);
        assert_eq!(summaries[0].run_id, "run-2");
        assert_eq!(summaries[0].qualified_count, 1);
    }

    #[tokio::test]
    async fn test_replace_is_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        let records = vec![record("AAA", 50.0, true), record("BBB", 20.0, false)];
        store.replace_all(Phase::Momentum, "run-1", &records).await.unwrap();
        let first = store
            .find_latest_per_identifier(Phase::Momentum, &RecordFilter::default(), RecordSort::Symbol)
            .await
            .unwrap();

        store.replace_all(Phase::Momentum, "run-1", &records).await.unwrap();
        let second = store
            .find_latest_per_identifier(Phase::Momentum, &RecordFilter::default(), RecordSort::Symbol)
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_empty_generation_clears_phase() {
        let store = SqliteStore::in_memory().unwrap();
        store.replace_all(Phase::Setup, "run-1", &[record("AAA", 50.0, true)]).await.unwrap();
        store.replace_all(Phase::Setup, "run-2", &[]).await.unwrap();
        assert_eq!(store.count(Phase::Setup, &RecordFilter::default()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_filters() {
        let store = SqliteStore::in_memory().unwrap();
        let records = vec![
            record("AAA", 10.0, true),
            record("BBB", 80.0, true),
            record("CCC", 60.0, true),
        ];
        store.replace_all(Phase::Momentum, "run-1", &records).await.unwrap();

        let filter = RecordFilter {
            min_composite: Some(50.0),
            ..Default::default()
        };
        assert_eq!(store.count(Phase::Momentum, &filter).await.unwrap(), 2);

        let filter = RecordFilter {
            symbols: Some(vec!["AAA".into(), "CCC".into()]),
            ..Default::default()
        }
        .limit(1);
        let found = store
            .find_latest_per_identifier(Phase::Momentum, &filter, RecordSort::CompositeDesc)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].symbol, "CCC");
        assert_eq!(store.count(Phase::Momentum, &filter).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_run_audit_retention() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("sieve.db"), 2).unwrap();
        for i in 0..3 {
            store
                .record_run(&RunAuditEntry::new(
                    format!("run-{i}"),
                    RunKind::Funnel,
                    None,
                    true,
                    serde_json::json!({ "i": i }),
                ))
                .await
                .unwrap();
        }
        let runs = store.recent_runs(10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, "run-2");
        assert_eq!(runs[1].run_id, "run-1");
    }

    #[tokio::test]
    async fn test_reopen_keeps_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("sieve.db");
        {
            let store = SqliteStore::open(&path, 10).unwrap();
            store.replace_all(Phase::Momentum, "run-1", &[record("AAA", 50.0, true)]).await.unwrap();
        }
        let store = SqliteStore::open(&path, 10).unwrap();
        assert_eq!(store.count(Phase::Momentum, &RecordFilter::default()).await.unwrap(), 1);
    }
}
