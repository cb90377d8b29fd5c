//! SQLite destination store.
//!
//! Full-table replacement is write-then-swap: rows go into
//! `{table}__incoming`, then the old table is dropped and the incoming one
//! renamed in the same transaction. Readers on other connections keep seeing
//! the previous table until commit, and a failure at any point leaves it
//! untouched.

use super::schema::{self, TableRow, TableSpec};
use crate::apis::dpe::DpeScope;
use crate::error::{PipelineError, Result};
use crate::types::DpeRecord;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

const INCOMING_SUFFIX: &str = "__incoming";

const MATERIALIZATIONS_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS materializations (
    step            TEXT NOT NULL,
    run_id          TEXT NOT NULL,
    materialized_at TEXT NOT NULL,
    metadata        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_materializations_step ON materializations (step, materialized_at);
"#;

/// One recorded step run.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterializationRecord {
    pub step: String,
    pub run_id: String,
    pub materialized_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(30))?;
        // journal_mode returns the resulting mode as a row
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        debug!("Opened store {} (journal_mode={})", path.display(), mode);
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        let store = Self { conn };
        store.create_tables()?;
        Ok(store)
    }

    /// Create every table and index that does not exist yet.
    pub fn create_tables(&self) -> Result<()> {
        for spec in schema::TABLES {
            self.conn.execute_batch(&spec.create_sql(spec.name))?;
            for sql in spec.index_sql() {
                self.conn.execute(&sql, [])?;
            }
        }
        self.conn.execute_batch(MATERIALIZATIONS_DDL)?;
        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn known_table(name: &str) -> Result<&'static TableSpec> {
        schema::table_spec(name).ok_or_else(|| PipelineError::Config(format!("unknown table: {name}")))
    }

    /// Row count of a catalogue table. Names outside the catalogue are rejected.
    pub fn count(&self, table: &str) -> Result<usize> {
        let spec = Self::known_table(table)?;
        let n: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", spec.name), [], |row| row.get(0))?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    pub fn read_all<R: TableRow>(&self) -> Result<Vec<R>> {
        let mut stmt = self.conn.prepare(&R::SPEC.select_sql())?;
        let rows = stmt.query_map([], |row| R::from_row(row))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Replace the whole table behind `R` with `rows` and return the new row
    /// count. On error the previous contents are kept.
    pub fn replace_table<R: TableRow>(&mut self, rows: &[R]) -> Result<usize> {
        let spec = R::SPEC;
        match self.swap_in(spec, rows) {
            Ok(count) => {
                info!("Replaced {} with {} rows", spec.name, count);
                Ok(count)
            }
            Err(e) => {
                warn!("Replacing {} failed, previous contents kept: {}", spec.name, e);
                Err(PipelineError::Load {
                    table: spec.name.to_string(),
                    rows: rows.len(),
                    message: e.to_string(),
                })
            }
        }
    }

    fn swap_in<R: TableRow>(&mut self, spec: &TableSpec, rows: &[R]) -> rusqlite::Result<usize> {
        let incoming = format!("{}{}", spec.name, INCOMING_SUFFIX);
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute_batch(&format!("DROP TABLE IF EXISTS {incoming}"))?;
        tx.execute_batch(&spec.create_sql(&incoming))?;
        {
            let mut stmt = tx.prepare(&spec.insert_sql(&incoming))?;
            for row in rows {
                stmt.execute(params_from_iter(row.values()))?;
            }
        }

        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {0}; ALTER TABLE {1} RENAME TO {0};",
            spec.name, incoming
        ))?;
        for sql in spec.index_sql() {
            tx.execute(&sql, [])?;
        }
        let count: i64 = tx.query_row(&format!("SELECT COUNT(*) FROM {}", spec.name), [], |r| r.get(0))?;
        tx.commit()?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Replace only the DPE rows of one commune or department. Rows outside
    /// the scope are dropped, so the same batch stored twice leaves the
    /// table unchanged. Returns the number of rows stored.
    pub fn replace_dpe_scope(&mut self, scope: &DpeScope, rows: &[DpeRecord]) -> Result<usize> {
        let spec = <DpeRecord as TableRow>::SPEC;
        let in_scope: Vec<&DpeRecord> = rows
            .iter()
            .filter(|r| scope.contains(r.code_commune.as_deref()))
            .collect();
        if in_scope.len() < rows.len() {
            debug!("DPE {}: {} rows outside the scope dropped", scope, rows.len() - in_scope.len());
        }

        let result = (|| -> rusqlite::Result<usize> {
            let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let deleted = match scope {
                DpeScope::Commune(code) => tx.execute("DELETE FROM dpe WHERE code_commune = ?1", params![code])?,
                // substr keeps the match case-sensitive and free of wildcards
                DpeScope::Department(code) => tx.execute(
                    "DELETE FROM dpe WHERE substr(code_commune, 1, length(?1)) = ?1",
                    params![code],
                )?,
            };
            {
                let mut stmt = tx.prepare(&spec.insert_sql(spec.name))?;
                for row in &in_scope {
                    stmt.execute(params_from_iter(row.values()))?;
                }
            }
            tx.commit()?;
            debug!("DPE {}: {} rows removed", scope, deleted);
            Ok(in_scope.len())
        })();

        result.map_err(|e| PipelineError::Load {
            table: spec.name.to_string(),
            rows: rows.len(),
            message: format!("{scope}: {e}"),
        })
    }

    pub fn record_materialization(&self, record: &MaterializationRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO materializations (step, run_id, materialized_at, metadata) VALUES (?1, ?2, ?3, ?4)",
            params![
                record.step,
                record.run_id,
                record.materialized_at.to_rfc3339_opts(SecondsFormat::Micros, true),
                serde_json::to_string(&record.metadata)?
            ],
        )?;
        Ok(())
    }

    pub fn last_materialization(&self, step: &str) -> Result<Option<MaterializationRecord>> {
        let raw = self
            .conn
            .query_row(
                "SELECT step, run_id, materialized_at, metadata FROM materializations
                 WHERE step = ?1 ORDER BY materialized_at DESC LIMIT 1",
                params![step],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((step, run_id, at, metadata)) = raw else {
            return Ok(None);
        };
        let materialized_at = DateTime::parse_from_rfc3339(&at)
            .map_err(|e| PipelineError::Parse(format!("materialized_at {at}: {e}")))?
            .with_timezone(&Utc);
        Ok(Some(MaterializationRecord {
            step,
            run_id,
            materialized_at,
            metadata: serde_json::from_str(&metadata)?,
        }))
    }
}
