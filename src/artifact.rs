//! Published rankings artifact, backed by SQLite.
//!
//! The artifact is the pipeline's only durable output. Every file carries
//! the schema version it was written with, and readers refuse files whose
//! version they do not understand; silently reading a mismatched layout is
//! how downstream backtests go wrong quietly.

use chrono::NaiveDate;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::schema::SCHEMA_VERSION;
use crate::table::{QualityTier, RankingRecord, RankingTable};

#[derive(Debug)]
pub enum ArtifactError {
    Sqlite(rusqlite::Error),
    /// The file's embedded schema version is not ours.
    VersionMismatch { found: String, expected: String },
    /// Publishing an empty table is always a caller bug.
    EmptyTable,
    CorruptRow { detail: String },
}

impl fmt::Display for ArtifactError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqlite(e) => write!(f, "sqlite error: {e}"),
            Self::VersionMismatch { found, expected } => {
                write!(f, "artifact schema version '{found}' (expected '{expected}')")
            }
            Self::EmptyTable => write!(f, "refusing to publish an empty table"),
            Self::CorruptRow { detail } => write!(f, "corrupt artifact row: {detail}"),
        }
    }
}

impl std::error::Error for ArtifactError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sqlite(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for ArtifactError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

pub struct ArtifactStore {
    conn: Arc<Mutex<Connection>>,
}

impl ArtifactStore {
    /// Create a new artifact at `path`, or reuse one already at the current
    /// schema version. A pre-existing file at a different version is rejected
    /// before anything is written to it.
    pub fn create(path: &Path) -> Result<Self, ArtifactError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        if store.has_tables()? {
            store.check_version()?;
        }
        store.initialize_schema()?;
        Ok(store)
    }

    /// Open an existing artifact, rejecting unknown schema versions.
    pub fn open(path: &Path) -> Result<Self, ArtifactError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.check_version()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, ArtifactError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<(), ArtifactError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;

             CREATE TABLE IF NOT EXISTS schema_version (
                 version TEXT PRIMARY KEY
             );

             CREATE TABLE IF NOT EXISTS rankings (
                 date               TEXT NOT NULL,
                 coin_id            TEXT NOT NULL,
                 rank               INTEGER NOT NULL,
                 symbol             TEXT,
                 name               TEXT,
                 market_cap         REAL NOT NULL,
                 price              REAL NOT NULL,
                 volume_24h         REAL NOT NULL,
                 circulating_supply REAL,
                 source             TEXT NOT NULL,
                 quality_tier       TEXT NOT NULL,
                 PRIMARY KEY (date, coin_id)
             ) WITHOUT ROWID;

             CREATE INDEX IF NOT EXISTS idx_rankings_date_rank
                 ON rankings (date, rank);",
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
            params![SCHEMA_VERSION],
        )?;
        Ok(())
    }

    fn has_tables(&self) -> Result<bool, ArtifactError> {
        let conn = self.conn.lock();
        Ok(conn.query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table'",
            [],
            |row| row.get(0),
        )?)
    }

    fn check_version(&self) -> Result<(), ArtifactError> {
        let conn = self.conn.lock();
        let has_table: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master
             WHERE type = 'table' AND name = 'schema_version'",
            [],
            |row| row.get(0),
        )?;
        if !has_table {
            return Err(ArtifactError::VersionMismatch {
                found: "<unversioned>".to_string(),
                expected: SCHEMA_VERSION.to_string(),
            });
        }
        let found: String =
            conn.query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })?;
        if found != SCHEMA_VERSION {
            return Err(ArtifactError::VersionMismatch {
                found,
                expected: SCHEMA_VERSION.to_string(),
            });
        }
        Ok(())
    }

    /// Publish a table atomically: all rows land in one transaction, with
    /// upsert semantics per (date, coin_id).
    pub fn publish(&self, table: &RankingTable) -> Result<usize, ArtifactError> {
        if table.is_empty() {
            return Err(ArtifactError::EmptyTable);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO rankings
                 (date, coin_id, rank, symbol, name, market_cap, price,
                  volume_24h, circulating_supply, source, quality_tier)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for row in table.rows() {
                stmt.execute(params![
                    row.date.to_string(),
                    row.coin_id,
                    row.rank,
                    row.symbol,
                    row.name,
                    row.market_cap,
                    row.price,
                    row.volume_24h,
                    row.circulating_supply,
                    row.source,
                    row.quality_tier.as_str(),
                ])?;
            }
        }
        tx.commit()?;
        info!(rows = table.len(), "published rankings artifact");
        Ok(table.len())
    }

    /// Load every row for one date, in rank order.
    pub fn load_date(&self, date: NaiveDate) -> Result<RankingTable, ArtifactError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT date, coin_id, rank, symbol, name, market_cap, price,
                    volume_24h, circulating_supply, source, quality_tier
             FROM rankings WHERE date = ?1 ORDER BY rank",
        )?;
        let mut rows = Vec::new();
        let mapped = stmt.query_map(params![date.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, f64>(5)?,
                row.get::<_, f64>(6)?,
                row.get::<_, f64>(7)?,
                row.get::<_, Option<f64>>(8)?,
                row.get::<_, String>(9)?,
                row.get::<_, String>(10)?,
            ))
        })?;
        for row in mapped {
            let (date_s, coin_id, rank, symbol, name, market_cap, price, volume_24h, supply, source, tier_s) =
                row?;
            let date = NaiveDate::parse_from_str(&date_s, "%Y-%m-%d").map_err(|e| {
                ArtifactError::CorruptRow {
                    detail: format!("bad date '{date_s}': {e}"),
                }
            })?;
            let quality_tier =
                QualityTier::parse(&tier_s).ok_or_else(|| ArtifactError::CorruptRow {
                    detail: format!("unknown quality tier '{tier_s}'"),
                })?;
            rows.push(RankingRecord {
                date,
                rank,
                coin_id,
                symbol,
                name,
                market_cap,
                price,
                volume_24h,
                circulating_supply: supply,
                source,
                quality_tier,
            });
        }
        Ok(RankingTable::from_rows(rows))
    }

    /// Earliest and latest dates in the artifact, if any rows exist.
    pub fn date_range(&self) -> Result<Option<(NaiveDate, NaiveDate)>, ArtifactError> {
        let conn = self.conn.lock();
        let (min, max): (Option<String>, Option<String>) = conn.query_row(
            "SELECT MIN(date), MAX(date) FROM rankings",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        match (min, max) {
            (Some(min), Some(max)) => {
                let parse = |s: &str| {
                    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| {
                        ArtifactError::CorruptRow {
                            detail: format!("bad date '{s}': {e}"),
                        }
                    })
                };
                Ok(Some((parse(&min)?, parse(&max)?)))
            }
            _ => Ok(None),
        }
    }

    pub fn schema_version(&self) -> Result<String, ArtifactError> {
        let conn = self.conn.lock();
        Ok(conn.query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })?)
    }
}
