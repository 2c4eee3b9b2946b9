use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use narrative_tagger_core::Record;
use narrative_tagger_store::{SourceRow, TabularSource, COLUMNS};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS narrative_records (
  topic TEXT NOT NULL DEFAULT '',
  narrative TEXT NOT NULL DEFAULT '',
  story TEXT NOT NULL DEFAULT '',
  link TEXT NOT NULL UNIQUE,
  tagger_1 TEXT NOT NULL DEFAULT '',
  tagger_1_result TEXT NOT NULL DEFAULT '',
  tagger_2 TEXT NOT NULL DEFAULT '',
  tagger_2_result TEXT NOT NULL DEFAULT ''
);
";

const SELECT_ROWS_SQL: &str = r"
SELECT topic, narrative, story, link, tagger_1, tagger_1_result, tagger_2, tagger_2_result
FROM narrative_records
ORDER BY rowid ASC
";

const UPSERT_ROW_SQL: &str = r"
INSERT INTO narrative_records(
  topic, narrative, story, link, tagger_1, tagger_1_result, tagger_2, tagger_2_result
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
ON CONFLICT(link) DO UPDATE SET
  topic = excluded.topic,
  narrative = excluded.narrative,
  story = excluded.story,
  tagger_1 = excluded.tagger_1,
  tagger_1_result = excluded.tagger_1_result,
  tagger_2 = excluded.tagger_2,
  tagger_2_result = excluded.tagger_2_result
";

/// Flat narrative table stored in SQLite. One row per link, cells kept as
/// plain text so hand-edited legacy values survive until the sync boundary
/// coerces them.
#[derive(Debug)]
pub struct SqliteTable {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteTable {
    /// Open the database, configure runtime pragmas, and apply migrations.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened, pragmas cannot be
    /// applied, or the schema cannot be migrated.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        let table = Self { path: path.to_path_buf(), conn: Mutex::new(conn) };
        table.migrate()?;
        Ok(table)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when bootstrapping or any migration step fails, or the
    /// database carries a newer schema than this build understands.
    pub fn migrate(&self) -> Result<()> {
        let mut conn = self.lock();
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        if version < 1 {
            let tx = conn.transaction().context("failed to start migration transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration 001")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration 001")?;
            tracing::info!(path = %self.path.display(), version = 1, "applied sqlite migration");
        }

        Ok(())
    }

    /// # Errors
    /// Returns an error when schema metadata cannot be read.
    pub fn schema_version(&self) -> Result<i64> {
        current_schema_version(&self.lock())
    }

    /// Store `row` exactly as given, without validation. Used to import sheet
    /// exports that may still carry legacy cells.
    ///
    /// # Errors
    /// Returns an error when the row has no link or the insert fails.
    pub fn insert_raw_row(&self, row: &SourceRow) -> Result<()> {
        let values = row.to_values();
        if values[3].trim().is_empty() {
            return Err(anyhow!("raw row is missing a link"));
        }

        self.lock()
            .execute(UPSERT_ROW_SQL, rusqlite::params_from_iter(values.iter()))
            .with_context(|| format!("failed to insert raw row for {}", values[3]))?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn row_count(&self) -> Result<usize> {
        let count = self
            .lock()
            .query_row("SELECT COUNT(*) FROM narrative_records", [], |row| row.get::<_, i64>(0))
            .context("failed to count narrative rows")?;
        usize::try_from(count).context("row count out of range")
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

impl TabularSource for SqliteTable {
    fn fetch_all_rows(&self) -> Result<Vec<SourceRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(SELECT_ROWS_SQL).context("failed to prepare row query")?;
        let rows = stmt
            .query_map([], |row| {
                let mut cells = Vec::with_capacity(COLUMNS.len());
                for (index, column) in COLUMNS.iter().enumerate() {
                    cells.push((*column, row.get::<_, String>(index)?));
                }
                Ok(SourceRow::from_pairs(cells))
            })
            .context("failed to query narrative rows")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to decode narrative row")?);
        }
        Ok(out)
    }

    fn append_or_update_row(&self, record: &Record) -> Result<()> {
        let values = SourceRow::from_record(record).to_values();
        self.lock()
            .execute(UPSERT_ROW_SQL, rusqlite::params_from_iter(values.iter()))
            .with_context(|| format!("failed to upsert row for {}", record.link))?;
        Ok(())
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}
