//! SQLite-backed experiment catalog.
//!
//! [`ExperimentCatalog`] owns the connection and answers queries over
//! committed data; [`Session`] stages one experiment and writes it in a
//! single transaction. A session mutably borrows its catalog, so the borrow
//! checker enforces the single-writer, commit-before-query flow.

#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeMap;
use std::path::Path;

use runledger_core::{
    format_rfc3339, now_utc, ExperimentDraft, ExperimentId, ExperimentRecord, ExperimentSummary,
    LedgerError, SortOrder,
};
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;

type Result<T> = std::result::Result<T, LedgerError>;

const LEDGER_MIGRATION_VERSION: i64 = 1;

const SCHEMA_LEDGER_V1: &str = r"
CREATE TABLE IF NOT EXISTS experiments (
  experiment_id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL CHECK (length(trim(name)) > 0),
  comment TEXT,
  recorded_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS parameters (
  parameter_id INTEGER PRIMARY KEY AUTOINCREMENT,
  experiment_id INTEGER NOT NULL REFERENCES experiments(experiment_id),
  name TEXT NOT NULL,
  value TEXT NOT NULL,
  UNIQUE (experiment_id, name)
);

CREATE TABLE IF NOT EXISTS outputs (
  output_id INTEGER PRIMARY KEY AUTOINCREMENT,
  experiment_id INTEGER NOT NULL REFERENCES experiments(experiment_id),
  label TEXT NOT NULL,
  path TEXT NOT NULL,
  UNIQUE (experiment_id, label)
);

CREATE TABLE IF NOT EXISTS scores (
  score_id INTEGER PRIMARY KEY AUTOINCREMENT,
  experiment_id INTEGER NOT NULL REFERENCES experiments(experiment_id),
  label TEXT NOT NULL,
  value REAL NOT NULL,
  UNIQUE (experiment_id, label)
);

CREATE TABLE IF NOT EXISTS features (
  feature_id INTEGER PRIMARY KEY AUTOINCREMENT,
  experiment_id INTEGER NOT NULL REFERENCES experiments(experiment_id),
  name TEXT NOT NULL,
  value TEXT NOT NULL,
  UNIQUE (experiment_id, name)
);

CREATE INDEX IF NOT EXISTS idx_scores_label_value
  ON scores(label, value);
";

fn storage(err: rusqlite::Error) -> LedgerError {
    LedgerError::Storage(err.to_string())
}

/// Long-lived handle over one catalog location. Opening is idempotent:
/// the schema batch only creates what is absent and never rewrites rows.
pub struct ExperimentCatalog {
    conn: Connection,
}

impl ExperimentCatalog {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|err| {
            LedgerError::StorageUnavailable(format!(
                "failed to open catalog at {}: {err}",
                path.display()
            ))
        })?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|err| {
            LedgerError::StorageUnavailable(format!("failed to configure sqlite pragmas: {err}"))
        })?;

        let catalog = Self { conn };
        catalog.migrate()?;
        Ok(catalog)
    }

    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .map_err(storage)?;

        self.conn.execute_batch(SCHEMA_LEDGER_V1).map_err(storage)?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![LEDGER_MIGRATION_VERSION, now],
            )
            .map_err(storage)?;

        Ok(())
    }

    /// Starts a session staging one new experiment. Nothing is written until
    /// [`Session::commit`]; dropping the session discards the staged data.
    pub fn begin(
        &mut self,
        name: &str,
        comment: Option<&str>,
        recorded_at: Option<OffsetDateTime>,
    ) -> Result<Session<'_>> {
        let draft = ExperimentDraft::new(name, comment, recorded_at)?;
        Ok(Session {
            catalog: self,
            draft,
            committed: None,
        })
    }

    /// Committed experiments ranked by the score stored under `score_label`.
    ///
    /// Experiments lacking that score are excluded. Ties are broken by
    /// ascending experiment id, so the ordering is reproducible. The result
    /// is materialized eagerly and recomputed from current store state on
    /// every call. Fails with [`LedgerError::UnknownScoreLabel`] when no
    /// score row anywhere in the store carries the label.
    pub fn best_experiments(
        &self,
        score_label: &str,
        order: SortOrder,
        limit: Option<usize>,
    ) -> Result<Vec<ExperimentRecord>> {
        let labeled: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM scores WHERE label = ?1",
                params![score_label],
                |row| row.get(0),
            )
            .map_err(storage)?;
        if labeled == 0 {
            return Err(LedgerError::UnknownScoreLabel(score_label.to_string()));
        }

        let mut query = format!(
            "SELECT experiment_id FROM scores
             WHERE label = ?1
             ORDER BY value {}, experiment_id ASC",
            order.sql_direction()
        );
        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self.conn.prepare(&query).map_err(storage)?;
        let ids = stmt
            .query_map(params![score_label], |row| row.get::<_, ExperimentId>(0))
            .map_err(storage)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage)?;

        let mut records = Vec::with_capacity(ids.len());
        for experiment_id in ids {
            let record = self.get_experiment(experiment_id)?.ok_or_else(|| {
                LedgerError::Storage(format!(
                    "score row references missing experiment {experiment_id}"
                ))
            })?;
            records.push(record);
        }
        Ok(records)
    }

    /// Direct lookup of one committed experiment with all child records.
    /// An experiment committed without scores comes back with an empty score
    /// map even though ranking queries never return it.
    pub fn get_experiment(&self, experiment_id: ExperimentId) -> Result<Option<ExperimentRecord>> {
        let summary = self
            .conn
            .query_row(
                "SELECT experiment_id, name, comment, recorded_at
                 FROM experiments
                 WHERE experiment_id = ?1",
                params![experiment_id],
                parse_summary_row,
            )
            .optional()
            .map_err(storage)?;

        let Some(experiment) = summary else {
            return Ok(None);
        };

        Ok(Some(ExperimentRecord {
            experiment,
            parameters: self.text_children(
                "SELECT name, value FROM parameters WHERE experiment_id = ?1",
                experiment_id,
            )?,
            outputs: self.text_children(
                "SELECT label, path FROM outputs WHERE experiment_id = ?1",
                experiment_id,
            )?,
            scores: self.score_children(experiment_id)?,
            features: self.text_children(
                "SELECT name, value FROM features WHERE experiment_id = ?1",
                experiment_id,
            )?,
        }))
    }

    /// All committed experiments, id ascending.
    pub fn list_experiments(&self) -> Result<Vec<ExperimentSummary>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT experiment_id, name, comment, recorded_at
                 FROM experiments
                 ORDER BY experiment_id ASC",
            )
            .map_err(storage)?;

        let rows = stmt.query_map([], parse_summary_row).map_err(storage)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(storage)
    }

    fn text_children(
        &self,
        query: &str,
        experiment_id: ExperimentId,
    ) -> Result<BTreeMap<String, String>> {
        let mut stmt = self.conn.prepare(query).map_err(storage)?;
        let rows = stmt
            .query_map(params![experiment_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(storage)?;
        rows.collect::<rusqlite::Result<BTreeMap<_, _>>>()
            .map_err(storage)
    }

    fn score_children(&self, experiment_id: ExperimentId) -> Result<BTreeMap<String, f64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT label, value FROM scores WHERE experiment_id = ?1")
            .map_err(storage)?;
        let rows = stmt
            .query_map(params![experiment_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })
            .map_err(storage)?;
        rows.collect::<rusqlite::Result<BTreeMap<_, _>>>()
            .map_err(storage)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn parse_summary_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExperimentSummary> {
    Ok(ExperimentSummary {
        experiment_id: row.get(0)?,
        name: row.get(1)?,
        comment: row.get(2)?,
        recorded_at: row.get(3)?,
    })
}

/// In-memory staging for one experiment. Add-operations may be called any
/// number of times in any order before [`Session::commit`]; afterwards every
/// call fails with [`LedgerError::SessionClosed`]. Commit is final: amending
/// a run means a new session and a new experiment id.
pub struct Session<'c> {
    catalog: &'c mut ExperimentCatalog,
    draft: ExperimentDraft,
    committed: Option<ExperimentId>,
}

impl Session<'_> {
    fn ensure_open(&self) -> Result<()> {
        match self.committed {
            Some(experiment_id) => Err(LedgerError::SessionClosed(experiment_id)),
            None => Ok(()),
        }
    }

    pub fn set_parameters<I, K, V>(&mut self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        self.ensure_open()?;
        self.draft.merge_parameters(entries);
        Ok(())
    }

    pub fn set_outputs<I, K, V>(&mut self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        self.ensure_open()?;
        self.draft.merge_outputs(entries);
        Ok(())
    }

    pub fn set_scores<I, K, V>(&mut self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        self.ensure_open()?;
        self.draft.merge_scores(entries)
    }

    pub fn set_features<I, K, V>(&mut self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        self.ensure_open()?;
        self.draft.merge_features(entries);
        Ok(())
    }

    #[must_use]
    pub fn draft(&self) -> &ExperimentDraft {
        &self.draft
    }

    #[must_use]
    pub fn committed_id(&self) -> Option<ExperimentId> {
        self.committed
    }

    /// Writes the experiment row and every staged child row in one
    /// transaction, returning the assigned experiment id. Readers observe
    /// all of the experiment's rows or none. A second call fails with
    /// [`LedgerError::SessionClosed`] and writes nothing.
    pub fn commit(&mut self) -> Result<ExperimentId> {
        self.ensure_open()?;

        let recorded_at = format_rfc3339(self.draft.recorded_at())?;
        let tx = self.catalog.conn.transaction().map_err(storage)?;

        tx.execute(
            "INSERT INTO experiments(name, comment, recorded_at) VALUES (?1, ?2, ?3)",
            params![self.draft.name(), self.draft.comment(), recorded_at],
        )
        .map_err(storage)?;
        let experiment_id = tx.last_insert_rowid();

        for (name, value) in self.draft.parameters() {
            tx.execute(
                "INSERT INTO parameters(experiment_id, name, value) VALUES (?1, ?2, ?3)",
                params![experiment_id, name, value],
            )
            .map_err(storage)?;
        }
        for (label, path) in self.draft.outputs() {
            tx.execute(
                "INSERT INTO outputs(experiment_id, label, path) VALUES (?1, ?2, ?3)",
                params![experiment_id, label, path],
            )
            .map_err(storage)?;
        }
        for (label, value) in self.draft.scores() {
            tx.execute(
                "INSERT INTO scores(experiment_id, label, value) VALUES (?1, ?2, ?3)",
                params![experiment_id, label, value],
            )
            .map_err(storage)?;
        }
        for (name, value) in self.draft.features() {
            tx.execute(
                "INSERT INTO features(experiment_id, name, value) VALUES (?1, ?2, ?3)",
                params![experiment_id, name, value],
            )
            .map_err(storage)?;
        }

        tx.commit().map_err(storage)?;
        self.committed = Some(experiment_id);
        Ok(experiment_id)
    }
}
