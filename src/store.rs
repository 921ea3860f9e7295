//! Finished runs and comparisons on disk: one pretty JSON file per entity under
//! `<root>/<domain>/{runs,comparisons}/<id>.json`, plus a SQLite catalog at
//! `<root>/catalog.sqlite` used for listing and id lookup.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::model::{Comparison, Run};
use crate::util::{ensure_directory, now_utc_string, write_json_pretty};

pub const LATEST_ALIAS: &str = "latest";
pub const MIN_PREFIX_LEN: usize = 4;
const CATALOG_FILE: &str = "catalog.sqlite";

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub id: String,
    pub domain: String,
    pub system_name: String,
    pub query_set_name: String,
    pub status: String,
    pub query_count: usize,
    pub error_count: usize,
    pub completed_at: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComparisonSummary {
    pub id: String,
    pub domain: String,
    pub systems: Vec<String>,
    pub run_ids: Vec<String>,
    pub status: String,
    pub evaluation_count: usize,
    pub error_count: usize,
    pub created_at: String,
    pub path: String,
}

#[derive(Copy, Clone)]
enum EntityKind {
    Run,
    Comparison,
}

impl EntityKind {
    fn table(self) -> &'static str {
        match self {
            Self::Run => "runs",
            Self::Comparison => "comparisons",
        }
    }

    fn id_column(self) -> &'static str {
        match self {
            Self::Run => "run_id",
            Self::Comparison => "comparison_id",
        }
    }

    fn time_column(self) -> &'static str {
        match self {
            Self::Run => "completed_at",
            Self::Comparison => "created_at",
        }
    }

    fn directory(self) -> &'static str {
        self.table()
    }

    fn label(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Comparison => "comparison",
        }
    }
}

pub struct FileStore {
    root: PathBuf,
    domain_pattern: Regex,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        ensure_directory(&root)?;
        let domain_pattern =
            Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").context("failed to compile domain regex")?;

        let store = Self {
            root,
            domain_pattern,
        };
        let connection = store.connection()?;
        ensure_schema(&connection)?;
        debug!(root = %store.root.display(), "store opened");
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn save_run(&self, run: &Run) -> Result<PathBuf> {
        if !run.is_finished() {
            bail!("run {} is not finished (status {})", run.id, run.status);
        }
        let path = self.entity_path(EntityKind::Run, &run.domain, &run.id)?;
        write_json_pretty(&path, run)?;

        let completed_at = run.completed_at.map(catalog_time).unwrap_or_default();
        let connection = self.connection()?;
        connection
            .execute(
                "INSERT OR REPLACE INTO runs
                   (run_id, domain, system_name, query_set_name, status, query_count,
                    error_count, completed_at, path, saved_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    run.id,
                    run.domain,
                    run.system_name,
                    run.query_set_name,
                    run.status.as_str(),
                    run.results.len() as i64,
                    run.error_count() as i64,
                    completed_at,
                    path.display().to_string(),
                    now_utc_string(),
                ],
            )
            .with_context(|| format!("failed to catalog run {}", run.id))?;

        info!(run_id = %run.id, path = %path.display(), "run saved");
        Ok(path)
    }

    pub fn save_comparison(&self, comparison: &Comparison) -> Result<PathBuf> {
        let path = self.entity_path(EntityKind::Comparison, &comparison.domain, &comparison.id)?;
        write_json_pretty(&path, comparison)?;

        let error_count = comparison
            .evaluations
            .iter()
            .filter(|evaluation| evaluation.winner.is_error())
            .count();
        let systems = serde_json::to_string(&comparison.systems)
            .context("failed to serialize comparison systems")?;
        let run_ids = serde_json::to_string(&comparison.run_ids)
            .context("failed to serialize comparison run ids")?;

        let connection = self.connection()?;
        connection
            .execute(
                "INSERT OR REPLACE INTO comparisons
                   (comparison_id, domain, systems_json, run_ids_json, status,
                    evaluation_count, error_count, created_at, path, saved_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    comparison.id,
                    comparison.domain,
                    systems,
                    run_ids,
                    comparison.status().as_str(),
                    comparison.evaluations.len() as i64,
                    error_count as i64,
                    catalog_time(comparison.timestamp),
                    path.display().to_string(),
                    now_utc_string(),
                ],
            )
            .with_context(|| format!("failed to catalog comparison {}", comparison.id))?;

        info!(comparison_id = %comparison.id, path = %path.display(), "comparison saved");
        Ok(path)
    }

    /// `key` is a full id, `latest`, or a unique id prefix of at least four characters.
    pub fn load_run(&self, domain: &str, key: &str) -> Result<Run> {
        let id = self.resolve_id(EntityKind::Run, domain, key)?;
        self.read_entity(EntityKind::Run, domain, &id)
    }

    pub fn load_comparison(&self, domain: &str, key: &str) -> Result<Comparison> {
        let id = self.resolve_id(EntityKind::Comparison, domain, key)?;
        self.read_entity(EntityKind::Comparison, domain, &id)
    }

    /// Newest first. `None` lists every domain.
    pub fn list_runs(&self, domain: Option<&str>) -> Result<Vec<RunSummary>> {
        let connection = self.connection()?;
        let mut statement = connection.prepare(
            "SELECT run_id, domain, system_name, query_set_name, status, query_count,
                    error_count, completed_at, path
             FROM runs
             WHERE ?1 IS NULL OR domain = ?1
             ORDER BY completed_at DESC, rowid DESC",
        )?;
        let rows = statement.query_map(params![domain], |row| {
            Ok(RunSummary {
                id: row.get(0)?,
                domain: row.get(1)?,
                system_name: row.get(2)?,
                query_set_name: row.get(3)?,
                status: row.get(4)?,
                query_count: row.get::<_, i64>(5)? as usize,
                error_count: row.get::<_, i64>(6)? as usize,
                completed_at: row.get(7)?,
                path: row.get(8)?,
            })
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row.context("failed to read run catalog row")?);
        }
        Ok(summaries)
    }

    pub fn list_comparisons(&self, domain: Option<&str>) -> Result<Vec<ComparisonSummary>> {
        let connection = self.connection()?;
        let mut statement = connection.prepare(
            "SELECT comparison_id, domain, systems_json, run_ids_json, status,
                    evaluation_count, error_count, created_at, path
             FROM comparisons
             WHERE ?1 IS NULL OR domain = ?1
             ORDER BY created_at DESC, rowid DESC",
        )?;
        let rows = statement.query_map(params![domain], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            let (id, domain, systems, run_ids, status, evaluations, errors, created_at, path) =
                row.context("failed to read comparison catalog row")?;
            summaries.push(ComparisonSummary {
                systems: serde_json::from_str(&systems)
                    .with_context(|| format!("bad systems list for comparison {id}"))?,
                run_ids: serde_json::from_str(&run_ids)
                    .with_context(|| format!("bad run id list for comparison {id}"))?,
                id,
                domain,
                status,
                evaluation_count: evaluations as usize,
                error_count: errors as usize,
                created_at,
                path,
            });
        }
        Ok(summaries)
    }

    fn connection(&self) -> Result<Connection> {
        let path = self.root.join(CATALOG_FILE);
        let connection = Connection::open(&path)
            .with_context(|| format!("failed to open catalog: {}", path.display()))?;
        configure_connection(&connection)?;
        Ok(connection)
    }

    fn entity_path(&self, kind: EntityKind, domain: &str, id: &str) -> Result<PathBuf> {
        if !self.domain_pattern.is_match(domain) {
            bail!("domain '{domain}' cannot be used as a storage directory name");
        }
        if id.is_empty() || !id.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '-') {
            bail!("{} id '{id}' contains unsupported characters", kind.label());
        }
        Ok(self
            .root
            .join(domain)
            .join(kind.directory())
            .join(format!("{id}.json")))
    }

    fn read_entity<T: DeserializeOwned>(&self, kind: EntityKind, domain: &str, id: &str) -> Result<T> {
        let path = self.entity_path(kind, domain, id)?;
        let raw = fs::read(&path)
            .with_context(|| format!("failed to read {} file: {}", kind.label(), path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse {} file: {}", kind.label(), path.display()))
    }

    fn resolve_id(&self, kind: EntityKind, domain: &str, key: &str) -> Result<String> {
        let key = key.trim();
        let connection = self.connection()?;
        let table = kind.table();
        let id_column = kind.id_column();

        if key.eq_ignore_ascii_case(LATEST_ALIAS) {
            let sql = format!(
                "SELECT {id_column} FROM {table} WHERE domain = ?1
                 ORDER BY {} DESC, rowid DESC LIMIT 1",
                kind.time_column()
            );
            return connection
                .query_row(&sql, params![domain], |row| row.get::<_, String>(0))
                .optional()?
                .with_context(|| format!("no {} stored for domain '{domain}'", kind.table()));
        }

        let exact_sql = format!("SELECT {id_column} FROM {table} WHERE domain = ?1 AND {id_column} = ?2");
        if let Some(id) = connection
            .query_row(&exact_sql, params![domain, key], |row| row.get::<_, String>(0))
            .optional()?
        {
            return Ok(id);
        }

        if key.chars().count() < MIN_PREFIX_LEN {
            bail!(
                "{} '{key}' not found in domain '{domain}' (prefixes need at least {MIN_PREFIX_LEN} characters)",
                kind.label()
            );
        }

        let prefix_sql = format!(
            "SELECT {id_column} FROM {table}
             WHERE domain = ?1 AND substr({id_column}, 1, length(?2)) = ?2
             ORDER BY {id_column}"
        );
        let mut statement = connection.prepare(&prefix_sql)?;
        let candidates = statement
            .query_map(params![domain, key], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()
            .with_context(|| format!("failed to look up {} prefix '{key}'", kind.label()))?;

        match candidates.as_slice() {
            [] => bail!("{} '{key}' not found in domain '{domain}'", kind.label()),
            [id] => Ok(id.clone()),
            many => bail!(
                "{} prefix '{key}' is ambiguous in domain '{domain}': {}",
                kind.label(),
                many.join(", ")
            ),
        }
    }
}

fn catalog_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    Ok(())
}

fn ensure_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
            CREATE TABLE IF NOT EXISTS runs (
              run_id TEXT PRIMARY KEY,
              domain TEXT NOT NULL,
              system_name TEXT NOT NULL,
              query_set_name TEXT NOT NULL,
              status TEXT NOT NULL,
              query_count INTEGER NOT NULL,
              error_count INTEGER NOT NULL,
              completed_at TEXT NOT NULL,
              path TEXT NOT NULL,
              saved_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_runs_domain ON runs(domain, completed_at);

            CREATE TABLE IF NOT EXISTS comparisons (
              comparison_id TEXT PRIMARY KEY,
              domain TEXT NOT NULL,
              systems_json TEXT NOT NULL,
              run_ids_json TEXT NOT NULL,
              status TEXT NOT NULL,
              evaluation_count INTEGER NOT NULL,
              error_count INTEGER NOT NULL,
              created_at TEXT NOT NULL,
              path TEXT NOT NULL,
              saved_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_comparisons_domain ON comparisons(domain, created_at);
            ",
        )
        .context("failed to create catalog schema")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use chrono::Duration;
    use serde_json::json;

    use crate::model::{
        Evaluation, Metadata, Query, QueryResult, QuerySet, RetrievedChunk, RunStatus, Winner,
    };

    fn run(id: &str, domain: &str, completed_offset_secs: i64) -> Run {
        let query = Query::new("What is zakat?").unwrap();
        let query_set = QuerySet::new("pillars", domain, vec![query.clone()]).unwrap();
        let completed = Utc::now() + Duration::seconds(completed_offset_secs);
        Run {
            id: id.to_string(),
            domain: domain.to_string(),
            system_name: "bm25".to_string(),
            query_set_name: "pillars".to_string(),
            status: RunStatus::Completed,
            results: vec![QueryResult::success(
                query,
                vec![RetrievedChunk::new("Zakat is obligatory alms.", 2.0)],
                5,
            )],
            system_config_snapshot: json!({"name": "bm25", "backend": "sqlite_fts"}),
            query_set_snapshot: query_set,
            started_at: Some(completed - Duration::seconds(1)),
            completed_at: Some(completed),
            metadata: Metadata::new(),
        }
    }

    fn comparison(id: &str, runs: &[&Run]) -> Comparison {
        Comparison {
            id: id.to_string(),
            domain: runs[0].domain.clone(),
            run_ids: runs.iter().map(|run| run.id.clone()).collect(),
            systems: vec!["bm25".to_string(), "dense".to_string()],
            evaluations: vec![Evaluation {
                query: "What is zakat?".to_string(),
                reference: None,
                per_system_results: BTreeMap::new(),
                winner: Winner::Error,
                scores: BTreeMap::new(),
                analysis: "judge failed".to_string(),
                metadata: Metadata::new(),
            }],
            evaluator_config_snapshot: json!({"name": "default-judge"}),
            timestamp: Utc::now(),
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn saved_run_round_trips_by_exact_id_prefix_and_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let older = run("abcd1111", "fiqh", -60);
        let newer = run("ef992222", "fiqh", 0);

        let path = store.save_run(&older).unwrap();
        assert!(path.ends_with("fiqh/runs/abcd1111.json"));
        store.save_run(&newer).unwrap();

        assert_eq!(store.load_run("fiqh", "abcd1111").unwrap().id, "abcd1111");
        assert_eq!(store.load_run("fiqh", "ef99").unwrap().id, "ef992222");
        assert_eq!(store.load_run("fiqh", "latest").unwrap().id, "ef992222");

        let loaded = store.load_run("fiqh", "abcd").unwrap();
        assert_eq!(loaded.results, older.results);
        assert_eq!(loaded.query_set_snapshot, older.query_set_snapshot);
    }

    #[test]
    fn ambiguous_and_short_prefixes_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.save_run(&run("abcd1111", "fiqh", 0)).unwrap();
        store.save_run(&run("abcd2222", "fiqh", 1)).unwrap();

        let err = store.load_run("fiqh", "abcd").unwrap_err().to_string();
        assert!(err.contains("ambiguous"));
        assert!(err.contains("abcd1111") && err.contains("abcd2222"));

        let err = store.load_run("fiqh", "abc").unwrap_err().to_string();
        assert!(err.contains("at least 4"));

        assert!(store.load_run("hadith", "latest").is_err());
    }

    #[test]
    fn unfinished_runs_and_unsafe_domains_are_not_saved() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let mut pending = run("abcd1111", "fiqh", 0);
        pending.status = RunStatus::Running;
        pending.completed_at = None;
        assert!(store.save_run(&pending).is_err());

        assert!(store.save_run(&run("abcd2222", "../escape", 0)).is_err());
        assert!(store.list_runs(None).unwrap().is_empty());
    }

    #[test]
    fn listings_filter_by_domain_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.save_run(&run("aaaa0001", "fiqh", -120)).unwrap();
        store.save_run(&run("aaaa0002", "fiqh", 0)).unwrap();
        store.save_run(&run("bbbb0001", "hadith", 0)).unwrap();

        let fiqh = store.list_runs(Some("fiqh")).unwrap();
        let ids = fiqh.iter().map(|summary| summary.id.as_str()).collect::<Vec<&str>>();
        assert_eq!(ids, vec!["aaaa0002", "aaaa0001"]);
        assert_eq!(fiqh[0].status, "completed");
        assert_eq!(fiqh[0].query_count, 1);

        assert_eq!(store.list_runs(None).unwrap().len(), 3);
    }

    #[test]
    fn comparisons_are_saved_listed_and_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let first = run("abcd1111", "fiqh", 0);
        let second = run("ef992222", "fiqh", 0);
        let saved = comparison("c0ffee01", &[&first, &second]);

        store.save_comparison(&saved).unwrap();

        let summaries = store.list_comparisons(Some("fiqh")).unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].run_ids, vec!["abcd1111", "ef992222"]);
        assert_eq!(summaries[0].status, "failed");
        assert_eq!(summaries[0].error_count, 1);

        let loaded = store.load_comparison("fiqh", "c0ff").unwrap();
        assert_eq!(loaded.systems, saved.systems);
        assert_eq!(loaded.evaluations[0].winner, Winner::Error);
    }

    #[test]
    fn reopening_keeps_the_catalog() {
        let dir = tempfile::tempdir().unwrap();
        FileStore::open(dir.path())
            .unwrap()
            .save_run(&run("abcd1111", "fiqh", 0))
            .unwrap();

        let reopened = FileStore::open(dir.path()).unwrap();
        assert_eq!(reopened.load_run("fiqh", "latest").unwrap().id, "abcd1111");
    }
}
