use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use super::Retriever;
use crate::config::SystemConfig;
use crate::error::EngineError;
use crate::model::RetrievedChunk;
use crate::util::condense_whitespace;

pub const BACKEND_NAME: &str = "sqlite_fts";

const DEFAULT_CONTENT_TABLE: &str = "chunks";
const DEFAULT_FTS_TABLE: &str = "chunks_fts";

/// BM25 search over an FTS5 index laid out as `chunks` + `chunks_fts`.
///
/// rusqlite connections are not `Sync`; queries are serialized through a mutex
/// and run on the blocking pool.
pub struct SqliteFtsRetriever {
    connection: Arc<Mutex<Connection>>,
    db_path: PathBuf,
    content_table: String,
    fts_table: String,
}

impl SqliteFtsRetriever {
    pub fn open(db_path: &Path, content_table: &str, fts_table: &str) -> Result<Self> {
        ensure_identifier(content_table)?;
        ensure_identifier(fts_table)?;

        let connection = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open database read-only: {}", db_path.display()))?;

        for table in [content_table, fts_table] {
            let exists = connection
                .query_row(
                    "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1 LIMIT 1",
                    [table],
                    |row| row.get::<_, String>(0),
                )
                .optional()?
                .is_some();
            if !exists {
                bail!("table '{table}' is missing from {}", db_path.display());
            }
        }

        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
            db_path: db_path.to_path_buf(),
            content_table: content_table.to_string(),
            fts_table: fts_table.to_string(),
        })
    }

    pub fn from_config(config: &SystemConfig) -> Result<Self, EngineError> {
        let db_path = PathBuf::from(config.require_str("db_path")?);
        let content_table = config
            .option_str("content_table")
            .unwrap_or(DEFAULT_CONTENT_TABLE);
        let fts_table = config.option_str("fts_table").unwrap_or(DEFAULT_FTS_TABLE);

        Self::open(&db_path, content_table, fts_table)
            .map_err(|err| EngineError::run(format!("{err:#}")))
    }

    fn source_id(&self) -> String {
        self.db_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Retriever for SqliteFtsRetriever {
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedChunk>> {
        let fts_query = to_fts_query(query);
        if fts_query.is_empty() {
            bail!("query has no searchable terms");
        }

        let connection = Arc::clone(&self.connection);
        let sql = format!(
            "
            SELECT
              c.chunk_id,
              c.doc_id,
              COALESCE(c.heading, ''),
              COALESCE(c.text, ''),
              bm25({fts})
            FROM {fts}
            JOIN {content} c ON c.rowid = {fts}.rowid
            WHERE {fts} MATCH ?1
            ORDER BY bm25({fts}) ASC
            LIMIT ?2
            ",
            fts = self.fts_table,
            content = self.content_table,
        );
        let source_id = self.source_id();

        tokio::task::spawn_blocking(move || {
            let connection = connection
                .lock()
                .map_err(|_| anyhow!("sqlite connection lock poisoned"))?;
            query_fts(&connection, &sql, &fts_query, top_k, &source_id)
        })
        .await
        .context("sqlite search task failed")?
    }
}

fn query_fts(
    connection: &Connection,
    sql: &str,
    fts_query: &str,
    top_k: usize,
    source_id: &str,
) -> Result<Vec<RetrievedChunk>> {
    let mut statement = connection.prepare_cached(sql)?;
    let mut rows = statement.query(params![fts_query, top_k as i64])?;

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let chunk_id: String = row.get(0)?;
        let doc_id: String = row.get(1)?;
        let heading: String = row.get(2)?;
        let text: String = row.get(3)?;
        let bm25: f64 = row.get(4)?;

        let content = if heading.is_empty() {
            condense_whitespace(&text)
        } else {
            format!("{heading}\n{}", condense_whitespace(&text))
        };

        out.push(
            RetrievedChunk::new(content, -bm25)
                .with_metadata("source_id", source_id)
                .with_metadata("doc_id", doc_id)
                .with_metadata("chunk_id", chunk_id),
        );
    }

    Ok(out)
}

fn to_fts_query(query_text: &str) -> String {
    query_text
        .split_whitespace()
        .map(|token| token.replace('"', ""))
        .filter(|token| !token.trim().is_empty())
        .map(|token| format!("\"{token}\""))
        .collect::<Vec<String>>()
        .join(" OR ")
}

fn ensure_identifier(name: &str) -> Result<()> {
    let pattern = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$")?;
    if !pattern.is_match(name) {
        bail!("invalid sqlite table name: {name}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn seed_index(path: &Path) {
        let connection = Connection::open(path).unwrap();
        connection
            .execute_batch(
                "
                CREATE TABLE chunks (
                  chunk_id TEXT PRIMARY KEY,
                  doc_id TEXT NOT NULL,
                  heading TEXT,
                  text TEXT
                );
                CREATE VIRTUAL TABLE chunks_fts
                USING fts5(chunk_id, doc_id, heading, text, content='chunks', content_rowid='rowid');
                INSERT INTO chunks(chunk_id, doc_id, heading, text) VALUES
                  ('c1', 'fiqh-1', 'Zakat', 'Zakat is the obligatory alms paid on qualifying wealth.'),
                  ('c2', 'fiqh-1', 'Hajj', 'Hajj is the pilgrimage to Makkah performed in Dhul Hijjah.'),
                  ('c3', 'fiqh-2', 'Sawm', 'Fasting during Ramadan from dawn until sunset.');
                INSERT INTO chunks_fts(chunks_fts) VALUES('rebuild');
                ",
            )
            .unwrap();
    }

    #[test]
    fn to_fts_query_quotes_tokens_and_strips_quotes() {
        assert_eq!(to_fts_query("what \"is\" zakat"), "\"what\" OR \"is\" OR \"zakat\"");
        assert_eq!(to_fts_query("  \"\"  "), "");
    }

    #[test]
    fn ensure_identifier_rejects_sql_fragments() {
        assert!(ensure_identifier("chunks_fts").is_ok());
        assert!(ensure_identifier("chunks; DROP TABLE x").is_err());
    }

    #[test]
    fn open_fails_when_fts_table_is_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.sqlite");
        let connection = Connection::open(&path).unwrap();
        connection
            .execute_batch("CREATE TABLE chunks (chunk_id TEXT, doc_id TEXT, heading TEXT, text TEXT);")
            .unwrap();
        drop(connection);

        let err = SqliteFtsRetriever::open(&path, "chunks", "chunks_fts")
            .err()
            .expect("missing fts table should fail");
        assert!(err.to_string().contains("chunks_fts"));
    }

    #[tokio::test]
    async fn search_ranks_matching_chunks_with_provenance() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fiqh.sqlite");
        seed_index(&path);

        let retriever = SqliteFtsRetriever::open(&path, "chunks", "chunks_fts").unwrap();
        let chunks = retriever.search("What is zakat?", 2).await.unwrap();

        assert!(!chunks.is_empty());
        assert!(chunks.len() <= 2);
        assert!(chunks[0].content.contains("obligatory alms"));
        assert_eq!(chunks[0].metadata["chunk_id"], "c1");
        assert_eq!(chunks[0].metadata["doc_id"], "fiqh-1");
        assert_eq!(chunks[0].metadata["source_id"], "fiqh");
        assert!(chunks[0].score.is_finite());
    }
}
