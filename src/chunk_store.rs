use std::collections::HashMap;
use std::path::Path;

use rusqlite::{Connection, OpenFlags, params, params_from_iter};
use serde::Serialize;
use tracing::debug;

use crate::error::Result;
use crate::model::{Chunk, ChunkFilter, ChunkId, ChunkRecord};
use crate::util::{ensure_directory, now_utc_string};

pub const DEFAULT_DB_PATH: &str = "data/processed/tracking.sqlite";

const LOOKUP_BATCH: usize = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub sources: i64,
    pub documents: i64,
    pub chunks: i64,
}

#[derive(Debug, Clone, Default)]
pub struct NewDocument<'a> {
    pub source_id: i64,
    pub title: Option<&'a str>,
    pub path: Option<&'a str>,
    pub run_id: Option<i64>,
}

/// Read access to the relational store the ingestion pipelines fill.
pub struct ChunkStore {
    connection: Connection,
}

impl ChunkStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            ensure_directory(parent)?;
        }

        let connection = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        connection.pragma_update(None, "journal_mode", "WAL")?;
        connection.pragma_update(None, "synchronous", "NORMAL")?;

        let store = Self { connection };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Opens the store only when the database file already exists.
    pub fn open_if_present(db_path: &Path) -> Result<Option<Self>> {
        if !db_path.is_file() {
            return Ok(None);
        }
        Self::open(db_path).map(Some)
    }

    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            connection: Connection::open_in_memory()?,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.connection.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sources (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              name TEXT NOT NULL,
              kind TEXT NOT NULL DEFAULT 'web',
              created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS documents (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              source_id INTEGER REFERENCES sources(id),
              title TEXT,
              path TEXT,
              meta TEXT NOT NULL DEFAULT '{}',
              created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chunks (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              source_id INTEGER NOT NULL,
              document_id INTEGER REFERENCES documents(id),
              ordinal INTEGER,
              text TEXT,
              content TEXT NOT NULL DEFAULT '',
              meta TEXT NOT NULL DEFAULT '{}',
              created_at TEXT
            );

            CREATE INDEX IF NOT EXISTS ix_chunks_source ON chunks(source_id);
            CREATE INDEX IF NOT EXISTS ix_chunks_document ON chunks(document_id);
            ",
        )?;
        Ok(())
    }

    /// Chunks matching the filter, ordered by id. Blank chunks are not indexable and are
    /// dropped here so that every selected chunk carries text.
    pub fn select_chunks(&self, filter: &ChunkFilter) -> Result<Vec<Chunk>> {
        let mut statement = self.connection.prepare(
            "
            SELECT
              c.id,
              c.document_id,
              c.source_id,
              c.ordinal,
              COALESCE(NULLIF(trim(COALESCE(c.text, '')), ''), c.content, ''),
              COALESCE(c.meta, '{}')
            FROM chunks c
            LEFT JOIN documents d ON d.id = c.document_id
            WHERE
              (?1 IS NULL OR c.source_id = ?1)
              AND (?2 IS NULL OR json_extract(COALESCE(d.meta, '{}'), '$.run_id') = ?2)
              AND trim(COALESCE(NULLIF(trim(COALESCE(c.text, '')), ''), c.content, '')) <> ''
            ORDER BY c.id ASC
            LIMIT ?3
            ",
        )?;

        let limit = filter.limit.map(|value| value as i64).unwrap_or(-1);
        let mut rows = statement.query(params![filter.source_id, filter.run_id, limit])?;
        let mut out = Vec::<Chunk>::new();

        while let Some(row) = rows.next()? {
            let meta_raw: String = row.get(5)?;
            let metadata = serde_json::from_str::<serde_json::Value>(&meta_raw)
                .ok()
                .and_then(|value| match value {
                    serde_json::Value::Object(map) => Some(map),
                    _ => None,
                })
                .unwrap_or_default();

            out.push(Chunk {
                id: row.get(0)?,
                document_id: row.get(1)?,
                source_id: row.get(2)?,
                ordinal: row.get(3)?,
                text: row.get(4)?,
                metadata,
            });
        }

        debug!(filters = %filter.describe(), selected = out.len(), "chunks selected");
        Ok(out)
    }

    /// Resolves chunk ids to their document context. Ids that do not resolve are simply
    /// absent from the returned map.
    pub fn lookup_chunks(&self, chunk_ids: &[ChunkId]) -> Result<HashMap<ChunkId, ChunkRecord>> {
        let mut out = HashMap::<ChunkId, ChunkRecord>::with_capacity(chunk_ids.len());

        for batch in chunk_ids.chunks(LOOKUP_BATCH) {
            let placeholders = vec!["?"; batch.len()].join(",");
            let sql = format!(
                "
                SELECT
                  c.id,
                  c.document_id,
                  d.title,
                  d.path,
                  c.ordinal,
                  COALESCE(NULLIF(trim(COALESCE(c.text, '')), ''), c.content, '')
                FROM chunks c
                LEFT JOIN documents d ON d.id = c.document_id
                WHERE c.id IN ({placeholders})
                "
            );
            let mut statement = self.connection.prepare(&sql)?;
            let mut rows = statement.query(params_from_iter(batch.iter()))?;

            while let Some(row) = rows.next()? {
                let record = ChunkRecord {
                    chunk_id: row.get(0)?,
                    document_id: row.get(1)?,
                    document_title: row.get(2)?,
                    document_path: row.get(3)?,
                    ordinal: row.get(4)?,
                    text: row.get(5)?,
                };
                out.insert(record.chunk_id, record);
            }
        }

        Ok(out)
    }

    pub fn counts(&self) -> Result<StoreCounts> {
        let count = |sql: &str| -> Result<i64> {
            Ok(self.connection.query_row(sql, [], |row| row.get(0))?)
        };

        Ok(StoreCounts {
            sources: count("SELECT COUNT(*) FROM sources")?,
            documents: count("SELECT COUNT(*) FROM documents")?,
            chunks: count("SELECT COUNT(*) FROM chunks")?,
        })
    }

    pub fn insert_source(&self, name: &str, kind: &str) -> Result<i64> {
        self.connection.execute(
            "INSERT INTO sources(name, kind, created_at) VALUES(?1, ?2, ?3)",
            params![name, kind, now_utc_string()],
        )?;
        Ok(self.connection.last_insert_rowid())
    }

    pub fn insert_document(&self, document: &NewDocument<'_>) -> Result<i64> {
        let meta = match document.run_id {
            Some(run_id) => serde_json::json!({ "run_id": run_id }),
            None => serde_json::json!({}),
        };
        self.connection.execute(
            "
            INSERT INTO documents(source_id, title, path, meta, created_at)
            VALUES(?1, ?2, ?3, ?4, ?5)
            ",
            params![
                document.source_id,
                document.title,
                document.path,
                meta.to_string(),
                now_utc_string(),
            ],
        )?;
        Ok(self.connection.last_insert_rowid())
    }

    pub fn insert_chunk(
        &self,
        source_id: i64,
        document_id: Option<i64>,
        ordinal: Option<i64>,
        text: &str,
    ) -> Result<ChunkId> {
        self.connection.execute(
            "
            INSERT INTO chunks(source_id, document_id, ordinal, text, content, meta, created_at)
            VALUES(?1, ?2, ?3, ?4, ?4, '{}', ?5)
            ",
            params![source_id, document_id, ordinal, text, now_utc_string()],
        )?;
        Ok(self.connection.last_insert_rowid())
    }

    pub fn update_chunk_text(&self, chunk_id: ChunkId, text: &str) -> Result<bool> {
        let changed = self.connection.execute(
            "UPDATE chunks SET text = ?2, content = ?2 WHERE id = ?1",
            params![chunk_id, text],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_chunk(&self, chunk_id: ChunkId) -> Result<bool> {
        let changed = self
            .connection
            .execute("DELETE FROM chunks WHERE id = ?1", params![chunk_id])?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::{ChunkStore, NewDocument};
    use crate::model::ChunkFilter;

    fn seeded_store() -> ChunkStore {
        let store = ChunkStore::open_in_memory().expect("in-memory store");
        let web = store.insert_source("ayuntamiento", "web").expect("source");
        let docs = store.insert_source("boletin", "docs").expect("source");

        let padron = store
            .insert_document(&NewDocument {
                source_id: web,
                title: Some("Padrón municipal"),
                path: Some("/tramites/padron"),
                run_id: Some(7),
            })
            .expect("document");
        let tasas = store
            .insert_document(&NewDocument {
                source_id: docs,
                title: Some("Ordenanza fiscal"),
                path: None,
                run_id: Some(8),
            })
            .expect("document");

        store
            .insert_chunk(web, Some(padron), Some(0), "Alta en el padrón municipal")
            .expect("chunk");
        store
            .insert_chunk(web, Some(padron), Some(1), "   ")
            .expect("chunk");
        store
            .insert_chunk(docs, Some(tasas), Some(0), "Tasa de basuras")
            .expect("chunk");
        store
            .insert_chunk(docs, Some(tasas), Some(1), "Bonificaciones")
            .expect("chunk");
        store
    }

    #[test]
    fn select_skips_blank_chunks_and_orders_by_id() {
        let store = seeded_store();
        // Blank `text` falls back to `content`.
        store
            .connection
            .execute(
                "INSERT INTO chunks(source_id, document_id, ordinal, text, content, meta, created_at)
                 VALUES(1, 1, 2, '   ', 'licencia de obra', '{}', '2026-01-01T00:00:00Z')",
                [],
            )
            .expect("insert");

        let chunks = store.select_chunks(&ChunkFilter::default()).expect("select");
        let ids = chunks.iter().map(|chunk| chunk.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 3, 4, 5]);
        assert!(chunks.iter().all(|chunk| !chunk.text.trim().is_empty()));
        assert_eq!(chunks[3].text, "licencia de obra");

        let records = store.lookup_chunks(&[5]).expect("lookup");
        assert_eq!(records[&5].text, "licencia de obra");
    }

    #[test]
    fn select_filters_by_source_run_and_limit() {
        let store = seeded_store();

        let by_source = store
            .select_chunks(&ChunkFilter {
                source_id: Some(2),
                ..ChunkFilter::default()
            })
            .expect("select");
        assert_eq!(by_source.len(), 2);

        let by_run = store
            .select_chunks(&ChunkFilter {
                run_id: Some(7),
                ..ChunkFilter::default()
            })
            .expect("select");
        assert_eq!(by_run.iter().map(|c| c.id).collect::<Vec<_>>(), vec![1]);

        let limited = store
            .select_chunks(&ChunkFilter {
                run_id: Some(8),
                limit: Some(1),
                ..ChunkFilter::default()
            })
            .expect("select");
        assert_eq!(limited.iter().map(|c| c.id).collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn lookup_returns_document_context_and_omits_unknown_ids() {
        let store = seeded_store();
        let records = store.lookup_chunks(&[1, 3, 99]).expect("lookup");

        assert_eq!(records.len(), 2);
        let padron = &records[&1];
        assert_eq!(padron.document_title.as_deref(), Some("Padrón municipal"));
        assert_eq!(padron.document_path.as_deref(), Some("/tramites/padron"));
        assert_eq!(padron.ordinal, Some(0));
        assert!(records[&3].document_path.is_none());
        assert!(!records.contains_key(&99));
    }

    #[test]
    fn counts_reflect_inserted_rows() {
        let store = seeded_store();
        let counts = store.counts().expect("counts");
        assert_eq!((counts.sources, counts.documents, counts.chunks), (2, 2, 4));
    }
}
