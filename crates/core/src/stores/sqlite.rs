//! SQLite metadata store.
//!
//! Documents and the current chunk generation live in two tables; a
//! generation swap is one transaction, so readers see either the old chunk
//! set or the new one.

use crate::error::StoreError;
use crate::locks::{DocumentLease, DocumentLocks};
use crate::models::{
    Chunk, Document, DocumentFlags, DocumentListQuery, DocumentPage, LifecycleState,
};
use crate::traits::MetadataStore;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;

const DOCUMENT_COLUMNS: &str = "document_id, filename, content_hash, byte_size, file_type, \
     uploader_id, uploaded_at, state, visible, generation, object_locator, page_count, \
     metadata, tags, needs_manual_review, ingestion_error";

const CHUNK_COLUMNS: &str = "chunk_id, document_id, generation, chunk_index, text, token_count, \
     page_start, page_end, embedding_ref, embedding";

pub struct SqliteMetadataStore {
    conn: Arc<Mutex<Connection>>,
    locks: DocumentLocks,
}

impl SqliteMetadataStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            locks: DocumentLocks::new(),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA foreign_keys=ON;
            "#,
        )?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                document_id TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                byte_size INTEGER NOT NULL,
                file_type TEXT NOT NULL,
                uploader_id TEXT NOT NULL,
                uploaded_at TEXT NOT NULL,
                state TEXT NOT NULL,
                visible INTEGER NOT NULL DEFAULT 0,
                generation INTEGER NOT NULL DEFAULT 0,
                object_locator TEXT,
                page_count INTEGER NOT NULL DEFAULT 0,
                metadata TEXT NOT NULL DEFAULT '{}',
                tags TEXT NOT NULL DEFAULT '[]',
                needs_manual_review INTEGER NOT NULL DEFAULT 0,
                ingestion_error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_documents_hash ON documents(uploader_id, content_hash);
            CREATE INDEX IF NOT EXISTS idx_documents_state ON documents(state);
            CREATE INDEX IF NOT EXISTS idx_documents_uploaded_at ON documents(uploaded_at);

            CREATE TABLE IF NOT EXISTS chunks (
                chunk_id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL REFERENCES documents(document_id) ON DELETE CASCADE,
                generation INTEGER NOT NULL,
                chunk_index INTEGER NOT NULL,
                text TEXT NOT NULL,
                token_count INTEGER NOT NULL,
                page_start INTEGER NOT NULL,
                page_end INTEGER NOT NULL,
                embedding_ref TEXT NOT NULL,
                embedding BLOB NOT NULL,
                UNIQUE(document_id, chunk_index)
            );

            CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id);
            "#,
        )?;

        Ok(())
    }
}

fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|value| value.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.len() % 4 != 0 {
        return Err(StoreError::Corrupt(format!(
            "embedding blob of {} bytes is not a float array",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|raw| f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
        .collect())
}

fn to_u32(value: i64, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} out of range: {value}")))
}

struct DocumentRow {
    document_id: String,
    filename: String,
    content_hash: String,
    byte_size: i64,
    file_type: String,
    uploader_id: String,
    uploaded_at: String,
    state: String,
    visible: bool,
    generation: i64,
    object_locator: Option<String>,
    page_count: i64,
    metadata: String,
    tags: String,
    needs_manual_review: bool,
    ingestion_error: Option<String>,
}

fn read_document_row(row: &Row<'_>) -> rusqlite::Result<DocumentRow> {
    Ok(DocumentRow {
        document_id: row.get(0)?,
        filename: row.get(1)?,
        content_hash: row.get(2)?,
        byte_size: row.get(3)?,
        file_type: row.get(4)?,
        uploader_id: row.get(5)?,
        uploaded_at: row.get(6)?,
        state: row.get(7)?,
        visible: row.get(8)?,
        generation: row.get(9)?,
        object_locator: row.get(10)?,
        page_count: row.get(11)?,
        metadata: row.get(12)?,
        tags: row.get(13)?,
        needs_manual_review: row.get(14)?,
        ingestion_error: row.get(15)?,
    })
}

impl TryFrom<DocumentRow> for Document {
    type Error = StoreError;

    fn try_from(row: DocumentRow) -> Result<Self, Self::Error> {
        let uploaded_at = DateTime::parse_from_rfc3339(&row.uploaded_at)
            .map_err(|error| StoreError::Corrupt(format!("uploaded_at: {error}")))?
            .with_timezone(&Utc);

        Ok(Document {
            byte_size: u64::try_from(row.byte_size)
                .map_err(|_| StoreError::Corrupt(format!("byte_size: {}", row.byte_size)))?,
            file_type: row.file_type.parse().map_err(StoreError::Corrupt)?,
            state: row.state.parse().map_err(StoreError::Corrupt)?,
            generation: to_u32(row.generation, "generation")?,
            page_count: to_u32(row.page_count, "page_count")?,
            metadata: serde_json::from_str(&row.metadata)?,
            tags: serde_json::from_str(&row.tags)?,
            flags: DocumentFlags {
                needs_manual_review: row.needs_manual_review,
                ingestion_error: row.ingestion_error,
            },
            document_id: row.document_id,
            filename: row.filename,
            content_hash: row.content_hash,
            uploader_id: row.uploader_id,
            uploaded_at,
            visible: row.visible,
            object_locator: row.object_locator,
        })
    }
}

struct ChunkRow {
    chunk_id: String,
    document_id: String,
    generation: i64,
    chunk_index: i64,
    text: String,
    token_count: i64,
    page_start: i64,
    page_end: i64,
    embedding_ref: String,
    embedding: Vec<u8>,
}

fn read_chunk_row(row: &Row<'_>) -> rusqlite::Result<ChunkRow> {
    Ok(ChunkRow {
        chunk_id: row.get(0)?,
        document_id: row.get(1)?,
        generation: row.get(2)?,
        chunk_index: row.get(3)?,
        text: row.get(4)?,
        token_count: row.get(5)?,
        page_start: row.get(6)?,
        page_end: row.get(7)?,
        embedding_ref: row.get(8)?,
        embedding: row.get(9)?,
    })
}

impl TryFrom<ChunkRow> for Chunk {
    type Error = StoreError;

    fn try_from(row: ChunkRow) -> Result<Self, Self::Error> {
        Ok(Chunk {
            generation: to_u32(row.generation, "generation")?,
            chunk_index: to_u32(row.chunk_index, "chunk_index")?,
            token_count: usize::try_from(row.token_count)
                .map_err(|_| StoreError::Corrupt(format!("token_count: {}", row.token_count)))?,
            page_start: to_u32(row.page_start, "page_start")?,
            page_end: to_u32(row.page_end, "page_end")?,
            embedding: decode_vector(&row.embedding)?,
            chunk_id: row.chunk_id,
            document_id: row.document_id,
            text: row.text,
            embedding_ref: row.embedding_ref,
        })
    }
}

fn upsert_document(conn: &Connection, document: &Document) -> Result<(), StoreError> {
    conn.execute(
        &format!(
            "INSERT INTO documents ({DOCUMENT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
             ON CONFLICT(document_id) DO UPDATE SET
                filename = excluded.filename,
                content_hash = excluded.content_hash,
                byte_size = excluded.byte_size,
                file_type = excluded.file_type,
                uploader_id = excluded.uploader_id,
                uploaded_at = excluded.uploaded_at,
                state = excluded.state,
                visible = excluded.visible,
                generation = excluded.generation,
                object_locator = excluded.object_locator,
                page_count = excluded.page_count,
                metadata = excluded.metadata,
                tags = excluded.tags,
                needs_manual_review = excluded.needs_manual_review,
                ingestion_error = excluded.ingestion_error"
        ),
        params![
            document.document_id,
            document.filename,
            document.content_hash,
            document.byte_size as i64,
            document.file_type.as_str(),
            document.uploader_id,
            format_timestamp(&document.uploaded_at),
            document.state.as_str(),
            document.visible,
            document.generation as i64,
            document.object_locator,
            document.page_count as i64,
            serde_json::to_string(&document.metadata)?,
            serde_json::to_string(&document.tags)?,
            document.flags.needs_manual_review,
            document.flags.ingestion_error,
        ],
    )?;
    Ok(())
}

fn expect_updated(changed: usize, document_id: &str) -> Result<(), StoreError> {
    if changed == 0 {
        Err(StoreError::NotFound(format!("document {document_id}")))
    } else {
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn lock_document(&self, key: &str) -> DocumentLease {
        self.locks.acquire(key).await
    }

    async fn find_by_content_hash(
        &self,
        uploader_id: &str,
        content_hash: &str,
    ) -> Result<Option<Document>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {DOCUMENT_COLUMNS} FROM documents
                     WHERE uploader_id = ?1 AND content_hash = ?2 AND state != 'rejected'
                     ORDER BY uploaded_at DESC LIMIT 1"
                ),
                params![uploader_id, content_hash],
                read_document_row,
            )
            .optional()?;
        row.map(Document::try_from).transpose()
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<Document>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE document_id = ?1"),
                params![document_id],
                read_document_row,
            )
            .optional()?;
        row.map(Document::try_from).transpose()
    }

    async fn list_documents(&self, query: &DocumentListQuery) -> Result<DocumentPage, StoreError> {
        let mut clauses = Vec::new();
        let mut args: Vec<String> = Vec::new();
        if let Some(status) = query.status {
            args.push(status.as_str().to_string());
            clauses.push(format!("state = ?{}", args.len()));
        }
        if let Some(uploader) = &query.uploader_id {
            args.push(uploader.clone());
            clauses.push(format!("uploader_id = ?{}", args.len()));
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let limit = if query.limit == 0 { -1 } else { query.limit as i64 };

        let conn = self.conn.lock();
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM documents {where_clause}"),
            params_from_iter(args.iter()),
            |row| row.get(0),
        )?;

        let mut statement = conn.prepare(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents {where_clause}
             ORDER BY uploaded_at DESC, document_id ASC
             LIMIT {limit} OFFSET {}",
            query.offset
        ))?;
        let rows = statement
            .query_map(params_from_iter(args.iter()), read_document_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let documents = rows
            .into_iter()
            .map(Document::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(DocumentPage {
            documents,
            total: total.max(0) as u64,
        })
    }

    async fn document_ids(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut statement = conn.prepare("SELECT document_id FROM documents ORDER BY document_id")?;
        let ids = statement
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    async fn insert_document(&self, document: &Document) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        upsert_document(&conn, document)
    }

    async fn commit_generation(
        &self,
        document: &Document,
        chunks: &[Chunk],
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let previous = {
            let mut statement =
                tx.prepare("SELECT chunk_id FROM chunks WHERE document_id = ?1 ORDER BY chunk_index")?;
            let ids = statement
                .query_map(params![document.document_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            ids
        };

        tx.execute(
            "DELETE FROM chunks WHERE document_id = ?1",
            params![document.document_id],
        )?;
        upsert_document(&tx, document)?;
        {
            let mut insert = tx.prepare(&format!(
                "INSERT INTO chunks ({CHUNK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
            ))?;
            for chunk in chunks {
                insert.execute(params![
                    chunk.chunk_id,
                    chunk.document_id,
                    chunk.generation as i64,
                    chunk.chunk_index as i64,
                    chunk.text,
                    chunk.token_count as i64,
                    chunk.page_start as i64,
                    chunk.page_end as i64,
                    chunk.embedding_ref,
                    encode_vector(&chunk.embedding),
                ])?;
            }
        }
        tx.commit()?;

        Ok(previous)
    }

    async fn update_state(
        &self,
        document_id: &str,
        state: LifecycleState,
        visible: bool,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE documents SET state = ?2, visible = ?3 WHERE document_id = ?1",
            params![document_id, state.as_str(), visible],
        )?;
        expect_updated(changed, document_id)
    }

    async fn set_visible(&self, document_id: &str, visible: bool) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE documents SET visible = ?2 WHERE document_id = ?1",
            params![document_id, visible],
        )?;
        expect_updated(changed, document_id)
    }

    async fn update_flags(&self, document_id: &str, flags: &DocumentFlags) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE documents SET needs_manual_review = ?2, ingestion_error = ?3 WHERE document_id = ?1",
            params![document_id, flags.needs_manual_review, flags.ingestion_error],
        )?;
        expect_updated(changed, document_id)
    }

    async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<Chunk>, StoreError> {
        let conn = self.conn.lock();
        let mut statement = conn.prepare(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE document_id = ?1 ORDER BY chunk_index"
        ))?;
        let rows = statement
            .query_map(params![document_id], read_chunk_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(Chunk::try_from).collect()
    }

    async fn get_chunks(&self, chunk_ids: &[String]) -> Result<Vec<Chunk>, StoreError> {
        let conn = self.conn.lock();
        let mut statement =
            conn.prepare_cached(&format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE chunk_id = ?1"))?;

        let mut chunks = Vec::with_capacity(chunk_ids.len());
        for chunk_id in chunk_ids {
            if let Some(row) = statement
                .query_row(params![chunk_id], read_chunk_row)
                .optional()?
            {
                chunks.push(Chunk::try_from(row)?);
            }
        }
        Ok(chunks)
    }

    async fn delete_document(&self, document_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM chunks WHERE document_id = ?1", params![document_id])?;
        let removed = tx.execute("DELETE FROM documents WHERE document_id = ?1", params![document_id])?;
        tx.commit()?;
        Ok(removed > 0)
    }
}
