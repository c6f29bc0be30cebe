//! SQLite-backed [`Store`] implementation.
//!
//! Chunks live in the `chunks` table keyed by `(collection, id)`, with the
//! embedding as a little-endian `f32` BLOB. Vector search loads the
//! candidate rows and ranks them by cosine similarity in process.
//!
//! Timestamps are stored as RFC 3339 text with millisecond precision and a
//! `Z` suffix, so lexical comparison in SQL matches chronological order.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::{
    format_timestamp, now_millis, parse_timestamp, ClaimedCommand, Command, CommandKind, CommandStatus,
    DocumentChunk, DocumentChunkMetadata, DocumentChunkWithScore, DocumentMetadata,
    DocumentMetadataFilter, Source,
};

use super::Store;

const CHUNK_COLUMNS: &str =
    "id, document_id, source, source_id, url, author, created_at, text, embedding";

const COMMAND_COLUMNS: &str = "id, type, content, status, errors, created_at, updated_at";

/// SQLite-backed store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Append `AND ...` clauses for each set field of `filter`.
fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &DocumentMetadataFilter) {
    if let Some(ref id) = filter.document_id {
        qb.push(" AND document_id = ").push_bind(id.clone());
    }
    if let Some(source) = filter.source {
        qb.push(" AND source = ").push_bind(source.as_str());
    }
    if let Some(ref source_id) = filter.source_id {
        qb.push(" AND source_id = ").push_bind(source_id.clone());
    }
    if let Some(ref author) = filter.author {
        qb.push(" AND author = ").push_bind(author.clone());
    }
    if let Some(start) = filter.start_date {
        qb.push(" AND created_at >= ").push_bind(format_timestamp(&start));
    }
    if let Some(end) = filter.end_date {
        qb.push(" AND created_at <= ").push_bind(format_timestamp(&end));
    }
}

fn row_to_metadata(row: &SqliteRow) -> Result<DocumentChunkMetadata> {
    let source: String = row.get("source");
    let created_at: String = row.get("created_at");
    Ok(DocumentChunkMetadata {
        base: DocumentMetadata {
            source: source.parse()?,
            source_id: row.get("source_id"),
            url: row.get("url"),
            created_at: parse_timestamp(&created_at)?,
            author: row.get("author"),
        },
        document_id: row.get("document_id"),
    })
}

fn row_to_chunk(row: &SqliteRow) -> Result<DocumentChunk> {
    let blob: Option<Vec<u8>> = row.get("embedding");
    Ok(DocumentChunk {
        id: row.get("id"),
        text: row.get("text"),
        metadata: row_to_metadata(row)?,
        embedding: blob.map(|b| blob_to_vec(&b)),
    })
}

fn row_to_command(row: &SqliteRow) -> Result<Command> {
    let id: String = row.get("id");
    let kind_type: String = row.get("type");
    let content: String = row.get("content");
    let status: String = row.get("status");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    let content: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("Command {} has malformed content", id))?;
    let kind: CommandKind =
        serde_json::from_value(serde_json::json!({ "type": kind_type, "content": content }))
            .with_context(|| format!("Command {} has unknown type '{}'", id, kind_type))?;

    Ok(Command {
        status: status.parse()?,
        errors: row.get("errors"),
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        kind,
        id,
    })
}

/// Payload half of the adjacently tagged `CommandKind` encoding.
fn command_content(kind: &CommandKind) -> Result<String> {
    let value = serde_json::to_value(kind)?;
    let content = value
        .get("content")
        .cloned()
        .unwrap_or(serde_json::Value::Null);
    Ok(content.to_string())
}

#[async_trait]
impl Store for SqliteStore {
    async fn delete_by_filters(&self, table: &str, filter: &DocumentMetadataFilter) -> Result<u64> {
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM chunks WHERE collection = ");
        qb.push_bind(table.to_string());
        push_filter(&mut qb, filter);

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn insert_chunks(&self, table: &str, chunks: &[DocumentChunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for chunk in chunks {
            let meta = &chunk.metadata;
            sqlx::query(
                r#"
                INSERT INTO chunks (collection, id, document_id, source, source_id, url,
                                    author, created_at, text, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(collection, id) DO UPDATE SET
                    document_id = excluded.document_id,
                    source = excluded.source,
                    source_id = excluded.source_id,
                    url = excluded.url,
                    author = excluded.author,
                    created_at = excluded.created_at,
                    text = excluded.text,
                    embedding = excluded.embedding
                "#,
            )
            .bind(table)
            .bind(&chunk.id)
            .bind(&meta.document_id)
            .bind(meta.base.source.as_str())
            .bind(&meta.base.source_id)
            .bind(&meta.base.url)
            .bind(&meta.base.author)
            .bind(format_timestamp(&meta.base.created_at))
            .bind(&chunk.text)
            .bind(chunk.embedding.as_deref().map(vec_to_blob))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn search(
        &self,
        table: &str,
        embedding: &[f32],
        filter: Option<&DocumentMetadataFilter>,
        top_k: usize,
    ) -> Result<Vec<DocumentChunkWithScore>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM chunks WHERE embedding IS NOT NULL AND collection = ",
            CHUNK_COLUMNS
        ));
        qb.push_bind(table.to_string());
        if let Some(filter) = filter {
            push_filter(&mut qb, filter);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;

        let mut results = Vec::with_capacity(rows.len());
        for row in &rows {
            let chunk = row_to_chunk(row)?;
            let score = chunk
                .embedding
                .as_deref()
                .map(|v| cosine_similarity(embedding, v) as f64)
                .unwrap_or(0.0);
            results.push(DocumentChunkWithScore { chunk, score });
        }

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk.id.cmp(&b.chunk.id))
        });
        results.truncate(top_k);
        Ok(results)
    }

    async fn synced_documents(&self, table: &str) -> Result<Vec<DocumentChunkMetadata>> {
        // One row per document: the lowest-rowid chunk carries the metadata
        // written at upsert time.
        let rows = sqlx::query(
            r#"
            SELECT document_id, source, source_id, url, author, created_at
            FROM chunks
            WHERE rowid IN (
                SELECT MIN(rowid) FROM chunks WHERE collection = ? GROUP BY document_id
            )
            ORDER BY document_id
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_metadata).collect()
    }

    async fn enqueue_command(&self, kind: CommandKind) -> Result<Command> {
        let now = now_millis();
        let command = Command {
            id: Uuid::new_v4().to_string(),
            status: CommandStatus::New,
            errors: None,
            created_at: now,
            updated_at: now,
            kind,
        };

        sqlx::query(
            r#"
            INSERT INTO commands (id, type, content, status, errors, created_at, updated_at)
            VALUES (?, ?, ?, ?, NULL, ?, ?)
            "#,
        )
        .bind(&command.id)
        .bind(command.kind.type_name())
        .bind(command_content(&command.kind)?)
        .bind(command.status.as_str())
        .bind(format_timestamp(&command.created_at))
        .bind(format_timestamp(&command.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(command)
    }

    async fn claim_next_command(&self) -> Result<Option<ClaimedCommand>> {
        // Single statement: the status guard in the outer WHERE keeps a
        // concurrent claimer from flipping the same row twice.
        let sql = format!(
            r#"
            UPDATE commands
            SET status = 'PROCESSING', updated_at = ?
            WHERE id = (
                SELECT id FROM commands
                WHERE status = 'NEW'
                ORDER BY created_at ASC, rowid ASC
                LIMIT 1
            )
            AND status = 'NEW'
            RETURNING {}
            "#,
            COMMAND_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(format_timestamp(&now_millis()))
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        // The row is already PROCESSING; hand back its id even if the rest
        // does not decode so it can still be given a terminal status.
        let claimed = match row_to_command(&row) {
            Ok(command) => ClaimedCommand::Ready(command),
            Err(e) => {
                let id: String = row.try_get("id")?;
                let error = format!("{:#}", e);
                tracing::warn!(command_id = %id, error = %error, "claimed malformed command");
                ClaimedCommand::Malformed { id, error }
            }
        };
        Ok(Some(claimed))
    }

    async fn update_command_status(
        &self,
        id: &str,
        status: CommandStatus,
        errors: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE commands SET status = ?, errors = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(errors)
        .bind(format_timestamp(&now_millis()))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("Command not found: {}", id);
        }
        Ok(())
    }

    async fn get_command(&self, id: &str) -> Result<Option<Command>> {
        let sql = format!("SELECT {} FROM commands WHERE id = ?", COMMAND_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_command).transpose()
    }
}
