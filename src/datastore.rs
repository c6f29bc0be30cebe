//! Store client: the upsert, query and command-queue operations the sync
//! engine performs against the persistent backend.
//!
//! [`DataStore`] composes a [`Store`] backend with the [`ChunkingEngine`].
//! An upsert replaces a document's chunks wholesale: the new chunks are
//! built and embedded, the old ones deleted, and the new ones inserted.
//! Documents are written one at a time, so a failure part way through
//! leaves the earlier documents committed.

use anyhow::{bail, Result};
use std::sync::Arc;

use crate::chunk::ChunkingEngine;
use crate::models::{
    ClaimedCommand, Command, CommandKind, CommandStatus, Document, DocumentChunkMetadata,
    DocumentMetadataFilter, Query, QueryResult, QueryWithEmbedding,
};
use crate::store::Store;

pub struct DataStore {
    store: Arc<dyn Store>,
    engine: Arc<ChunkingEngine>,
}

impl DataStore {
    pub fn new(store: Arc<dyn Store>, engine: Arc<ChunkingEngine>) -> Self {
        Self { store, engine }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<ChunkingEngine> {
        &self.engine
    }

    /// Chunk, embed and store `documents`, replacing any chunks previously
    /// stored under the same document ids.
    ///
    /// Returns the document ids in input order, including generated ids
    /// for documents that had none.
    pub async fn upsert(
        &self,
        table: &str,
        documents: &[Document],
        chunk_token_size: Option<usize>,
    ) -> Result<Vec<String>> {
        let chunked = self
            .engine
            .get_document_chunks(documents, chunk_token_size)
            .await?;

        let mut ids = Vec::with_capacity(chunked.len());
        for doc in chunked {
            let removed = self
                .store
                .delete_by_filters(table, &DocumentMetadataFilter::by_document_id(&doc.document_id))
                .await?;
            self.store.insert_chunks(table, &doc.chunks).await?;

            tracing::debug!(
                document_id = %doc.document_id,
                removed,
                inserted = doc.chunks.len(),
                "upserted document"
            );
            ids.push(doc.document_id);
        }

        Ok(ids)
    }

    /// Delete every chunk matching `filter`. An empty filter is refused
    /// rather than wiping the table.
    pub async fn delete_by_filters(
        &self,
        table: &str,
        filter: &DocumentMetadataFilter,
    ) -> Result<u64> {
        if filter.is_empty() {
            bail!("Refusing to delete with an empty filter");
        }
        self.store.delete_by_filters(table, filter).await
    }

    pub async fn query(
        &self,
        table: &str,
        queries: &[QueryWithEmbedding],
    ) -> Result<Vec<QueryResult>> {
        let mut results = Vec::with_capacity(queries.len());
        for q in queries {
            let hits = self
                .store
                .search(table, &q.embedding, q.query.filter.as_ref(), q.query.top_k())
                .await?;
            results.push(QueryResult {
                query: q.query.query.clone(),
                results: hits,
            });
        }
        Ok(results)
    }

    /// Embed plain queries with the engine's provider, one batch per call.
    pub async fn embed_queries(&self, queries: &[Query]) -> Result<Vec<QueryWithEmbedding>> {
        if queries.is_empty() {
            return Ok(Vec::new());
        }

        let texts: Vec<String> = queries.iter().map(|q| q.query.clone()).collect();
        let embeddings = self.engine.embedder().embed(&texts).await?;
        if embeddings.len() != queries.len() {
            bail!(
                "Embedding provider returned {} vectors for {} queries",
                embeddings.len(),
                queries.len()
            );
        }

        Ok(queries
            .iter()
            .cloned()
            .zip(embeddings)
            .map(|(query, embedding)| QueryWithEmbedding { query, embedding })
            .collect())
    }

    /// Claim the oldest pending command, flipping it to `PROCESSING`.
    pub async fn poll_command(&self) -> Result<Option<ClaimedCommand>> {
        self.store.claim_next_command().await
    }

    pub async fn update_command_status(
        &self,
        id: &str,
        status: CommandStatus,
        errors: Option<&str>,
    ) -> Result<()> {
        self.store.update_command_status(id, status, errors).await
    }

    pub async fn synced_documents(&self, table: &str) -> Result<Vec<DocumentChunkMetadata>> {
        self.store.synced_documents(table).await
    }

    pub async fn enqueue_command(&self, kind: CommandKind) -> Result<Command> {
        self.store.enqueue_command(kind).await
    }

    pub async fn get_command(&self, id: &str) -> Result<Option<Command>> {
        self.store.get_command(id).await
    }
}
