//! In-memory [`Store`] implementation for tests and ephemeral runs.
//!
//! Uses `HashMap` and `Vec` behind `std::sync` locks. Vector search is
//! brute-force cosine similarity over all stored chunks.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use anyhow::{bail, Result};
use async_trait::async_trait;
use uuid::Uuid;

use crate::embedding::cosine_similarity;
use crate::models::{
    now_millis, ClaimedCommand, Command, CommandKind, CommandStatus, DocumentChunk, DocumentChunkMetadata,
    DocumentChunkWithScore, DocumentMetadataFilter,
};

use super::Store;

/// In-memory store.
pub struct InMemoryStore {
    /// Chunks per table, in insertion order.
    tables: RwLock<HashMap<String, Vec<DocumentChunk>>>,
    /// Commands in enqueue order; one lock makes claiming atomic.
    commands: Mutex<Vec<Command>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
        }
    }

    /// Number of chunks stored in `table`.
    pub fn chunk_count(&self, table: &str) -> usize {
        self.tables
            .read()
            .unwrap()
            .get(table)
            .map(|chunks| chunks.len())
            .unwrap_or(0)
    }

    /// Chunks stored in `table` for one document.
    pub fn chunks_for(&self, table: &str, document_id: &str) -> Vec<DocumentChunk> {
        self.tables
            .read()
            .unwrap()
            .get(table)
            .map(|chunks| {
                chunks
                    .iter()
                    .filter(|c| c.metadata.document_id == document_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn delete_by_filters(&self, table: &str, filter: &DocumentMetadataFilter) -> Result<u64> {
        let mut tables = self.tables.write().unwrap();
        let Some(chunks) = tables.get_mut(table) else {
            return Ok(0);
        };
        let before = chunks.len();
        chunks.retain(|c| !filter.matches(&c.metadata));
        Ok((before - chunks.len()) as u64)
    }

    async fn insert_chunks(&self, table: &str, chunks: &[DocumentChunk]) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        let stored = tables.entry(table.to_string()).or_default();
        for chunk in chunks {
            stored.retain(|c| c.id != chunk.id);
            stored.push(chunk.clone());
        }
        Ok(())
    }

    async fn search(
        &self,
        table: &str,
        embedding: &[f32],
        filter: Option<&DocumentMetadataFilter>,
        top_k: usize,
    ) -> Result<Vec<DocumentChunkWithScore>> {
        let tables = self.tables.read().unwrap();
        let Some(chunks) = tables.get(table) else {
            return Ok(Vec::new());
        };

        let mut results: Vec<DocumentChunkWithScore> = chunks
            .iter()
            .filter(|c| filter.map_or(true, |f| f.matches(&c.metadata)))
            .filter_map(|c| {
                let vector = c.embedding.as_ref()?;
                Some(DocumentChunkWithScore {
                    chunk: c.clone(),
                    score: cosine_similarity(embedding, vector) as f64,
                })
            })
            .collect();

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
        let tables = self.tables.read().unwrap();
        let mut seen = std::collections::HashSet::new();
        Ok(tables
            .get(table)
            .map(|chunks| {
                chunks
                    .iter()
                    .filter(|c| seen.insert(c.metadata.document_id.clone()))
                    .map(|c| c.metadata.clone())
                    .collect()
            })
            .unwrap_or_default())
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
        self.commands.lock().unwrap().push(command.clone());
        Ok(command)
    }

    async fn claim_next_command(&self) -> Result<Option<ClaimedCommand>> {
        let mut commands = self.commands.lock().unwrap();
        // Enqueue order breaks creation-time ties.
        let next = commands
            .iter_mut()
            .enumerate()
            .filter(|(_, c)| c.status == CommandStatus::New)
            .min_by_key(|(i, c)| (c.created_at, *i))
            .map(|(_, c)| c);

        Ok(next.map(|command| {
            command.status = CommandStatus::Processing;
            command.updated_at = now_millis();
            ClaimedCommand::Ready(command.clone())
        }))
    }

    async fn update_command_status(
        &self,
        id: &str,
        status: CommandStatus,
        errors: Option<&str>,
    ) -> Result<()> {
        let mut commands = self.commands.lock().unwrap();
        let Some(command) = commands.iter_mut().find(|c| c.id == id) else {
            bail!("Command not found: {}", id);
        };
        command.status = status;
        command.errors = errors.map(str::to_string);
        command.updated_at = now_millis();
        Ok(())
    }

    async fn get_command(&self, id: &str) -> Result<Option<Command>> {
        Ok(self
            .commands
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == id)
            .cloned())
    }
}
