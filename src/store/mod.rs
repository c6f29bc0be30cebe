//! Storage abstraction for synced chunks and the remote command queue.
//!
//! The [`Store`] trait is the set of backend primitives the
//! [`DataStore`](crate::datastore::DataStore) builds its upsert, query and
//! polling operations on. Two backends ship with the crate:
//!
//! | Backend | Purpose |
//! |---------|---------|
//! | [`memory::InMemoryStore`] | Tests and ephemeral runs |
//! | [`sqlite::SqliteStore`] | Persistent store shared with the remote agent |
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    ClaimedCommand, Command, CommandKind, CommandStatus, DocumentChunk, DocumentChunkMetadata,
    DocumentChunkWithScore, DocumentMetadataFilter,
};

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`delete_by_filters`](Store::delete_by_filters) | Delete chunks matching a conjunctive filter |
/// | [`insert_chunks`](Store::insert_chunks) | Insert (or overwrite by id) embedded chunks |
/// | [`search`](Store::search) | Cosine-similarity search over chunk embeddings |
/// | [`synced_documents`](Store::synced_documents) | One metadata record per stored document |
/// | [`enqueue_command`](Store::enqueue_command) | Queue a new command with status `NEW` |
/// | [`claim_next_command`](Store::claim_next_command) | Atomically flip the oldest `NEW` command to `PROCESSING` |
/// | [`update_command_status`](Store::update_command_status) | Idempotent status write |
/// | [`get_command`](Store::get_command) | Inspect a command by id |
#[async_trait]
pub trait Store: Send + Sync {
    /// Delete all chunks in `table` matching `filter`. Returns the number removed.
    async fn delete_by_filters(&self, table: &str, filter: &DocumentMetadataFilter) -> Result<u64>;

    async fn insert_chunks(&self, table: &str, chunks: &[DocumentChunk]) -> Result<()>;

    /// Best `top_k` chunks by cosine similarity, highest score first.
    async fn search(
        &self,
        table: &str,
        embedding: &[f32],
        filter: Option<&DocumentMetadataFilter>,
        top_k: usize,
    ) -> Result<Vec<DocumentChunkWithScore>>;

    /// Last-known remote metadata, one record per document id.
    async fn synced_documents(&self, table: &str) -> Result<Vec<DocumentChunkMetadata>>;

    async fn enqueue_command(&self, kind: CommandKind) -> Result<Command>;

    /// Claim the oldest `NEW` command by creation time, or `None`.
    ///
    /// The status flip and the read happen as one atomic step, so two
    /// callers can never claim the same command. A claimed row whose
    /// payload does not decode comes back as [`ClaimedCommand::Malformed`].
    async fn claim_next_command(&self) -> Result<Option<ClaimedCommand>>;

    async fn update_command_status(
        &self,
        id: &str,
        status: CommandStatus,
        errors: Option<&str>,
    ) -> Result<()>;

    async fn get_command(&self, id: &str) -> Result<Option<Command>>;
}
