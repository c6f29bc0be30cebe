//! Explicit wiring of the engine's components.
//!
//! [`AppContext::from_config`] builds every collaborator once, in
//! dependency order, and hands them to each other at construction:
//!
//! ```text
//! tokenizer ─┐
//! provider  ─┴─▶ ChunkingEngine ─┐
//! SqliteStore ───────────────────┴─▶ DataStore ─┬─▶ NoteCommandHandler ─▶ DatabasePoller
//! Vault ────────────────────────────────────────┘
//! ```

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use crate::chunk::ChunkingEngine;
use crate::command::NoteCommandHandler;
use crate::config::Config;
use crate::datastore::DataStore;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::poller::DatabasePoller;
use crate::store::sqlite::SqliteStore;
use crate::store::Store;
use crate::tokenizer::{Cl100kTokenizer, Tokenizer};
use crate::vault::Vault;
use crate::{db, migrate};

pub struct AppContext {
    pub config: Config,
    pub vault: Arc<Vault>,
    pub datastore: Arc<DataStore>,
    pub poller: DatabasePoller,
}

impl AppContext {
    /// Open the store (running migrations), the vault and the embedding
    /// provider. Configuration problems fail here, before anything runs.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let embedder: Arc<dyn EmbeddingProvider> = Arc::from(create_provider(&config.embedding)?);
        let vault = Arc::new(Vault::open(&config.vault)?);

        let pool = db::connect(&config.store).await?;
        migrate::run_migrations(&pool).await?;
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool));

        Self::assemble(config, vault, store, embedder)
    }

    /// Wire the remaining components around the given collaborators.
    pub fn assemble(
        config: &Config,
        vault: Arc<Vault>,
        store: Arc<dyn Store>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let tokenizer: Arc<dyn Tokenizer> = Arc::new(Cl100kTokenizer::new()?);
        Ok(Self::assemble_with_tokenizer(config, vault, store, embedder, tokenizer))
    }

    pub fn assemble_with_tokenizer(
        config: &Config,
        vault: Arc<Vault>,
        store: Arc<dyn Store>,
        embedder: Arc<dyn EmbeddingProvider>,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Self {
        let engine = Arc::new(
            ChunkingEngine::new(tokenizer, embedder)
                .with_chunk_token_size(config.chunking.chunk_token_size)
                .with_batch_size(config.embedding.batch_size),
        );
        let datastore = Arc::new(DataStore::new(store, engine));

        let handler = NoteCommandHandler::new(vault.clone(), datastore.clone(), &config.store.table)
            .with_new_note_folder(config.vault.new_note_folder.clone())
            .with_chunk_token_size(config.chunking.chunk_token_size);

        let poller = DatabasePoller::new(
            datastore.clone(),
            Arc::new(handler),
            Duration::from_secs(config.polling.interval_secs),
        );

        Self {
            config: config.clone(),
            vault,
            datastore,
            poller,
        }
    }

    pub fn table(&self) -> &str {
        &self.config.store.table
    }

    pub fn chunk_token_size(&self) -> usize {
        self.config.chunking.chunk_token_size
    }
}
