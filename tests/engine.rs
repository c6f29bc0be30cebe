use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use vault_sync::chunk::ChunkingEngine;
use vault_sync::command::CommandProcessor;
use vault_sync::config::{parse_config, Config};
use vault_sync::context::AppContext;
use vault_sync::datastore::DataStore;
use vault_sync::embedding::EmbeddingProvider;
use vault_sync::models::{
    ClaimedCommand, Command, CommandContent, CommandKind, CommandStatus, Document, DocumentChunk,
    DocumentChunkMetadata, DocumentChunkWithScore, DocumentMetadata, DocumentMetadataFilter,
    FileState, Source,
};
use vault_sync::poller::{CycleOutcome, DatabasePoller};
use vault_sync::reconcile;
use vault_sync::store::memory::InMemoryStore;
use vault_sync::store::sqlite::SqliteStore;
use vault_sync::store::Store;
use vault_sync::tokenizer::Cl100kTokenizer;
use vault_sync::vault::{LocalFile, Vault};
use vault_sync::{db, migrate};

/// Deterministic bag-of-bytes embedding.
struct HashEmbedder;

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash"
    }
    fn dims(&self) -> usize {
        8
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let mut v = vec![0.0f32; 8];
                for b in t.bytes() {
                    v[(b % 8) as usize] += 1.0;
                }
                v
            })
            .collect())
    }
}

/// Records the document ids whose chunks get replaced.
struct RecordingStore {
    inner: InMemoryStore,
    replaced: Mutex<Vec<String>>,
}

impl RecordingStore {
    fn new() -> Self {
        Self {
            inner: InMemoryStore::new(),
            replaced: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Store for RecordingStore {
    async fn delete_by_filters(&self, table: &str, filter: &DocumentMetadataFilter) -> Result<u64> {
        if let Some(ref id) = filter.document_id {
            self.replaced.lock().unwrap().push(id.clone());
        }
        self.inner.delete_by_filters(table, filter).await
    }
    async fn insert_chunks(&self, table: &str, chunks: &[DocumentChunk]) -> Result<()> {
        self.inner.insert_chunks(table, chunks).await
    }
    async fn search(
        &self,
        table: &str,
        embedding: &[f32],
        filter: Option<&DocumentMetadataFilter>,
        top_k: usize,
    ) -> Result<Vec<DocumentChunkWithScore>> {
        self.inner.search(table, embedding, filter, top_k).await
    }
    async fn synced_documents(&self, table: &str) -> Result<Vec<DocumentChunkMetadata>> {
        self.inner.synced_documents(table).await
    }
    async fn enqueue_command(&self, kind: CommandKind) -> Result<Command> {
        self.inner.enqueue_command(kind).await
    }
    async fn claim_next_command(&self) -> Result<Option<ClaimedCommand>> {
        self.inner.claim_next_command().await
    }
    async fn update_command_status(
        &self,
        id: &str,
        status: CommandStatus,
        errors: Option<&str>,
    ) -> Result<()> {
        self.inner.update_command_status(id, status, errors).await
    }
    async fn get_command(&self, id: &str) -> Result<Option<Command>> {
        self.inner.get_command(id).await
    }
}

/// Always fails.
struct BrokenProcessor;

#[async_trait]
impl CommandProcessor for BrokenProcessor {
    async fn handle_new_command(&self, _command: &Command) -> Result<bool> {
        bail!("processor crashed")
    }
}

fn test_config(tmp: &TempDir) -> Config {
    let vault_dir = tmp.path().join("vault");
    std::fs::create_dir_all(&vault_dir).unwrap();
    parse_config(&format!(
        r#"
[store]
path = "{}/data/vsync.sqlite"

[vault]
root = "{}"
name = "test-vault"
"#,
        tmp.path().display(),
        vault_dir.display()
    ))
    .unwrap()
}

fn in_memory_datastore() -> Arc<DataStore> {
    let engine = Arc::new(ChunkingEngine::new(
        Arc::new(Cl100kTokenizer::new().unwrap()),
        Arc::new(HashEmbedder),
    ));
    Arc::new(DataStore::new(Arc::new(InMemoryStore::new()), engine))
}

#[tokio::test]
async fn test_short_note_is_one_chunk_and_newer_file_is_modified() {
    let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
    let ds = in_memory_datastore();

    let doc = Document {
        id: Some("note1".to_string()),
        text: "Hello world. ".repeat(40),
        metadata: DocumentMetadata {
            source: Source::File,
            source_id: "note1.md".to_string(),
            url: None,
            created_at: t0,
            author: None,
        },
    };

    let chunked = ds.engine().get_document_chunks(&[doc], Some(200)).await.unwrap();
    assert_eq!(chunked.len(), 1);
    assert_eq!(chunked[0].document_id, "note1");
    assert_eq!(chunked[0].chunks.len(), 1);
    let chunk = &chunked[0].chunks[0];
    assert_eq!(chunk.id, "note1_0");
    assert_eq!(chunk.text, "Hello world. ".repeat(40).trim());
    assert_eq!(chunk.embedding.as_ref().map(|v| v.len()), Some(8));

    ds.upsert("documents", &[Document {
        id: Some("note1".to_string()),
        text: "Hello world. ".repeat(40),
        metadata: chunk.metadata.base.clone(),
    }], Some(200))
    .await
    .unwrap();

    let remote = ds.synced_documents("documents").await.unwrap();
    let local = LocalFile {
        path: "note1.md".to_string(),
        basename: "note1".to_string(),
        extension: "md".to_string(),
        modified: t0 + Duration::seconds(1),
        created: t0,
    };
    let changes = reconcile::classify(&[local.clone()], &remote, "test-vault");
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].state, FileState::Modified);

    let unchanged = LocalFile {
        modified: t0,
        ..local
    };
    assert!(reconcile::classify(&[unchanged], &remote, "test-vault").is_empty());
}

#[test]
fn test_real_tokenizer_chunks_cover_long_text() {
    let tokenizer = Cl100kTokenizer::new().unwrap();
    let text = (0..300)
        .map(|i| format!("Sentence number {} talks about topic {}.", i, i % 7))
        .collect::<Vec<_>>()
        .join(" ");

    let chunks = vault_sync::chunk::text_chunks(&tokenizer, &text, 200);
    assert!(chunks.len() > 1);
    for chunk in &chunks {
        assert!(chunk.chars().count() > 5);
        assert!(chunk.ends_with('.'));
    }
    let squashed: String = text.split_whitespace().collect();
    let rejoined: String = chunks.concat().split_whitespace().collect();
    assert_eq!(rejoined, squashed);
}

#[tokio::test]
async fn test_create_note_command_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let vault = Arc::new(Vault::open(&config.vault).unwrap());
    let store = Arc::new(RecordingStore::new());

    let ctx = AppContext::assemble(&config, vault, store.clone(), Arc::new(HashEmbedder)).unwrap();

    let queued = ctx
        .datastore
        .enqueue_command(CommandKind::CreateNote(CommandContent::new("hi")))
        .await
        .unwrap();

    let outcome = ctx.poller.run_cycle().await;
    assert_eq!(outcome, CycleOutcome::Completed { id: queued.id.clone() });

    let note_path = format!("{}.md", queued.id);
    assert_eq!(ctx.vault.read(&note_path).unwrap(), "hi");
    assert_eq!(*store.replaced.lock().unwrap(), vec![queued.id.clone()]);

    let stored = ctx.datastore.get_command(&queued.id).await.unwrap().unwrap();
    assert_eq!(stored.status, CommandStatus::Completed);
    assert!(stored.errors.is_none());

    assert!(ctx.datastore.poll_command().await.unwrap().is_none());
    assert_eq!(ctx.poller.run_cycle().await, CycleOutcome::Empty);
}

#[tokio::test]
async fn test_created_note_is_unchanged_on_next_reconcile() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let vault = Arc::new(Vault::open(&config.vault).unwrap());
    let ctx = AppContext::assemble(
        &config,
        vault,
        Arc::new(InMemoryStore::new()),
        Arc::new(HashEmbedder),
    )
    .unwrap();

    ctx.datastore
        .enqueue_command(CommandKind::CreateNote(
            CommandContent::new("A note long enough to be embedded.")
                .with_source_id(Some("Inbox".to_string())),
        ))
        .await
        .unwrap();
    assert!(matches!(ctx.poller.run_cycle().await, CycleOutcome::Completed { .. }));

    let files = ctx.vault.list_files().unwrap();
    let remote = ctx.datastore.synced_documents(ctx.table()).await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(remote.len(), 1);
    assert_eq!(remote[0].base.source, Source::Chat);
    assert!(reconcile::compute_changes(&files, &remote, ctx.vault.name()).is_empty());
}

#[tokio::test]
async fn test_sequential_claims_never_repeat() {
    let ds = in_memory_datastore();
    for i in 0..3 {
        ds.enqueue_command(CommandKind::CreateNote(CommandContent::new(format!("note {}", i))))
        .await
        .unwrap();
    }

    let first = ds
        .poll_command()
        .await
        .unwrap()
        .and_then(ClaimedCommand::into_command)
        .unwrap();
    let second = ds.poll_command().await.unwrap().unwrap();
    assert_ne!(first.id, second.id());
    assert_eq!(first.status, CommandStatus::Processing);
    assert_eq!(
        ds.get_command(&first.id).await.unwrap().unwrap().status,
        CommandStatus::Processing
    );
}

#[tokio::test]
async fn test_processor_failure_marks_error_and_keeps_polling() {
    let ds = in_memory_datastore();
    let poller = DatabasePoller::new(
        ds.clone(),
        Arc::new(BrokenProcessor),
        std::time::Duration::from_secs(5),
    );

    let a = ds
        .enqueue_command(CommandKind::CreateNote(CommandContent::new("a")))
        .await
        .unwrap();
    let b = ds
        .enqueue_command(CommandKind::CreateNote(CommandContent::new("b")))
        .await
        .unwrap();

    assert!(matches!(poller.run_cycle().await, CycleOutcome::Failed { ref id, .. } if *id == a.id));
    assert!(matches!(poller.run_cycle().await, CycleOutcome::Failed { ref id, .. } if *id == b.id));

    for id in [&a.id, &b.id] {
        let cmd = ds.get_command(id).await.unwrap().unwrap();
        assert_eq!(cmd.status, CommandStatus::Error);
        assert!(cmd.errors.unwrap().contains("processor crashed"));
    }
}

#[tokio::test]
async fn test_sqlite_store_through_datastore() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let pool = db::connect(&config.store).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();

    let engine = Arc::new(ChunkingEngine::new(
        Arc::new(Cl100kTokenizer::new().unwrap()),
        Arc::new(HashEmbedder),
    ));
    let ds = DataStore::new(Arc::new(SqliteStore::new(pool)), engine);

    let meta = DocumentMetadata {
        source: Source::File,
        source_id: "notes/rust.md".to_string(),
        url: None,
        created_at: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
        author: Some("test-vault".to_string()),
    };
    let ids = ds
        .upsert(
            "documents",
            &[Document {
                id: Some("notes/rust".to_string()),
                text: "Ownership and borrowing are central to Rust.".to_string(),
                metadata: meta.clone(),
            }],
            None,
        )
        .await
        .unwrap();
    assert_eq!(ids, vec!["notes/rust".to_string()]);

    let synced = ds.synced_documents("documents").await.unwrap();
    assert_eq!(synced.len(), 1);
    assert_eq!(synced[0].base, meta);
    assert_eq!(synced[0].document_id, "notes/rust");

    let removed = ds
        .delete_by_filters(
            "documents",
            &DocumentMetadataFilter {
                source: Some(Source::File),
                author: Some("test-vault".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(ds.synced_documents("documents").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_queued_rows_are_routed_and_malformed_rows_marked_error() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let pool = db::connect(&config.store).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();

    // Rows as a remote producer writes them: payload is `{text, metadata}`.
    sqlx::query(
        r#"
        INSERT INTO commands (id, type, content, status, created_at, updated_at) VALUES
            ('c1', 'CREATE_NOTE',
             '{"text":"hi","metadata":{"source":"CHAT","sourceId":"Inbox","createdAt":"1700000000000"}}',
             'NEW', '2024-01-01T00:00:00.000Z', '2024-01-01T00:00:00.000Z'),
            ('c2', 'ARCHIVE_NOTE', '{"text":"x","metadata":{"sourceId":"a.md"}}',
             'NEW', '2024-01-01T00:00:01.000Z', '2024-01-01T00:00:01.000Z'),
            ('c3', 'DELETE_NOTE', '{"text":"","metadata":{"sourceId":"a.md"}}',
             'NEW', '2024-01-01T00:00:02.000Z', '2024-01-01T00:00:02.000Z')
        "#,
    )
    .execute(&pool)
    .await
    .unwrap();

    let vault = Arc::new(Vault::open(&config.vault).unwrap());
    let ctx = AppContext::assemble(
        &config,
        vault,
        Arc::new(SqliteStore::new(pool.clone())),
        Arc::new(HashEmbedder),
    )
    .unwrap();

    assert_eq!(
        ctx.poller.run_cycle().await,
        CycleOutcome::Completed { id: "c1".to_string() }
    );
    assert_eq!(ctx.vault.read("Inbox/c1.md").unwrap(), "hi");

    let outcome = ctx.poller.run_cycle().await;
    assert!(matches!(outcome, CycleOutcome::Failed { ref id, ref error }
        if id == "c2" && error.contains("ARCHIVE_NOTE")));
    let (status, errors): (String, Option<String>) =
        sqlx::query_as("SELECT status, errors FROM commands WHERE id = 'c2'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, "ERROR");
    assert!(errors.unwrap().contains("ARCHIVE_NOTE"));

    let outcome = ctx.poller.run_cycle().await;
    assert!(matches!(outcome, CycleOutcome::Failed { ref id, ref error }
        if id == "c3" && error.contains("Unsupported command type: DELETE_NOTE")));
    assert_eq!(ctx.poller.run_cycle().await, CycleOutcome::Empty);
}
