//! Applying reconciled changes to the store.
//!
//! Added and modified files are read from the vault and upserted as `file`
//! documents; deleted records have their chunks removed. Documents are
//! handled one by one: a failure is logged and counted, and the rest of
//! the batch still goes through.

use anyhow::Result;

use crate::datastore::DataStore;
use crate::models::{
    ChangeType, Document, DocumentMetadata, DocumentMetadataFilter, Source, StagedChange,
};
use crate::vault::{LocalFile, Vault};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub failed: usize,
}

impl SyncReport {
    pub fn total_ok(&self) -> usize {
        self.added + self.modified + self.deleted
    }
}

/// The document a local file is uploaded as.
pub fn file_document(vault: &Vault, file: &LocalFile) -> Result<Document> {
    let text = vault.read(&file.path)?;
    Ok(Document {
        id: Some(file.document_id()),
        text,
        metadata: DocumentMetadata {
            source: Source::File,
            source_id: file.path.clone(),
            url: None,
            created_at: file.modified,
            author: Some(vault.name().to_string()),
        },
    })
}

pub async fn apply_changes(
    changes: &[StagedChange],
    vault: &Vault,
    datastore: &DataStore,
    table: &str,
    chunk_token_size: Option<usize>,
) -> SyncReport {
    let mut report = SyncReport::default();

    for change in changes {
        let result = apply_change(change, vault, datastore, table, chunk_token_size).await;
        match result {
            Ok(()) => match change.change_type {
                ChangeType::Added => report.added += 1,
                ChangeType::Modified => report.modified += 1,
                ChangeType::Deleted => report.deleted += 1,
            },
            Err(e) => {
                tracing::error!(
                    source_id = %change.document.base.source_id,
                    change = %change.change_type,
                    error = %format!("{:#}", e),
                    "failed to apply change"
                );
                report.failed += 1;
            }
        }
    }

    tracing::info!(
        added = report.added,
        modified = report.modified,
        deleted = report.deleted,
        failed = report.failed,
        "applied changes"
    );
    report
}

async fn apply_change(
    change: &StagedChange,
    vault: &Vault,
    datastore: &DataStore,
    table: &str,
    chunk_token_size: Option<usize>,
) -> Result<()> {
    match change.change_type {
        ChangeType::Added | ChangeType::Modified => {
            let file = vault.stat(&change.document.base.source_id)?;
            let document = file_document(vault, &file)?;
            datastore
                .upsert(table, &[document], chunk_token_size)
                .await?;
        }
        ChangeType::Deleted => {
            let filter = DocumentMetadataFilter::by_document_id(&change.document.document_id);
            datastore.delete_by_filters(table, &filter).await?;
        }
    }
    Ok(())
}

/// Upload every local file, replacing whatever the store holds for it.
pub async fn sync_all(
    vault: &Vault,
    datastore: &DataStore,
    table: &str,
    chunk_token_size: Option<usize>,
) -> Result<SyncReport> {
    let files = vault.list_files()?;
    let mut report = SyncReport::default();

    for file in &files {
        let outcome = match file_document(vault, file) {
            Ok(document) => datastore
                .upsert(table, &[document], chunk_token_size)
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => report.added += 1,
            Err(e) => {
                tracing::error!(path = %file.path, error = %format!("{:#}", e), "failed to sync file");
                report.failed += 1;
            }
        }
    }

    tracing::info!(synced = report.added, failed = report.failed, "full sync finished");
    Ok(report)
}
