//! Execution of remotely queued commands against the local vault.
//!
//! [`CommandProcessor`] is the seam the [`DatabasePoller`](crate::poller::DatabasePoller)
//! hands claimed commands to. [`NoteCommandHandler`] is the production
//! processor: it creates notes in the vault and upserts them.
//!
//! # CREATE_NOTE
//!
//! The destination folder is the first of:
//!
//! 1. the payload's `metadata.sourceId`,
//! 2. the configured `vault.new_note_folder`,
//! 3. the vault's default parent (its root).
//!
//! The file is named `<command id>.md`, or `Note #<n>.md` with a random
//! `n` when the command has no id. The new note is upserted as a `chat`
//! document whose `sourceId` is the new file's path.
//!
//! `MODIFY_NOTE` and `DELETE_NOTE` are not handled yet and report `false`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use crate::datastore::DataStore;
use crate::models::{Command, CommandContent, CommandKind, Document, DocumentMetadata, Source};
use crate::vault::{normalize_path, Vault};

#[async_trait]
pub trait CommandProcessor: Send + Sync {
    /// Execute `command`. `Ok(false)` means the command type is not
    /// supported; an `Err` means it failed part way.
    async fn handle_new_command(&self, command: &Command) -> Result<bool>;
}

pub struct NoteCommandHandler {
    vault: Arc<Vault>,
    datastore: Arc<DataStore>,
    table: String,
    new_note_folder: Option<String>,
    chunk_token_size: Option<usize>,
}

impl NoteCommandHandler {
    pub fn new(vault: Arc<Vault>, datastore: Arc<DataStore>, table: &str) -> Self {
        Self {
            vault,
            datastore,
            table: table.to_string(),
            new_note_folder: None,
            chunk_token_size: None,
        }
    }

    pub fn with_new_note_folder(mut self, folder: Option<String>) -> Self {
        self.new_note_folder = folder.filter(|f| !normalize_path(f).is_empty());
        self
    }

    pub fn with_chunk_token_size(mut self, size: usize) -> Self {
        self.chunk_token_size = Some(size);
        self
    }

    /// Vault-relative path for the note a CREATE_NOTE command produces.
    pub fn new_note_path(&self, command_id: &str, payload: &CommandContent) -> String {
        let folder = payload
            .source_id()
            .map(normalize_path)
            .filter(|f| !f.is_empty())
            .or_else(|| self.new_note_folder.as_deref().map(normalize_path))
            .unwrap_or_else(|| self.vault.default_new_file_parent());

        let file_name = if command_id.is_empty() {
            let n = Uuid::new_v4().as_u128() % 9999 + 1;
            format!("Note #{}.md", n)
        } else {
            format!("{}.md", command_id)
        };

        if folder.is_empty() {
            file_name
        } else {
            format!("{}/{}", folder, file_name)
        }
    }

    async fn create_note(&self, command: &Command, payload: &CommandContent) -> Result<()> {
        let path = self.new_note_path(&command.id, payload);
        let file = self
            .vault
            .create(&path, &payload.text)
            .with_context(|| format!("Failed to create note for command {}", command.id))?;

        let document = Document {
            id: Some(file.document_id()),
            text: payload.text.clone(),
            metadata: DocumentMetadata {
                source: Source::Chat,
                source_id: file.path.clone(),
                url: None,
                created_at: file.modified,
                author: Some(self.vault.name().to_string()),
            },
        };

        self.datastore
            .upsert(&self.table, &[document], self.chunk_token_size)
            .await?;

        tracing::info!(command_id = %command.id, path = %file.path, "note created and synced");
        Ok(())
    }
}

#[async_trait]
impl CommandProcessor for NoteCommandHandler {
    async fn handle_new_command(&self, command: &Command) -> Result<bool> {
        tracing::info!(command_id = %command.id, kind = command.kind.type_name(), "handling command");

        match &command.kind {
            CommandKind::CreateNote(payload) => {
                self.create_note(command, payload).await?;
                Ok(true)
            }
            CommandKind::ModifyNote(_) | CommandKind::DeleteNote(_) => {
                tracing::warn!(
                    command_id = %command.id,
                    kind = command.kind.type_name(),
                    "command type not implemented"
                );
                Ok(false)
            }
        }
    }
}
