//! Core data models shared by the chunker, the reconciler, the store and
//! the command poller.
//!
//! Timestamps are `DateTime<Utc>` kept at millisecond precision (see
//! [`to_millis_precision`]) so that a value read back from the store
//! compares equal to the local file time it was recorded from.

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where a document originally came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    #[serde(alias = "EMAIL")]
    Email,
    #[serde(alias = "FILE")]
    File,
    #[serde(alias = "CHAT")]
    Chat,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Email => "email",
            Source::File => "file",
            Source::Chat => "chat",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "email" => Ok(Source::Email),
            "file" => Ok(Source::File),
            "chat" => Ok(Source::Chat),
            other => bail!("Unknown document source: '{}'", other),
        }
    }
}

/// Metadata carried by every document and, by composition, every chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    pub source: Source,
    /// Natural key correlating a local file with its remote record.
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

/// A document handed to the chunking engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Generated when absent.
    pub id: Option<String>,
    pub text: String,
    pub metadata: DocumentMetadata,
}

/// Chunk metadata: the document metadata plus the owning document id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentChunkMetadata {
    #[serde(flatten)]
    pub base: DocumentMetadata,
    pub document_id: String,
}

/// A token-bounded slice of a document, optionally with its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChunk {
    /// `"<documentId>_<index>"`.
    pub id: String,
    pub text: String,
    pub metadata: DocumentChunkMetadata,
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChunkWithScore {
    pub chunk: DocumentChunk,
    pub score: f64,
}

/// Conjunctive filter over chunk metadata. Absent fields match everything;
/// the date bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentMetadataFilter {
    pub document_id: Option<String>,
    pub source: Option<Source>,
    pub source_id: Option<String>,
    pub author: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl DocumentMetadataFilter {
    pub fn by_document_id(id: &str) -> Self {
        Self {
            document_id: Some(id.to_string()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn matches(&self, meta: &DocumentChunkMetadata) -> bool {
        if let Some(ref id) = self.document_id {
            if &meta.document_id != id {
                return false;
            }
        }
        if let Some(source) = self.source {
            if meta.base.source != source {
                return false;
            }
        }
        if let Some(ref source_id) = self.source_id {
            if &meta.base.source_id != source_id {
                return false;
            }
        }
        if let Some(ref author) = self.author {
            if meta.base.author.as_ref() != Some(author) {
                return false;
            }
        }
        if let Some(start) = self.start_date {
            if meta.base.created_at < start {
                return false;
            }
        }
        if let Some(end) = self.end_date {
            if meta.base.created_at > end {
                return false;
            }
        }
        true
    }
}

pub const DEFAULT_TOP_K: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub query: String,
    pub filter: Option<DocumentMetadataFilter>,
    pub top_k: Option<usize>,
}

impl Query {
    pub fn top_k(&self) -> usize {
        self.top_k.unwrap_or(DEFAULT_TOP_K)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryWithEmbedding {
    pub query: Query,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub query: String,
    pub results: Vec<DocumentChunkWithScore>,
}

// ============ Reconciliation ============

/// Synchronization state of a node in the document state tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileState {
    New,
    Modified,
    Deleted,
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FileState::New => "NEW",
            FileState::Modified => "MODIFIED",
            FileState::Deleted => "DELETED",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
}

impl From<FileState> for ChangeType {
    fn from(state: FileState) -> Self {
        match state {
            FileState::New => ChangeType::Added,
            FileState::Modified => ChangeType::Modified,
            FileState::Deleted => ChangeType::Deleted,
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangeType::Added => "added",
            ChangeType::Modified => "modified",
            ChangeType::Deleted => "deleted",
        })
    }
}

/// A classified difference between the local vault and the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedChange {
    pub document: DocumentChunkMetadata,
    pub change_type: ChangeType,
}

// ============ Commands ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    New,
    Processing,
    Completed,
    Abandoned,
    Error,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::New => "NEW",
            CommandStatus::Processing => "PROCESSING",
            CommandStatus::Completed => "COMPLETED",
            CommandStatus::Abandoned => "ABANDONED",
            CommandStatus::Error => "ERROR",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Completed | CommandStatus::Abandoned | CommandStatus::Error
        )
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NEW" => Ok(CommandStatus::New),
            "PROCESSING" => Ok(CommandStatus::Processing),
            "COMPLETED" => Ok(CommandStatus::Completed),
            "ABANDONED" => Ok(CommandStatus::Abandoned),
            "ERROR" => Ok(CommandStatus::Error),
            other => bail!("Unknown command status: '{}'", other),
        }
    }
}

/// Loose document metadata attached to a command payload.
///
/// Every field is optional and unknown fields are ignored, so a producer
/// sending the full document metadata shape still decodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// For CREATE_NOTE, the destination folder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

/// `{ text, metadata }` payload carried by every command type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandContent {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub metadata: CommandMetadata,
}

impl CommandContent {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: CommandMetadata::default(),
        }
    }

    pub fn with_source_id(mut self, source_id: Option<String>) -> Self {
        self.metadata.source_id = source_id;
        self
    }

    pub fn source_id(&self) -> Option<&str> {
        self.metadata.source_id.as_deref()
    }
}

/// What a queued command asks for, each variant with its own payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    CreateNote(CommandContent),
    ModifyNote(CommandContent),
    DeleteNote(CommandContent),
}

impl CommandKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            CommandKind::CreateNote(_) => "CREATE_NOTE",
            CommandKind::ModifyNote(_) => "MODIFY_NOTE",
            CommandKind::DeleteNote(_) => "DELETE_NOTE",
        }
    }

    pub fn content(&self) -> &CommandContent {
        match self {
            CommandKind::CreateNote(content)
            | CommandKind::ModifyNote(content)
            | CommandKind::DeleteNote(content) => content,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| anyhow!("Invalid command payload: {}", e))
    }
}

/// A remotely queued request for a document mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub id: String,
    pub status: CommandStatus,
    pub errors: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub kind: CommandKind,
}

/// Result of claiming a queued command.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimedCommand {
    Ready(Command),
    /// The row was flipped to `PROCESSING` but could not be decoded. It
    /// still needs a terminal status.
    Malformed { id: String, error: String },
}

impl ClaimedCommand {
    pub fn id(&self) -> &str {
        match self {
            ClaimedCommand::Ready(command) => &command.id,
            ClaimedCommand::Malformed { id, .. } => id,
        }
    }

    pub fn into_command(self) -> Option<Command> {
        match self {
            ClaimedCommand::Ready(command) => Some(command),
            ClaimedCommand::Malformed { .. } => None,
        }
    }
}

// ============ Timestamps ============

/// Drop sub-millisecond precision.
pub fn to_millis_precision(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}

/// Current time at millisecond precision.
pub fn now_millis() -> DateTime<Utc> {
    to_millis_precision(Utc::now())
}

/// RFC 3339 with millisecond precision, the persisted form.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse RFC 3339 text or an epoch-milliseconds integer string.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    let trimmed = s.trim();
    if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        let millis: i64 = trimmed.parse()?;
        return DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| anyhow!("Timestamp out of range: {}", trimmed));
    }
    let parsed = DateTime::parse_from_rfc3339(trimmed)
        .map_err(|e| anyhow!("Invalid timestamp '{}': {}", trimmed, e))?;
    Ok(to_millis_precision(parsed.with_timezone(&Utc)))
}
