//! Reconciliation of local files against the last-known remote state.
//!
//! Each remote record is matched to a local file by natural key (the
//! record's `sourceId` against the file's vault-relative path):
//!
//! | Remote | Local | Outcome |
//! |--------|-------|---------|
//! | present | present, `createdAt < mtime` | `MODIFIED` |
//! | present | present, `createdAt >= mtime` | unchanged |
//! | `source = file` | absent | `DELETED` |
//! | other source | absent | ignored |
//! | absent | present | `NEW` |
//!
//! The comparison is strict: equal timestamps mean unchanged.

use std::collections::{HashMap, HashSet};

use crate::models::{
    ChangeType, DocumentChunkMetadata, DocumentMetadata, FileState, Source, StagedChange,
};
use crate::state_tree::{DocumentStateTree, NodeKind};
use crate::vault::LocalFile;

/// One classified difference.
#[derive(Debug, Clone, PartialEq)]
pub struct Classified {
    /// Vault-relative path of the node this change belongs to.
    pub path: String,
    pub state: FileState,
    /// Remote metadata for modified/deleted records, synthesized metadata
    /// for new files.
    pub metadata: DocumentChunkMetadata,
}

/// Metadata describing a local file that has never been synced.
pub fn new_file_metadata(file: &LocalFile, collection: &str) -> DocumentChunkMetadata {
    DocumentChunkMetadata {
        base: DocumentMetadata {
            source: Source::File,
            source_id: file.path.clone(),
            url: None,
            created_at: file.modified,
            author: Some(collection.to_string()),
        },
        document_id: file.document_id(),
    }
}

/// Classify every difference between `local_files` and `remote`.
///
/// Remote-derived changes come first in `remote` order, followed by new
/// files in `local_files` order.
pub fn classify(
    local_files: &[LocalFile],
    remote: &[DocumentChunkMetadata],
    collection: &str,
) -> Vec<Classified> {
    let by_key: HashMap<&str, &LocalFile> =
        local_files.iter().map(|f| (f.path.as_str(), f)).collect();
    let mut matched: HashSet<&str> = HashSet::new();
    let mut changes = Vec::new();

    for record in remote {
        let key = record.base.source_id.as_str();
        match by_key.get(key) {
            Some(file) => {
                if !matched.insert(file.path.as_str()) {
                    tracing::debug!(source_id = key, "duplicate remote record ignored");
                    continue;
                }
                if record.base.created_at < file.modified {
                    tracing::debug!(
                        path = %file.path,
                        remote = %record.base.created_at,
                        local = %file.modified,
                        "file modified since last sync"
                    );
                    changes.push(Classified {
                        path: file.path.clone(),
                        state: FileState::Modified,
                        metadata: record.clone(),
                    });
                }
            }
            None if record.base.source == Source::File => {
                changes.push(Classified {
                    path: key.to_string(),
                    state: FileState::Deleted,
                    metadata: record.clone(),
                });
            }
            None => {}
        }
    }

    for file in local_files {
        if !matched.contains(file.path.as_str()) {
            changes.push(Classified {
                path: file.path.clone(),
                state: FileState::New,
                metadata: new_file_metadata(file, collection),
            });
        }
    }

    changes
}

/// Build the state tree for the given local and remote state. Only changed
/// files appear, together with their ancestor folders.
pub fn build_tree(
    local_files: &[LocalFile],
    remote: &[DocumentChunkMetadata],
    collection: &str,
) -> DocumentStateTree {
    let mut tree = DocumentStateTree::new(collection);
    for change in classify(local_files, remote, collection) {
        tree.add_node(
            &change.path,
            NodeKind::File,
            Some(change.state),
            Some(change.metadata),
        );
    }
    tree
}

/// Flat change list for the staging area.
pub fn compute_changes(
    local_files: &[LocalFile],
    remote: &[DocumentChunkMetadata],
    collection: &str,
) -> Vec<StagedChange> {
    classify(local_files, remote, collection)
        .into_iter()
        .map(|c| StagedChange {
            document: c.metadata,
            change_type: ChangeType::from(c.state),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn local(path: &str, modified: DateTime<Utc>) -> LocalFile {
        let (stem, ext) = path.rsplit_once('.').unwrap_or((path, ""));
        LocalFile {
            path: path.to_string(),
            basename: stem.rsplit('/').next().unwrap().to_string(),
            extension: ext.to_string(),
            modified,
            created: modified,
        }
    }

    fn remote(source_id: &str, source: Source, created_at: DateTime<Utc>) -> DocumentChunkMetadata {
        DocumentChunkMetadata {
            base: DocumentMetadata {
                source,
                source_id: source_id.to_string(),
                url: None,
                created_at,
                author: Some("vault".to_string()),
            },
            document_id: source_id.trim_end_matches(".md").to_string(),
        }
    }

    #[test]
    fn test_newer_local_file_is_modified() {
        let changes = classify(
            &[local("note1.md", t0() + Duration::seconds(1))],
            &[remote("note1.md", Source::File, t0())],
            "vault",
        );
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].state, FileState::Modified);
        assert_eq!(changes[0].metadata.base.created_at, t0());
    }

    #[test]
    fn test_equal_timestamps_are_unchanged() {
        let changes = classify(
            &[local("note1.md", t0())],
            &[remote("note1.md", Source::File, t0())],
            "vault",
        );
        assert!(changes.is_empty());
    }

    #[test]
    fn test_older_local_file_is_unchanged() {
        let changes = classify(
            &[local("note1.md", t0() - Duration::milliseconds(1))],
            &[remote("note1.md", Source::File, t0())],
            "vault",
        );
        assert!(changes.is_empty());
    }

    #[test]
    fn test_missing_file_records_are_deleted_others_ignored() {
        let changes = classify(
            &[],
            &[
                remote("gone.md", Source::File, t0()),
                remote("chat.md", Source::Chat, t0()),
            ],
            "vault",
        );
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "gone.md");
        assert_eq!(changes[0].state, FileState::Deleted);
    }

    #[test]
    fn test_unmatched_local_files_are_new() {
        let changes = classify(&[local("dir/fresh.md", t0())], &[], "my-vault");
        assert_eq!(changes.len(), 1);
        let meta = &changes[0].metadata;
        assert_eq!(changes[0].state, FileState::New);
        assert_eq!(meta.base.source, Source::File);
        assert_eq!(meta.base.source_id, "dir/fresh.md");
        assert_eq!(meta.base.author.as_deref(), Some("my-vault"));
        assert_eq!(meta.base.created_at, t0());
        assert_eq!(meta.document_id, "dir/fresh");
    }

    #[test]
    fn test_build_tree_places_changes_under_folders() {
        let tree = build_tree(
            &[
                local("a/b/new.md", t0()),
                local("a/kept.md", t0()),
            ],
            &[
                remote("a/kept.md", Source::File, t0()),
                remote("x/removed.md", Source::File, t0()),
            ],
            "vault",
        );

        assert_eq!(
            tree.get_node("a/b/new.md").unwrap().state,
            Some(FileState::New)
        );
        assert_eq!(
            tree.get_node("x/removed.md").unwrap().state,
            Some(FileState::Deleted)
        );
        assert!(tree.get_node("a/kept.md").is_none());
        assert!(tree.get_node("a/b").unwrap().is_folder());
        assert_eq!(tree.changed_files().len(), 2);
    }

    #[test]
    fn test_compute_changes_maps_change_types() {
        let changes = compute_changes(
            &[local("m.md", t0() + Duration::seconds(5)), local("n.md", t0())],
            &[remote("m.md", Source::File, t0()), remote("d.md", Source::File, t0())],
            "vault",
        );
        let types: Vec<ChangeType> = changes.iter().map(|c| c.change_type).collect();
        assert_eq!(
            types,
            vec![ChangeType::Modified, ChangeType::Deleted, ChangeType::Added]
        );
    }
}
