//! Local document root: enumeration, reads and note creation.
//!
//! Files are addressed by their vault-relative, `/`-separated path. That
//! path is the natural key matched against a stored record's `sourceId`;
//! the same path without its extension is the document id.
//!
//! Enumeration walks the root with `walkdir`, skips `.git`, `.obsidian`
//! and `target`, then applies the configured include/exclude globs.
//! Modification and creation times are truncated to milliseconds.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

use crate::config::VaultConfig;
use crate::models::to_millis_precision;

const DEFAULT_EXCLUDES: [&str; 3] = ["**/.git/**", "**/.obsidian/**", "**/target/**"];

/// A file found under the vault root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    /// Vault-relative path with `/` separators, e.g. `notes/today.md`.
    pub path: String,
    /// File name without extension.
    pub basename: String,
    pub extension: String,
    pub modified: DateTime<Utc>,
    pub created: DateTime<Utc>,
}

impl LocalFile {
    /// Path without extension.
    pub fn document_id(&self) -> String {
        if self.extension.is_empty() {
            return self.path.clone();
        }
        self.path
            .strip_suffix(&format!(".{}", self.extension))
            .unwrap_or(&self.path)
            .to_string()
    }
}

pub struct Vault {
    root: PathBuf,
    name: String,
    include: GlobSet,
    exclude: GlobSet,
}

impl Vault {
    /// Open the vault described by `config`. The root must exist.
    pub fn open(config: &VaultConfig) -> Result<Self> {
        let root = &config.root;
        if !root.is_dir() {
            bail!("Vault root does not exist: {}", root.display());
        }

        let name = match config.name {
            Some(ref name) => name.clone(),
            None => root
                .canonicalize()
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
                .unwrap_or_else(|| "vault".to_string()),
        };

        let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        excludes.extend(config.exclude_globs.iter().cloned());

        Ok(Self {
            root: root.clone(),
            name,
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&excludes)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Collection name, written as the `author` of synced documents.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All matching files, sorted by path.
    pub fn list_files(&self) -> Result<Vec<LocalFile>> {
        let mut files = Vec::new();

        for entry in WalkDir::new(&self.root) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = entry.path().strip_prefix(&self.root).unwrap_or(entry.path());
            let rel_str = to_vault_path(relative);

            if self.exclude.is_match(&rel_str) || !self.include.is_match(&rel_str) {
                continue;
            }

            files.push(self.stat_path(entry.path(), rel_str)?);
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        tracing::debug!(count = files.len(), root = %self.root.display(), "listed vault files");
        Ok(files)
    }

    pub fn stat(&self, path: &str) -> Result<LocalFile> {
        let full = self.resolve(path)?;
        self.stat_path(&full, normalize_path(path))
    }

    pub fn read(&self, path: &str) -> Result<String> {
        let full = self.resolve(path)?;
        std::fs::read_to_string(&full).with_context(|| format!("Failed to read {}", path))
    }

    /// Create a new file with `text`, creating parent folders as needed.
    /// Fails if the file already exists.
    pub fn create(&self, path: &str, text: &str) -> Result<LocalFile> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&full)
            .with_context(|| format!("Failed to create {}", path))?;
        file.write_all(text.as_bytes())?;
        file.sync_all()?;
        drop(file);

        tracing::info!(path, "created note");
        self.stat_path(&full, normalize_path(path))
    }

    /// Folder new files go to when nothing else is specified: the root.
    pub fn default_new_file_parent(&self) -> String {
        String::new()
    }

    /// Map a vault-relative path to a filesystem path, refusing anything
    /// that would land outside the root.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let normalized = normalize_path(path);
        if normalized.is_empty() {
            bail!("Empty vault path");
        }
        let relative = Path::new(&normalized);
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => bail!("Path escapes the vault root: {}", path),
            }
        }
        Ok(self.root.join(relative))
    }

    fn stat_path(&self, full: &Path, path: String) -> Result<LocalFile> {
        let metadata =
            std::fs::metadata(full).with_context(|| format!("Failed to stat {}", path))?;
        let modified = system_time_to_utc(metadata.modified()?);
        let created = metadata
            .created()
            .map(system_time_to_utc)
            .unwrap_or(modified);

        let file_path = Path::new(&path);
        let basename = file_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .ok_or_else(|| anyhow!("Path has no file name: {}", path))?;
        let extension = file_path
            .extension()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        Ok(LocalFile {
            path,
            basename,
            extension,
            modified,
            created,
        })
    }
}

fn system_time_to_utc(t: SystemTime) -> DateTime<Utc> {
    to_millis_precision(DateTime::<Utc>::from(t))
}

/// `/`-joined path components, independent of the platform separator.
fn to_vault_path(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Strip leading/trailing separators and collapse backslashes.
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/").trim_matches('/').to_string()
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
