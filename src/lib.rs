//! # vault-sync
//!
//! Keeps a folder of text documents mirrored into a vector-searchable store
//! and drives a remote command queue through which an external agent
//! requests document mutations.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────┐   ┌──────────────┐   ┌──────────┐
//! │  Vault   │──▶│ Reconcile + │──▶│  Chunk +     │──▶│  Store   │
//! │  files   │   │  Staging    │   │  Embed       │   │ (SQLite) │
//! └──────────┘   └─────────────┘   └──────────────┘   └────┬─────┘
//!      ▲                                                   │ claim
//!      │          ┌──────────────────┐   ┌───────────┐     │
//!      └──────────│ NoteCommandHandler│◀──│  Poller   │◀────┘
//!                 └──────────────────┘   └───────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Documents, chunks, filters, commands, timestamps |
//! | [`tokenizer`] | BPE tokenizer adapter |
//! | [`chunk`] | Token-bounded chunking and batched embedding |
//! | [`embedding`] | Embedding providers and vector helpers |
//! | [`store`] | Storage backends (in-memory, SQLite) |
//! | [`datastore`] | Upsert, query and command-queue client |
//! | [`db`] | SQLite connection |
//! | [`migrate`] | Schema migrations |
//! | [`vault`] | Local file enumeration and note creation |
//! | [`state_tree`] | Document state tree |
//! | [`reconcile`] | Local vs. remote change classification |
//! | [`staging`] | Staged/unstaged change review |
//! | [`sync`] | Applying changes to the store |
//! | [`command`] | Remote command execution |
//! | [`poller`] | Command polling loop |
//! | [`context`] | Component wiring |

pub mod chunk;
pub mod command;
pub mod config;
pub mod context;
pub mod datastore;
pub mod db;
pub mod embedding;
pub mod migrate;
pub mod models;
pub mod poller;
pub mod reconcile;
pub mod staging;
pub mod state_tree;
pub mod store;
pub mod sync;
pub mod tokenizer;
pub mod vault;
