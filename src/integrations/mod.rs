//! Collaborator seams: semantic index, note vault and cloud store
//!
//! Every collaborator is optional. The orchestrator holds each one as an
//! `Option<Arc<dyn Trait>>` and degrades gracefully when it is absent.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;

pub mod dropbox;
#[cfg(feature = "semantic")]
pub mod semantic;
pub mod vault;

pub use crate::llm::LlmClient;
pub use crate::observer::Extractor;
pub use dropbox::DropboxStore;
#[cfg(feature = "semantic")]
pub use semantic::VectorIndex;
pub use vault::FsVault;

/// Nearest-neighbour hit from a semantic index
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SemanticHit {
    pub id: String,
    pub content: String,
    /// Smaller is closer
    pub distance: f32,
}

/// Vector index over observation text
#[async_trait]
pub trait SemanticIndex: Send + Sync {
    async fn search(&self, query: &str, n: usize) -> Result<Vec<SemanticHit>>;

    async fn index(&self, id: &str, text: &str) -> Result<()>;
}

/// A note found in the vault
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VaultNote {
    /// Absolute path of the note on the local filesystem
    pub path: PathBuf,
    pub title: String,
}

/// Local note vault used for Cold replication and recovery
#[async_trait]
pub trait NoteVault: Send + Sync {
    async fn search(
        &self,
        query: &str,
        folder: Option<&str>,
        max_results: usize,
    ) -> Result<Vec<VaultNote>>;

    /// Mirror a local directory into `folder`; returns files written
    async fn sync_dir(&self, local: &Path, folder: &str) -> Result<usize>;

    /// Mirror a single file into `folder`; returns whether it was written
    async fn sync_file(&self, local: &Path, folder: &str) -> Result<bool>;
}

/// Outcome of a folder upload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub total_synced: usize,
    pub failed: usize,
}

/// Cloud object store (Cold tier)
#[async_trait]
pub trait CloudStore: Send + Sync {
    /// Configured and credentialed
    fn is_available(&self) -> bool;

    /// Download up to `max_results` files matching `query` into `dest`
    async fn reverse_lookup(&self, query: &str, dest: &Path, max_results: usize)
        -> Result<Vec<PathBuf>>;

    /// Upload every file under `local` to `remote_folder`
    async fn sync_folder(&self, local: &Path, remote_folder: &str) -> Result<SyncReport>;
}
