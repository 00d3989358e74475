//! Reverse lookup: rehydrate forgotten topics into Hot
//!
//! When a new observation mentions something the Active Document does not
//! know about, matching material is pulled back from the Warm archive, the
//! note vault or the cloud store into `hot/recovered/`. The first source that
//! yields anything wins. Nothing in Hot is ever overwritten.

use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RecoveryConfig;
use crate::error::Result;
use crate::integrations::{CloudStore, NoteVault, SemanticIndex};
use crate::observation::Observation;
use crate::retry::RetryPolicy;
use crate::storage::ArchiveCatalog;
use crate::util::{keywords, leading_chars, walk_files, words};

/// Subdirectory of Hot that receives recovered files
pub const RECOVERED_DIR: &str = "recovered";

/// What one recovery attempt did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryOutcome {
    /// The topic was already known; nothing was looked up
    pub known: bool,
    pub from_archive: usize,
    pub from_vault: usize,
    pub from_cloud: usize,
}

impl RecoveryOutcome {
    fn known() -> Self {
        Self {
            known: true,
            ..Default::default()
        }
    }

    pub fn total(&self) -> usize {
        self.from_archive + self.from_vault + self.from_cloud
    }
}

/// Recovery engine
pub struct ReverseLookup {
    hot_dir: PathBuf,
    staging_dir: PathBuf,
    retry: RetryPolicy,
    settings: RecoveryConfig,
    semantic: Option<Arc<dyn SemanticIndex>>,
    catalog: Option<Arc<ArchiveCatalog>>,
    vault: Option<(Arc<dyn NoteVault>, String)>,
    cloud: Option<Arc<dyn CloudStore>>,
}

impl ReverseLookup {
    pub fn new(
        hot_dir: impl Into<PathBuf>,
        staging_dir: impl Into<PathBuf>,
        retry: RetryPolicy,
        settings: RecoveryConfig,
    ) -> Self {
        Self {
            hot_dir: hot_dir.into(),
            staging_dir: staging_dir.into(),
            retry,
            settings,
            semantic: None,
            catalog: None,
            vault: None,
            cloud: None,
        }
    }

    pub fn with_semantic_index(mut self, index: Arc<dyn SemanticIndex>) -> Self {
        self.semantic = Some(index);
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<ArchiveCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Builder: search `folder` inside the vault
    pub fn with_vault(mut self, vault: Arc<dyn NoteVault>, folder: impl Into<String>) -> Self {
        self.vault = Some((vault, folder.into()));
        self
    }

    pub fn with_cloud(mut self, cloud: Arc<dyn CloudStore>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    pub fn recovered_dir(&self) -> PathBuf {
        self.hot_dir.join(RECOVERED_DIR)
    }

    /// Run the lookup chain for one observation
    ///
    /// `context` is the Active Document text as it was before this
    /// observation's batch was merged.
    pub async fn recover(&self, observation: &Observation, context: &str) -> Result<RecoveryOutcome> {
        let query = leading_chars(&observation.content, self.settings.query_chars);

        if self.is_known(query, context).await {
            debug!(id = %observation.id, "topic already known");
            return Ok(RecoveryOutcome::known());
        }

        let mut outcome = RecoveryOutcome::default();

        outcome.from_archive = self.from_archive(query);
        if outcome.total() > 0 {
            return Ok(self.finish(observation, outcome));
        }

        outcome.from_vault = self.from_vault(query).await;
        if outcome.total() > 0 {
            return Ok(self.finish(observation, outcome));
        }

        outcome.from_cloud = self.from_cloud(query).await?;
        Ok(self.finish(observation, outcome))
    }

    fn finish(&self, observation: &Observation, outcome: RecoveryOutcome) -> RecoveryOutcome {
        if outcome.total() > 0 {
            info!(
                id = %observation.id,
                archive = outcome.from_archive,
                vault = outcome.from_vault,
                cloud = outcome.from_cloud,
                "recovered context into hot"
            );
        }
        outcome
    }

    async fn is_known(&self, query: &str, context: &str) -> bool {
        let Some(index) = &self.semantic else {
            return is_known_lexically(query, context);
        };

        let index = index.as_ref();
        match self.retry.run("semantic search", move || index.search(query, 1)).await {
            Ok(hits) => hits
                .first()
                .map_or(false, |hit| hit.distance < self.settings.distance_threshold),
            Err(e) => {
                warn!(error = %e, "semantic search failed, using lexical check");
                is_known_lexically(query, context)
            }
        }
    }

    fn from_archive(&self, query: &str) -> usize {
        let Some(catalog) = &self.catalog else {
            return 0;
        };

        let records = match catalog.search(query, self.settings.archive_max_results) {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "archive catalog search failed");
                return 0;
            }
        };

        records
            .iter()
            .filter(|record| {
                // prefer the archived file; fall back to the cataloged text
                let content = std::fs::read(&record.path)
                    .unwrap_or_else(|_| record.content.clone().into_bytes());
                self.admit(&record.restore_name, &content)
            })
            .count()
    }

    async fn from_vault(&self, query: &str) -> usize {
        let Some((vault, folder)) = &self.vault else {
            return 0;
        };

        let vault = vault.as_ref();
        let folder = Some(folder.as_str());
        let max = self.settings.vault_max_results;
        let notes = match self
            .retry
            .run("vault search", move || vault.search(query, folder, max))
            .await
        {
            Ok(notes) => notes,
            Err(e) => {
                warn!(error = %e, "vault search failed");
                return 0;
            }
        };

        notes
            .iter()
            .filter(|note| {
                let Some(name) = note.path.file_name() else {
                    return false;
                };
                match std::fs::read(&note.path) {
                    Ok(content) => self.admit(&name.to_string_lossy(), &content),
                    Err(e) => {
                        warn!(path = %note.path.display(), error = %e, "cannot read vault note");
                        false
                    }
                }
            })
            .count()
    }

    /// Cloud downloads land in a private staging directory first, then
    /// only names absent from Hot are admitted.
    async fn from_cloud(&self, query: &str) -> Result<usize> {
        let Some(cloud) = &self.cloud else {
            return Ok(0);
        };
        if !cloud.is_available() {
            return Ok(0);
        }

        let staging = self.staging_dir.join(Uuid::new_v4().simple().to_string());
        std::fs::create_dir_all(&staging)?;

        let cloud = cloud.as_ref();
        let staging_ref = staging.as_path();
        let max = self.settings.cloud_max_results;
        let downloaded = self
            .retry
            .run("cloud lookup", move || cloud.reverse_lookup(query, staging_ref, max))
            .await;

        let admitted = match downloaded {
            Ok(paths) => paths
                .iter()
                .filter(|path| {
                    let (Some(name), Ok(content)) = (path.file_name(), std::fs::read(path)) else {
                        return false;
                    };
                    self.admit(&name.to_string_lossy(), &content)
                })
                .count(),
            Err(e) => {
                warn!(error = %e, "cloud lookup failed");
                0
            }
        };

        if let Err(e) = std::fs::remove_dir_all(&staging) {
            warn!(path = %staging.display(), error = %e, "failed to clean staging directory");
        }
        Ok(admitted)
    }

    /// Write `content` to `hot/recovered/<name>` unless `name` exists anywhere in Hot
    fn admit(&self, name: &str, content: &[u8]) -> bool {
        match self.hot_contains(name) {
            Ok(true) => {
                debug!(name, "already in hot, skipping");
                return false;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "cannot scan hot directory");
                return false;
            }
        }

        let dir = self.recovered_dir();
        let written = std::fs::create_dir_all(&dir).and_then(|()| {
            // create_new: never clobber a file that appeared concurrently
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(dir.join(name))?;
            file.write_all(content)
        });

        match written {
            Ok(()) => true,
            Err(e) => {
                warn!(name, error = %e, "failed to write recovered file");
                false
            }
        }
    }

    fn hot_contains(&self, name: &str) -> Result<bool> {
        Ok(walk_files(&self.hot_dir)?
            .iter()
            .any(|p| p.file_name().map_or(false, |n| n == name)))
    }
}

/// More than half of the query's keywords occur in `context`
///
/// A query without keywords counts as known.
pub fn is_known_lexically(query: &str, context: &str) -> bool {
    let query_words = keywords(query);
    if query_words.is_empty() {
        return true;
    }

    let context_words: HashSet<String> = words(context).into_iter().collect();
    let present = query_words
        .iter()
        .filter(|w| context_words.contains(w.as_str()))
        .count();
    present * 2 > query_words.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::{Category, Priority};
    use crate::storage::{ArchiveRecord, UnitKind};
    use crate::testing::{MockCloudStore, MockSemanticIndex, MockVault};
    use tempfile::TempDir;

    fn obs(content: &str) -> Observation {
        Observation::new("obs_t", Priority::Medium, Category::Fact, content).unwrap()
    }

    fn engine(dir: &TempDir) -> ReverseLookup {
        ReverseLookup::new(
            dir.path().join("hot"),
            dir.path().join(".staging"),
            RetryPolicy::once(),
            RecoveryConfig::default(),
        )
    }

    #[test]
    fn lexical_check() {
        let ctx = "## Observations Log\n- User prefers Python for scripting";
        assert!(is_known_lexically("prefers Python", ctx));
        assert!(!is_known_lexically("kubernetes cluster upgrade", ctx));
        // exactly half is not enough
        assert!(!is_known_lexically("python kubernetes", ctx));
        assert!(is_known_lexically("a to be", ctx));
    }

    #[tokio::test]
    async fn vault_match_is_copied_into_hot() {
        let dir = TempDir::new().unwrap();
        let note = dir.path().join("vault/kubernetes.md");
        std::fs::create_dir_all(note.parent().unwrap()).unwrap();
        std::fs::write(&note, "# K8s\nupgrade steps").unwrap();

        let vault = Arc::new(MockVault::with_notes(vec![note.clone()]));
        let engine = engine(&dir).with_vault(vault.clone(), "OC-Memory");

        let outcome = engine
            .recover(&obs("Planning kubernetes cluster upgrade"), "")
            .await
            .unwrap();
        assert_eq!(outcome.from_vault, 1);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("hot/recovered/kubernetes.md")).unwrap(),
            "# K8s\nupgrade steps"
        );
        assert_eq!(vault.search_calls(), 1);
    }

    #[tokio::test]
    async fn existing_hot_file_is_never_overwritten() {
        let dir = TempDir::new().unwrap();
        let existing = dir.path().join("hot/notes/kubernetes.md");
        std::fs::create_dir_all(existing.parent().unwrap()).unwrap();
        std::fs::write(&existing, "mine").unwrap();

        let note = dir.path().join("vault/kubernetes.md");
        std::fs::create_dir_all(note.parent().unwrap()).unwrap();
        std::fs::write(&note, "theirs").unwrap();

        let engine = engine(&dir).with_vault(Arc::new(MockVault::with_notes(vec![note])), "f");
        let outcome = engine.recover(&obs("kubernetes cluster upgrade"), "").await.unwrap();

        assert_eq!(outcome.total(), 0);
        assert_eq!(std::fs::read_to_string(&existing).unwrap(), "mine");
        assert!(!dir.path().join("hot/recovered/kubernetes.md").exists());
    }

    #[tokio::test]
    async fn known_topic_skips_lookups() {
        let dir = TempDir::new().unwrap();
        let vault = Arc::new(MockVault::with_notes(vec![]));
        let engine = engine(&dir).with_vault(vault.clone(), "f");

        let outcome = engine
            .recover(&obs("User prefers Python"), "- User prefers Python daily")
            .await
            .unwrap();
        assert!(outcome.known);
        assert_eq!(vault.search_calls(), 0);
    }

    #[tokio::test]
    async fn semantic_distance_decides_when_present() {
        let dir = TempDir::new().unwrap();
        let vault = Arc::new(MockVault::with_notes(vec![]));

        let near = engine(&dir)
            .with_semantic_index(Arc::new(MockSemanticIndex::with_distance(0.1)))
            .with_vault(vault.clone(), "f");
        assert!(near.recover(&obs("totally new words here"), "").await.unwrap().known);

        let far = engine(&dir)
            .with_semantic_index(Arc::new(MockSemanticIndex::with_distance(0.9)))
            .with_vault(vault.clone(), "f");
        let outcome = far
            .recover(&obs("User prefers Python"), "- User prefers Python")
            .await
            .unwrap();
        assert!(!outcome.known);
        assert_eq!(vault.search_calls(), 1);
    }

    #[tokio::test]
    async fn archive_catalog_comes_first() {
        let dir = TempDir::new().unwrap();
        let catalog = Arc::new(ArchiveCatalog::in_memory().unwrap());
        catalog
            .record(&ArchiveRecord::new(
                UnitKind::File,
                dir.path().join("archive/gone.md"),
                "k8s-notes.md",
                "notes",
                "kubernetes cluster upgrade plan",
            ))
            .unwrap();
        let vault = Arc::new(MockVault::with_notes(vec![]));

        let engine = engine(&dir).with_catalog(catalog).with_vault(vault.clone(), "f");
        let outcome = engine.recover(&obs("kubernetes cluster upgrade"), "").await.unwrap();

        assert_eq!(outcome.from_archive, 1);
        assert_eq!(vault.search_calls(), 0);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("hot/recovered/k8s-notes.md")).unwrap(),
            "kubernetes cluster upgrade plan"
        );
    }

    #[tokio::test]
    async fn cloud_only_when_nothing_else_matched() {
        let dir = TempDir::new().unwrap();
        let cloud = Arc::new(MockCloudStore::with_files(vec![(
            "remote.md".to_string(),
            "from the cloud".to_string(),
        )]));
        let engine = engine(&dir)
            .with_vault(Arc::new(MockVault::with_notes(vec![])), "f")
            .with_cloud(cloud.clone());

        let outcome = engine.recover(&obs("quantum entanglement basics"), "").await.unwrap();
        assert_eq!(outcome.from_cloud, 1);
        assert_eq!(cloud.lookup_calls(), 1);
        assert!(dir.path().join("hot/recovered/remote.md").exists());
        // staging is cleaned up
        assert_eq!(std::fs::read_dir(dir.path().join(".staging")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn failing_vault_and_cloud_recover_nothing() {
        let dir = TempDir::new().unwrap();
        let vault = Arc::new(MockVault::failing());
        let cloud = Arc::new(MockCloudStore::failing());
        let engine = engine(&dir)
            .with_vault(vault.clone(), "f")
            .with_cloud(cloud.clone());

        let outcome = engine.recover(&obs("quantum entanglement basics"), "").await.unwrap();
        assert_eq!(outcome.total(), 0);
        assert_eq!(vault.search_calls(), 1);
        assert_eq!(cloud.lookup_calls(), 1);
        assert!(!dir.path().join("hot/recovered").exists());
        assert_eq!(std::fs::read_dir(dir.path().join(".staging")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn unavailable_cloud_is_not_called() {
        let dir = TempDir::new().unwrap();
        let cloud = Arc::new(MockCloudStore::unavailable());
        let engine = engine(&dir).with_cloud(cloud.clone());

        let outcome = engine.recover(&obs("quantum entanglement basics"), "").await.unwrap();
        assert_eq!(outcome.total(), 0);
        assert_eq!(cloud.lookup_calls(), 0);
    }
}
