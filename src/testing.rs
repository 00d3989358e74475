//! Scripted collaborators for tests
//!
//! Each mock records how often it was called so tests can assert on the
//! lookup chain without touching the network.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::integrations::{CloudStore, NoteVault, SemanticHit, SemanticIndex, SyncReport, VaultNote};
use crate::llm::LlmClient;
use crate::observation::Observation;
use crate::observer::Extractor;

/// LLM that replays canned responses in order
///
/// Once the script is exhausted every call fails with a remote error.
#[derive(Default)]
pub struct MockLlmClient {
    responses: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl MockLlmClient {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            ..Default::default()
        }
    }

    pub fn push_response(&self, response: impl Into<String>) {
        self.responses.lock().unwrap().push_back(response.into());
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// User prompts received so far
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, _system: &str, user: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(user.to_string());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::remote("mock-llm", "no scripted response left"))
    }
}

/// Extractor returning one scripted batch per call
#[derive(Default)]
pub struct MockExtractor {
    batches: Mutex<VecDeque<Result<Vec<Observation>>>>,
    calls: AtomicUsize,
}

impl MockExtractor {
    pub fn new(batches: Vec<Vec<Observation>>) -> Self {
        Self {
            batches: Mutex::new(batches.into_iter().map(Ok).collect()),
            ..Default::default()
        }
    }

    /// Extractor whose first `n` calls fail before the scripted batches
    pub fn failing_first(n: usize, batches: Vec<Vec<Observation>>) -> Self {
        let mut queue: VecDeque<Result<Vec<Observation>>> = (0..n)
            .map(|_| Err(Error::remote("mock-extractor", "transient failure")))
            .collect();
        queue.extend(batches.into_iter().map(Ok));
        Self {
            batches: Mutex::new(queue),
            ..Default::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Extractor for MockExtractor {
    async fn extract(&self, _text: &str) -> Result<Vec<Observation>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.batches
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// Semantic index that always answers with one hit at a fixed distance
pub struct MockSemanticIndex {
    distance: Option<f32>,
    indexed: Mutex<Vec<(String, String)>>,
}

impl MockSemanticIndex {
    pub fn with_distance(distance: f32) -> Self {
        Self {
            distance: Some(distance),
            indexed: Mutex::new(Vec::new()),
        }
    }

    pub fn empty() -> Self {
        Self {
            distance: None,
            indexed: Mutex::new(Vec::new()),
        }
    }

    pub fn indexed(&self) -> Vec<(String, String)> {
        self.indexed.lock().unwrap().clone()
    }
}

#[async_trait]
impl SemanticIndex for MockSemanticIndex {
    async fn search(&self, query: &str, _n: usize) -> Result<Vec<SemanticHit>> {
        Ok(self
            .distance
            .map(|distance| SemanticHit {
                id: "mock".to_string(),
                content: query.to_string(),
                distance,
            })
            .into_iter()
            .collect())
    }

    async fn index(&self, id: &str, text: &str) -> Result<()> {
        self.indexed
            .lock()
            .unwrap()
            .push((id.to_string(), text.to_string()));
        Ok(())
    }
}

/// Vault whose search returns a fixed list of notes
#[derive(Default)]
pub struct MockVault {
    notes: Vec<PathBuf>,
    failing: bool,
    search_calls: AtomicUsize,
    synced: Mutex<Vec<(PathBuf, String)>>,
}

impl MockVault {
    pub fn with_notes(notes: Vec<PathBuf>) -> Self {
        Self {
            notes,
            ..Default::default()
        }
    }

    /// Vault whose every call fails after being recorded
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Default::default()
        }
    }

    fn check(&self) -> Result<()> {
        if self.failing {
            return Err(Error::remote("mock-vault", "vault unreachable"));
        }
        Ok(())
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    /// `(local path, folder)` pairs passed to the sync methods
    pub fn synced(&self) -> Vec<(PathBuf, String)> {
        self.synced.lock().unwrap().clone()
    }
}

#[async_trait]
impl NoteVault for MockVault {
    async fn search(
        &self,
        _query: &str,
        _folder: Option<&str>,
        max_results: usize,
    ) -> Result<Vec<VaultNote>> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self
            .notes
            .iter()
            .take(max_results)
            .map(|path| VaultNote {
                path: path.clone(),
                title: path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            })
            .collect())
    }

    async fn sync_dir(&self, local: &Path, folder: &str) -> Result<usize> {
        self.synced
            .lock()
            .unwrap()
            .push((local.to_path_buf(), folder.to_string()));
        self.check()?;
        Ok(0)
    }

    async fn sync_file(&self, local: &Path, folder: &str) -> Result<bool> {
        self.synced
            .lock()
            .unwrap()
            .push((local.to_path_buf(), folder.to_string()));
        self.check()?;
        Ok(false)
    }
}

/// Cloud store serving a fixed set of `(name, content)` files
pub struct MockCloudStore {
    available: bool,
    failing: bool,
    files: Vec<(String, String)>,
    lookup_calls: AtomicUsize,
    uploads: Mutex<Vec<(PathBuf, String)>>,
}

impl MockCloudStore {
    pub fn with_files(files: Vec<(String, String)>) -> Self {
        Self {
            available: true,
            failing: false,
            files,
            lookup_calls: AtomicUsize::new(0),
            uploads: Mutex::new(Vec::new()),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::with_files(Vec::new())
        }
    }

    /// Credentialed store whose lookups and uploads fail
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::with_files(Vec::new())
        }
    }

    fn check(&self) -> Result<()> {
        if self.failing {
            return Err(Error::remote("mock-cloud", "service unavailable"));
        }
        Ok(())
    }

    pub fn lookup_calls(&self) -> usize {
        self.lookup_calls.load(Ordering::SeqCst)
    }

    pub fn uploads(&self) -> Vec<(PathBuf, String)> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl CloudStore for MockCloudStore {
    fn is_available(&self) -> bool {
        self.available
    }

    async fn reverse_lookup(
        &self,
        _query: &str,
        dest: &Path,
        max_results: usize,
    ) -> Result<Vec<PathBuf>> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        std::fs::create_dir_all(dest)?;

        let mut written = Vec::new();
        for (name, content) in self.files.iter().take(max_results) {
            let path = dest.join(name);
            std::fs::write(&path, content)?;
            written.push(path);
        }
        Ok(written)
    }

    async fn sync_folder(&self, local: &Path, remote_folder: &str) -> Result<SyncReport> {
        self.uploads
            .lock()
            .unwrap()
            .push((local.to_path_buf(), remote_folder.to_string()));
        self.check()?;
        Ok(SyncReport {
            total_synced: crate::util::walk_files(local)?.len(),
            failed: 0,
        })
    }
}
