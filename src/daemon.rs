//! Lifecycle orchestrator
//!
//! File change events flow through a single ingestion worker:
//! Hot copy, extraction, merge, recovery and indexing. The control loop runs
//! the periodic tasks (migration, compression, Cold replication and cloud
//! upload) on independent timers, so they never overlap each other.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::integrations::{CloudStore, DropboxStore, FsVault, NoteVault, SemanticIndex};
use crate::llm::{LlmClient, OpenAiClient};
use crate::merger::{to_blocks, MemoryMerger, OBSERVATIONS_LOG};
use crate::observer::{load_source_text, Extractor, LlmExtractor};
use crate::recovery::ReverseLookup;
use crate::reflector::{CompressionRecord, ReflectionStats, Reflector};
use crate::retry::RetryPolicy;
use crate::storage::ArchiveCatalog;
use crate::tokens::TokenCounter;
use crate::ttl::{MigrationReport, TierCounts, TtlManager};
use crate::util::{same_file, write_atomic};
use crate::watcher::{FileEvent, FileEventKind};
use crate::writer::{ingest_metadata, HotWriter};

/// How often the control loop checks its timers
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Process-lifetime counters
#[derive(Debug, Default)]
pub struct Counters {
    files_processed: AtomicU64,
    observations_extracted: AtomicU64,
    observations_merged: AtomicU64,
    compressions_run: AtomicU64,
    files_recovered: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub files_processed: u64,
    pub observations_extracted: u64,
    pub observations_merged: u64,
    pub compressions_run: u64,
    pub files_recovered: u64,
    pub errors: u64,
}

impl Counters {
    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            files_processed: self.files_processed.load(Ordering::Relaxed),
            observations_extracted: self.observations_extracted.load(Ordering::Relaxed),
            observations_merged: self.observations_merged.load(Ordering::Relaxed),
            compressions_run: self.compressions_run.load(Ordering::Relaxed),
            files_recovered: self.files_recovered.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Intervals of the periodic tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub migration: Duration,
    pub compression: Duration,
    pub cold_sync: Duration,
    pub cloud_upload: Duration,
}

impl Schedule {
    pub fn from_config(config: &Config) -> Self {
        Self {
            migration: config.ttl.check_interval(),
            compression: config.reflection.check_interval(),
            cold_sync: config.vault.sync_interval(),
            cloud_upload: config.cloud.upload_interval(),
        }
    }
}

/// Last-run instants of the periodic tasks
///
/// Owned by the control loop and passed by `&mut` into each tick. A task
/// that has never run is due immediately.
#[derive(Debug, Clone, Default)]
pub struct DaemonState {
    pub last_migration: Option<Instant>,
    pub last_compression: Option<Instant>,
    pub last_cold_sync: Option<Instant>,
    pub last_cloud_upload: Option<Instant>,
    pub ticks: u64,
}

fn is_due(last: Option<Instant>, every: Duration, now: Instant) -> bool {
    last.map_or(true, |t| now.saturating_duration_since(t) >= every)
}

/// Optional collaborators of the orchestrator
#[derive(Clone, Default)]
pub struct Collaborators {
    pub extractor: Option<Arc<dyn Extractor>>,
    /// Model used by the compressor
    pub llm: Option<Arc<dyn LlmClient>>,
    pub semantic: Option<Arc<dyn SemanticIndex>>,
    pub vault: Option<Arc<dyn NoteVault>>,
    pub cloud: Option<Arc<dyn CloudStore>>,
}

impl Collaborators {
    /// Build the concrete collaborators named in the config
    ///
    /// A collaborator that cannot be set up is logged and left out; the
    /// daemon still runs without it.
    pub async fn from_config(config: &Config) -> Self {
        let llm: Option<Arc<dyn LlmClient>> = match OpenAiClient::from_config(&config.llm) {
            Some(client) => {
                info!(model = %client.model(), "llm client ready");
                Some(Arc::new(client))
            }
            None => {
                if config.llm.enabled {
                    warn!(
                        env = %config.llm.api_key_env,
                        "no API key found, extraction and compression disabled"
                    );
                }
                None
            }
        };
        let extractor = llm
            .clone()
            .map(|llm| {
                let extractor = LlmExtractor::new(llm).with_id_state(config.id_state_path());
                Arc::new(extractor) as Arc<dyn Extractor>
            });

        let vault = config.vault.path.as_ref().map(|root| {
            info!(root = %root.display(), "note vault configured");
            Arc::new(FsVault::new(root.clone())) as Arc<dyn NoteVault>
        });

        let cloud = config
            .cloud
            .enabled
            .then(|| Arc::new(DropboxStore::from_config(&config.cloud)) as Arc<dyn CloudStore>);

        Self {
            extractor,
            llm,
            semantic: Self::semantic_from_config(config).await,
            vault,
            cloud,
        }
    }

    #[cfg(feature = "semantic")]
    async fn semantic_from_config(config: &Config) -> Option<Arc<dyn SemanticIndex>> {
        if !config.semantic.enabled {
            return None;
        }
        match crate::integrations::VectorIndex::open(&config.vector_db_path()).await {
            Ok(index) => Some(Arc::new(index)),
            Err(e) => {
                warn!(error = %e, "semantic index unavailable, using lexical matching");
                None
            }
        }
    }

    #[cfg(not(feature = "semantic"))]
    async fn semantic_from_config(config: &Config) -> Option<Arc<dyn SemanticIndex>> {
        if config.semantic.enabled {
            warn!("built without the `semantic` feature, using lexical matching");
        }
        None
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_semantic_index(mut self, index: Arc<dyn SemanticIndex>) -> Self {
        self.semantic = Some(index);
        self
    }

    pub fn with_vault(mut self, vault: Arc<dyn NoteVault>) -> Self {
        self.vault = Some(vault);
        self
    }

    pub fn with_cloud(mut self, cloud: Arc<dyn CloudStore>) -> Self {
        self.cloud = Some(cloud);
        self
    }
}

/// What one ingested file produced
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub hot_path: PathBuf,
    pub extracted: usize,
    pub merged: usize,
    pub recovered: usize,
}

/// Snapshot served by `stats` and the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub counters: CounterSnapshot,
    pub reflection: Option<ReflectionStats>,
    pub tokens: usize,
    pub max_tokens: usize,
    pub suggested_level: Option<u8>,
    pub tiers: TierCounts,
}

/// Wires the lifecycle components together
pub struct Orchestrator {
    memory_dir: PathBuf,
    hot_dir: PathBuf,
    archive_dir: PathBuf,
    vault_folder: String,
    remote_folder: String,
    schedule: Schedule,
    retry: RetryPolicy,
    writer: HotWriter,
    merger: Arc<MemoryMerger>,
    catalog: Arc<ArchiveCatalog>,
    ttl: TtlManager,
    recovery: Option<ReverseLookup>,
    reflector: Option<Reflector>,
    extractor: Option<Arc<dyn Extractor>>,
    semantic: Option<Arc<dyn SemanticIndex>>,
    vault: Option<Arc<dyn NoteVault>>,
    cloud: Option<Arc<dyn CloudStore>>,
    counters: Counters,
}

impl Orchestrator {
    pub fn new(config: &Config, collaborators: Collaborators) -> Result<Self> {
        config.ensure_dirs()?;

        let retry = RetryPolicy::from_config(&config.retry);
        let counter = TokenCounter::from_config(config.reflection.tokenizer)?;
        let merger = Arc::new(MemoryMerger::new(
            config.active_document_path(),
            counter.clone(),
        ));
        let catalog = Arc::new(ArchiveCatalog::new(&config.catalog_path())?);

        let writer = HotWriter::new(config.hot_dir(), config.memory.max_versions_per_source)?
            .with_auto_categorize(config.memory.auto_categorize);

        let ttl = TtlManager::new(
            config.hot_dir(),
            config.archive_dir(),
            merger.clone(),
            config.ttl.hot_days,
            config.ttl.warm_days,
        )
        .with_catalog(catalog.clone());

        let recovery = config.recovery.enabled.then(|| {
            let mut lookup = ReverseLookup::new(
                config.hot_dir(),
                config.staging_dir(),
                retry,
                config.recovery.clone(),
            )
            .with_catalog(catalog.clone());
            if let Some(index) = &collaborators.semantic {
                lookup = lookup.with_semantic_index(index.clone());
            }
            if let Some(vault) = &collaborators.vault {
                lookup = lookup.with_vault(vault.clone(), config.vault.folder.clone());
            }
            if let Some(cloud) = &collaborators.cloud {
                lookup = lookup.with_cloud(cloud.clone());
            }
            lookup
        });

        let reflector = match (&collaborators.llm, config.reflection.enabled) {
            (Some(llm), true) => Some(Reflector::new(
                llm.clone(),
                counter,
                retry,
                &config.reflection,
            )),
            _ => None,
        };

        info!(
            memory = %config.memory.dir.display(),
            extraction = collaborators.extractor.is_some(),
            compression = reflector.is_some(),
            recovery = recovery.is_some(),
            vault = collaborators.vault.is_some(),
            cloud = collaborators.cloud.is_some(),
            "orchestrator ready"
        );

        Ok(Self {
            memory_dir: config.memory.dir.clone(),
            hot_dir: config.hot_dir(),
            archive_dir: config.archive_dir(),
            vault_folder: config.vault.folder.clone(),
            remote_folder: config.cloud.remote_folder.clone(),
            schedule: Schedule::from_config(config),
            retry,
            writer,
            merger,
            catalog,
            ttl,
            recovery,
            reflector,
            extractor: collaborators.extractor,
            semantic: collaborators.semantic,
            vault: collaborators.vault,
            cloud: collaborators.cloud,
            counters: Counters::default(),
        })
    }

    pub fn merger(&self) -> &Arc<MemoryMerger> {
        &self.merger
    }

    pub fn ttl(&self) -> &TtlManager {
        &self.ttl
    }

    pub fn catalog(&self) -> &Arc<ArchiveCatalog> {
        &self.catalog
    }

    pub fn reflector(&self) -> Option<&Reflector> {
        self.reflector.as_ref()
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    pub fn reflection_stats(&self) -> Option<ReflectionStats> {
        self.reflector.as_ref().map(Reflector::get_stats)
    }

    pub fn status(&self) -> Result<StatusReport> {
        let tokens = self.merger.get_token_count()?;
        Ok(StatusReport {
            counters: self.counters(),
            reflection: self.reflection_stats(),
            tokens,
            max_tokens: self
                .reflector
                .as_ref()
                .map_or(0, Reflector::max_tokens),
            suggested_level: self
                .reflector
                .as_ref()
                .map(|r| r.suggest_level(tokens, None)),
            tiers: self.ttl.tier_counts()?,
        })
    }

    /// Ingest one changed file
    pub async fn on_file_change(&self, path: &Path, kind: FileEventKind) -> Result<IngestReport> {
        let category = self.writer.category_for(path);
        let hot_path = self.writer.copy_to_memory(path, Some(category))?;
        self.writer
            .add_metadata(&hot_path, &ingest_metadata(path, category, &kind.to_string()))?;
        Counters::add(&self.counters.files_processed, 1);

        let mut report = IngestReport {
            hot_path,
            ..Default::default()
        };

        let Some(extractor) = &self.extractor else {
            debug!(path = %path.display(), "no extractor configured, copy only");
            return Ok(report);
        };

        let text = load_source_text(&report.hot_path)?;
        let extractor = extractor.as_ref();
        let text = text.as_str();
        let observations = self
            .retry
            .run("extract", move || extractor.extract(text))
            .await?;
        report.extracted = observations.len();
        Counters::add(&self.counters.observations_extracted, observations.len());

        let context = self.merger.text()?;
        let inserted = self.merger.merge_new(&observations)?;
        report.merged = inserted.len();
        Counters::add(&self.counters.observations_merged, inserted.len());

        if let Some(recovery) = &self.recovery {
            for obs in &inserted {
                match recovery.recover(obs, &context).await {
                    Ok(outcome) => report.recovered += outcome.total(),
                    Err(e) => warn!(id = %obs.id, error = %e, "recovery failed"),
                }
            }
            Counters::add(&self.counters.files_recovered, report.recovered);
        }

        if let Some(index) = &self.semantic {
            for obs in &inserted {
                if let Err(e) = index.index(&obs.id, &obs.content).await {
                    warn!(id = %obs.id, error = %e, "failed to index observation");
                }
            }
        }

        info!(
            path = %path.display(),
            extracted = report.extracted,
            merged = report.merged,
            recovered = report.recovered,
            "file ingested"
        );
        Ok(report)
    }

    /// Ingest an event, counting (not propagating) failures
    pub async fn handle_event(&self, event: FileEvent) {
        if let Err(e) = self.on_file_change(&event.path, event.kind).await {
            Counters::add(&self.counters.errors, 1);
            error!(path = %event.path.display(), error = %e, "failed to process file");
        }
    }

    /// Run every periodic task that is due at `now`
    pub async fn tick(&self, state: &mut DaemonState, now: Instant) {
        state.ticks += 1;

        if is_due(state.last_migration, self.schedule.migration, now) {
            state.last_migration = Some(now);
            if let Err(e) = self.run_migration() {
                self.task_failed("migration", &e);
            }
        }

        if is_due(state.last_compression, self.schedule.compression, now) {
            state.last_compression = Some(now);
            if let Err(e) = self.run_compression().await {
                self.task_failed("compression", &e);
            }
        }

        if is_due(state.last_cold_sync, self.schedule.cold_sync, now) {
            state.last_cold_sync = Some(now);
            if let Err(e) = self.run_cold_sync().await {
                self.task_failed("cold sync", &e);
            }
        }

        if is_due(state.last_cloud_upload, self.schedule.cloud_upload, now) {
            state.last_cloud_upload = Some(now);
            if let Err(e) = self.run_cloud_upload().await {
                self.task_failed("cloud upload", &e);
            }
        }
    }

    fn task_failed(&self, task: &str, e: &crate::error::Error) {
        Counters::add(&self.counters.errors, 1);
        error!(task, error = %e, "periodic task failed");
    }

    pub fn run_migration(&self) -> Result<MigrationReport> {
        let report = self.ttl.check_and_archive()?;
        Counters::add(&self.counters.errors, report.failed);
        Ok(report)
    }

    /// Compress the Observations Log when the document is over budget
    ///
    /// Returns `None` when nothing was attempted. The section is replaced
    /// only by an effective compression; lines merged while the model call
    /// was in flight are kept after the compressed content.
    pub async fn run_compression(&self) -> Result<Option<CompressionRecord>> {
        let Some(reflector) = &self.reflector else {
            return Ok(None);
        };

        let tokens = self.merger.get_token_count()?;
        if !reflector.should_reflect(tokens) {
            debug!(tokens, max = reflector.max_tokens(), "within token budget");
            return Ok(None);
        }

        let level = reflector.suggest_level(tokens, None).max(1);
        self.compress_log(reflector, level).await
    }

    async fn compress_log(
        &self,
        reflector: &Reflector,
        level: u8,
    ) -> Result<Option<CompressionRecord>> {
        let original: Vec<String> = self
            .merger
            .load()?
            .section(OBSERVATIONS_LOG)
            .map(<[String]>::to_vec)
            .unwrap_or_default();
        if original.is_empty() {
            return Ok(None);
        }

        info!(lines = original.len(), level, "compressing observations log");
        let record = reflector.reflect(&original.join("\n"), level).await?;
        Counters::add(&self.counters.compressions_run, 1);

        if !record.is_effective() {
            warn!(
                ratio = record.compression_ratio,
                "compression not effective, keeping original"
            );
            return Ok(Some(record));
        }

        let compressed = to_blocks(&record.compressed_content);
        self.merger.update(|doc| {
            let before: HashSet<&String> = original.iter().collect();
            let log = doc.section_mut(OBSERVATIONS_LOG);
            let arrived: Vec<String> = log.iter().filter(|l| !before.contains(l)).cloned().collect();
            *log = compressed;
            log.extend(arrived);
        })?;

        Ok(Some(record))
    }

    /// Mirror Hot, Warm and the Active Document into the note vault
    pub async fn run_cold_sync(&self) -> Result<usize> {
        let Some(vault) = &self.vault else {
            return Ok(0);
        };

        let vault = vault.as_ref();
        let mut written = 0;
        for (local, sub) in [(&self.hot_dir, "hot"), (&self.archive_dir, "archive")] {
            let folder = format!("{}/{}", self.vault_folder, sub);
            let local = local.as_path();
            let folder = folder.as_str();
            written += self
                .retry
                .run("vault sync", move || vault.sync_dir(local, folder))
                .await?;
        }

        let document = self.merger.path();
        let folder = self.vault_folder.as_str();
        if document.exists()
            && self
                .retry
                .run("vault sync", move || vault.sync_file(document, folder))
                .await?
        {
            written += 1;
        }

        if written > 0 {
            info!(files = written, folder = %self.vault_folder, "replicated to vault");
        }
        Ok(written)
    }

    /// Upload the memory root to the cloud store
    pub async fn run_cloud_upload(&self) -> Result<usize> {
        let Some(cloud) = &self.cloud else {
            return Ok(0);
        };
        if !cloud.is_available() {
            debug!("cloud store not credentialed, skipping upload");
            return Ok(0);
        }

        let cloud = cloud.as_ref();
        let local = self.memory_dir.as_path();
        let remote = self.remote_folder.as_str();
        let report = self
            .retry
            .run("cloud upload", move || cloud.sync_folder(local, remote))
            .await?;

        Counters::add(&self.counters.errors, report.failed);
        info!(
            synced = report.total_synced,
            failed = report.failed,
            remote = %self.remote_folder,
            "uploaded to cloud store"
        );
        Ok(report.total_synced)
    }

    /// One-shot compression of a file
    ///
    /// The Active Document only ever has its Observations Log compressed,
    /// under the store lock; other files are replaced atomically. Nothing
    /// is rewritten unless the result is smaller.
    pub async fn compress_file(
        &self,
        path: &Path,
        compression_target: f64,
    ) -> Result<Option<CompressionRecord>> {
        let Some(reflector) = &self.reflector else {
            return Ok(None);
        };
        let ratio = compression_target.clamp(0.05, 1.0);

        if same_file(path, self.merger.path()) {
            let tokens = TokenCounter::estimate(&self.merger.section_text(OBSERVATIONS_LOG)?);
            let target = ((tokens as f64) * ratio).ceil() as usize;
            let level = reflector.suggest_level(tokens, Some(target)).max(1);
            return self.compress_log(reflector, level).await;
        }

        let content = std::fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(None);
        }

        let tokens = TokenCounter::estimate(&content);
        let target = ((tokens as f64) * ratio).ceil() as usize;
        let level = reflector.suggest_level(tokens, Some(target)).max(1);
        let record = reflector.reflect(&content, level).await?;
        Counters::add(&self.counters.compressions_run, 1);

        if record.is_effective() {
            write_atomic(path, &format!("{}\n", record.compressed_content.trim_end()))?;
            info!(
                path = %path.display(),
                ratio = record.compression_ratio,
                "file compressed"
            );
        } else {
            warn!(path = %path.display(), "compression not effective, file unchanged");
        }
        Ok(Some(record))
    }

    /// Drive the daemon until `shutdown` flips to true
    ///
    /// Events are processed in order by one worker task. The channel must
    /// be closed by its senders (the watcher closes it on shutdown) so the
    /// worker can drain before the final flush.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<FileEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let worker = {
            let this = self.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    this.handle_event(event).await;
                }
                debug!("event channel closed");
            })
        };

        let mut state = DaemonState::default();
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("daemon started");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(&mut state, Instant::now()).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("shutting down, draining events");
        if let Err(e) = worker.await {
            error!(error = %e, "ingestion worker panicked");
        }
        self.merger.flush()?;

        let counters = self.counters();
        info!(
            files = counters.files_processed,
            extracted = counters.observations_extracted,
            merged = counters.observations_merged,
            compressions = counters.compressions_run,
            recovered = counters.files_recovered,
            errors = counters.errors,
            ticks = state.ticks,
            "daemon stopped"
        );
        Ok(())
    }
}
