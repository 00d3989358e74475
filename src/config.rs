//! Configuration for oc-memory
//!
//! Loaded from a YAML file (`config.yaml` by default). Only the `watch` and
//! `memory` sections are required; every other section falls back to its
//! defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// File name of the Active Document inside the memory root
pub const ACTIVE_DOCUMENT_NAME: &str = "active_memory.md";
pub const ID_STATE_NAME: &str = ".observation_ids";

/// Configuration for the memory daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub watch: WatchConfig,
    pub memory: MemoryConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub ttl: TtlConfig,
    #[serde(default)]
    pub reflection: ReflectionConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub semantic: SemanticConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

/// Directories to watch for new conversation material
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub dirs: Vec<PathBuf>,
    pub recursive: bool,
    /// File extensions (without the dot) that trigger ingestion
    pub extensions: Vec<String>,
    pub poll_interval_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            dirs: Vec::new(),
            recursive: true,
            extensions: vec!["md".to_string(), "markdown".to_string()],
            poll_interval_ms: 1000,
        }
    }
}

/// Memory root layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Memory root: holds the Active Document, the Hot directory and the archive
    pub dir: PathBuf,
    pub auto_categorize: bool,
    /// Copies kept per source file in the Hot directory
    pub max_versions_per_source: usize,
    /// Override for the Warm archive root (defaults to `<dir>/archive`)
    pub archive_dir: Option<PathBuf>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        let dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".openclaw")
            .join("workspace")
            .join("memory");

        Self {
            dir,
            auto_categorize: true,
            max_versions_per_source: 5,
            archive_dir: None,
        }
    }
}

/// Extraction / summarization model
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub enabled: bool,
    /// `openai` or `google`
    pub provider: String,
    pub model: Option<String>,
    /// Chat-completions endpoint; derived from the provider when absent
    pub base_url: Option<String>,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: "openai".to_string(),
            model: None,
            base_url: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            max_tokens: 2000,
        }
    }
}

impl LlmConfig {
    /// Model name, falling back to the provider default
    pub fn model_name(&self) -> String {
        if let Some(model) = &self.model {
            return model.clone();
        }
        match self.provider.as_str() {
            "google" => "gemini-2.0-flash".to_string(),
            _ => "gpt-4o-mini".to_string(),
        }
    }

    /// Chat-completions endpoint for the configured provider
    pub fn endpoint(&self) -> String {
        if let Some(url) = &self.base_url {
            return url.clone();
        }
        match self.provider.as_str() {
            "google" => {
                "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions"
                    .to_string()
            }
            _ => "https://api.openai.com/v1/chat/completions".to_string(),
        }
    }

    /// Read the API key from the environment; empty values count as missing
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }
}

/// Backoff for remote calls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

/// Hot → Warm → Cold ageing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
    pub hot_days: i64,
    pub warm_days: i64,
    pub check_interval_secs: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            hot_days: 7,
            warm_days: 90,
            check_interval_secs: 3600,
        }
    }
}

impl TtlConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

/// Tokenizer used for the Active Document budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tokenizer {
    /// ~4 characters per token
    #[default]
    Heuristic,
    /// BPE count with the cl100k vocabulary
    Cl100k,
}

/// Token budget and compression cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectionConfig {
    pub enabled: bool,
    /// Ceiling above which the Active Document is compressed
    pub max_tokens: usize,
    /// Size to aim for; defaults to half of `max_tokens`
    pub target_tokens: Option<usize>,
    pub check_interval_secs: u64,
    pub tokenizer: Tokenizer,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_tokens: 30_000,
            target_tokens: None,
            check_interval_secs: 300,
            tokenizer: Tokenizer::Heuristic,
        }
    }
}

impl ReflectionConfig {
    pub fn target(&self) -> usize {
        self.target_tokens.unwrap_or(self.max_tokens / 2).max(1)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

/// Reverse lookup tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub enabled: bool,
    /// Nearest-neighbour distance below which a topic counts as known
    pub distance_threshold: f32,
    /// Leading characters of an observation used as the lookup query
    pub query_chars: usize,
    pub archive_max_results: usize,
    pub vault_max_results: usize,
    pub cloud_max_results: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            distance_threshold: 0.5,
            query_chars: 200,
            archive_max_results: 3,
            vault_max_results: 5,
            cloud_max_results: 3,
        }
    }
}

/// Local note vault (Cold replica + recovery source)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Vault root; the vault is disabled when unset
    pub path: Option<PathBuf>,
    /// Folder inside the vault used for replication and search
    pub folder: String,
    pub sync_interval_secs: u64,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            path: None,
            folder: "OC-Memory".to_string(),
            sync_interval_secs: 3600,
        }
    }
}

impl VaultConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}

/// Cloud object store (Cold tier)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub enabled: bool,
    /// Environment variable holding the access token
    pub token_env: String,
    pub remote_folder: String,
    pub upload_interval_secs: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token_env: "DROPBOX_ACCESS_TOKEN".to_string(),
            remote_folder: "/OC-Memory".to_string(),
            upload_interval_secs: 6 * 3600,
        }
    }
}

impl CloudConfig {
    pub fn upload_interval(&self) -> Duration {
        Duration::from_secs(self.upload_interval_secs)
    }

    pub fn token(&self) -> Option<String> {
        std::env::var(&self.token_env)
            .ok()
            .filter(|token| !token.trim().is_empty())
    }
}

/// Semantic index for known-topic detection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Optional HTTP status endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub port: Option<u16>,
}

impl Config {
    /// Load, validate and expand a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = expand_home(path.as_ref());
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::config(format!("Config file not found: {}", path.display()))
            } else {
                Error::config(format!("Cannot read {}: {}", path.display(), e))
            }
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(raw)
            .map_err(|e| Error::config(format!("Invalid YAML in config file: {}", e)))?;
        validate(&value)?;

        let config: Config = serde_yaml::from_value(value)
            .map_err(|e| Error::config(format!("Invalid config: {}", e)))?;
        Ok(config.expand_paths())
    }

    /// Create a config rooted at a custom memory directory (no watch dirs)
    pub fn with_memory_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            watch: WatchConfig::default(),
            memory: MemoryConfig {
                dir: dir.into(),
                ..Default::default()
            },
            llm: LlmConfig::default(),
            retry: RetryConfig::default(),
            ttl: TtlConfig::default(),
            reflection: ReflectionConfig::default(),
            recovery: RecoveryConfig::default(),
            vault: VaultConfig::default(),
            cloud: CloudConfig::default(),
            semantic: SemanticConfig::default(),
            logging: LoggingConfig::default(),
            status: StatusConfig::default(),
        }
    }

    fn expand_paths(mut self) -> Self {
        self.watch.dirs = self.watch.dirs.iter().map(|d| expand_home(d)).collect();
        self.memory.dir = expand_home(&self.memory.dir);
        self.memory.archive_dir = self.memory.archive_dir.as_deref().map(expand_home);
        self.vault.path = self.vault.path.as_deref().map(expand_home);
        self
    }

    /// Get the path to the Active Document
    pub fn active_document_path(&self) -> PathBuf {
        self.memory.dir.join(ACTIVE_DOCUMENT_NAME)
    }

    /// Last issued observation id sequence, kept beside the Active Document
    pub fn id_state_path(&self) -> PathBuf {
        self.memory.dir.join(ID_STATE_NAME)
    }

    /// Get the Hot directory (categorized copies)
    pub fn hot_dir(&self) -> PathBuf {
        self.memory.dir.join("hot")
    }

    /// Get the Warm archive root
    pub fn archive_dir(&self) -> PathBuf {
        self.memory
            .archive_dir
            .clone()
            .unwrap_or_else(|| self.memory.dir.join("archive"))
    }

    /// Get the path to the archive catalog database
    pub fn catalog_path(&self) -> PathBuf {
        self.memory.dir.join("catalog.db")
    }

    /// Get the path to the vector database
    pub fn vector_db_path(&self) -> PathBuf {
        self.memory.dir.join("vectors")
    }

    /// Scratch space for cloud downloads before they are admitted into Hot
    pub fn staging_dir(&self) -> PathBuf {
        self.memory.dir.join(".staging")
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.memory.dir)?;
        std::fs::create_dir_all(self.hot_dir())?;
        std::fs::create_dir_all(self.archive_dir())?;
        Ok(())
    }
}

fn validate(value: &serde_yaml::Value) -> Result<()> {
    let map = value
        .as_mapping()
        .ok_or_else(|| Error::config("Config root must be a mapping"))?;

    for section in ["watch", "memory"] {
        if !map.contains_key(section) {
            return Err(Error::config(format!(
                "Missing required section in config: {}",
                section
            )));
        }
    }

    match value.get("watch").and_then(|w| w.get("dirs")) {
        None => return Err(Error::config("Missing 'dirs' in watch section")),
        Some(dirs) if !dirs.is_sequence() => {
            return Err(Error::config("'watch.dirs' must be a list"))
        }
        Some(_) => {}
    }

    if value.get("memory").and_then(|m| m.get("dir")).is_none() {
        return Err(Error::config("Missing 'dir' in memory section"));
    }

    Ok(())
}

/// Expand a leading `~` to the user's home directory
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}
