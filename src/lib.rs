//! # OC Memory
//!
//! Tiered memory lifecycle manager for conversational agents.
//!
//! ## Architecture
//!
//! Observations extracted from watched conversation files live in three tiers:
//! - **Hot**: the Active Document (`active_memory.md`) plus categorized
//!   copies under `hot/`
//! - **Warm**: dated archive units under `archive/<date>/<category>/`,
//!   indexed by a SQLite catalog
//! - **Cold**: a local note vault and a cloud store
//!
//! The [`daemon::Orchestrator`] routes file events through extraction, merge
//! and reverse lookup, and runs migration, compression and replication on
//! independent timers.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use oc_memory::{Collaborators, Config, Orchestrator};
//!
//! let config = Config::load("config.yaml")?;
//! let collaborators = Collaborators::from_config(&config).await;
//! let orchestrator = Orchestrator::new(&config, collaborators)?;
//!
//! let report = orchestrator.on_file_change(&path, FileEventKind::Created).await?;
//! println!("merged {} observations", report.merged);
//! ```

pub mod config;
pub mod daemon;
#[cfg(feature = "semantic")]
pub mod embedding;
pub mod error;
pub mod integrations;
pub mod llm;
pub mod merger;
pub mod observation;
pub mod observer;
pub mod recovery;
pub mod reflector;
pub mod retry;
pub mod storage;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tokens;
pub mod ttl;
pub mod util;
pub mod watcher;
pub mod writer;

pub use config::Config;
pub use daemon::{Collaborators, Orchestrator};
pub use error::{Error, Result};
pub use merger::{ActiveDocument, MemoryMerger};
pub use observation::{Category, Observation, Priority};
pub use recovery::{RecoveryOutcome, ReverseLookup};
pub use reflector::{CompressionRecord, Reflector};
pub use retry::RetryPolicy;
pub use ttl::{MigrationReport, Tier, TtlManager};
pub use watcher::{DirectoryWatcher, FileEvent, FileEventKind};
