//! Hot directory writer
//!
//! Copies watched source files into `hot/<category>/`, stamps them with YAML
//! front-matter and keeps a bounded number of versions per source.

use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::util::split_name;

/// Front-matter fields, in the order they are written
pub type Metadata = Vec<(String, String)>;

/// Writes categorized copies into the Hot directory
#[derive(Debug, Clone)]
pub struct HotWriter {
    hot_dir: PathBuf,
    max_versions_per_source: usize,
    auto_categorize: bool,
}

impl HotWriter {
    pub fn new(hot_dir: impl Into<PathBuf>, max_versions_per_source: usize) -> Result<Self> {
        let hot_dir = hot_dir.into();
        std::fs::create_dir_all(&hot_dir)?;
        info!(dir = %hot_dir.display(), "hot directory ready");

        Ok(Self {
            hot_dir,
            max_versions_per_source: max_versions_per_source.max(1),
            auto_categorize: true,
        })
    }

    /// Builder: disable path-based categorization (everything goes to `general`)
    pub fn with_auto_categorize(mut self, enabled: bool) -> Self {
        self.auto_categorize = enabled;
        self
    }

    pub fn hot_dir(&self) -> &Path {
        &self.hot_dir
    }

    pub fn category_for(&self, path: &Path) -> &'static str {
        if self.auto_categorize {
            category_from_path(path)
        } else {
            "general"
        }
    }

    /// Copy `source` into the Hot directory
    ///
    /// Name clashes get a `_YYYYmmdd_HHMMSS` suffix (plus a counter if that
    /// is taken too). Older copies of the same source beyond the retention
    /// limit are pruned afterwards.
    pub fn copy_to_memory(&self, source: &Path, category: Option<&str>) -> Result<PathBuf> {
        if !source.is_file() {
            return Err(Error::not_found(format!(
                "Source file not found: {}",
                source.display()
            )));
        }

        let target_dir = self.target_dir(category)?;
        let name = source
            .file_name()
            .ok_or_else(|| Error::invalid_input(format!("not a file: {}", source.display())))?
            .to_string_lossy()
            .into_owned();

        let target = self.free_target(&target_dir, &name);
        std::fs::copy(source, &target).map_err(|e| {
            Error::storage(format!("Failed to copy {}: {}", source.display(), e))
        })?;

        self.enforce_version_retention(&target_dir, &name);
        info!(source = %source.display(), target = %target.display(), "copied to hot");
        Ok(target)
    }

    /// Create a new Hot entry from text
    pub fn write_memory_entry(
        &self,
        content: &str,
        filename: &str,
        category: Option<&str>,
    ) -> Result<PathBuf> {
        let target = self.target_dir(category)?.join(filename);
        std::fs::write(&target, content)
            .map_err(|e| Error::storage(format!("Failed to write {}: {}", target.display(), e)))?;

        info!(target = %target.display(), "created memory entry");
        Ok(target)
    }

    /// Replace the file's front-matter with `metadata`
    pub fn add_metadata(&self, path: &Path, metadata: &[(String, String)]) -> Result<()> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::storage(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let mut front = String::from("---\n");
        for (key, value) in metadata {
            front.push_str(&format!("{}: {}\n", key, value));
        }
        front.push_str("---\n\n");

        let body = strip_front_matter(&content).trim_start();
        std::fs::write(path, format!("{}{}", front, body))
            .map_err(|e| Error::storage(format!("Failed to add metadata: {}", e)))?;

        debug!(path = %path.display(), "metadata added");
        Ok(())
    }

    fn target_dir(&self, category: Option<&str>) -> Result<PathBuf> {
        let dir = match category {
            Some(c) if !c.is_empty() => self.hot_dir.join(c),
            _ => self.hot_dir.clone(),
        };
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn free_target(&self, dir: &Path, name: &str) -> PathBuf {
        let plain = dir.join(name);
        if !plain.exists() {
            return plain;
        }

        let (stem, ext) = split_name(name);
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let stamped = dir.join(format!("{}_{}{}", stem, stamp, ext));
        if !stamped.exists() {
            debug!(target = %stamped.display(), "filename conflict resolved");
            return stamped;
        }

        (1u32..)
            .map(|n| dir.join(format!("{}_{}_{}{}", stem, stamp, n, ext)))
            .find(|p| !p.exists())
            .unwrap_or(stamped)
    }

    /// Keep only the newest copies of `name` in `dir`
    fn enforce_version_retention(&self, dir: &Path, name: &str) {
        let (stem, ext) = split_name(name);
        let prefix = format!("{}_", stem);

        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };

        let mut versions: Vec<(std::time::SystemTime, PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                let file_name = entry.file_name().to_string_lossy().into_owned();
                file_name == name || (file_name.starts_with(&prefix) && file_name.ends_with(ext))
            })
            .filter_map(|entry| {
                let meta = entry.metadata().ok()?;
                if !meta.is_file() {
                    return None;
                }
                Some((meta.modified().ok()?, entry.path()))
            })
            .collect();

        if versions.len() <= self.max_versions_per_source {
            return;
        }

        // newest first; ties broken by name so stamped copies outrank the plain one
        versions.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
        for (_, path) in versions.into_iter().skip(self.max_versions_per_source) {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "pruned old version"),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to prune old version"),
            }
        }
    }
}

/// Standard front-matter for a freshly ingested copy
pub fn ingest_metadata(source: &Path, category: &str, event_type: &str) -> Metadata {
    vec![
        ("source".to_string(), source.display().to_string()),
        ("synced_at".to_string(), Local::now().to_rfc3339()),
        ("category".to_string(), category.to_string()),
        ("event_type".to_string(), event_type.to_string()),
        (
            "oc_memory_version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        ),
    ]
}

/// Category derived from path keywords
pub fn category_from_path(path: &Path) -> &'static str {
    let lower = path.to_string_lossy().to_lowercase();
    if lower.contains("project") {
        "projects"
    } else if lower.contains("note") {
        "notes"
    } else if lower.contains("doc") {
        "documents"
    } else if lower.contains("meeting") {
        "meetings"
    } else {
        "general"
    }
}

/// Body of a Markdown file without its leading `---` front-matter block
pub fn strip_front_matter(content: &str) -> &str {
    let Some(rest) = content.strip_prefix("---") else {
        return content;
    };
    match rest.find("\n---") {
        Some(end) => {
            let after = &rest[end + 4..];
            after.strip_prefix('\n').unwrap_or(after)
        }
        None => content,
    }
}
