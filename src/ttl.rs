//! Hot → Warm migration
//!
//! Two kinds of Hot material age out:
//! - files in `hot/<category>/`, aged by modification time
//! - Observations Log lines, aged by their rendered timestamp
//!
//! Both move under `archive/<YYYY-MM-DD>/<category>/`, and each migrated
//! unit is recorded in the archive catalog when one is attached.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Local, TimeZone};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::merger::{MemoryMerger, OBSERVATIONS_LOG};
use crate::observation::parse_log_line;
use crate::storage::{ArchiveCatalog, ArchiveRecord, UnitKind};
use crate::util::{unique_path, walk_files};

/// Storage tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Hot,
    Warm,
    Cold,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Hot => write!(f, "hot"),
            Tier::Warm => write!(f, "warm"),
            Tier::Cold => write!(f, "cold"),
        }
    }
}

/// Where a memory unit currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residence {
    Hot,
    Archive,
    External,
}

impl Tier {
    /// Tier implied by age and residence
    pub fn classify(age: Duration, residence: Residence, hot_days: i64, warm_days: i64) -> Tier {
        if residence == Residence::External || age >= Duration::days(warm_days) {
            Tier::Cold
        } else if residence == Residence::Archive || age >= Duration::days(hot_days) {
            Tier::Warm
        } else {
            Tier::Hot
        }
    }
}

/// Outcome of one migration pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Total units moved (files + log lines)
    pub hot_to_warm: usize,
    pub files: usize,
    pub lines: usize,
    /// Units that could not be moved this pass
    pub failed: usize,
}

/// Count of files per tier directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TierCounts {
    pub hot_files: usize,
    pub warm_files: usize,
    pub active_observations: usize,
}

/// Moves aged Hot material into the Warm archive
pub struct TtlManager {
    hot_dir: PathBuf,
    archive_dir: PathBuf,
    hot_days: i64,
    warm_days: i64,
    merger: Arc<MemoryMerger>,
    catalog: Option<Arc<ArchiveCatalog>>,
}

impl TtlManager {
    pub fn new(
        hot_dir: impl Into<PathBuf>,
        archive_dir: impl Into<PathBuf>,
        merger: Arc<MemoryMerger>,
        hot_days: i64,
        warm_days: i64,
    ) -> Self {
        Self {
            hot_dir: hot_dir.into(),
            archive_dir: archive_dir.into(),
            hot_days,
            warm_days,
            merger,
            catalog: None,
        }
    }

    /// Builder: record migrations in the archive catalog
    pub fn with_catalog(mut self, catalog: Arc<ArchiveCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn check_and_archive(&self) -> Result<MigrationReport> {
        self.check_and_archive_at(Local::now())
    }

    /// Migrate everything older than the Hot TTL relative to `now`
    ///
    /// A unit that fails to move stays where it is and is retried next pass.
    pub fn check_and_archive_at(&self, now: DateTime<Local>) -> Result<MigrationReport> {
        let cutoff = now - Duration::days(self.hot_days);
        let mut report = MigrationReport::default();

        for path in walk_files(&self.hot_dir)? {
            let modified = match file_modified(&path) {
                Ok(ts) => ts,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot read file age");
                    report.failed += 1;
                    continue;
                }
            };
            if modified >= cutoff {
                continue;
            }

            match self.archive_file(&path, now) {
                Ok(dest) => {
                    debug!(from = %path.display(), to = %dest.display(), "file archived");
                    report.files += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to archive file");
                    report.failed += 1;
                }
            }
        }

        match self.archive_log_lines(cutoff, now) {
            Ok((lines, failed)) => {
                report.lines = lines;
                report.failed += failed;
            }
            Err(e) => {
                warn!(error = %e, "failed to archive observation lines");
                report.failed += 1;
            }
        }

        report.hot_to_warm = report.files + report.lines;
        if report.hot_to_warm > 0 || report.failed > 0 {
            info!(
                files = report.files,
                lines = report.lines,
                failed = report.failed,
                "hot to warm migration finished"
            );
        }
        Ok(report)
    }

    /// Tier of a file at `now`, based on where it lives and its age
    pub fn tier_of(&self, path: &Path, now: DateTime<Local>) -> Result<Tier> {
        let residence = if path.starts_with(&self.archive_dir) {
            Residence::Archive
        } else if path.starts_with(&self.hot_dir) || path == self.merger.path() {
            Residence::Hot
        } else {
            Residence::External
        };
        let age = now - file_modified(path)?;
        Ok(Tier::classify(age, residence, self.hot_days, self.warm_days))
    }

    pub fn tier_counts(&self) -> Result<TierCounts> {
        Ok(TierCounts {
            hot_files: walk_files(&self.hot_dir)?.len(),
            warm_files: walk_files(&self.archive_dir)?.len(),
            active_observations: self.merger.load()?.observation_count(),
        })
    }

    fn unit_dir(&self, now: DateTime<Local>, category: &str) -> PathBuf {
        self.archive_dir
            .join(now.format("%Y-%m-%d").to_string())
            .join(category)
    }

    fn archive_file(&self, path: &Path, now: DateTime<Local>) -> Result<PathBuf> {
        let category = self.category_of(path);
        let name = path
            .file_name()
            .ok_or_else(|| Error::invalid_input(format!("not a file: {}", path.display())))?
            .to_string_lossy()
            .into_owned();

        let dir = self.unit_dir(now, &category);
        std::fs::create_dir_all(&dir)?;
        let dest = unique_path(&dir, &name);

        let content = match std::fs::read(path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read file for the catalog");
                String::new()
            }
        };
        if std::fs::rename(path, &dest).is_err() {
            // different filesystem
            std::fs::copy(path, &dest)?;
            std::fs::remove_file(path)?;
        }

        self.catalog_record(ArchiveRecord::new(UnitKind::File, &dest, name, category, content));
        Ok(dest)
    }

    /// Move Observations Log lines older than `cutoff` into per-category files
    ///
    /// A line leaves the Active Document only once its category file was
    /// written. Returns the number of lines moved and of categories that
    /// could not be written; those lines stay for the next pass.
    fn archive_log_lines(
        &self,
        cutoff: DateTime<Local>,
        now: DateTime<Local>,
    ) -> Result<(usize, usize)> {
        self.merger.update(|doc| {
            let log = doc.section_mut(OBSERVATIONS_LOG);
            let mut stale: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for line in log.iter() {
                let aged = parse_log_line(line).and_then(|parsed| {
                    let ts = Local.from_local_datetime(&parsed.timestamp).earliest()?;
                    (ts < cutoff).then_some(parsed.category)
                });
                if let Some(category) = aged {
                    stale.entry(category).or_default().push(line.clone());
                }
            }

            let mut archived: HashSet<String> = HashSet::new();
            let mut failed = 0;
            for (category, lines) in stale {
                match self.append_observations(now, &category, &lines) {
                    Ok(()) => archived.extend(lines),
                    Err(e) => {
                        warn!(%category, error = %e, "failed to archive observation lines");
                        failed += 1;
                    }
                }
            }

            let before = log.len();
            log.retain(|line| !archived.contains(line));
            (before - log.len(), failed)
        })
    }

    fn append_observations(
        &self,
        now: DateTime<Local>,
        category: &str,
        lines: &[String],
    ) -> Result<()> {
        use std::io::Write;

        let dir = self.unit_dir(now, category);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("observations.md");

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let mut text = lines.join("\n");
        text.push('\n');
        file.write_all(text.as_bytes())?;

        let restore_name = format!("observations_{}_{}.md", now.format("%Y-%m-%d"), category);
        self.catalog_record(ArchiveRecord::new(
            UnitKind::Observations,
            &path,
            restore_name,
            category,
            text,
        ));
        Ok(())
    }

    fn catalog_record(&self, record: ArchiveRecord) {
        if let Some(catalog) = &self.catalog {
            if let Err(e) = catalog.record(&record) {
                warn!(path = %record.path.display(), error = %e, "failed to catalog archived unit");
            }
        }
    }

    /// First directory under hot, or `general` for top-level files
    fn category_of(&self, path: &Path) -> String {
        path.strip_prefix(&self.hot_dir)
            .ok()
            .and_then(|rel| {
                let mut parts = rel.components();
                let first = parts.next()?;
                parts.next()?;
                Some(first.as_os_str().to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "general".to_string())
    }
}

fn file_modified(path: &Path) -> Result<DateTime<Local>> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(DateTime::<Local>::from(modified))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::{Category, Observation, Priority};
    use crate::tokens::TokenCounter;
    use std::time::SystemTime;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        hot: PathBuf,
        archive: PathBuf,
        merger: Arc<MemoryMerger>,
        catalog: Arc<ArchiveCatalog>,
        ttl: TtlManager,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let hot = dir.path().join("hot");
        let archive = dir.path().join("archive");
        std::fs::create_dir_all(&hot).unwrap();
        let merger = Arc::new(MemoryMerger::new(
            dir.path().join("active_memory.md"),
            TokenCounter::heuristic(),
        ));
        let catalog = Arc::new(ArchiveCatalog::in_memory().unwrap());
        let ttl = TtlManager::new(&hot, &archive, merger.clone(), 7, 90)
            .with_catalog(catalog.clone());
        Fixture {
            _dir: dir,
            hot,
            archive,
            merger,
            catalog,
            ttl,
        }
    }

    fn set_age(path: &Path, days: u64) {
        let when = SystemTime::now() - std::time::Duration::from_secs(days * 86_400);
        std::fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(when)
            .unwrap();
    }

    #[test]
    fn classification_boundaries() {
        let d = Duration::days;
        assert_eq!(Tier::classify(d(1), Residence::Hot, 7, 90), Tier::Hot);
        assert_eq!(Tier::classify(d(7), Residence::Hot, 7, 90), Tier::Warm);
        assert_eq!(Tier::classify(d(1), Residence::Archive, 7, 90), Tier::Warm);
        assert_eq!(Tier::classify(d(90), Residence::Archive, 7, 90), Tier::Cold);
        assert_eq!(Tier::classify(d(0), Residence::External, 7, 90), Tier::Cold);
    }

    #[test]
    fn old_files_move_and_fresh_files_stay() {
        let f = fixture();
        let notes = f.hot.join("notes");
        std::fs::create_dir_all(&notes).unwrap();
        let old = notes.join("old.md");
        let fresh = notes.join("fresh.md");
        std::fs::write(&old, "kubernetes upgrade notes").unwrap();
        std::fs::write(&fresh, "today").unwrap();
        set_age(&old, 8);

        let now = Local::now();
        let report = f.ttl.check_and_archive_at(now).unwrap();
        assert_eq!(report.files, 1);
        assert_eq!(report.hot_to_warm, 1);

        let dest = f
            .archive
            .join(now.format("%Y-%m-%d").to_string())
            .join("notes")
            .join("old.md");
        assert!(dest.exists());
        assert!(!old.exists());
        assert!(fresh.exists());
        assert_eq!(f.ttl.tier_of(&dest, now).unwrap(), Tier::Warm);
        assert_eq!(f.ttl.tier_of(&fresh, now).unwrap(), Tier::Hot);

        let hits = f.catalog.search("kubernetes upgrade", 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].restore_name, "old.md");

        // second pass: nothing left to move
        assert_eq!(f.ttl.check_and_archive_at(now).unwrap().hot_to_warm, 0);
    }

    #[test]
    fn archive_name_conflicts_get_suffix() {
        let f = fixture();
        let now = Local::now();
        let dir = f.archive.join(now.format("%Y-%m-%d").to_string()).join("general");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.md"), "already here").unwrap();

        let path = f.hot.join("a.md");
        std::fs::write(&path, "new").unwrap();
        set_age(&path, 30);

        f.ttl.check_and_archive_at(now).unwrap();
        assert_eq!(std::fs::read_to_string(dir.join("a.md")).unwrap(), "already here");
        assert_eq!(std::fs::read_to_string(dir.join("a_1.md")).unwrap(), "new");
    }

    #[test]
    fn stale_log_lines_are_archived() {
        let f = fixture();
        let now = Local::now();
        let old = Observation::new("o1", Priority::Low, Category::Fact, "Old fact")
            .unwrap()
            .with_timestamp(now - Duration::days(10));
        let new = Observation::new("o2", Priority::High, Category::Task, "New task").unwrap();
        f.merger.add_observations(&[old.clone(), new.clone()]).unwrap();

        let report = f.ttl.check_and_archive_at(now).unwrap();
        assert_eq!(report.lines, 1);

        let doc = f.merger.load().unwrap();
        assert_eq!(doc.section(OBSERVATIONS_LOG).unwrap(), [new.to_markdown()]);

        let archived = f
            .archive
            .join(now.format("%Y-%m-%d").to_string())
            .join("fact")
            .join("observations.md");
        assert_eq!(
            std::fs::read_to_string(archived).unwrap(),
            format!("{}\n", old.to_markdown())
        );
    }

    #[test]
    fn unwritable_category_keeps_only_its_own_lines() {
        let f = fixture();
        let now = Local::now();
        let then = now - Duration::days(10);
        let fact = Observation::new("o1", Priority::Low, Category::Fact, "Old fact")
            .unwrap()
            .with_timestamp(then);
        let task = Observation::new("o2", Priority::Medium, Category::Task, "Old task")
            .unwrap()
            .with_timestamp(then);
        f.merger.add_observations(&[fact.clone(), task.clone()]).unwrap();

        // a plain file where the task unit directory should go
        let day = f.archive.join(now.format("%Y-%m-%d").to_string());
        std::fs::create_dir_all(&day).unwrap();
        std::fs::write(day.join("task"), "in the way").unwrap();

        let report = f.ttl.check_and_archive_at(now).unwrap();
        assert_eq!(report.lines, 1);
        assert_eq!(report.failed, 1);
        let doc = f.merger.load().unwrap();
        assert_eq!(doc.section(OBSERVATIONS_LOG).unwrap(), [task.to_markdown()]);

        std::fs::remove_file(day.join("task")).unwrap();
        let report = f.ttl.check_and_archive_at(now).unwrap();
        assert_eq!(report.lines, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(f.merger.load().unwrap().observation_count(), 0);

        assert_eq!(
            std::fs::read_to_string(day.join("fact/observations.md")).unwrap(),
            format!("{}\n", fact.to_markdown())
        );
        assert_eq!(
            std::fs::read_to_string(day.join("task/observations.md")).unwrap(),
            format!("{}\n", task.to_markdown())
        );
    }

    #[test]
    fn non_utf8_file_is_cataloged_lossily() {
        let f = fixture();
        let path = f.hot.join("legacy.md");
        std::fs::write(&path, b"terraform modules \xff\xfe need pinning").unwrap();
        set_age(&path, 30);

        let report = f.ttl.check_and_archive_at(Local::now()).unwrap();
        assert_eq!(report.files, 1);

        let hits = f.catalog.search("terraform pinning", 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].restore_name, "legacy.md");
    }

    #[test]
    fn unparseable_lines_stay_put() {
        let f = fixture();
        f.merger
            .update(|doc| {
                doc.section_mut(OBSERVATIONS_LOG)
                    .push("Compressed summary of earlier work".to_string())
            })
            .unwrap();

        let report = f.ttl.check_and_archive_at(Local::now() + Duration::days(365)).unwrap();
        assert_eq!(report.lines, 0);
        assert_eq!(f.merger.load().unwrap().observation_count(), 1);
    }
}
