//! Active Document store
//!
//! The Active Document is a small Markdown file:
//!
//! ```text
//! # Active Memory
//!
//! ## Core Context
//! - ...
//!
//! ## Observations Log
//! - 🔴 [2026-02-12 14:30] **preference**: ...
//! ```
//!
//! Every write goes through [`MemoryMerger`], which serializes
//! read-modify-write cycles and replaces the file atomically, so readers
//! never observe a partially written document.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::error::{Error, Result};
use crate::observation::Observation;
use crate::tokens::TokenCounter;
use crate::util::write_atomic;

pub const CORE_CONTEXT: &str = "Core Context";
pub const OBSERVATIONS_LOG: &str = "Observations Log";

const TITLE: &str = "# Active Memory";
const CANONICAL_SECTIONS: [&str; 2] = [CORE_CONTEXT, OBSERVATIONS_LOG];

/// One `## Heading` and the non-empty lines under it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub blocks: Vec<String>,
}

impl Section {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            blocks: Vec::new(),
        }
    }
}

/// Parsed Active Document
///
/// Canonical sections always exist and come first; other sections keep
/// their first-seen order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveDocument {
    sections: Vec<Section>,
}

impl Default for ActiveDocument {
    fn default() -> Self {
        Self::skeleton()
    }
}

impl ActiveDocument {
    /// Empty document with only the canonical sections
    pub fn skeleton() -> Self {
        Self {
            sections: CANONICAL_SECTIONS.iter().map(|name| Section::new(*name)).collect(),
        }
    }

    /// Parse Markdown text; text before the first section heading is dropped
    pub fn parse(text: &str) -> Self {
        let mut found: Vec<Section> = Vec::new();
        let mut current: Option<usize> = None;

        for line in text.lines() {
            if let Some(name) = line.strip_prefix("## ") {
                let name = name.trim();
                let idx = match found.iter().position(|s| s.name == name) {
                    Some(idx) => idx,
                    None => {
                        found.push(Section::new(name));
                        found.len() - 1
                    }
                };
                current = Some(idx);
                continue;
            }

            let line = line.trim_end();
            if line.trim().is_empty() {
                continue;
            }
            if let Some(idx) = current {
                found[idx].blocks.push(line.to_string());
            }
        }

        let mut sections = Vec::with_capacity(found.len() + CANONICAL_SECTIONS.len());
        for name in CANONICAL_SECTIONS {
            match found.iter().position(|s| s.name == name) {
                Some(idx) => sections.push(found.remove(idx)),
                None => sections.push(Section::new(name)),
            }
        }
        sections.extend(found);

        Self { sections }
    }

    /// Render to Markdown; sections are separated by one blank line
    pub fn render(&self) -> String {
        let body = self
            .sections
            .iter()
            .map(|section| {
                let mut text = format!("## {}\n", section.name);
                for block in &section.blocks {
                    text.push_str(block);
                    text.push('\n');
                }
                text
            })
            .collect::<Vec<_>>()
            .join("\n");

        format!("{}\n\n{}", TITLE, body)
    }

    pub fn section(&self, name: &str) -> Option<&[String]> {
        self.sections
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.blocks.as_slice())
    }

    /// Blocks of a section, creating the section at the end if missing
    pub fn section_mut(&mut self, name: &str) -> &mut Vec<String> {
        let idx = match self.sections.iter().position(|s| s.name == name) {
            Some(idx) => idx,
            None => {
                self.sections.push(Section::new(name));
                self.sections.len() - 1
            }
        };
        &mut self.sections[idx].blocks
    }

    /// Replace a section's blocks with the non-empty lines of `text`
    pub fn replace_section(&mut self, name: &str, text: &str) {
        *self.section_mut(name) = to_blocks(text);
    }

    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter()
    }

    pub fn observation_count(&self) -> usize {
        self.section(OBSERVATIONS_LOG).map_or(0, |b| b.len())
    }
}

/// Split free text into blocks that survive a parse/render cycle
///
/// Second-level headings are demoted so they cannot open a new section.
pub fn to_blocks(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .map(|line| match line.strip_prefix("## ") {
            Some(rest) => format!("### {}", rest),
            None => line.to_string(),
        })
        .collect()
}

/// Serialized access to the Active Document on disk
pub struct MemoryMerger {
    path: PathBuf,
    counter: TokenCounter,
    lock: Mutex<()>,
}

impl MemoryMerger {
    pub fn new(path: impl Into<PathBuf>, counter: TokenCounter) -> Self {
        Self {
            path: path.into(),
            counter,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the current document; a missing file reads as the skeleton
    pub fn load(&self) -> Result<ActiveDocument> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(ActiveDocument::parse(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ActiveDocument::skeleton()),
            Err(e) => Err(e.into()),
        }
    }

    /// Rendered text of the current document
    pub fn text(&self) -> Result<String> {
        Ok(self.load()?.render())
    }

    /// Lines of one section joined by newlines; empty when absent
    pub fn section_text(&self, name: &str) -> Result<String> {
        Ok(self
            .load()?
            .section(name)
            .map(|blocks| blocks.join("\n"))
            .unwrap_or_default())
    }

    pub fn get_token_count(&self) -> Result<usize> {
        Ok(self.counter.count(&self.text()?))
    }

    /// Merge observations into the Observations Log
    ///
    /// Returns how many lines were actually added; a line already present
    /// byte-for-byte is skipped.
    pub fn add_observations(&self, observations: &[Observation]) -> Result<usize> {
        Ok(self.merge_new(observations)?.len())
    }

    /// Same as [`add_observations`](Self::add_observations) but returns the
    /// observations that were inserted
    pub fn merge_new(&self, observations: &[Observation]) -> Result<Vec<Observation>> {
        if observations.is_empty() {
            return Ok(Vec::new());
        }

        self.update(|doc| {
            let log = doc.section_mut(OBSERVATIONS_LOG);
            let mut present: HashSet<String> = log.iter().cloned().collect();
            let mut inserted = Vec::new();

            for obs in observations {
                let line = obs.to_markdown();
                if present.insert(line.clone()) {
                    log.push(line);
                    inserted.push(obs.clone());
                }
            }
            inserted
        })
    }

    /// Run a read-modify-write cycle under the store lock
    ///
    /// The file is rewritten only when `f` changed the document.
    pub fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut ActiveDocument) -> T,
    {
        let _guard = self.lock.lock().map_err(|e| Error::storage(e.to_string()))?;

        let mut doc = self.load()?;
        let before = doc.clone();
        let result = f(&mut doc);

        if doc != before {
            self.write_atomic(&doc.render())?;
        }
        Ok(result)
    }

    /// Replace the stored document with `doc`
    pub fn save(&self, doc: &ActiveDocument) -> Result<()> {
        let _guard = self.lock.lock().map_err(|e| Error::storage(e.to_string()))?;
        self.write_atomic(&doc.render())
    }

    /// Persist the current document in canonical form
    pub fn flush(&self) -> Result<()> {
        let _guard = self.lock.lock().map_err(|e| Error::storage(e.to_string()))?;
        let doc = self.load()?;
        self.write_atomic(&doc.render())
    }

    fn write_atomic(&self, text: &str) -> Result<()> {
        write_atomic(&self.path, text)?;
        debug!(path = %self.path.display(), bytes = text.len(), "active document written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::{Category, Priority};
    use chrono::{Local, TimeZone};
    use tempfile::TempDir;

    fn obs(content: &str, minute: u32) -> Observation {
        Observation::new("obs_test", Priority::High, Category::Preference, content)
            .unwrap()
            .with_timestamp(Local.with_ymd_and_hms(2026, 2, 12, 14, minute, 0).unwrap())
    }

    fn merger(dir: &TempDir) -> MemoryMerger {
        MemoryMerger::new(dir.path().join("active_memory.md"), TokenCounter::heuristic())
    }

    #[test]
    fn missing_file_loads_as_skeleton() {
        let dir = TempDir::new().unwrap();
        let doc = merger(&dir).load().unwrap();
        assert_eq!(doc, ActiveDocument::skeleton());
        assert_eq!(
            doc.render(),
            "# Active Memory\n\n## Core Context\n\n## Observations Log\n"
        );
    }

    #[test]
    fn parse_render_is_stable() {
        let text = "# Active Memory\n\n## Projects\n- alpha\n\n## Observations Log\n- one\n\n\n- two\n## Core Context\n- user is Kim\n";
        let doc = ActiveDocument::parse(text);
        let names: Vec<_> = doc.sections().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec![CORE_CONTEXT, OBSERVATIONS_LOG, "Projects"]);

        let rendered = doc.render();
        assert_eq!(ActiveDocument::parse(&rendered), doc);
        assert_eq!(ActiveDocument::parse(&rendered).render(), rendered);
    }

    #[test]
    fn adding_twice_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let merger = merger(&dir);
        let batch = vec![obs("User prefers Python", 30), obs("User uses Neovim", 31)];

        assert_eq!(merger.add_observations(&batch).unwrap(), 2);
        let first = std::fs::read_to_string(merger.path()).unwrap();

        assert_eq!(merger.add_observations(&batch).unwrap(), 0);
        let second = std::fs::read_to_string(merger.path()).unwrap();
        assert_eq!(first, second);
        assert_eq!(merger.load().unwrap().observation_count(), 2);
    }

    #[test]
    fn duplicates_within_one_batch_collapse() {
        let dir = TempDir::new().unwrap();
        let merger = merger(&dir);
        let same = obs("Deploys on Fridays", 10);
        let inserted = merger.merge_new(&[same.clone(), same]).unwrap();
        assert_eq!(inserted.len(), 1);
    }

    #[test]
    fn unknown_sections_survive_merges() {
        let dir = TempDir::new().unwrap();
        let merger = merger(&dir);
        std::fs::write(
            merger.path(),
            "# Active Memory\n\n## Core Context\n- Name: Kim\n\n## Observations Log\n\n## Projects\n- oc-memory\n",
        )
        .unwrap();

        merger.add_observations(&[obs("Likes tea", 1)]).unwrap();
        let doc = merger.load().unwrap();
        assert_eq!(doc.section("Projects").unwrap(), ["- oc-memory"]);
        assert_eq!(doc.section(CORE_CONTEXT).unwrap(), ["- Name: Kim"]);
    }

    #[test]
    fn no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let merger = merger(&dir);
        merger.add_observations(&[obs("a fact", 2)]).unwrap();
        merger.flush().unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["active_memory.md".to_string()]);
    }

    #[test]
    fn replaced_text_cannot_open_sections() {
        let mut doc = ActiveDocument::skeleton();
        doc.replace_section(OBSERVATIONS_LOG, "## Summary\n- merged\n\n");
        assert_eq!(doc.section(OBSERVATIONS_LOG).unwrap(), ["### Summary", "- merged"]);
        assert_eq!(ActiveDocument::parse(&doc.render()), doc);
    }

    #[test]
    fn token_count_tracks_content() {
        let dir = TempDir::new().unwrap();
        let merger = merger(&dir);
        let empty = merger.get_token_count().unwrap();
        merger.add_observations(&[obs(&"word ".repeat(100), 3)]).unwrap();
        assert!(merger.get_token_count().unwrap() > empty + 100);
    }

    #[test]
    fn save_then_read_section() {
        let dir = TempDir::new().unwrap();
        let merger = merger(&dir);

        let mut doc = ActiveDocument::skeleton();
        doc.section_mut(CORE_CONTEXT).push("- Timezone: UTC".to_string());
        doc.section_mut(CORE_CONTEXT).push("- Editor: Helix".to_string());
        merger.save(&doc).unwrap();

        assert_eq!(
            merger.section_text(CORE_CONTEXT).unwrap(),
            "- Timezone: UTC\n- Editor: Helix"
        );
        assert_eq!(merger.section_text("Missing").unwrap(), "");
    }
}
