//! Observations: the unit of extracted knowledge

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::util::write_atomic;

/// Timestamp format used in rendered observation lines
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Importance of an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// Parse a priority, treating anything unrecognised as `Medium`
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "high" => Priority::High,
            "low" => Priority::Low,
            _ => Priority::Medium,
        }
    }

    /// Colour marker shown at the start of a rendered line
    pub fn marker(&self) -> &'static str {
        match self {
            Priority::High => "\u{1f534}",
            Priority::Medium => "\u{1f7e1}",
            Priority::Low => "\u{1f7e2}",
        }
    }

    fn from_marker(marker: &str) -> Option<Self> {
        [Priority::High, Priority::Medium, Priority::Low]
            .into_iter()
            .find(|p| p.marker() == marker)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// Kind of knowledge an observation carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// How the user likes things done
    Preference,
    /// Something true about the world or the project
    Fact,
    /// Work to be done
    Task,
    /// A choice that was made
    Decision,
    /// A rule that must hold
    Constraint,
}

impl Category {
    /// Parse a category, treating anything unrecognised as `Fact`
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "preference" => Category::Preference,
            "task" => Category::Task,
            "decision" => Category::Decision,
            "constraint" => Category::Constraint,
            _ => Category::Fact,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::Preference => write!(f, "preference"),
            Category::Fact => write!(f, "fact"),
            Category::Task => write!(f, "task"),
            Category::Decision => write!(f, "decision"),
            Category::Constraint => write!(f, "constraint"),
        }
    }
}

/// A single piece of knowledge extracted from conversation text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// `obs_<yyyymmdd>_<seq>`
    pub id: String,

    /// When the observation was extracted
    pub timestamp: DateTime<Local>,

    pub priority: Priority,

    pub category: Category,

    /// Single-line, non-empty content
    pub content: String,

    /// Free-form extras (`time_context`, `source`, ...)
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Observation {
    /// Create a new observation stamped with the current local time
    pub fn new(
        id: impl Into<String>,
        priority: Priority,
        category: Category,
        content: &str,
    ) -> Result<Self> {
        let content = content.split_whitespace().collect::<Vec<_>>().join(" ");
        if content.is_empty() {
            return Err(Error::invalid_input("observation content is empty"));
        }

        Ok(Self {
            id: id.into(),
            timestamp: Local::now(),
            priority,
            category,
            content,
            metadata: BTreeMap::new(),
        })
    }

    /// Builder: override the timestamp
    pub fn with_timestamp(mut self, timestamp: DateTime<Local>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Builder: attach a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn time_context(&self) -> Option<&str> {
        self.metadata
            .get("time_context")
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Render as one Observations Log line
    ///
    /// `- 🔴 [2026-02-12 14:30] **preference**: content`
    pub fn to_markdown(&self) -> String {
        format!(
            "- {} [{}] **{}**: {}",
            self.priority.marker(),
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.category,
            self.content
        )
    }
}

/// Parsed view of a rendered Observations Log line
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    pub priority: Option<Priority>,
    pub timestamp: NaiveDateTime,
    /// Raw category label; unknown labels are kept verbatim
    pub category: String,
    pub content: String,
}

fn log_line_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^-\s+(\S+)\s+\[(\d{4}-\d{2}-\d{2} \d{2}:\d{2})\]\s+\*\*([^*]+)\*\*:\s*(.*)$").ok()
    })
    .as_ref()
}

/// Parse a line previously produced by [`Observation::to_markdown`]
///
/// Returns `None` for anything else (compressed prose, headings, ...).
pub fn parse_log_line(line: &str) -> Option<LogLine> {
    let caps = log_line_regex()?.captures(line.trim())?;
    let timestamp = NaiveDateTime::parse_from_str(&caps[2], TIMESTAMP_FORMAT).ok()?;

    Some(LogLine {
        priority: Priority::from_marker(&caps[1]),
        timestamp,
        category: caps[3].trim().to_string(),
        content: caps[4].to_string(),
    })
}

/// Generates `obs_<yyyymmdd>_<seq>` identifiers; the sequence restarts each day
///
/// With a state file the last issued sequence survives restarts, so a
/// daemon restarted mid-day continues where it stopped.
#[derive(Debug, Default)]
pub struct IdGenerator {
    state: Mutex<Option<(NaiveDate, u32)>>,
    store: Option<PathBuf>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generator that records each issued sequence in `path`
    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        Self {
            state: Mutex::new(None),
            store: Some(path.into()),
        }
    }

    /// Next identifier for the day of `now`
    pub fn next(&self, now: DateTime<Local>) -> String {
        let day = now.date_naive();
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let issued = match *state {
            Some((d, seq)) if d == day => seq,
            _ => 0,
        };
        let seq = issued.max(self.stored_seq(day)) + 1;
        *state = Some((day, seq));
        self.persist(day, seq);

        format!("obs_{}_{:04}", day.format("%Y%m%d"), seq)
    }

    fn stored_seq(&self, day: NaiveDate) -> u32 {
        let Some(path) = &self.store else {
            return 0;
        };
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read id sequence");
                return 0;
            }
        };

        let mut parts = text.split_whitespace();
        let stored_day = parts
            .next()
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y%m%d").ok());
        match (stored_day, parts.next().and_then(|s| s.parse::<u32>().ok())) {
            (Some(d), Some(seq)) if d == day => seq,
            _ => 0,
        }
    }

    fn persist(&self, day: NaiveDate, seq: u32) {
        let Some(path) = &self.store else {
            return;
        };
        let line = format!("{} {}\n", day.format("%Y%m%d"), seq);
        if let Err(e) = write_atomic(path, &line) {
            warn!(path = %path.display(), error = %e, "cannot persist id sequence");
        }
    }
}
