//! Observation extraction from conversation text

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, Local};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Result;
use crate::llm::LlmClient;
use crate::observation::{Category, IdGenerator, Observation, Priority};
use crate::writer::strip_front_matter;

pub const OBSERVER_SYSTEM_PROMPT: &str = r#"You are an Observation Extraction Agent for a memory system.

Your task: Analyze conversation messages and extract structured observations.

## Rules
1. Extract ONLY factual, useful information (preferences, decisions, constraints, tasks)
2. Each observation must be a single, self-contained statement
3. Assign priority: high (critical decisions/constraints), medium (useful facts), low (minor preferences)
4. Assign category: preference, fact, task, decision, constraint
5. Include time context when available
6. Do NOT include small talk, greetings, or trivial exchanges
7. Do NOT infer or assume - only extract explicitly stated information

## Output Format
Return a JSON array of observations:
[
  {
    "priority": "high|medium|low",
    "category": "preference|fact|task|decision|constraint",
    "content": "Clear, concise observation statement",
    "time_context": "optional time reference from the conversation"
  }
]

If no meaningful observations can be extracted, return an empty array: []
"#;

/// Turns raw conversation text into observations
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, text: &str) -> Result<Vec<Observation>>;
}

/// LLM-backed extractor
pub struct LlmExtractor {
    llm: Arc<dyn LlmClient>,
    ids: IdGenerator,
}

impl LlmExtractor {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            ids: IdGenerator::new(),
        }
    }

    /// Keep the id sequence in `path` so restarts never reissue an id
    pub fn with_id_state(mut self, path: impl Into<PathBuf>) -> Self {
        self.ids = IdGenerator::persistent(path);
        self
    }
}

#[async_trait]
impl Extractor for LlmExtractor {
    async fn extract(&self, text: &str) -> Result<Vec<Observation>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let user = format!("Extract observations from this conversation:\n\n{}", text);
        let raw = self.llm.complete(OBSERVER_SYSTEM_PROMPT, &user).await?;
        let observations = parse_observations(&raw, &self.ids, Local::now());

        debug!(count = observations.len(), "observations extracted");
        Ok(observations)
    }
}

fn embedded_array_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\[.*\]").ok()).as_ref()
}

/// Parse a model response into observations
///
/// Accepts a bare JSON array, an object wrapping the array under
/// `observations`/`results`/`data`/`items`, or an array embedded in prose.
/// Anything unparseable yields an empty list.
pub fn parse_observations(raw: &str, ids: &IdGenerator, now: DateTime<Local>) -> Vec<Observation> {
    let cleaned = strip_code_fence(raw);

    let data = match serde_json::from_str::<Value>(&cleaned) {
        Ok(value) => value,
        Err(_) => {
            let embedded = embedded_array_regex()
                .and_then(|re| re.find(&cleaned))
                .and_then(|m| serde_json::from_str::<Value>(m.as_str()).ok());
            match embedded {
                Some(value) => value,
                None => {
                    warn!("no JSON array found in extraction response");
                    return Vec::new();
                }
            }
        }
    };

    let items = match data {
        Value::Array(items) => items,
        Value::Object(mut map) => {
            let key = ["observations", "results", "data", "items"]
                .into_iter()
                .find(|k| map.get(*k).map_or(false, Value::is_array));
            match key.and_then(|k| map.remove(k)) {
                Some(Value::Array(items)) => items,
                _ => {
                    warn!("unexpected JSON structure in extraction response");
                    return Vec::new();
                }
            }
        }
        _ => {
            warn!("extraction response is not a list");
            return Vec::new();
        }
    };

    items
        .iter()
        .filter_map(|item| {
            let content = item.get("content").and_then(Value::as_str).unwrap_or("");
            let priority = item
                .get("priority")
                .and_then(Value::as_str)
                .map_or(Priority::Medium, Priority::parse_lenient);
            let category = item
                .get("category")
                .and_then(Value::as_str)
                .map_or(Category::Fact, Category::parse_lenient);

            let obs = Observation::new(String::new(), priority, category, content).ok()?;
            let mut obs = obs
                .with_timestamp(now)
                .with_metadata("source", "observer");
            if let Some(tc) = item.get("time_context").and_then(Value::as_str) {
                if !tc.trim().is_empty() {
                    obs = obs.with_metadata("time_context", tc.trim());
                }
            }
            obs.id = ids.next(now);
            Some(obs)
        })
        .collect()
}

/// Remove a surrounding Markdown code fence, if any
pub fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    // drop the language tag line
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
        .to_string()
}

#[derive(Debug, Deserialize)]
struct TranscriptLine {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<Value>,
}

/// Read the text to extract from a watched (or Hot) file
///
/// `.jsonl` transcripts are rendered as `[Role]: content` blocks; anything
/// else is read as Markdown with its front-matter removed.
pub fn load_source_text(path: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(path)?;
    let is_transcript = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("jsonl"));

    if is_transcript {
        Ok(format_transcript(&raw))
    } else {
        Ok(strip_front_matter(&raw).trim().to_string())
    }
}

/// Render JSONL chat messages; unparseable lines are skipped
pub fn format_transcript(raw: &str) -> String {
    raw.lines()
        .filter_map(|line| serde_json::from_str::<TranscriptLine>(line.trim()).ok())
        .filter_map(|msg| {
            let content = match msg.content? {
                Value::String(s) => s,
                Value::Array(parts) => parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("\n"),
                _ => return None,
            };
            if content.trim().is_empty() {
                return None;
            }
            let role = msg.role.unwrap_or_else(|| "unknown".to_string());
            Some(format!("[{}]: {}", capitalize(&role), content.trim()))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
