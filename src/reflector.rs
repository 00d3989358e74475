//! Token-budget driven compression of the Active Document

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::ReflectionConfig;
use crate::error::Result;
use crate::llm::LlmClient;
use crate::observer::strip_code_fence;
use crate::retry::RetryPolicy;
use crate::tokens::TokenCounter;

const REFLECTOR_SYSTEM_PROMPT: &str = "You are the Reflector of a memory system. You compress \
an observation log while preserving what matters. Lines marked \u{1f534} are high priority and \
must be kept verbatim. Return only the compressed log as Markdown lines, without commentary.";

/// Result of one compression call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompressionRecord {
    pub original_tokens: usize,
    pub compressed_tokens: usize,
    pub compressed_content: String,
    /// `original / compressed`; 0.0 when the output is empty
    pub compression_ratio: f64,
    pub level: u8,
}

impl CompressionRecord {
    pub fn new(
        original_tokens: usize,
        compressed_content: String,
        compressed_tokens: usize,
        level: u8,
    ) -> Self {
        let compression_ratio = if compressed_tokens == 0 {
            0.0
        } else {
            original_tokens as f64 / compressed_tokens as f64
        };

        Self {
            original_tokens,
            compressed_tokens,
            compressed_content,
            compression_ratio,
            level,
        }
    }

    /// Only an effective compression may replace the original
    pub fn is_effective(&self) -> bool {
        self.compression_ratio > 1.0
    }

    pub fn tokens_saved(&self) -> usize {
        self.original_tokens.saturating_sub(self.compressed_tokens)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReflectionStats {
    pub total_compressions: u64,
    pub tokens_saved: u64,
}

/// Compresses text through the LLM when the budget is exceeded
pub struct Reflector {
    llm: Arc<dyn LlmClient>,
    counter: TokenCounter,
    retry: RetryPolicy,
    max_tokens: usize,
    target_tokens: usize,
    total_compressions: AtomicU64,
    tokens_saved: AtomicU64,
}

impl Reflector {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        counter: TokenCounter,
        retry: RetryPolicy,
        config: &ReflectionConfig,
    ) -> Self {
        Self {
            llm,
            counter,
            retry,
            max_tokens: config.max_tokens,
            target_tokens: config.target(),
            total_compressions: AtomicU64::new(0),
            tokens_saved: AtomicU64::new(0),
        }
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn target_tokens(&self) -> usize {
        self.target_tokens
    }

    pub fn should_reflect(&self, tokens: usize) -> bool {
        tokens > self.max_tokens
    }

    /// Compression level 0..=3 for a document of `tokens` tokens
    pub fn suggest_level(&self, tokens: usize, target: Option<usize>) -> u8 {
        let target = target.unwrap_or(self.target_tokens).max(1);
        let ratio = tokens as f64 / target as f64;

        if ratio <= 1.0 {
            0
        } else if ratio <= 1.5 {
            1
        } else if ratio <= 2.5 {
            2
        } else {
            3
        }
    }

    /// Compress `content` at `level` with a single (retried) model call
    pub async fn reflect(&self, content: &str, level: u8) -> Result<CompressionRecord> {
        let original_tokens = self.counter.count(content);
        let user = format!(
            "{}\n\nCompress the following observation log:\n\n{}",
            level_instructions(level),
            content
        );

        let llm = self.llm.as_ref();
        let user = user.as_str();
        let raw = self
            .retry
            .run("reflect", move || llm.complete(REFLECTOR_SYSTEM_PROMPT, user))
            .await?;

        let compressed = strip_code_fence(&raw);
        let compressed_tokens = self.counter.count(&compressed);
        let record = CompressionRecord::new(original_tokens, compressed, compressed_tokens, level);

        self.total_compressions.fetch_add(1, Ordering::Relaxed);
        self.tokens_saved
            .fetch_add(record.tokens_saved() as u64, Ordering::Relaxed);

        debug!(
            level,
            original = record.original_tokens,
            compressed = record.compressed_tokens,
            "reflection finished"
        );
        if record.is_effective() {
            info!(ratio = record.compression_ratio, "content compressed");
        }
        Ok(record)
    }

    pub fn get_stats(&self) -> ReflectionStats {
        ReflectionStats {
            total_compressions: self.total_compressions.load(Ordering::Relaxed),
            tokens_saved: self.tokens_saved.load(Ordering::Relaxed),
        }
    }
}

fn level_instructions(level: u8) -> &'static str {
    match level {
        0 | 1 => "Level 1 (light): merge duplicate or near-duplicate lines and drop filler. Keep dates.",
        2 => "Level 2 (moderate): group related observations into single lines per topic. \
              Keep dates for decisions and tasks.",
        _ => "Level 3 (aggressive): keep only durable preferences, decisions, constraints and \
              open tasks, one short line each.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockLlmClient;

    fn reflector(responses: Vec<&str>) -> (Arc<MockLlmClient>, Reflector) {
        let llm = Arc::new(MockLlmClient::new(
            responses.into_iter().map(String::from).collect(),
        ));
        let config = ReflectionConfig {
            max_tokens: 100,
            target_tokens: Some(100),
            ..Default::default()
        };
        let r = Reflector::new(llm.clone(), TokenCounter::heuristic(), RetryPolicy::once(), &config);
        (llm, r)
    }

    #[test]
    fn levels_follow_ratio_bands() {
        let (_, r) = reflector(vec![]);
        assert!(!r.should_reflect(100));
        assert!(r.should_reflect(101));
        assert_eq!(r.suggest_level(100, None), 0);
        assert_eq!(r.suggest_level(150, None), 1);
        assert_eq!(r.suggest_level(250, None), 2);
        assert_eq!(r.suggest_level(251, None), 3);
        assert_eq!(r.suggest_level(40, Some(10)), 3);

        let mut last = 0;
        for tokens in (0..1000).step_by(7) {
            let level = r.suggest_level(tokens, None);
            assert!(level >= last);
            last = level;
        }
    }

    #[tokio::test]
    async fn reflect_records_savings() {
        let (llm, r) = reflector(vec!["```markdown\n- short\n```"]);
        let content = "- a long observation line that goes on and on\n".repeat(10);

        let record = r.reflect(&content, 2).await.unwrap();
        assert_eq!(record.compressed_content, "- short");
        assert!(record.is_effective());
        assert_eq!(llm.call_count(), 1);

        let stats = r.get_stats();
        assert_eq!(stats.total_compressions, 1);
        assert_eq!(stats.tokens_saved, record.tokens_saved() as u64);
    }

    #[tokio::test]
    async fn expansion_is_ineffective_and_saves_nothing() {
        let longer = "x".repeat(400);
        let (_, r) = reflector(vec![longer.as_str()]);

        let record = r.reflect("tiny", 1).await.unwrap();
        assert!(!record.is_effective());
        assert_eq!(r.get_stats().tokens_saved, 0);
    }

    #[test]
    fn empty_output_has_zero_ratio() {
        let record = CompressionRecord::new(50, String::new(), 0, 1);
        assert_eq!(record.compression_ratio, 0.0);
        assert!(!record.is_effective());
    }
}
