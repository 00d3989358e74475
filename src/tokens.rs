//! Token counting for the Active Document budget

use std::sync::Arc;

use crate::config::Tokenizer;
use crate::error::{Error, Result};

/// Token counter: a character heuristic by default, tiktoken BPE when asked
#[derive(Clone, Default)]
pub struct TokenCounter {
    bpe: Option<Arc<tiktoken_rs::CoreBPE>>,
}

impl TokenCounter {
    /// ~4 characters per token, no vocabulary needed
    pub fn heuristic() -> Self {
        Self { bpe: None }
    }

    /// BPE counter for a specific model
    pub fn new(model: &str) -> Result<Self> {
        let bpe = tiktoken_rs::get_bpe_from_model(model)
            .map_err(|e| Error::config(format!("Failed to load tokenizer for {}: {}", model, e)))?;

        Ok(Self {
            bpe: Some(Arc::new(bpe)),
        })
    }

    /// BPE counter using the cl100k vocabulary (GPT-4 family)
    pub fn for_gpt() -> Result<Self> {
        Self::new("gpt-4")
    }

    pub fn from_config(tokenizer: Tokenizer) -> Result<Self> {
        match tokenizer {
            Tokenizer::Heuristic => Ok(Self::heuristic()),
            Tokenizer::Cl100k => Self::for_gpt(),
        }
    }

    /// Count tokens in a text
    pub fn count(&self, text: &str) -> usize {
        match &self.bpe {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            None => Self::estimate(text),
        }
    }

    /// ceil(chars / 4)
    pub fn estimate(text: &str) -> usize {
        text.chars().count().div_ceil(4)
    }

    pub fn is_exact(&self) -> bool {
        self.bpe.is_some()
    }
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCounter")
            .field("exact", &self.is_exact())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_rounds_up() {
        let counter = TokenCounter::heuristic();
        assert_eq!(counter.count(""), 0);
        assert_eq!(counter.count("abc"), 1);
        assert_eq!(counter.count("abcd"), 1);
        assert_eq!(counter.count("abcde"), 2);
        assert_eq!(counter.count(&"x".repeat(400)), 100);
    }

    #[test]
    fn heuristic_counts_characters_not_bytes() {
        // four code points, twelve bytes
        assert_eq!(TokenCounter::estimate("\u{1f534}\u{1f534}\u{1f534}\u{1f534}"), 1);
    }
}
