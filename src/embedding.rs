//! Local embedding generation with fastembed (no API keys)

use std::sync::Arc;

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// all-MiniLM-L6-v2 output size
pub const EMBEDDING_DIMENSIONS: usize = 384;

/// Embedding service running a small sentence model in-process
pub struct EmbeddingService {
    model: Arc<Mutex<TextEmbedding>>,
    dimensions: usize,
}

impl EmbeddingService {
    /// Load all-MiniLM-L6-v2; downloaded to the fastembed cache on first use
    pub fn new() -> Result<Self> {
        let model = TextEmbedding::try_new(
            InitOptions::new(EmbeddingModel::AllMiniLML6V2).with_show_download_progress(false),
        )
        .map_err(|e| Error::embedding(format!("Failed to load embedding model: {}", e)))?;

        Ok(Self {
            model: Arc::new(Mutex::new(model)),
            dimensions: EMBEDDING_DIMENSIONS,
        })
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut guard = self.model.lock().await;
        let embeddings = guard
            .embed(vec![text.to_string()], None)
            .map_err(|e| Error::embedding(format!("Embedding failed: {}", e)))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| Error::embedding("No embedding returned"))
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }
}
