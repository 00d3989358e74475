//! Semantic index over fastembed + LanceDB

use std::path::Path;

use async_trait::async_trait;

use super::{SemanticHit, SemanticIndex};
use crate::embedding::EmbeddingService;
use crate::error::Result;
use crate::storage::VectorStorage;

pub struct VectorIndex {
    embeddings: EmbeddingService,
    storage: VectorStorage,
}

impl VectorIndex {
    /// Open (or create) the index under `path`
    pub async fn open(path: &Path) -> Result<Self> {
        let embeddings = EmbeddingService::new()?;
        let storage = VectorStorage::new(path, embeddings.dimensions()).await?;
        Ok(Self {
            embeddings,
            storage,
        })
    }
}

#[async_trait]
impl SemanticIndex for VectorIndex {
    async fn search(&self, query: &str, n: usize) -> Result<Vec<SemanticHit>> {
        let embedding = self.embeddings.embed(query).await?;
        let matches = self.storage.search(&embedding, n).await?;

        Ok(matches
            .into_iter()
            .map(|m| SemanticHit {
                id: m.id,
                content: m.content,
                distance: m.distance,
            })
            .collect())
    }

    async fn index(&self, id: &str, text: &str) -> Result<()> {
        let embedding = self.embeddings.embed(text).await?;
        self.storage.upsert(id, text, embedding).await
    }
}
