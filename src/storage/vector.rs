//! LanceDB table of observation embeddings

use std::path::Path;
use std::sync::Arc;

use arrow_array::{
    Array, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use futures::TryStreamExt;
use lance_arrow::FixedSizeListArrayExt;
use lancedb::connect;
use lancedb::query::{ExecutableQuery, QueryBase};

use crate::error::{Error, Result};

const TABLE_NAME: &str = "observations";

/// Nearest neighbour returned by [`VectorStorage::search`]
#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub id: String,
    pub content: String,
    /// L2 distance; smaller is closer
    pub distance: f32,
}

/// Vector storage backend using LanceDB
pub struct VectorStorage {
    db: lancedb::Connection,
    dimensions: usize,
}

impl VectorStorage {
    pub async fn new(path: &Path, dimensions: usize) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let db = connect(&path.to_string_lossy())
            .execute()
            .await
            .map_err(|e| Error::vector_db(e.to_string()))?;

        let storage = Self { db, dimensions };
        storage.ensure_table().await?;
        Ok(storage)
    }

    fn schema(&self) -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("content", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimensions as i32,
                ),
                false,
            ),
        ])
    }

    async fn ensure_table(&self) -> Result<()> {
        let tables = self
            .db
            .table_names()
            .execute()
            .await
            .map_err(|e| Error::vector_db(e.to_string()))?;

        if !tables.iter().any(|t| t == TABLE_NAME) {
            let schema = Arc::new(self.schema());
            let empty = RecordBatch::new_empty(schema.clone());
            let reader = RecordBatchIterator::new(vec![empty].into_iter().map(Ok), schema);

            self.db
                .create_table(TABLE_NAME, Box::new(reader))
                .execute()
                .await
                .map_err(|e| Error::vector_db(e.to_string()))?;
        }

        Ok(())
    }

    async fn table(&self) -> Result<lancedb::Table> {
        self.db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|e| Error::vector_db(e.to_string()))
    }

    /// Insert or replace the row for `id`
    pub async fn upsert(&self, id: &str, content: &str, embedding: Vec<f32>) -> Result<()> {
        if embedding.len() != self.dimensions {
            return Err(Error::vector_db(format!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.dimensions,
                embedding.len()
            )));
        }

        let table = self.table().await?;
        table
            .delete(&format!("id = '{}'", id.replace('\'', "''")))
            .await
            .map_err(|e| Error::vector_db(e.to_string()))?;

        let vectors = FixedSizeListArray::try_new_from_values(
            Float32Array::from(embedding),
            self.dimensions as i32,
        )
        .map_err(|e: arrow_schema::ArrowError| Error::vector_db(e.to_string()))?;

        let schema = Arc::new(self.schema());
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(vec![id.to_string()])) as Arc<dyn Array>,
                Arc::new(StringArray::from(vec![content.to_string()])),
                Arc::new(vectors),
            ],
        )
        .map_err(|e| Error::vector_db(e.to_string()))?;

        let reader = RecordBatchIterator::new(vec![batch].into_iter().map(Ok), schema);
        table
            .add(Box::new(reader))
            .execute()
            .await
            .map_err(|e| Error::vector_db(e.to_string()))?;

        Ok(())
    }

    pub async fn search(&self, query_embedding: &[f32], limit: usize) -> Result<Vec<VectorMatch>> {
        let table = self.table().await?;
        let stream = table
            .vector_search(query_embedding.to_vec())
            .map_err(|e: lancedb::Error| Error::vector_db(e.to_string()))?
            .limit(limit)
            .execute()
            .await
            .map_err(|e: lancedb::Error| Error::vector_db(e.to_string()))?;

        let batches: Vec<RecordBatch> = stream
            .try_collect::<Vec<RecordBatch>>()
            .await
            .map_err(|e: lancedb::Error| Error::vector_db(e.to_string()))?;

        let mut matches = Vec::new();
        for batch in batches {
            let ids = string_column(&batch, "id")?;
            let contents = string_column(&batch, "content")?;
            let distances = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
                .ok_or_else(|| Error::vector_db("Missing _distance column"))?;

            for i in 0..batch.num_rows() {
                matches.push(VectorMatch {
                    id: ids.value(i).to_string(),
                    content: contents.value(i).to_string(),
                    distance: distances.value(i),
                });
            }
        }

        matches.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        Ok(matches)
    }
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| Error::vector_db(format!("Missing {} column", name)))
}
