//! pgvector-backed knowledge retrieval for the `doubts` section.
//!
//! The query is embedded locally with fastembed and matched against the
//! `medical_knowledge` passages table by cosine distance.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use consult_flow::{FlowError, KnowledgeRetriever, RetrievedPassage};

pub struct PgVectorRetriever {
    pool: sqlx::PgPool,
}

impl PgVectorRetriever {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }
}

/// Generate an embedding for a query using fastembed.
async fn embed_query(text: &str) -> Result<Vec<f32>> {
    let input = text.to_owned();

    // Off-load the ONNX inference to a blocking thread so we don't obstruct
    // Tokio's async scheduler.
    let embedding = tokio::task::spawn_blocking(move || {
        use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

        let mut model = TextEmbedding::try_new(
            InitOptions::new(EmbeddingModel::AllMiniLML6V2).with_show_download_progress(false),
        )?;
        let embeddings = model.embed(vec![input], None)?;
        Ok::<Vec<f32>, anyhow::Error>(embeddings.into_iter().next().unwrap())
    })
    .await??;

    Ok(embedding)
}

#[async_trait]
impl KnowledgeRetriever for PgVectorRetriever {
    async fn retrieve(
        &self,
        query: &str,
        limit: usize,
    ) -> consult_flow::Result<Vec<RetrievedPassage>> {
        info!("Searching medical knowledge base");

        let embedding = embed_query(query)
            .await
            .map_err(|e| FlowError::Retrieval(format!("query embedding failed: {e}")))?;

        // Build a literal vector representation suitable for pgvector.
        let vector_literal = embedding
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "SELECT document_id, title, article_id, chunk_text, chunk_index,     \
                    1 - (embedding <=> ARRAY[{v}]::vector) AS similarity         \
             FROM medical_knowledge                                              \
             ORDER BY embedding <=> ARRAY[{v}]::vector                           \
             LIMIT {limit}",
            v = vector_literal,
        );

        let rows = sqlx::query_as::<_, (String, String, String, String, i32, f64)>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| FlowError::Retrieval(format!("knowledge query failed: {e}")))?;

        info!("Retrieved {} passages from knowledge base", rows.len());

        Ok(rows
            .into_iter()
            .map(
                |(document_id, title, article_id, text, index, similarity)| RetrievedPassage {
                    document_id,
                    title,
                    article_id,
                    similarity: similarity as f32,
                    text,
                    index,
                },
            )
            .collect())
    }
}
