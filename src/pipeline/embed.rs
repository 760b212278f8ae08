//! Embedding stage: summary text → vector + content hash.

use std::sync::Arc;

use crate::knowledge::content_hash;
use crate::providers::LlmProvider;
use crate::types::ProviderError;

use super::EmbeddedSummary;

/// Embed one summary. Provider errors propagate so the queue can retry
/// the job.
pub async fn embed_summary(
    embedder: &Arc<dyn LlmProvider>,
    summary: &str,
    model_tag: &str,
) -> Result<EmbeddedSummary, ProviderError> {
    let embedding = embedder.embed(summary).await?;
    Ok(EmbeddedSummary {
        embedding,
        embedding_model: model_tag.to_string(),
        content_hash: content_hash(summary),
    })
}

/// Embed a batch of summaries in one provider call.
pub async fn embed_summaries(
    embedder: &Arc<dyn LlmProvider>,
    summaries: &[String],
    model_tag: &str,
) -> Result<Vec<EmbeddedSummary>, ProviderError> {
    let embeddings = embedder.embed_batch(summaries).await?;
    if embeddings.len() != summaries.len() {
        return Err(ProviderError::InvalidResponse(format!(
            "expected {} embeddings, got {}",
            summaries.len(),
            embeddings.len()
        )));
    }
    Ok(summaries
        .iter()
        .zip(embeddings)
        .map(|(summary, embedding)| EmbeddedSummary {
            embedding,
            embedding_model: model_tag.to_string(),
            content_hash: content_hash(summary),
        })
        .collect())
}
