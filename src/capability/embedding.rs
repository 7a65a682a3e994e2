//! Batch embedding with graceful degradation.

use crate::capability::Embedder;
use crate::client::LlmClient;
use crate::models::Result;
use std::sync::Arc;
use tracing::warn;

/// Production embedder over an OpenAI-compatible endpoint.
///
/// Embedding failures never abort a pipeline run: transport and shape errors
/// are logged and reported as an empty batch, which callers interpret as
/// "capability unavailable" and answer with their lexical fallback.
pub struct LlmEmbedder {
    client: Arc<LlmClient>,
    model_id: String,
}

impl LlmEmbedder {
    pub fn new(client: Arc<LlmClient>, model_id: impl Into<String>) -> Self {
        Self {
            client,
            model_id: model_id.into(),
        }
    }
}

impl Embedder for LlmEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        match self.client.embeddings(&self.model_id, texts).await {
            Ok(vectors) => Ok(vectors),
            Err(e) => {
                warn!(error = %e, batch = texts.len(), "Embedding call failed, degrading");
                Ok(Vec::new())
            }
        }
    }
}
