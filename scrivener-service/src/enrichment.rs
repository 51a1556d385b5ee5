//! LLM-backed metadata enrichment and embeddings.
//!
//! Enrichment is best-effort: a failed or malformed LLM response downgrades to
//! "no enriched metadata" with a warning, it never fails the parsing stage.

use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::EnrichmentConfig;
use crate::error::{EnrichmentError, ServiceError, ServiceResult};
use crate::vector::Embedder;

/// How far a document's content is trusted, judged by the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reliability {
    High,
    Medium,
    Low,
}

/// Document-level metadata produced by the enrichment model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedMetadata {
    pub document_type: String,
    pub summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub date_of_authoring: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    pub reliability: Reliability,
}

/// LLM API client (chat completion + embeddings).
pub struct LlmClient {
    client: Client,
    base_url: String,
    chat_model: String,
    embedding_model: String,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

impl LlmClient {
    pub fn new(config: &EnrichmentConfig) -> Result<Self, EnrichmentError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| EnrichmentError::Connection {
                url: config.base_url.clone(),
                source: e,
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            chat_model: config.chat_model.clone(),
            embedding_model: config.embedding_model.clone(),
        })
    }

    /// One chat completion constrained to JSON output.
    async fn chat_json(&self, system: &str, user: String) -> Result<String, EnrichmentError> {
        let url = format!("{}/api/chat", self.base_url);

        let body = serde_json::json!({
            "model": &self.chat_model,
            "messages": [
                ChatMessage { role: "system", content: system.to_string() },
                ChatMessage { role: "user", content: user },
            ],
            "format": "json",
            "stream": false,
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EnrichmentError::Connection {
                url: url.clone(),
                source: e,
            })?;

        if !response.status().is_success() {
            return Err(EnrichmentError::Generation {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| EnrichmentError::Connection {
                url,
                source: e,
            })?;

        Ok(chat.message.content)
    }

    /// Embed a single text.
    pub async fn embed_text(&self, text: &str) -> Result<Vec<f32>, EnrichmentError> {
        let url = format!("{}/api/embeddings", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "model": &self.embedding_model,
                "prompt": text,
            }))
            .send()
            .await
            .map_err(|e| EnrichmentError::Connection {
                url: url.clone(),
                source: e,
            })?;

        if !response.status().is_success() {
            return Err(EnrichmentError::Generation {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let parsed: EmbeddingResponse =
            response
                .json()
                .await
                .map_err(|e| EnrichmentError::Connection {
                    url,
                    source: e,
                })?;

        Ok(parsed.embedding)
    }
}

impl Embedder for LlmClient {
    fn embed<'a>(&'a self, text: &'a str) -> BoxFuture<'a, ServiceResult<Vec<f32>>> {
        Box::pin(async move {
            self.embed_text(text)
                .await
                .map_err(|e| ServiceError::Internal {
                    message: format!("embedding request failed: {e}"),
                })
        })
    }
}

const ENRICHMENT_SYSTEM_PROMPT: &str = "You classify documents. Respond with a single JSON \
object with these keys: document_type (short noun phrase), summary (2-3 sentences), tags \
(array of 3-5 short strings), date_of_authoring (ISO date or null), source (issuing \
organization or null), reliability (one of: high, medium, low).";

/// Budget of document text handed to the model per request.
const ENRICHMENT_TEXT_BUDGET: usize = 8000;

/// Best-effort document enrichment on top of [`LlmClient`].
pub struct Enrichment {
    llm: LlmClient,
}

impl Enrichment {
    pub fn new(llm: LlmClient) -> Self {
        Self { llm }
    }

    /// Classify a document from its extracted text. Returns `None` on any
    /// failure; parsing proceeds without enriched metadata.
    pub async fn enrich(&self, text: &str, filename: &str) -> Option<EnrichedMetadata> {
        let excerpt = truncate_to_budget(text, ENRICHMENT_TEXT_BUDGET);
        let prompt = format!("Filename: {filename}\n\nDocument text:\n{excerpt}");

        let content = match self.llm.chat_json(ENRICHMENT_SYSTEM_PROMPT, prompt).await {
            Ok(content) => content,
            Err(e) => {
                warn!(filename = %filename, error = %e, "Enrichment request failed, continuing without metadata");
                return None;
            }
        };

        match serde_json::from_str::<EnrichedMetadata>(&content) {
            Ok(metadata) => {
                debug!(
                    filename = %filename,
                    document_type = %metadata.document_type,
                    "Document enriched"
                );
                Some(metadata)
            }
            Err(e) => {
                warn!(filename = %filename, error = %e, "Enrichment response was not valid metadata JSON");
                None
            }
        }
    }
}

/// Truncate on a char boundary at or below the byte budget.
fn truncate_to_budget(text: &str, budget: usize) -> &str {
    if text.len() <= budget {
        return text;
    }
    let mut end = budget;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
