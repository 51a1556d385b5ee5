//! Layout-analysis service client.
//!
//! [`DocumentAnalyzer`] wraps one round-trip to the layout-analysis capability
//! with a retry policy tuned per failure class: request timeouts back off
//! linearly, rate limits back off exponentially, everything else waits a fixed
//! delay. Exhausting the budget is terminal for the parsing stage.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::config::AnalysisConfig;
use crate::error::AnalysisError;

/// Raw analysis result: pages, paragraphs and tables with bounding polygons.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawAnalysis {
    #[serde(default)]
    pub pages: Vec<AnalyzedPage>,
    #[serde(default)]
    pub paragraphs: Vec<AnalyzedParagraph>,
    #[serde(default)]
    pub tables: Vec<AnalyzedTable>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzedPage {
    pub page_number: u32,
    pub width: f64,
    pub height: f64,
    pub unit: String,
    #[serde(default)]
    pub angle: f64,
}

/// Where an element sits on a page: 8-point polygon, flattened
/// `[x1, y1, x2, y2, x3, y3, x4, y4]` in the source coordinate system.
#[derive(Debug, Clone, Deserialize)]
pub struct BoundingRegion {
    pub page_number: u32,
    #[serde(default)]
    pub polygon: Vec<f64>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct AnalyzedSpan {
    pub offset: u64,
    #[allow(dead_code)]
    #[serde(default)]
    pub length: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzedParagraph {
    pub content: String,
    /// Structural role when detected (title, sectionHeading, ...)
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub bounding_regions: Vec<BoundingRegion>,
    #[serde(default)]
    pub spans: Vec<AnalyzedSpan>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzedTable {
    pub row_count: u32,
    pub column_count: u32,
    #[serde(default)]
    pub cells: Vec<AnalyzedTableCell>,
    #[serde(default)]
    pub bounding_regions: Vec<BoundingRegion>,
    #[serde(default)]
    pub spans: Vec<AnalyzedSpan>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzedTableCell {
    pub row_index: u32,
    pub column_index: u32,
    pub content: String,
    /// `columnHeader` cells render as `<th>`
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub row_span: Option<u32>,
    #[serde(default)]
    pub column_span: Option<u32>,
}

/// One round-trip to the layout-analysis service. Split from the retry
/// policy so the analyzer is testable without a live endpoint.
pub trait AnalysisTransport: Send + Sync {
    fn call<'a>(&'a self, content: &'a [u8]) -> BoxFuture<'a, Result<RawAnalysis, AnalysisError>>;
}

/// Retrying wrapper around an [`AnalysisTransport`].
pub struct DocumentAnalyzer {
    transport: Arc<dyn AnalysisTransport>,
    attempts: u32,
    retry_delay: Duration,
}

impl DocumentAnalyzer {
    pub fn new(transport: Arc<dyn AnalysisTransport>, attempts: u32, retry_delay: Duration) -> Self {
        Self {
            transport,
            attempts: attempts.max(1),
            retry_delay,
        }
    }

    /// Analyze a document, retrying per the failure-class policy.
    pub async fn analyze(&self, content: &[u8]) -> Result<RawAnalysis, AnalysisError> {
        let mut last_message = String::new();

        for attempt in 1..=self.attempts {
            info!(attempt, total = self.attempts, "Starting layout analysis");

            let error = match self.transport.call(content).await {
                Ok(result) => {
                    info!(
                        pages = result.pages.len(),
                        paragraphs = result.paragraphs.len(),
                        tables = result.tables.len(),
                        "Layout analysis completed"
                    );
                    return Ok(result);
                }
                Err(e) => e,
            };

            // A response that did not decode is not a service hiccup; give
            // up immediately rather than replaying the request.
            if matches!(error, AnalysisError::InvalidResponse(_)) {
                error!(attempt, error = %error, "Layout analysis returned an invalid response");
                return Err(error);
            }

            last_message = error.to_string();
            let delay = match &error {
                // Timeouts back off linearly with the attempt number.
                AnalysisError::Timeout { .. } => self.retry_delay * attempt,
                // Rate limiting backs off exponentially.
                AnalysisError::RateLimited => {
                    self.retry_delay * 2u32.saturating_pow(attempt - 1)
                }
                _ => self.retry_delay,
            };

            if attempt < self.attempts {
                warn!(
                    attempt,
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "Layout analysis attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            } else {
                error!(attempt, error = %error, "Layout analysis attempts exhausted");
            }
        }

        Err(AnalysisError::Exhausted {
            attempts: self.attempts,
            message: last_message,
        })
    }
}

/// HTTP transport for the layout-analysis service.
pub struct HttpAnalysisTransport {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    poll_timeout: Duration,
}

impl HttpAnalysisTransport {
    pub fn new(config: &AnalysisConfig) -> Result<Self, AnalysisError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| AnalysisError::Connection {
                url: config.endpoint.clone(),
                source: e,
            })?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            poll_timeout: Duration::from_secs(config.poll_timeout_secs),
        })
    }
}

impl AnalysisTransport for HttpAnalysisTransport {
    fn call<'a>(&'a self, content: &'a [u8]) -> BoxFuture<'a, Result<RawAnalysis, AnalysisError>> {
        Box::pin(async move {
            let url = format!("{}/analyze?model={}", self.endpoint, self.model);

            let mut request = self
                .client
                .post(&url)
                .header("content-type", "application/octet-stream")
                .body(content.to_vec());
            if let Some(key) = &self.api_key {
                request = request.header("authorization", format!("Bearer {key}"));
            }

            // Hard wall clock on the whole analyze round-trip, polling included.
            let response = match tokio::time::timeout(self.poll_timeout, request.send()).await {
                Err(_) => {
                    return Err(AnalysisError::Timeout {
                        secs: self.poll_timeout.as_secs(),
                    });
                }
                Ok(Err(e)) if e.is_timeout() => {
                    return Err(AnalysisError::Timeout {
                        secs: self.poll_timeout.as_secs(),
                    });
                }
                Ok(Err(e)) => {
                    return Err(AnalysisError::Connection {
                        url: url.clone(),
                        source: e,
                    });
                }
                Ok(Ok(resp)) => resp,
            };

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                return Err(AnalysisError::RateLimited);
            }
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(AnalysisError::Http {
                    status: status.as_u16(),
                    message,
                });
            }

            let body = response.bytes().await.map_err(|e| AnalysisError::Connection {
                url,
                source: e,
            })?;
            serde_json::from_slice(&body).map_err(AnalysisError::InvalidResponse)
        })
    }
}
