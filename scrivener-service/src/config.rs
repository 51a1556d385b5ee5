//! Service configuration.
//!
//! Loaded once at startup from an optional `config` file plus environment
//! variables with the `SCRIVENER` prefix (`__` as the section separator, e.g.
//! `SCRIVENER__SERVER__PORT=8080`). Every field has a default so the service
//! starts with no configuration at all.

use std::path::PathBuf;

use config::{Config as ConfigBuilder, Environment, File};
use serde::Deserialize;

use crate::error::{ServiceError, ServiceResult};

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub conversion: ConversionConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Database and local artifacts live under this directory.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversionConfig {
    #[serde(default = "default_soffice_path")]
    pub soffice_path: String,
    #[serde(default = "default_conversion_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_analysis_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_analysis_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Wall clock budget for one analyze round-trip, polling included.
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnrichmentConfig {
    /// When false the pipeline runs without LLM metadata enrichment.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_llm_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Attempt budget per stage execution.
    #[serde(default = "default_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    /// Stage executions running at once across all documents.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_stages: usize,
    #[serde(default = "default_chunk_max_tokens")]
    pub chunk_max_tokens: u32,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_soffice_path() -> String {
    "/usr/bin/soffice".to_string()
}

fn default_conversion_timeout() -> u64 {
    120
}

fn default_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    2
}

fn default_analysis_endpoint() -> String {
    "http://localhost:5000".to_string()
}

fn default_analysis_model() -> String {
    "prebuilt-layout".to_string()
}

fn default_poll_timeout() -> u64 {
    300
}

fn default_llm_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_chat_model() -> String {
    "llama3.1:8b".to_string()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_llm_timeout() -> u64 {
    120
}

fn default_max_concurrent() -> usize {
    4
}

fn default_chunk_max_tokens() -> u32 {
    512
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            soffice_path: default_soffice_path(),
            timeout_secs: default_conversion_timeout(),
            attempts: default_attempts(),
            retry_delay_secs: default_retry_delay(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            endpoint: default_analysis_endpoint(),
            model: default_analysis_model(),
            api_key: None,
            poll_timeout_secs: default_poll_timeout(),
            attempts: default_attempts(),
            retry_delay_secs: default_retry_delay(),
        }
    }
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_llm_base_url(),
            chat_model: default_chat_model(),
            embedding_model: default_embedding_model(),
            request_timeout_secs: default_llm_timeout(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_attempts(),
            retry_delay_secs: default_retry_delay(),
            max_concurrent_stages: default_max_concurrent(),
            chunk_max_tokens: default_chunk_max_tokens(),
        }
    }
}

impl ServiceConfig {
    /// Load from the optional `config` file and the environment.
    pub fn load() -> ServiceResult<Self> {
        ConfigBuilder::builder()
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("SCRIVENER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ServiceError::Config {
                message: e.to_string(),
            })
    }
}
