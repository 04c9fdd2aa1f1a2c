//! Typed pipeline configuration.
//!
//! Every stage reads this same structure, populated from environment
//! variables via `dotenvy` (lazy, one-time load, tolerant of a missing
//! `.env`) following the `DbConfig::from_env` pattern used by the
//! persistence layer. Validation happens at construction time, never
//! mid-run.

use once_cell::sync::Lazy;
use std::env;
use std::time::Duration;
use thiserror::Error;

static DOTENV_LOADED: Lazy<()> = Lazy::new(|| {
    let _ = dotenvy::dotenv();
});

pub fn init_dotenv() {
    Lazy::force(&DOTENV_LOADED);
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid { key: &'static str, value: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageBusType {
    Broker,
    Cloud,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStoreType {
    InMemory,
    Postgres,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorStoreType {
    InMemory,
    Qdrant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkingStrategy {
    TokenWindow,
    FixedSize,
    Semantic,
}

#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    pub strategy: ChunkingStrategy,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub min_chunk_size: usize,
    pub max_chunk_size: usize,
    pub messages_per_chunk: usize,
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub backend: String,
    pub model: String,
    pub dimension: usize,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub context_window_tokens: usize,
}

#[derive(Debug, Clone)]
pub struct RetrySharedConfig {
    pub max_attempts: u32,
    pub backoff_seconds: u64,
    pub max_backoff_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub startup_requeue_stall_threshold_seconds: i64,
    pub retry_supervisor_interval_seconds: u64,
    pub retry_supervisor_max_retries: u32,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub message_bus_type: MessageBusType,
    pub document_store_type: DocumentStoreType,
    pub vector_store_type: VectorStoreType,
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub retrieval: RetrievalConfig,
    pub retry: RetrySharedConfig,
    pub supervisor: SupervisorConfig,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        init_dotenv();

        let message_bus_type = match env_or("MESSAGE_BUS_TYPE", "broker").as_str() {
            "broker" => MessageBusType::Broker,
            "cloud" => MessageBusType::Cloud,
            other => {
                return Err(ConfigError::Invalid {
                    key: "MESSAGE_BUS_TYPE",
                    value: other.to_string(),
                    reason: "expected 'broker' or 'cloud'".to_string(),
                })
            }
        };

        let document_store_type = match env_or("DOCUMENT_STORE_TYPE", "in_memory").as_str() {
            "in_memory" => DocumentStoreType::InMemory,
            "postgres" => DocumentStoreType::Postgres,
            other => {
                return Err(ConfigError::Invalid {
                    key: "DOCUMENT_STORE_TYPE",
                    value: other.to_string(),
                    reason: "expected 'in_memory' or 'postgres'".to_string(),
                })
            }
        };

        let vector_store_type = match env_or("VECTOR_STORE_TYPE", "in_memory").as_str() {
            "in_memory" => VectorStoreType::InMemory,
            "qdrant" => VectorStoreType::Qdrant,
            other => {
                return Err(ConfigError::Invalid {
                    key: "VECTOR_STORE_TYPE",
                    value: other.to_string(),
                    reason: "expected 'in_memory' or 'qdrant'".to_string(),
                })
            }
        };

        let strategy = match env_or("CHUNKING_STRATEGY", "token_window").as_str() {
            "token_window" => ChunkingStrategy::TokenWindow,
            "fixed_size" => ChunkingStrategy::FixedSize,
            "semantic" => ChunkingStrategy::Semantic,
            other => {
                return Err(ConfigError::Invalid {
                    key: "CHUNKING_STRATEGY",
                    value: other.to_string(),
                    reason: "expected 'token_window', 'fixed_size' or 'semantic'".to_string(),
                })
            }
        };

        let chunk_size = parse_env_or("CHUNK_SIZE", 512usize)?;
        let chunk_overlap = parse_env_or("CHUNK_OVERLAP", 64usize)?;
        if chunk_overlap >= chunk_size {
            return Err(ConfigError::Invalid {
                key: "CHUNK_OVERLAP",
                value: chunk_overlap.to_string(),
                reason: "chunk_overlap must be strictly less than chunk_size".to_string(),
            });
        }

        let chunking = ChunkingConfig {
            strategy,
            chunk_size,
            chunk_overlap,
            min_chunk_size: parse_env_or("MIN_CHUNK_SIZE", 32usize)?,
            max_chunk_size: parse_env_or("MAX_CHUNK_SIZE", 1024usize)?,
            messages_per_chunk: parse_env_or("MESSAGES_PER_CHUNK", 1usize)?,
        };

        let embedding = EmbeddingConfig {
            backend: env_or("EMBEDDING_BACKEND", "local"),
            model: env_or("EMBEDDING_MODEL", "text-embedding-default"),
            dimension: parse_env_or("EMBEDDING_DIMENSION", 384usize)?,
        };

        let llm = LlmConfig {
            backend: env_or("LLM_BACKEND", "local"),
            model: env_or("LLM_MODEL", "summarizer-default"),
            temperature: parse_env_or("LLM_TEMPERATURE", 0.2f32)?,
            max_tokens: parse_env_or("LLM_MAX_TOKENS", 1024u32)?,
            timeout_seconds: parse_env_or("LLM_TIMEOUT_SECONDS", 30u64)?,
        };

        let retrieval = RetrievalConfig {
            top_k: parse_env_or("TOP_K", 8usize)?,
            context_window_tokens: parse_env_or("CONTEXT_WINDOW_TOKENS", 4096usize)?,
        };

        let retry = RetrySharedConfig {
            max_attempts: parse_env_or("RETRY_MAX_ATTEMPTS", crate::constants::DEFAULT_RETRY_MAX_ATTEMPTS)?,
            backoff_seconds: parse_env_or("RETRY_BACKOFF_SECONDS", crate::constants::DEFAULT_RETRY_BASE_BACKOFF_SECONDS)?,
            max_backoff_seconds: parse_env_or("RETRY_MAX_BACKOFF_SECONDS", crate::constants::DEFAULT_RETRY_MAX_BACKOFF_SECONDS)?,
        };

        let supervisor = SupervisorConfig {
            startup_requeue_stall_threshold_seconds: parse_env_or(
                "STARTUP_REQUEUE_STALL_THRESHOLD_SECONDS",
                crate::constants::DEFAULT_STARTUP_REQUEUE_STALL_THRESHOLD_SECONDS,
            )?,
            retry_supervisor_interval_seconds: parse_env_or(
                "RETRY_SUPERVISOR_INTERVAL_SECONDS",
                crate::constants::DEFAULT_RETRY_SUPERVISOR_INTERVAL_SECONDS,
            )?,
            retry_supervisor_max_retries: parse_env_or(
                "RETRY_SUPERVISOR_MAX_RETRIES",
                crate::constants::DEFAULT_RETRY_SUPERVISOR_MAX_RETRIES,
            )?,
        };

        Ok(Self { message_bus_type, document_store_type, vector_store_type, chunking, embedding, llm, retrieval, retry, supervisor })
    }

    pub fn retry_config(&self) -> crate::retry::RetryConfig {
        crate::retry::RetryConfig {
            max_attempts: self.retry.max_attempts,
            base_backoff: Duration::from_secs(self.retry.backoff_seconds),
            max_backoff: Duration::from_secs(self.retry.max_backoff_seconds),
            jitter_fraction: 0.20,
        }
    }
}

fn env_or(key: &'static str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env_or<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.parse::<T>().map_err(|_| ConfigError::Invalid { key, value: raw, reason: "failed to parse".to_string() }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_overlap_must_be_less_than_chunk_size() {
        std::env::set_var("CHUNK_SIZE", "100");
        std::env::set_var("CHUNK_OVERLAP", "100");
        let result = PipelineConfig::from_env();
        std::env::remove_var("CHUNK_SIZE");
        std::env::remove_var("CHUNK_OVERLAP");
        assert!(result.is_err());
    }

    #[test]
    fn defaults_are_valid() {
        std::env::remove_var("CHUNK_SIZE");
        std::env::remove_var("CHUNK_OVERLAP");
        let cfg = PipelineConfig::from_env().expect("defaults should validate");
        assert_eq!(cfg.chunking.strategy, ChunkingStrategy::TokenWindow);
    }
}
