use std::{fmt, fs, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed reading config file {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed parsing config file {path}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("unknown vector backend `{0}`, expected `flat` or `qdrant`")]
    UnknownBackend(String),
    #[error("unknown cache backend `{0}`, expected `disk` or `memory`")]
    UnknownCacheBackend(String),
    #[error("invalid value `{value}` for {key}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    #[default]
    Flat,
    Qdrant,
}

impl VectorBackend {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Flat => "flat",
            Self::Qdrant => "qdrant",
        }
    }
}

impl FromStr for VectorBackend {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "flat" => Ok(Self::Flat),
            "qdrant" => Ok(Self::Qdrant),
            _ => Err(ConfigError::UnknownBackend(raw.to_string())),
        }
    }
}

impl fmt::Display for VectorBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Disk,
    Memory,
}

impl FromStr for CacheBackend {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "disk" => Ok(Self::Disk),
            "memory" => Ok(Self::Memory),
            _ => Err(ConfigError::UnknownCacheBackend(raw.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QdrantSettings {
    pub url: String,
    pub collection: String,
}

impl Default for QdrantSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:6334".to_string(),
            collection: "sop_chunks".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub model_path: String,
    pub tokenizer_path: Option<String>,
    pub vector_dim: usize,
    pub max_sequence_length: usize,
    pub batch_size: usize,
    pub allow_pseudo: bool,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            model_path: "models/bge-base-zh-v1.5.onnx".to_string(),
            tokenizer_path: None,
            vector_dim: 768,
            max_sequence_length: 512,
            batch_size: 32,
            allow_pseudo: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalSettings {
    pub top_k: usize,
    pub fetch_k: usize,
    pub rrf_c: f64,
    pub bm25_k1: f64,
    pub bm25_b: f64,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: 8,
            fetch_k: 40,
            rrf_c: 60.0,
            bm25_k1: 1.5,
            bm25_b: 0.75,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheSettings {
    pub backend: CacheBackend,
    pub dir: String,
    pub ttl_seconds: u64,
    pub capacity: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Disk,
            dir: "storage/cache".to_string(),
            ttl_seconds: 3600,
            capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmSettings {
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub timeout_ms: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            temperature: 0.2,
            timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_addr: String,
    pub port: u16,
    pub allow_non_local: bool,
    pub api_token: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: 8000,
            allow_non_local: false,
            api_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub storage_dir: String,
    pub vector_backend: VectorBackend,
    pub qdrant: QdrantSettings,
    pub embedding: EmbeddingSettings,
    pub retrieval: RetrievalSettings,
    pub cache: CacheSettings,
    pub llm: LlmSettings,
    pub server: ServerSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage_dir: "storage".to_string(),
            vector_backend: VectorBackend::default(),
            qdrant: QdrantSettings::default(),
            embedding: EmbeddingSettings::default(),
            retrieval: RetrievalSettings::default(),
            cache: CacheSettings::default(),
            llm: LlmSettings::default(),
            server: ServerSettings::default(),
        }
    }
}

impl AppConfig {
    /// Reads `path` when it exists, then layers `SOP_RAG_*` environment overrides on top.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut cfg = Self::from_file(path)?;
        cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let cfg = toml::from_str::<Self>(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        check_rrf_c("retrieval.rrf_c", cfg.retrieval.rrf_c)?;
        Ok(cfg)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = non_empty("SOP_RAG_STORAGE_DIR") {
            self.storage_dir = dir;
        }
        if let Some(backend) = non_empty("SOP_RAG_VECTOR_BACKEND") {
            self.vector_backend = backend.parse()?;
        }
        if let Some(url) = non_empty("SOP_RAG_QDRANT_URL") {
            self.qdrant.url = url;
        }
        if let Some(collection) = non_empty("SOP_RAG_QDRANT_COLLECTION") {
            self.qdrant.collection = collection;
        }
        if let Some(model) = non_empty("SOP_RAG_MODEL_PATH") {
            self.embedding.model_path = model;
        }
        if let Some(tokenizer) = non_empty("SOP_RAG_TOKENIZER_PATH") {
            self.embedding.tokenizer_path = Some(tokenizer);
        }
        if let Some(raw) = non_empty("SOP_RAG_ALLOW_PSEUDO_EMBED") {
            self.embedding.allow_pseudo = raw.eq_ignore_ascii_case("true");
        }
        if let Some(raw) = non_empty("SOP_RAG_VECTOR_DIM") {
            self.embedding.vector_dim = parse_value("SOP_RAG_VECTOR_DIM", &raw)?;
        }
        if let Some(raw) = non_empty("SOP_RAG_TOP_K") {
            self.retrieval.top_k = parse_value("SOP_RAG_TOP_K", &raw)?;
        }
        if let Some(raw) = non_empty("SOP_RAG_FETCH_K") {
            self.retrieval.fetch_k = parse_value("SOP_RAG_FETCH_K", &raw)?;
        }
        if let Some(raw) = non_empty("SOP_RAG_RRF_C") {
            self.retrieval.rrf_c = check_rrf_c("SOP_RAG_RRF_C", parse_value("SOP_RAG_RRF_C", &raw)?)?;
        }
        if let Some(backend) = non_empty("SOP_RAG_CACHE_BACKEND") {
            self.cache.backend = backend.parse()?;
        }
        if let Some(dir) = non_empty("SOP_RAG_CACHE_DIR") {
            self.cache.dir = dir;
        }
        if let Some(raw) = non_empty("SOP_RAG_CACHE_TTL_SECONDS") {
            self.cache.ttl_seconds = parse_value("SOP_RAG_CACHE_TTL_SECONDS", &raw)?;
        }
        if let Some(base) = non_empty("SOP_RAG_LLM_API_BASE") {
            self.llm.api_base = base;
        }
        if let Some(model) = non_empty("SOP_RAG_LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(key) = non_empty("SOP_RAG_LLM_API_KEY").or_else(|| non_empty("OPENAI_API_KEY"))
        {
            self.llm.api_key = Some(key);
        }
        if let Some(addr) = non_empty("SOP_RAG_BIND_ADDR") {
            self.server.bind_addr = addr;
        }
        if let Some(raw) = non_empty("SOP_RAG_PORT") {
            self.server.port = parse_value("SOP_RAG_PORT", &raw)?;
        }
        if let Some(raw) = non_empty("SOP_RAG_ALLOW_NON_LOCAL") {
            self.server.allow_non_local = raw.eq_ignore_ascii_case("true");
        }
        if let Some(token) = non_empty("SOP_RAG_API_TOKEN") {
            self.server.api_token = Some(token);
        }
        Ok(())
    }
}

fn parse_value<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidValue {
            key,
            value: raw.to_string(),
        })
}

/// The fusion constant must be a finite, non-negative number.
fn check_rrf_c(key: &'static str, value: f64) -> Result<f64, ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        })
    }
}
