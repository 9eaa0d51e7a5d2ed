pub mod config;

use schemars::JsonSchema;
use schemars::Schema;
use serde::{Deserialize, Serialize};

pub use config::{
    AppConfig, CacheBackend, CacheSettings, ConfigError, EmbeddingSettings, LlmSettings,
    QdrantSettings, RetrievalSettings, ServerSettings, VectorBackend,
};

/// Joins the parts of a fusion key. U+241F never shows up in forum text.
pub const FUSION_KEY_SEPARATOR: char = '\u{241f}';
/// Number of title characters that take part in a fusion key.
pub const FUSION_KEY_TITLE_CHARS: usize = 80;
/// Number of content characters exposed as a source snippet.
pub const SNIPPET_CHARS: usize = 600;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ChunkMeta {
    pub source_id: String,
    pub chunk_index: usize,
    pub component: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub relevance_score: i64,
    #[serde(default)]
    pub accepted: bool,
    #[serde(default)]
    pub title: String,
}

/// A retrievable passage. Built once at index time and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct Chunk {
    pub content: String,
    pub meta: ChunkMeta,
}

impl Chunk {
    /// Stable identity of a chunk across index builds.
    pub fn fusion_key(&self) -> String {
        let title = self
            .meta
            .title
            .chars()
            .take(FUSION_KEY_TITLE_CHARS)
            .collect::<String>();
        format!(
            "{}{FUSION_KEY_SEPARATOR}{}{FUSION_KEY_SEPARATOR}{title}",
            self.meta.source_id, self.meta.chunk_index
        )
    }

    pub fn snippet(&self) -> String {
        self.content.chars().take(SNIPPET_CHARS).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct AskParams {
    pub question: String,
    #[serde(default)]
    pub components: Option<Vec<String>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default, alias = "topK")]
    pub top_k: Option<usize>,
    #[serde(default, alias = "fetchK")]
    pub fetch_k: Option<usize>,
    #[serde(default = "default_debug")]
    pub debug: bool,
}

const fn default_debug() -> bool {
    true
}

impl AskParams {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            components: None,
            tags: None,
            top_k: None,
            fetch_k: None,
            debug: default_debug(),
        }
    }
}

/// Structured troubleshooting procedure produced by an answer generator.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct SopAnswer {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub possible_causes: Vec<String>,
    #[serde(default)]
    pub checks: Vec<String>,
    #[serde(default)]
    pub step_by_step_sop: Vec<String>,
    #[serde(default)]
    pub mitigations: Vec<String>,
    #[serde(default)]
    pub rollback_plan: Vec<String>,
    #[serde(default)]
    pub when_to_escalate: Vec<String>,
    #[serde(default)]
    pub references: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct SourceItem {
    pub identity: String,
    pub source_id: String,
    pub chunk_index: usize,
    pub component: String,
    pub tags: Vec<String>,
    pub title: String,
    pub snippet: String,
    pub relevance_score: i64,
    pub accepted: bool,
    pub rrf_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct FusedPreview {
    pub key: String,
    pub rrf: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct HitPreview {
    pub title: String,
    pub component: String,
}

impl From<&Chunk> for HitPreview {
    fn from(chunk: &Chunk) -> Self {
        Self {
            title: chunk.meta.title.clone(),
            component: chunk.meta.component.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RetrievalDebug {
    pub dense_n: usize,
    pub bm25_n: usize,
    pub rrf_c: f64,
    pub rrf_top: Vec<FusedPreview>,
    pub dense_preview: Vec<HitPreview>,
    pub bm25_preview: Vec<HitPreview>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct AskResult {
    pub answer_md: String,
    pub sop: SopAnswer,
    pub sources: Vec<SourceItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<RetrievalDebug>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct SchemaBundle {
    pub ask_params: Schema,
    pub ask_result: Schema,
    pub sop_answer: Schema,
}

pub fn schema_bundle() -> SchemaBundle {
    SchemaBundle {
        ask_params: schemars::schema_for!(AskParams),
        ask_result: schemars::schema_for!(AskResult),
        sop_answer: schemars::schema_for!(SopAnswer),
    }
}
