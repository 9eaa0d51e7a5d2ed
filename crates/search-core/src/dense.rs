use std::{fs, future::Future, path::Path, sync::Arc};

use common::{Chunk, ScoredChunk};
use embeddings::{Embedder, l2_normalize};
use serde::{Deserialize, Serialize};

use crate::{
    error::{IndexError, RetrievalError},
    filter::AttributeFilter,
    storage::write_atomic,
    vector::QdrantDenseIndex,
};

pub const FLAT_FORMAT: &str = "sop-rag/flat-dense";
pub const FLAT_VERSION: u32 = 1;

/// Component restriction an adapter may apply natively, before truncation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DenseFilter {
    pub components: Vec<String>,
}

impl DenseFilter {
    pub fn from_attributes(filter: &AttributeFilter) -> Option<Self> {
        (!filter.components().is_empty()).then(|| Self {
            components: filter.components().to_vec(),
        })
    }
}

/// Similarity search over embedded chunks.
///
/// Results come back best first. Scores are only comparable within one adapter.
pub trait DenseIndex: Send + Sync {
    fn search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&DenseFilter>,
    ) -> impl Future<Output = Result<Vec<ScoredChunk>, RetrievalError>> + Send;
}

/// Brute-force cosine index kept in memory and persisted as one JSON document.
pub struct FlatDenseIndex {
    embedder: Arc<dyn Embedder>,
    entries: Vec<FlatEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FlatEntry {
    chunk: Chunk,
    vector: Vec<f32>,
}

#[derive(Serialize)]
struct FlatDocumentRef<'a> {
    format: &'static str,
    version: u32,
    embedder_id: String,
    dim: usize,
    entries: &'a [FlatEntry],
}

#[derive(Deserialize)]
struct FlatDocument {
    format: String,
    version: u32,
    embedder_id: String,
    dim: usize,
    entries: Vec<FlatEntry>,
}

impl FlatDenseIndex {
    pub fn build(chunks: Vec<Chunk>, embedder: Arc<dyn Embedder>) -> Result<Self, IndexError> {
        let texts = chunks.iter().map(|c| c.content.clone()).collect::<Vec<_>>();
        let vectors = embedder
            .embed_batch(&texts)
            .map_err(|err| IndexError::Embedding(err.into()))?;
        if vectors.len() != chunks.len() {
            return Err(IndexError::Corrupt(format!(
                "embedder returned {} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            )));
        }
        let entries = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, mut vector)| {
                l2_normalize(&mut vector);
                FlatEntry { chunk, vector }
            })
            .collect::<Vec<_>>();
        tracing::debug!(chunks = entries.len(), embedder = %embedder.embedder_id(), "built flat dense index");
        Ok(Self { embedder, entries })
    }

    pub fn save(&self, path: &Path) -> Result<(), IndexError> {
        let doc = FlatDocumentRef {
            format: FLAT_FORMAT,
            version: FLAT_VERSION,
            embedder_id: self.embedder.embedder_id(),
            dim: self.embedder.dim(),
            entries: &self.entries,
        };
        let bytes = serde_json::to_vec(&doc).map_err(IndexError::Encode)?;
        write_atomic(path, &bytes)
    }

    pub fn load(path: &Path, embedder: Arc<dyn Embedder>) -> Result<Self, IndexError> {
        let raw = fs::read_to_string(path).map_err(|source| IndexError::io(path, source))?;
        let doc = serde_json::from_str::<FlatDocument>(&raw).map_err(|source| IndexError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
        if doc.format != FLAT_FORMAT {
            return Err(IndexError::Format {
                expected: FLAT_FORMAT,
                found: doc.format,
            });
        }
        if doc.version != FLAT_VERSION {
            return Err(IndexError::Version {
                found: doc.version,
                supported: FLAT_VERSION,
            });
        }
        let expected = embedder.embedder_id();
        if doc.embedder_id != expected || doc.dim != embedder.dim() {
            return Err(IndexError::Embedder {
                expected,
                found: doc.embedder_id,
            });
        }
        if let Some(bad) = doc.entries.iter().find(|e| e.vector.len() != doc.dim) {
            return Err(IndexError::Corrupt(format!(
                "vector for {} has {} dimensions, expected {}",
                bad.chunk.fusion_key(),
                bad.vector.len(),
                doc.dim
            )));
        }
        tracing::info!(path = %path.display(), chunks = doc.entries.len(), "loaded flat dense index");
        Ok(Self {
            embedder,
            entries: doc.entries,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn search_sync(
        &self,
        query: &str,
        k: usize,
        filter: Option<&DenseFilter>,
    ) -> Result<Vec<ScoredChunk>, RetrievalError> {
        if k == 0 || self.entries.is_empty() {
            return Ok(Vec::new());
        }
        let mut q = self
            .embedder
            .embed_query(query)
            .map_err(|err| RetrievalError::Embedding(err.into()))?;
        l2_normalize(&mut q);

        let allowed = |chunk: &Chunk| {
            filter.is_none_or(|f| {
                f.components
                    .contains(&chunk.meta.component.trim().to_lowercase())
            })
        };
        let mut scored = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| allowed(&e.chunk))
            .map(|(pos, e)| (pos, dot(&q, &e.vector)))
            .collect::<Vec<_>>();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(pos, score)| ScoredChunk {
                chunk: self.entries[pos].chunk.clone(),
                score: f64::from(score),
            })
            .collect())
    }
}

impl DenseIndex for FlatDenseIndex {
    async fn search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&DenseFilter>,
    ) -> Result<Vec<ScoredChunk>, RetrievalError> {
        self.search_sync(query, k, filter)
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Dense backend chosen by configuration.
pub enum DenseEngine {
    Flat(FlatDenseIndex),
    Qdrant(QdrantDenseIndex),
}

impl DenseEngine {
    pub const fn backend_name(&self) -> &'static str {
        match self {
            Self::Flat(_) => "flat",
            Self::Qdrant(_) => "qdrant",
        }
    }
}

impl DenseIndex for DenseEngine {
    async fn search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&DenseFilter>,
    ) -> Result<Vec<ScoredChunk>, RetrievalError> {
        match self {
            Self::Flat(index) => index.search(query, k, filter).await,
            Self::Qdrant(index) => index.search(query, k, filter).await,
        }
    }
}
