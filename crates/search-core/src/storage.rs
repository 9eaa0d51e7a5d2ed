use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use common::{AppConfig, Chunk, VectorBackend};
use embeddings::Embedder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    dense::{DenseEngine, FlatDenseIndex},
    error::IndexError,
    hybrid::HybridRetriever,
    lexical::{Bm25Index, Bm25Params},
    vector::{QdrantDenseIndex, VectorSearchConfig},
};

/// File layout of a built index under the storage directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    root: PathBuf,
}

impl StoragePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bm25(&self) -> PathBuf {
        self.root.join("bm25.json")
    }

    pub fn dense(&self) -> PathBuf {
        self.root.join("dense.json")
    }

    pub fn meta(&self) -> PathBuf {
        self.root.join("meta.json")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexMeta {
    pub backend: VectorBackend,
    pub n_records: usize,
    pub n_chunks: usize,
    pub embedder_id: String,
    /// Content hash of the lexical index and the embedder that built the dense side.
    /// Equal corpora built with the same embedder share an id.
    #[serde(default)]
    pub index_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    pub built_at_unix: u64,
}

impl IndexMeta {
    pub fn write(&self, path: &Path) -> Result<(), IndexError> {
        let bytes = serde_json::to_vec_pretty(self).map_err(IndexError::Encode)?;
        write_atomic(path, &bytes)
    }

    pub fn read(path: &Path) -> Result<Self, IndexError> {
        let raw = fs::read_to_string(path).map_err(|source| IndexError::io(path, source))?;
        serde_json::from_str(&raw).map_err(|source| IndexError::Decode {
            path: path.to_path_buf(),
            source,
        })
    }
}

pub fn bm25_params(config: &AppConfig) -> Bm25Params {
    Bm25Params {
        k1: config.retrieval.bm25_k1,
        b: config.retrieval.bm25_b,
        ..Bm25Params::default()
    }
}

/// Builds and persists the lexical index, the dense index and `meta.json`.
pub async fn build_indexes(
    config: &AppConfig,
    embedder: Arc<dyn Embedder>,
    chunks: Vec<Chunk>,
    n_records: usize,
) -> Result<IndexMeta, IndexError> {
    let paths = StoragePaths::new(&config.storage_dir);
    fs::create_dir_all(paths.root()).map_err(|source| IndexError::io(paths.root(), source))?;

    let n_chunks = chunks.len();
    let lexical = Bm25Index::build(chunks.clone(), bm25_params(config));
    lexical.save(&paths.bm25())?;

    let collection = match config.vector_backend {
        VectorBackend::Flat => {
            let dense = FlatDenseIndex::build(chunks, Arc::clone(&embedder))?;
            dense.save(&paths.dense())?;
            None
        }
        VectorBackend::Qdrant => {
            let index = connect_qdrant(config, Arc::clone(&embedder))?;
            index.recreate_collection().await?;
            index.upsert_chunks(&chunks).await?;
            Some(index.collection().to_string())
        }
    };

    let bm25_bytes = fs::read(paths.bm25()).map_err(|source| IndexError::io(paths.bm25(), source))?;
    let embedder_id = embedder.embedder_id();
    let meta = IndexMeta {
        backend: config.vector_backend,
        n_records,
        n_chunks,
        index_id: index_id(&embedder_id, &bm25_bytes),
        embedder_id,
        collection,
        built_at_unix: unix_now(),
    };
    meta.write(&paths.meta())?;
    tracing::info!(
        storage = %paths.root().display(),
        backend = %meta.backend,
        chunks = n_chunks,
        "index build complete"
    );
    Ok(meta)
}

/// Hex sha256 over the embedder id and the persisted lexical document.
pub fn index_id(embedder_id: &str, bm25_document: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(embedder_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(bm25_document);
    format!("{:x}", hasher.finalize())
}

pub fn read_meta(config: &AppConfig) -> Result<IndexMeta, IndexError> {
    IndexMeta::read(&StoragePaths::new(&config.storage_dir).meta())
}

pub fn open_lexical(config: &AppConfig) -> Result<Bm25Index, IndexError> {
    Bm25Index::load(&StoragePaths::new(&config.storage_dir).bm25())
}

pub fn open_dense(
    config: &AppConfig,
    embedder: Arc<dyn Embedder>,
) -> Result<DenseEngine, IndexError> {
    match config.vector_backend {
        VectorBackend::Flat => {
            let path = StoragePaths::new(&config.storage_dir).dense();
            Ok(DenseEngine::Flat(FlatDenseIndex::load(&path, embedder)?))
        }
        VectorBackend::Qdrant => Ok(DenseEngine::Qdrant(connect_qdrant(config, embedder)?)),
    }
}

/// Loads both persisted indexes. A missing or corrupt file is an error, never an empty index.
pub fn open_retriever(
    config: &AppConfig,
    embedder: Arc<dyn Embedder>,
) -> Result<HybridRetriever<DenseEngine>, IndexError> {
    let lexical = open_lexical(config)?;
    let dense = open_dense(config, embedder)?;
    Ok(HybridRetriever::new(
        Arc::new(dense),
        Arc::new(lexical),
        config.retrieval.rrf_c,
    ))
}

fn connect_qdrant(
    config: &AppConfig,
    embedder: Arc<dyn Embedder>,
) -> Result<QdrantDenseIndex, IndexError> {
    let vector_config = VectorSearchConfig::from_settings(&config.qdrant, embedder.dim());
    QdrantDenseIndex::connect(&config.qdrant.url, vector_config, embedder)
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), IndexError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| IndexError::io(parent, source))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes).map_err(|source| IndexError::io(&tmp, source))?;
    fs::rename(&tmp, path).map_err(|source| IndexError::io(path, source))
}

fn unix_now() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs(),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use common::VectorBackend;

    use super::{IndexMeta, StoragePaths, index_id, write_atomic};

    #[test]
    fn paths_live_under_root() {
        let paths = StoragePaths::new("/srv/sop");
        assert!(paths.bm25().ends_with("bm25.json"));
        assert!(paths.dense().starts_with("/srv/sop"));
    }

    #[test]
    fn meta_round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("meta.json");
        let meta = IndexMeta {
            backend: VectorBackend::Flat,
            n_records: 2,
            n_chunks: 3,
            embedder_id: "pseudo-hash/8".to_string(),
            index_id: "abc".to_string(),
            collection: None,
            built_at_unix: 1,
        };
        meta.write(&path).expect("write");
        assert_eq!(IndexMeta::read(&path).expect("read"), meta);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn index_id_tracks_document_and_embedder() {
        let a = index_id("pseudo-hash/8", b"{\"chunks\":[1]}");
        assert_eq!(a, index_id("pseudo-hash/8", b"{\"chunks\":[1]}"));
        assert_ne!(a, index_id("pseudo-hash/8", b"{\"chunks\":[2]}"));
        assert_ne!(a, index_id("onnx/768", b"{\"chunks\":[1]}"));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn meta_without_index_id_still_reads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("meta.json");
        std::fs::write(
            &path,
            r#"{"backend":"flat","n_records":1,"n_chunks":1,"embedder_id":"e","built_at_unix":0}"#,
        )
        .expect("write");
        assert_eq!(IndexMeta::read(&path).expect("read").index_id, "");
    }

    #[test]
    fn atomic_write_replaces_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("x.json");
        write_atomic(&path, b"old").expect("first");
        write_atomic(&path, b"new").expect("second");
        assert_eq!(std::fs::read(&path).expect("read"), b"new");
    }
}
