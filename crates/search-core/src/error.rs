use std::path::PathBuf;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failures while building, persisting or loading an index.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("io error on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed decoding {}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed encoding index")]
    Encode(#[source] serde_json::Error),
    #[error("unexpected index format `{found}`, expected `{expected}`")]
    Format {
        expected: &'static str,
        found: String,
    },
    #[error("unsupported index version {found}, this build reads version {supported}")]
    Version { found: u32, supported: u32 },
    #[error("index was built with tokenizer `{found}`, this build uses `{expected}`")]
    Tokenizer {
        expected: &'static str,
        found: String,
    },
    #[error("index was built with embedder `{found}`, configured embedder is `{expected}`")]
    Embedder { expected: String, found: String },
    #[error("index is corrupt: {0}")]
    Corrupt(String),
    #[error("invalid record at {}:{line}", path.display())]
    Record {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("embedding failed during index build")]
    Embedding(#[source] BoxError),
    #[error("vector backend error")]
    Backend(#[source] BoxError),
}

/// Failures while serving a retrieval request.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("query embedding failed")]
    Embedding(#[source] BoxError),
    #[error("dense search failed")]
    Dense(#[source] BoxError),
}

impl IndexError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
