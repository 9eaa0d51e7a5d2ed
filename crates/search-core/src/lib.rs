pub mod corpus;
pub mod dense;
pub mod error;
pub mod filter;
pub mod fusion;
pub mod hybrid;
pub mod lexical;
pub mod retrieval;
pub mod storage;
pub mod tokenize;
pub mod vector;

pub use corpus::{ChunkingConfig, SourceRecord, read_jsonl, records_to_chunks};
pub use dense::{DenseEngine, DenseFilter, DenseIndex, FlatDenseIndex};
pub use error::{IndexError, RetrievalError};
pub use filter::AttributeFilter;
pub use fusion::{ScoredId, rrf_fuse};
pub use hybrid::{FusedChunk, HybridRetriever, Retrieval};
pub use lexical::{Bm25Index, Bm25Params, LexicalScorer, LexicalStats};
pub use retrieval::{RetrievalDefaults, RetrievalParams};
pub use storage::{IndexMeta, StoragePaths, build_indexes, open_retriever, read_meta};
pub use tokenize::{DefaultTokenizer, TextTokenizer};
pub use vector::{QdrantDenseIndex, VectorSearchConfig};
