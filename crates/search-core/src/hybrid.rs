use std::sync::Arc;

use ahash::AHashMap;
use common::{Chunk, FusedPreview, HitPreview, RetrievalDebug};

use crate::{
    dense::{DenseFilter, DenseIndex},
    error::RetrievalError,
    filter::AttributeFilter,
    fusion::rrf_fuse,
    lexical::{Bm25Index, LexicalScorer},
    retrieval::RetrievalParams,
};

const PREVIEW_LEN: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct FusedChunk {
    pub key: String,
    pub chunk: Chunk,
    pub rrf_score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Retrieval {
    pub fused: Vec<FusedChunk>,
    pub debug: RetrievalDebug,
}

/// Runs dense and lexical search under one attribute filter and fuses the rankings with RRF.
pub struct HybridRetriever<D, L = Bm25Index> {
    dense: Arc<D>,
    lexical: Arc<L>,
    rrf_c: f64,
}

impl<D, L> Clone for HybridRetriever<D, L> {
    fn clone(&self) -> Self {
        Self {
            dense: Arc::clone(&self.dense),
            lexical: Arc::clone(&self.lexical),
            rrf_c: self.rrf_c,
        }
    }
}

impl<D: DenseIndex, L: LexicalScorer> HybridRetriever<D, L> {
    pub const fn new(dense: Arc<D>, lexical: Arc<L>, rrf_c: f64) -> Self {
        Self {
            dense,
            lexical,
            rrf_c,
        }
    }

    pub fn dense(&self) -> &Arc<D> {
        &self.dense
    }

    pub fn lexical(&self) -> &Arc<L> {
        &self.lexical
    }

    pub const fn rrf_c(&self) -> f64 {
        self.rrf_c
    }

    pub async fn retrieve(
        &self,
        query: &str,
        params: RetrievalParams,
        filter: &AttributeFilter,
    ) -> Result<Retrieval, RetrievalError> {
        if query.trim().is_empty() {
            return Ok(Retrieval {
                fused: Vec::new(),
                debug: RetrievalDebug {
                    rrf_c: self.rrf_c,
                    ..RetrievalDebug::default()
                },
            });
        }
        let top_k = params.top_k.max(1);
        let fetch_k = params.fetch_k.max(top_k);

        // Adapters may ignore the native filter, so the same rule is re-applied here.
        let dense_filter = DenseFilter::from_attributes(filter);
        let mut dense = self
            .dense
            .search(query, fetch_k, dense_filter.as_ref())
            .await?;
        dense.retain(|hit| filter.matches(&hit.chunk.meta));
        dense.truncate(top_k);

        let sparse = self.lexical.search(query, top_k, filter);

        let dense_keys = dense.iter().map(|h| h.chunk.fusion_key()).collect::<Vec<_>>();
        let sparse_keys = sparse
            .iter()
            .map(|h| h.chunk.fusion_key())
            .collect::<Vec<_>>();

        let mut by_key: AHashMap<&str, &Chunk> = AHashMap::new();
        for (key, hit) in dense_keys.iter().zip(&dense).chain(sparse_keys.iter().zip(&sparse)) {
            by_key.entry(key.as_str()).or_insert(&hit.chunk);
        }

        let mut fused = rrf_fuse(&dense_keys, &sparse_keys, self.rrf_c);
        fused.truncate(top_k);

        let fused = fused
            .into_iter()
            .filter_map(|scored| {
                let chunk = (*by_key.get(scored.id.as_str())?).clone();
                Some(FusedChunk {
                    key: scored.id,
                    chunk,
                    rrf_score: scored.score,
                })
            })
            .collect::<Vec<_>>();

        let debug = RetrievalDebug {
            dense_n: dense.len(),
            bm25_n: sparse.len(),
            rrf_c: self.rrf_c,
            rrf_top: fused
                .iter()
                .map(|f| FusedPreview {
                    key: f.key.clone(),
                    rrf: f.rrf_score,
                })
                .collect(),
            dense_preview: dense
                .iter()
                .take(PREVIEW_LEN)
                .map(|h| HitPreview::from(&h.chunk))
                .collect(),
            bm25_preview: sparse
                .iter()
                .take(PREVIEW_LEN)
                .map(|h| HitPreview::from(&h.chunk))
                .collect(),
        };
        let (dense_n, bm25_n) = (debug.dense_n, debug.bm25_n);
        tracing::debug!(
            dense_n,
            bm25_n,
            fused_n = fused.len(),
            top_k,
            fetch_k,
            "hybrid retrieval complete"
        );

        Ok(Retrieval { fused, debug })
    }
}
