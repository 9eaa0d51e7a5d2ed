use std::{sync::Arc, time::Instant};

use common::{AskParams, AskResult, SopAnswer, SourceItem};
use search_core::{
    AttributeFilter, Bm25Index, DenseIndex, FusedChunk, HybridRetriever, IndexError,
    LexicalScorer, RetrievalDefaults, RetrievalError, RetrievalParams,
};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::services::{
    answer::{AnswerGenerator, GenerationError, render_answer_markdown},
    cache::{QueryCache, cache_key, normalize_query},
};

pub const MAX_TOP_K: usize = 100;
pub const MAX_FETCH_K: usize = 1_000;

#[derive(Debug, Error)]
pub enum AskError {
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("retrieval failed: {0}")]
    Retrieval(#[from] RetrievalError),
    #[error("answer generation failed: {0}")]
    Generation(#[from] GenerationError),
    #[error("index reload failed: {0}")]
    Reload(#[from] IndexError),
}

/// Cache, retrieval and answer generation for one question.
///
/// The live index sits behind a lock only so it can be swapped; requests clone what they
/// need and run without holding the lock.
pub struct AskService<D, L = Bm25Index> {
    live: RwLock<LiveIndex<D, L>>,
    defaults: RetrievalDefaults,
    cache: QueryCache,
    generator: Arc<dyn AnswerGenerator>,
}

/// A retriever and the id of the build it was opened from. Swapped as one unit, so the
/// cache key always names the index that produced the cached answer.
struct LiveIndex<D, L> {
    retriever: Arc<HybridRetriever<D, L>>,
    index_id: Arc<str>,
}

impl<D: DenseIndex, L: LexicalScorer> AskService<D, L> {
    pub fn new(
        retriever: HybridRetriever<D, L>,
        defaults: RetrievalDefaults,
        cache: QueryCache,
        generator: Arc<dyn AnswerGenerator>,
    ) -> Self {
        Self {
            live: RwLock::new(LiveIndex {
                retriever: Arc::new(retriever),
                index_id: Arc::from(""),
            }),
            defaults,
            cache,
            generator,
        }
    }

    /// Tags the initial retriever with the id of the build it came from.
    #[must_use]
    pub fn with_index_id(mut self, index_id: &str) -> Self {
        self.live.get_mut().index_id = Arc::from(index_id);
        self
    }

    pub async fn retriever(&self) -> Arc<HybridRetriever<D, L>> {
        Arc::clone(&self.live.read().await.retriever)
    }

    pub async fn index_id(&self) -> Arc<str> {
        Arc::clone(&self.live.read().await.index_id)
    }

    pub const fn defaults(&self) -> &RetrievalDefaults {
        &self.defaults
    }

    /// Replaces the dense and lexical sides together. In-flight requests finish on the old
    /// retriever; cached answers of another build stop matching because the id is part of
    /// the cache key.
    pub async fn swap_index(&self, retriever: HybridRetriever<D, L>, index_id: &str) {
        let mut guard = self.live.write().await;
        *guard = LiveIndex {
            retriever: Arc::new(retriever),
            index_id: Arc::from(index_id),
        };
        info!(index_id, "retriever swapped");
    }

    pub async fn ask(&self, params: AskParams) -> Result<AskResult, AskError> {
        let started = Instant::now();
        metrics::counter!("ask_requests_total").increment(1);
        let outcome = self.ask_inner(params).await;
        metrics::histogram!("ask_latency_ms").record(started.elapsed().as_secs_f64() * 1_000.0);
        if let Err(err) = &outcome {
            metrics::counter!("ask_failures_total").increment(1);
            warn!(error = %err, "ask failed");
        }
        outcome
    }

    async fn ask_inner(&self, params: AskParams) -> Result<AskResult, AskError> {
        validate(&params)?;
        let question = normalize_query(&params.question);
        let want_debug = params.debug;
        if question.is_empty() {
            return Ok(blank_result(self.defaults.rrf_c, want_debug));
        }

        let filter = AttributeFilter::new(params.components.as_deref(), params.tags.as_deref());
        let sizes = RetrievalParams::resolve(&self.defaults, params.top_k, params.fetch_k);
        let (retriever, index_id) = {
            let live = self.live.read().await;
            (Arc::clone(&live.retriever), Arc::clone(&live.index_id))
        };
        let key = cache_key(&question, &filter, sizes, &index_id);

        if let Some(hit) = self.cache.get(&key) {
            metrics::counter!("ask_cache_hits_total").increment(1);
            info!(key = %key, "ask served from cache");
            return Ok(present(hit, want_debug));
        }
        metrics::counter!("ask_cache_misses_total").increment(1);

        let retrieval = retriever.retrieve(&question, sizes, &filter).await?;
        let sop = self.generator.generate(&question, &retrieval.fused).await?;

        let bundle = AskResult {
            answer_md: render_answer_markdown(&sop),
            sources: retrieval.fused.iter().map(source_item).collect(),
            sop,
            debug: Some(retrieval.debug),
        };
        self.cache.put(&key, &bundle);
        info!(
            key = %key,
            sources = bundle.sources.len(),
            generator = self.generator.name(),
            top_k = sizes.top_k,
            fetch_k = sizes.fetch_k,
            "ask answered"
        );
        Ok(present(bundle, want_debug))
    }
}

fn validate(params: &AskParams) -> Result<(), AskError> {
    if let Some(top_k) = params.top_k.filter(|k| *k > MAX_TOP_K) {
        return Err(AskError::InvalidParams(format!(
            "top_k {top_k} exceeds the maximum of {MAX_TOP_K}"
        )));
    }
    if let Some(fetch_k) = params.fetch_k.filter(|k| *k > MAX_FETCH_K) {
        return Err(AskError::InvalidParams(format!(
            "fetch_k {fetch_k} exceeds the maximum of {MAX_FETCH_K}"
        )));
    }
    Ok(())
}

/// The cache always holds the debug record; it is dropped here when not requested.
fn present(mut bundle: AskResult, want_debug: bool) -> AskResult {
    if !want_debug {
        bundle.debug = None;
    }
    bundle
}

fn blank_result(rrf_c: f64, want_debug: bool) -> AskResult {
    let sop = SopAnswer {
        summary: "The question is empty. Describe the failing component and the observed error."
            .to_string(),
        ..SopAnswer::default()
    };
    AskResult {
        answer_md: render_answer_markdown(&sop),
        sop,
        sources: Vec::new(),
        debug: want_debug.then(|| common::RetrievalDebug {
            rrf_c,
            ..common::RetrievalDebug::default()
        }),
    }
}

fn source_item(fused: &FusedChunk) -> SourceItem {
    let meta = &fused.chunk.meta;
    SourceItem {
        identity: fused.key.clone(),
        source_id: meta.source_id.clone(),
        chunk_index: meta.chunk_index,
        component: meta.component.clone(),
        tags: meta.tags.clone(),
        title: meta.title.clone(),
        snippet: fused.chunk.snippet(),
        relevance_score: meta.relevance_score,
        accepted: meta.accepted,
        rrf_score: fused.rrf_score,
    }
}
