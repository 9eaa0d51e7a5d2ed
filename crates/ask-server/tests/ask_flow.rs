use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use ask_server::services::{
    answer::ExtractiveGenerator,
    ask::{AskError, AskService},
    cache::{ManualClock, MemoryCacheStore, QueryCache},
};
use common::{AskParams, Chunk, ChunkMeta, ScoredChunk};
use search_core::{
    Bm25Index, Bm25Params, DenseFilter, DenseIndex, HybridRetriever, RetrievalDefaults,
    RetrievalError,
};

struct CountingDense {
    hits: Vec<Chunk>,
    calls: AtomicUsize,
    fail: AtomicBool,
}

impl DenseIndex for CountingDense {
    async fn search(
        &self,
        _query: &str,
        k: usize,
        _filter: Option<&DenseFilter>,
    ) -> Result<Vec<ScoredChunk>, RetrievalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(RetrievalError::Dense("qdrant unreachable".into()));
        }
        Ok(self
            .hits
            .iter()
            .take(k)
            .cloned()
            .map(|chunk| ScoredChunk { chunk, score: 0.5 })
            .collect())
    }
}

fn chunk(id: &str, index: usize, component: &str, tags: &[&str], content: &str) -> Chunk {
    Chunk {
        content: content.to_string(),
        meta: ChunkMeta {
            source_id: id.to_string(),
            chunk_index: index,
            component: component.to_string(),
            tags: tags.iter().map(|t| (*t).to_string()).collect(),
            relevance_score: 2,
            accepted: true,
            title: format!("{id}/{index} {component}"),
        },
    }
}

fn corpus() -> Vec<Chunk> {
    vec![
        chunk("q1", 0, "spark", &["oom"], "executor outofmemory during shuffle stage"),
        chunk("q2", 0, "kafka", &["lag"], "broker outofmemory heap consumer lag"),
        chunk("q1", 1, "spark", &["driver"], "driver outofmemory outofmemory collect large result"),
    ]
}

struct Harness {
    service: AskService<CountingDense>,
    dense: Arc<CountingDense>,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn with_index_id(self, index_id: &str) -> Self {
        Self {
            service: self.service.with_index_id(index_id),
            ..self
        }
    }
}

fn harness(dense_hits: Vec<Chunk>) -> Harness {
    let dense = Arc::new(CountingDense {
        hits: dense_hits,
        calls: AtomicUsize::new(0),
        fail: AtomicBool::new(false),
    });
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let cache = QueryCache::new(
        Arc::new(MemoryCacheStore::new(16)),
        clock.clone(),
        Duration::from_secs(3_600),
    );
    let retriever = HybridRetriever::new(
        Arc::clone(&dense),
        Arc::new(Bm25Index::build(corpus(), Bm25Params::default())),
        60.0,
    );
    Harness {
        service: AskService::new(
            retriever,
            RetrievalDefaults::default(),
            cache,
            Arc::new(ExtractiveGenerator),
        ),
        dense,
        clock,
    }
}

fn spark_question() -> AskParams {
    AskParams {
        components: Some(vec!["spark".to_string()]),
        top_k: Some(2),
        ..AskParams::new("outofmemory")
    }
}

#[tokio::test]
async fn component_filter_keeps_only_spark_chunks_ranked_by_bm25() {
    let h = harness(Vec::new());
    let result = h.service.ask(spark_question()).await.expect("ask");

    let ids = result
        .sources
        .iter()
        .map(|s| (s.source_id.as_str(), s.chunk_index))
        .collect::<Vec<_>>();
    assert_eq!(ids, vec![("q1", 1), ("q1", 0)]);
    assert!(result.sources.iter().all(|s| s.component == "spark"));
    assert!(result.answer_md.starts_with("### Summary\n"));
    let debug = result.debug.expect("debug requested by default");
    assert_eq!(debug.dense_n, 0);
    assert_eq!(debug.bm25_n, 2);
}

#[tokio::test]
async fn identical_asks_within_ttl_are_byte_identical_and_skip_retrieval() {
    let h = harness(corpus());
    let first = h.service.ask(spark_question()).await.expect("first");
    let second = h
        .service
        .ask(AskParams {
            question: "  outofmemory  ".to_string(),
            ..spark_question()
        })
        .await
        .expect("second");

    assert_eq!(h.dense.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        serde_json::to_vec(&first).expect("encode"),
        serde_json::to_vec(&second).expect("encode")
    );
}

#[tokio::test]
async fn expired_entries_trigger_fresh_retrieval() {
    let h = harness(corpus());
    h.service.ask(spark_question()).await.expect("first");
    h.clock.advance(Duration::from_secs(3_600));
    h.service.ask(spark_question()).await.expect("second");
    assert_eq!(h.dense.calls.load(Ordering::SeqCst), 2);

    h.service.ask(spark_question()).await.expect("third");
    assert_eq!(h.dense.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn debug_is_stripped_on_return_but_kept_in_cache() {
    let h = harness(corpus());
    let quiet = h
        .service
        .ask(AskParams {
            debug: false,
            ..spark_question()
        })
        .await
        .expect("quiet");
    assert!(quiet.debug.is_none());

    let verbose = h.service.ask(spark_question()).await.expect("verbose");
    assert_eq!(h.dense.calls.load(Ordering::SeqCst), 1);
    assert!(verbose.debug.is_some());
    assert_eq!(verbose.sources, quiet.sources);
}

#[tokio::test]
async fn dense_failure_surfaces_and_is_not_cached() {
    let h = harness(corpus());
    h.dense.fail.store(true, Ordering::SeqCst);
    let err = h.service.ask(spark_question()).await.expect_err("dense down");
    assert!(matches!(err, AskError::Retrieval(RetrievalError::Dense(_))));

    h.dense.fail.store(false, Ordering::SeqCst);
    let ok = h.service.ask(spark_question()).await.expect("recovered");
    assert!(!ok.sources.is_empty());
    assert_eq!(h.dense.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn oversized_top_k_is_rejected() {
    let h = harness(corpus());
    let err = h
        .service
        .ask(AskParams {
            top_k: Some(500),
            ..AskParams::new("outofmemory")
        })
        .await
        .expect_err("too large");
    assert!(matches!(err, AskError::InvalidParams(_)));
    assert_eq!(h.dense.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn blank_question_returns_empty_result_without_searching() {
    let h = harness(corpus());
    let result = h.service.ask(AskParams::new(" \n\t ")).await.expect("blank");
    assert!(result.sources.is_empty());
    assert!(!result.sop.summary.is_empty());
    assert_eq!(h.dense.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn swapped_index_replaces_both_sides_and_bypasses_old_answers() {
    let h = harness(corpus()).with_index_id("build-1");
    let stale = h.service.ask(AskParams::new("outofmemory")).await.expect("before swap");
    assert!(stale.sources.iter().any(|s| s.source_id == "q1"));
    let before = h.service.retriever().await;

    let fresh = vec![
        chunk("q9", 0, "hive", &["metastore"], "metastore outofmemory socket timeout"),
        chunk("q7", 0, "hdfs", &["safemode"], "namenode stuck in safemode"),
        chunk("q8", 0, "yarn", &["queue"], "application pending in queue"),
    ];
    let next_dense = Arc::new(CountingDense {
        hits: fresh.clone(),
        calls: AtomicUsize::new(0),
        fail: AtomicBool::new(false),
    });
    h.service
        .swap_index(
            HybridRetriever::new(
                Arc::clone(&next_dense),
                Arc::new(Bm25Index::build(fresh, Bm25Params::default())),
                60.0,
            ),
            "build-2",
        )
        .await;

    let result = h
        .service
        .ask(AskParams::new("outofmemory"))
        .await
        .expect("after swap");
    assert_eq!(next_dense.calls.load(Ordering::SeqCst), 1);
    assert!(!result.sources.is_empty());
    assert!(
        result
            .sources
            .iter()
            .all(|s| ["q7", "q8", "q9"].contains(&s.source_id.as_str()))
    );
    assert_eq!(result.sources[0].source_id, "q9");
    assert_eq!(&*h.service.index_id().await, "build-2");
    assert_eq!(before.lexical().chunks().len(), 3);
    assert_eq!(before.lexical().chunks()[0].meta.source_id, "q1");
}
