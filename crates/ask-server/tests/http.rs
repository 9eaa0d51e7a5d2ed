use std::sync::Arc;

use ask_server::{app::router, services::answer::ExtractiveGenerator, state::AppState};
use axum::{
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use common::{AppConfig, AskResult, CacheBackend, Chunk, ChunkMeta, VectorBackend};
use embeddings::{Embedder, EmbeddingConfig, EmbeddingEngine};
use search_core::build_indexes;
use tempfile::TempDir;
use tower::util::ServiceExt;

fn chunk(id: &str, component: &str, tags: &[&str], title: &str, content: &str) -> Chunk {
    Chunk {
        content: content.to_string(),
        meta: ChunkMeta {
            source_id: id.to_string(),
            chunk_index: 0,
            component: component.to_string(),
            tags: tags.iter().map(|t| (*t).to_string()).collect(),
            relevance_score: 1,
            accepted: false,
            title: title.to_string(),
        },
    }
}

async fn state_with_index(api_token: Option<&str>) -> (AppState, TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = AppConfig {
        storage_dir: dir.path().display().to_string(),
        vector_backend: VectorBackend::Flat,
        ..AppConfig::default()
    };
    config.embedding.allow_pseudo = true;
    config.embedding.vector_dim = 64;
    config.cache.backend = CacheBackend::Memory;
    config.server.api_token = api_token.map(str::to_string);

    let embedder: Arc<dyn Embedder> =
        Arc::new(EmbeddingEngine::new(EmbeddingConfig::from(&config.embedding)));
    let chunks = vec![
        chunk("1", "spark", &["oom"], "Executor OOM", "executor outofmemory during shuffle"),
        chunk("2", "kafka", &["lag"], "Consumer lag", "consumer lag after rebalance"),
        chunk("3", "hive", &["metastore"], "Metastore timeout", "metastore socket timeout"),
    ];
    build_indexes(&config, embedder, chunks, 3)
        .await
        .expect("build indexes");

    let state = AppState::for_tests(config, Arc::new(ExtractiveGenerator)).expect("state");
    (state, dir)
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

async fn body_json(res: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(res.into_body(), usize::MAX).await.expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

#[tokio::test]
async fn health_reports_backend_and_chunk_count() {
    let (state, _dir) = state_with_index(None).await;
    let res = router(state)
        .oneshot(Request::builder().uri("/health").body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert_eq!(res.status(), StatusCode::OK);
    assert!(res.headers().contains_key("x-correlation-id"));
    let json = body_json(res).await;
    assert_eq!(json["ok"], true);
    assert_eq!(json["backend"], "flat");
    assert_eq!(json["chunks"], 3);
    assert!(json["collection"].is_null());
}

#[tokio::test]
async fn ask_returns_filtered_sources() {
    let (state, _dir) = state_with_index(None).await;
    let res = router(state)
        .oneshot(post_json(
            "/ask",
            r#"{"question":"metastore timeout","components":["hive"],"topK":3}"#,
        ))
        .await
        .expect("response");
    assert_eq!(res.status(), StatusCode::OK);

    let bytes = to_bytes(res.into_body(), usize::MAX).await.expect("body");
    let result: AskResult = serde_json::from_slice(&bytes).expect("ask result");
    assert_eq!(result.sources.len(), 1);
    assert_eq!(result.sources[0].title, "Metastore timeout");
    assert!(result.debug.is_some());
    assert!(result.answer_md.contains("### SOP"));
}

#[tokio::test]
async fn ask_without_debug_omits_the_field() {
    let (state, _dir) = state_with_index(None).await;
    let res = router(state)
        .oneshot(post_json("/ask", r#"{"question":"consumer lag","debug":false}"#))
        .await
        .expect("response");
    assert_eq!(res.status(), StatusCode::OK);
    let json = body_json(res).await;
    assert!(json.get("debug").is_none());
    assert!(json["sources"].is_array());
}

#[tokio::test]
async fn invalid_params_are_bad_requests() {
    let (state, _dir) = state_with_index(None).await;
    let app = router(state);

    let res = app
        .clone()
        .oneshot(post_json("/ask", r#"{"question":"lag","top_k":1000}"#))
        .await
        .expect("response");
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert!(body_json(res).await["error"].as_str().is_some_and(|e| e.contains("top_k")));

    let res = app
        .oneshot(post_json("/ask", r#"{"components":["spark"]}"#))
        .await
        .expect("response");
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn token_guards_ask_and_reload() {
    let (state, _dir) = state_with_index(Some("s3cret")).await;
    let app = router(state);

    let res = app
        .clone()
        .oneshot(post_json("/ask", r#"{"question":"lag"}"#))
        .await
        .expect("response");
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = app
        .clone()
        .oneshot(post_json("/admin/reload", ""))
        .await
        .expect("response");
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let mut req = post_json("/ask", r#"{"question":"lag"}"#);
    req.headers_mut()
        .insert("x-api-token", "s3cret".parse().expect("header"));
    let res = app.oneshot(req).await.expect("response");
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn reload_swaps_in_the_persisted_index() {
    let (state, _dir) = state_with_index(None).await;
    let res = router(state)
        .oneshot(post_json("/admin/reload", ""))
        .await
        .expect("response");
    assert_eq!(res.status(), StatusCode::OK);
    let json = body_json(res).await;
    assert_eq!(json["reloaded"], true);
    assert_eq!(json["documents"], 3);
}

async fn ask(app: &axum::Router, body: &str) -> AskResult {
    let res = app
        .clone()
        .oneshot(post_json("/ask", body))
        .await
        .expect("response");
    assert_eq!(res.status(), StatusCode::OK);
    let bytes = to_bytes(res.into_body(), usize::MAX).await.expect("body");
    serde_json::from_slice(&bytes).expect("ask result")
}

#[tokio::test]
async fn reload_after_rebuild_serves_only_the_new_corpus() {
    let (state, _dir) = state_with_index(None).await;
    let app = router(state.clone());
    let question = r#"{"question":"executor outofmemory","topK":5}"#;

    let before = ask(&app, question).await;
    assert!(before.sources.iter().any(|s| s.source_id == "1"));

    let rebuilt = vec![
        chunk("n1", "spark", &["oom"], "Driver OOM", "driver outofmemory on collect"),
        chunk("n2", "flink", &["checkpoint"], "Checkpoint timeout", "checkpoint timeout on large state"),
        chunk("n3", "yarn", &["queue"], "Queue full", "application pending in queue"),
    ];
    build_indexes(&state.config, Arc::clone(&state.embedder), rebuilt, 3)
        .await
        .expect("rebuild");

    let res = app
        .clone()
        .oneshot(post_json("/admin/reload", ""))
        .await
        .expect("response");
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_json(res).await["chunks"], 3);

    let after = ask(&app, question).await;
    assert!(!after.sources.is_empty());
    assert!(after.sources.iter().all(|s| s.source_id.starts_with('n')));
    let debug = after.debug.expect("debug");
    let old_titles = ["Executor OOM", "Consumer lag", "Metastore timeout"];
    assert!(
        debug
            .dense_preview
            .iter()
            .chain(&debug.bm25_preview)
            .all(|p| !old_titles.contains(&p.title.as_str()))
    );
}

#[tokio::test]
async fn schemas_and_metrics_are_served() {
    let (state, _dir) = state_with_index(None).await;
    let app = router(state);

    let res = app
        .clone()
        .oneshot(Request::builder().uri("/schemas").body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert_eq!(res.status(), StatusCode::OK);
    let json = body_json(res).await;
    assert!(json["ask_params"]["properties"]["question"].is_object());

    let res = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert_eq!(res.status(), StatusCode::OK);
}
