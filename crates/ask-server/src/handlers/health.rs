use axum::{Json, extract::State};
use common::VectorBackend;
use search_core::LexicalScorer;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub backend: &'static str,
    pub collection: Option<String>,
    pub chunks: usize,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let retriever = state.ask.retriever().await;
    let collection = (state.config.vector_backend == VectorBackend::Qdrant)
        .then(|| state.config.qdrant.collection.clone());
    Json(HealthResponse {
        ok: true,
        backend: retriever.dense().backend_name(),
        collection,
        chunks: retriever.lexical().len(),
    })
}
