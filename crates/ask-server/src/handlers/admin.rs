use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::{handlers::auth::is_authorized, state::AppState};

/// Reopens the lexical and dense indexes from the storage directory and swaps them into the
/// live retriever together.
pub async fn reload_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !is_authorized(&headers, &state) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    match state.reload_indexes().await {
        Ok(summary) => Json(json!({
            "reloaded": true,
            "index_id": summary.index_id,
            "chunks": summary.n_chunks,
            "documents": summary.lexical.documents,
            "vocabulary": summary.lexical.vocabulary,
        }))
        .into_response(),
        Err(err) => err.into_response(),
    }
}
