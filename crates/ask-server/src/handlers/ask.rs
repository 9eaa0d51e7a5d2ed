use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use common::AskParams;
use serde_json::json;

use crate::{handlers::auth::is_authorized, services::ask::AskError, state::AppState};

pub async fn ask_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<AskParams>, JsonRejection>,
) -> Response {
    if !is_authorized(&headers, &state) {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    let Json(params) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return error_response(StatusCode::BAD_REQUEST, &rejection.body_text());
        }
    };
    match state.ask.ask(params).await {
        Ok(result) => Json(result).into_response(),
        Err(err) => err.into_response(),
    }
}

impl IntoResponse for AskError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::InvalidParams(_) => StatusCode::BAD_REQUEST,
            Self::Retrieval(_) | Self::Generation(_) => StatusCode::BAD_GATEWAY,
            Self::Reload(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error_response(status, &self.to_string())
    }
}

pub fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
