use axum::http::HeaderMap;

use crate::state::AppState;

pub const API_TOKEN_HEADER: &str = "x-api-token";

pub fn is_authorized(headers: &HeaderMap, state: &AppState) -> bool {
    match &state.api_token {
        None => true,
        Some(expected) => headers
            .get(API_TOKEN_HEADER)
            .and_then(|h| h.to_str().ok())
            .is_some_and(|token| token == expected),
    }
}
