use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;
use crate::mcp::{CallerContext, McpHandler, Reply, SESSION_HEADER};
use crate::state::AppState;

// JSON-RPC errors still travel with HTTP 200
pub async fn mcp_handler(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    let caller = CallerContext::from_headers(&headers);
    let request = match McpHandler::parse(&body) {
        Ok(request) => request,
        Err(error) => return Json(error).into_response(),
    };

    match state.mcp.handle(caller, request).await {
        Reply::Accepted => StatusCode::ACCEPTED.into_response(),
        Reply::Response { session, body } => {
            let mut response = Json(body).into_response();
            if let Some(value) = session.and_then(|s| HeaderValue::from_str(&s).ok()) {
                response.headers_mut().insert(SESSION_HEADER, value);
            }
            response
        }
    }
}

pub async fn mcp_close_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> StatusCode {
    match CallerContext::from_headers(&headers).session_id {
        Some(session) if state.mcp.close_session(&session) => StatusCode::NO_CONTENT,
        Some(_) => StatusCode::NOT_FOUND,
        None => StatusCode::BAD_REQUEST,
    }
}
