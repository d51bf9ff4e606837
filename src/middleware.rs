use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::debug;

use crate::database::AppState;

/// Middleware to check for Authorization header
///
/// When an API key is configured (`AUTHORIZATION`), the request must carry an
/// `Authorization` header with exactly that value. Without a configured key
/// the check is skipped.
pub async fn auth_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    if let Some(api_key) = state.config.api_key.as_deref() {
        let provided = headers
            .get("Authorization")
            .and_then(|value| value.to_str().ok());

        if provided != Some(api_key) {
            debug!(path = %request.uri().path(), "rejected unauthorized request");
            return Err((
                StatusCode::UNAUTHORIZED,
                Json(json!({
                    "error": "Unauthorized",
                    "message": "Invalid or missing authorization header"
                })),
            )
                .into_response());
        }
    }

    Ok(next.run(request).await)
}
