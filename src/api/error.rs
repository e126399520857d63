use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Any failure in the template/tokenize/generate/decode chain. All causes
/// collapse to one HTTP 500 with the error message as detail.
pub struct GenerationFailure(anyhow::Error);

impl IntoResponse for GenerationFailure {
    fn into_response(self) -> Response {
        tracing::error!(error = %self.0, "generation failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": self.0.to_string() })),
        )
            .into_response()
    }
}

impl<E> From<E> for GenerationFailure
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
