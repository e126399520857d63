use axum::{extract::State, Json};
use tracing::debug;

use crate::api::error::GenerationFailure;
use crate::api::types::{ChatRequest, ChatResponse};
use crate::api::AppState;
use crate::conversation::build_transcript;

/// POST /chat: append the prompt to the history, render the chat template
/// with a trailing assistant marker and hand the result to the model.
pub async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, GenerationFailure> {
    let transcript = build_transcript(&req.history, &req.prompt);
    debug!(turns = transcript.len(), "chat request");

    let prompt = state.template.render(&transcript, true)?;
    let response = state
        .infer
        .generate(&prompt, state.config.max_new_tokens)
        .await?;

    Ok(Json(ChatResponse { response }))
}
