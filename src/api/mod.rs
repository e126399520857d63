use std::sync::Arc;

use axum::{routing::post, Router};

use crate::config::ServerConfig;
use crate::conversation::ChatTemplate;
use crate::inference::ChatModel;

pub mod error;
pub mod handlers;
pub mod types;

/// Read-only handles built once at startup and cloned into every request.
#[derive(Clone)]
pub struct AppState {
    pub infer: Arc<dyn ChatModel>,
    pub template: Arc<ChatTemplate>,
    pub config: Arc<ServerConfig>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/chat", post(handlers::chat))
}
