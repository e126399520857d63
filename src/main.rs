use std::{fs, sync::Arc};

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod api;
mod config;
mod conversation;
mod inference;
mod model;

use api::AppState;
use config::ServerConfig;
use conversation::ChatTemplate;
use inference::qwen::{ModelFiles, QwenEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(ServerConfig::from_env()?);
    info!(model_id = %config.model_id, "loading model, this can take a while");

    let files = ModelFiles::resolve(&config)?;
    let template = ChatTemplate::load(Some(files.snapshot_dir.as_path()))?;
    let engine = QwenEngine::load(&files, &config)?;

    let state = AppState {
        infer: Arc::new(engine),
        template: Arc::new(template),
        config: config.clone(),
    };

    fs::create_dir_all(&config.static_dir)?;

    let app = Router::new()
        .merge(api::router())
        .fallback_service(
            ServeDir::new(&config.static_dir).append_index_html_on_directories(true),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state);

    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
