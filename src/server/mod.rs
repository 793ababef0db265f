//! HTTP/WebSocket gateway.
//!
//! ## Module Map
//!
//! | Module     | Responsibility                                         |
//! |------------|--------------------------------------------------------|
//! | `ws`       | `/ws/{user_id}` session loop and the two-agent turn    |
//! | `embedded` | Demo page embedded via `rust-embed`, served as fallback|
//!
//! The router carries three surfaces: the health probe Cloud Run polls, the
//! WebSocket endpoint the clients drive, and a static fallback serving the
//! embedded demo page.

pub mod embedded;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::Request,
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::agent::{ImageAgent, ImageGenerator, StoryAgent, StoryGenerator};
use crate::config::AppConfig;
use crate::genai::GeminiClient;
use crate::storage::GcsUploader;
use embedded::Assets;

/// Shared application state.
pub struct AppState {
    pub story_agent: Arc<dyn StoryGenerator>,
    /// `None` when no Google Cloud project is configured; the gateway then
    /// runs text-only.
    pub image_agent: Option<Arc<dyn ImageGenerator>>,
    /// Pause between scene illustrations.
    pub image_pacing: Duration,
}

pub type SharedState = Arc<AppState>;

/// Build the full application router: health, WebSocket, demo-page fallback.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws/{user_id}", get(ws::ws_handler))
        .fallback(static_handler)
        // Demo posture: any origin may connect, matching the original
        // deployment's wildcard CORS.
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "storygen-backend",
    }))
}

/// Serve embedded static files or fall back to index.html.
async fn static_handler(req: Request<Body>) -> impl IntoResponse {
    let path = req.uri().path().trim_start_matches('/');

    if !path.is_empty() {
        if let Some(content) = Assets::get(path) {
            let mime = mime_guess::from_path(path).first_or_octet_stream();
            return Response::builder()
                .header(header::CONTENT_TYPE, mime.as_ref())
                .body(Body::from(content.data.to_vec()))
                .unwrap()
                .into_response();
        }
    }

    match Assets::get("index.html") {
        Some(content) => Html(String::from_utf8_lossy(&content.data).to_string()).into_response(),
        None => (StatusCode::NOT_FOUND, "Demo page not found").into_response(),
    }
}

/// Wire up the agents from configuration.
pub fn build_state(config: &AppConfig) -> AppState {
    let client = GeminiClient::new(&config.google);

    info!(
        project_id = config.google.project_id.as_deref().unwrap_or("<unset>"),
        api_key = if config.google.api_key.is_some() { "yes" } else { "no" },
        use_vertex = config.google.use_vertex,
        story_model = %config.models.story_model,
        "Resolved Google configuration"
    );

    let story_agent: Arc<dyn StoryGenerator> = Arc::new(StoryAgent::new(
        client.clone(),
        config.models.story_model.clone(),
    ));

    let image_agent: Option<Arc<dyn ImageGenerator>> = if config.images_enabled() {
        let uploader = config.google.bucket.clone().map(|bucket| {
            GcsUploader::new(client.http(), client.token_provider(), bucket)
        });
        if uploader.is_none() {
            warn!(
                "GENMEDIA_BUCKET not set; images will be returned as base64 payloads, \
                 which may exceed message limits"
            );
        }
        info!(image_model = %config.models.image_model, "Image agent enabled");
        Some(Arc::new(ImageAgent::new(
            client,
            uploader,
            config.models.image_model.clone(),
        )))
    } else {
        info!("To enable image generation, set GOOGLE_CLOUD_PROJECT_ID; running text-only");
        None
    };

    AppState {
        story_agent,
        image_agent,
        image_pacing: ws::IMAGE_PACING,
    }
}

/// Start the gateway and serve until Ctrl-C.
pub async fn start_server(config: AppConfig) -> Result<()> {
    let state = Arc::new(build_state(&config));
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "StoryGen backend listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Shutting down...");
}
