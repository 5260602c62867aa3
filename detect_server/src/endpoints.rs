//! Endpoints of HTTP server.
//!
use std::sync::Arc;

use axum::{
    body::StreamBody,
    extract::Path,
    http::header,
    response::{Html, IntoResponse},
    routing::get,
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::{
    camera::CameraOpener,
    pipeline::Pipeline,
    stats::{DetectionStats, StatsSnapshot},
};

const INDEX_HTML: &str = include_str!("../static/index.html");

/// Reply of the toggle endpoint.
#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct ToggleResponse {
    pub success: bool,
}

/// Build the HTTP server with all endpoints.
pub fn router(
    stats: Arc<DetectionStats>,
    pipeline: Arc<Pipeline>,
    camera_opener: CameraOpener,
) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/healthcheck", get(healthcheck))
        .route("/video_feed", get(video_feed))
        .route("/stats", get(stats_snapshot))
        .route("/toggle_detection/:state", get(toggle_detection))
        .layer(Extension(stats))
        .layer(Extension(pipeline))
        .layer(Extension(camera_opener))
}

/// Dashboard page.
pub async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// Health check endpoint.
pub async fn healthcheck() -> &'static str {
    "healthy"
}

/// Annotated camera stream.
///
/// Every request opens its own capture, which is released again when the client goes away.
pub async fn video_feed(
    Extension(pipeline): Extension<Arc<Pipeline>>,
    Extension(camera_opener): Extension<CameraOpener>,
) -> impl IntoResponse {
    log::info!("Video stream requested");

    // Set body and headers for multipart streaming
    let body = StreamBody::new(pipeline.frame_stream(camera_opener));
    let headers = [(
        header::CONTENT_TYPE,
        "multipart/x-mixed-replace; boundary=frame",
    )];

    (headers, body)
}

pub async fn stats_snapshot(
    Extension(stats): Extension<Arc<DetectionStats>>,
) -> Json<StatsSnapshot> {
    Json(stats.snapshot())
}

/// Enable detection for `true`, disable it for anything else.
pub async fn toggle_detection(
    Extension(stats): Extension<Arc<DetectionStats>>,
    Path(state): Path<String>,
) -> Json<ToggleResponse> {
    let enabled = state == "true";
    log::info!("Detection {}", if enabled { "enabled" } else { "disabled" });
    stats.set_detecting(enabled);

    Json(ToggleResponse { success: true })
}
