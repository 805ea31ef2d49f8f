use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{RawQuery, State},
    http::{
        HeaderName, HeaderValue, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::get,
};
use futures_util::{StreamExt, TryStreamExt, stream};
use tower_http::{set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::{Instrument, Span, debug, error, info_span};
use url::form_urlencoded;
use uuid::Uuid;

use crate::{
    error::{ApiError, StreamError},
    format::select_format,
    resolver::VideoResolver,
    video_id::{VideoId, parse_video_id},
};

const CORS_HEADERS: [(&str, &str); 4] = [
    ("access-control-allow-credentials", "true"),
    ("access-control-allow-origin", "*"),
    ("access-control-allow-methods", "GET,OPTIONS"),
    (
        "access-control-allow-headers",
        "X-CSRF-Token, X-Requested-With, Accept, Accept-Version, Content-Length, Content-MD5, Content-Type, Date, X-Api-Version",
    ),
];

#[derive(Clone)]
pub struct AppState {
    resolver: Arc<dyn VideoResolver>,
}

pub fn router(resolver: Arc<dyn VideoResolver>) -> Router {
    let state = AppState { resolver };

    let app = Router::new()
        .route("/api/health", get(health))
        .route(
            "/api/download",
            get(download)
                .options(preflight)
                .head(reject_method)
                .fallback(reject_method),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    with_cors_headers(app)
}

fn with_cors_headers(app: Router) -> Router {
    CORS_HEADERS.into_iter().fold(app, |app, (name, value)| {
        app.layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        ))
    })
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn preflight() -> StatusCode {
    StatusCode::OK
}

async fn reject_method() -> ApiError {
    ApiError::method_not_allowed()
}

fn video_id_param(query: &str) -> Option<String> {
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "videoId")
        .map(|(_, value)| value.into_owned())
}

async fn download(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
) -> Result<Response, ApiError> {
    let raw_id = query
        .as_deref()
        .and_then(video_id_param)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::bad_request("Video ID is required"))?;

    let video_id = parse_video_id(&raw_id)
        .ok_or_else(|| ApiError::bad_request("Invalid YouTube video ID"))?;

    let span = info_span!(
        "download",
        download_id = %Uuid::new_v4(),
        video_id = %video_id,
    );
    stream_video(state, video_id).instrument(span).await
}

async fn stream_video(state: AppState, video_id: VideoId) -> Result<Response, ApiError> {
    let info = state.resolver.resolve(&video_id).await.map_err(|error| {
        error!("Metadata resolution failed: {error}");
        ApiError::internal("Internal server error")
    })?;

    let format = select_format(&info.formats)
        .ok_or_else(|| ApiError::not_found("No suitable video format found"))?;
    debug!(
        itag = %format.itag,
        height = ?format.height,
        quality = ?format.quality_label,
        ext = ?format.ext,
        filesize = ?format.filesize,
        "Selected format out of {}",
        info.formats.len()
    );

    let mut upstream = state
        .resolver
        .open_stream(&video_id, format)
        .await
        .map_err(download_failed)?;

    // The response head is only committed once the first chunk arrived.
    let first_chunk = match upstream.next().await {
        Some(Ok(chunk)) => Some(chunk),
        Some(Err(error)) => return Err(download_failed(error)),
        None => None,
    };

    let span = Span::current();
    let body = stream::iter(first_chunk.map(Ok))
        .chain(upstream)
        .inspect_err(move |error| {
            let _enter = span.enter();
            error!("Download interrupted after headers were sent: {error}");
        });

    let content_disposition =
        HeaderValue::from_str(&format!("attachment; filename=\"darkzone-yt-{video_id}.mp4\""))
            .map_err(|_| ApiError::internal("Internal server error"))?;

    Ok((
        [
            (CONTENT_DISPOSITION, content_disposition),
            (CONTENT_TYPE, HeaderValue::from_static("video/mp4")),
        ],
        Body::from_stream(body),
    )
        .into_response())
}

fn download_failed(error: StreamError) -> ApiError {
    error!("Download error: {error}");
    ApiError::internal("Download failed")
}
