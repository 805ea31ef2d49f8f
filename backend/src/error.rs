use std::time::Duration;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::ALLOW},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn method_not_allowed() -> Self {
        Self {
            status: StatusCode::METHOD_NOT_ALLOWED,
            message: "Method not allowed".to_string(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let allow_header = self.status == StatusCode::METHOD_NOT_ALLOWED;
        let body = Json(ErrorBody {
            error: self.message,
        });

        let mut response = (self.status, body).into_response();
        if allow_header {
            response
                .headers_mut()
                .insert(ALLOW, HeaderValue::from_static("GET, OPTIONS"));
        }

        response
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("could not start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("extractor exited with {status}: {message}")]
    Exit { status: String, message: String },

    #[error("extractor timed out after {0:?}")]
    Timeout(Duration),

    #[error("could not decode extractor output: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("could not start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("extractor exited with {status}: {message}")]
    Exit { status: String, message: String },

    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream answered {0}")]
    UpstreamStatus(reqwest::StatusCode),

    #[error("invalid upstream header {0:?}")]
    InvalidHeader(String),

    #[error("read error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn stderr_message(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp did not report a reason")
        .to_string()
}
