use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::{
    cookies::CookieError,
    download::{DownloadError, Platform},
};

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub details: Option<String>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            details: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            details: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            details: self.details,
        });

        (self.status, body).into_response()
    }
}

impl From<DownloadError> for ApiError {
    fn from(error: DownloadError) -> Self {
        match error {
            DownloadError::InvalidUrl { platform } => {
                ApiError::bad_request(format!("Valid {} URL is required", platform.label()))
            }
            DownloadError::ToolMissing { .. } => {
                ApiError::internal("yt-dlp not found. Please ensure yt-dlp is installed.")
                    .with_details("Install yt-dlp on the PATH or set YTDLP_PATH to its location.")
            }
            DownloadError::Spawn { platform, .. } => ApiError::internal(format!(
                "Failed to start {}download process",
                platform.scope()
            )),
            DownloadError::Failed {
                platform,
                code,
                stderr,
            } => {
                let details = if stderr.trim().is_empty() {
                    match code {
                        Some(code) => format!("Process exited with code {code}"),
                        None => "Process was terminated by a signal".to_string(),
                    }
                } else {
                    stderr
                };
                ApiError::internal(failure_message(platform)).with_details(details)
            }
            error @ DownloadError::Wait { platform, .. } => {
                ApiError::internal(failure_message(platform)).with_details(error.to_string())
            }
            error @ DownloadError::NoOutput { .. } => ApiError::internal(error.to_string()),
            DownloadError::Stream(_) => ApiError::internal("File streaming failed"),
            DownloadError::AdmissionClosed => {
                ApiError::internal("Download capacity is unavailable")
            }
            DownloadError::Io(error) => {
                ApiError::internal(format!("Failed to read temporary downloads: {error}"))
            }
        }
    }
}

fn failure_message(platform: Platform) -> &'static str {
    match platform {
        Platform::YouTube => "Download failed",
        Platform::Instagram => "Instagram download failed",
    }
}

impl From<CookieError> for ApiError {
    fn from(error: CookieError) -> Self {
        match error {
            CookieError::MissingFile | CookieError::WrongType | CookieError::TooLarge => {
                ApiError::bad_request(error.to_string())
            }
            CookieError::NotFound { .. } => ApiError::not_found(error.to_string()),
            CookieError::Io { .. } => ApiError::internal(error.to_string()),
        }
    }
}
