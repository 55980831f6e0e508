use std::{
    collections::HashSet,
    convert::Infallible,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use axum::{
    Json, Router,
    extract::{
        ConnectInfo, FromRequestParts, Multipart, Query, State, multipart::MultipartError,
    },
    http::{
        HeaderMap, HeaderValue, Method, StatusCode, header::CONTENT_DISPOSITION,
        request::Parts,
    },
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    audit::{AuditLog, LogEntry, RECENT_LOG_LINES},
    cleanup::CleanupScheduler,
    config::{AppConfig, non_empty},
    cookies::{CookieError, CookieStore, validate_upload},
    delivery,
    download::{Admission, DownloadRequest, Downloader, Platform},
    error::ApiError,
    locator::ToolLocator,
};

const COOKIES_FIELD: &str = "cookies";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub locator: ToolLocator,
    pub cookies: CookieStore,
    pub downloader: Downloader,
    pub cleanup: CleanupScheduler,
    pub audit: AuditLog,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let locator = ToolLocator::new(config.ytdlp_override.clone());
        let cookies = CookieStore::new(config.cookies_dir.clone());
        let downloader = Downloader::new(
            locator.clone(),
            cookies.clone(),
            config.temp_dir.clone(),
            Admission::new(config.max_concurrent_downloads),
        );
        let cleanup = CleanupScheduler::from_config(&config);
        let audit = AuditLog::new(config.audit_log_path());

        Self {
            config: Arc::new(config),
            locator,
            cookies,
            downloader,
            cleanup,
            audit,
        }
    }
}

pub fn router(state: AppState) -> Result<Router, ApiError> {
    let cors = build_cors_layer(&state.config.allowed_origins)?;

    Ok(Router::new()
        .route("/youtube", get(download_youtube))
        .route("/instagram", get(download_instagram))
        .route("/upload-cookies", post(upload_cookies))
        .route("/cookies-status", get(cookies_status))
        .route("/cookies", delete(delete_cookies))
        .route("/health", get(health))
        .route("/logs", get(recent_logs))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors))
}

#[derive(Debug, Deserialize)]
struct MediaQuery {
    url: Option<String>,
    audio: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlatformQuery {
    platform: Option<Platform>,
}

impl PlatformQuery {
    fn platform(&self) -> Platform {
        self.platform.unwrap_or(Platform::YouTube)
    }
}

async fn download_youtube(
    State(state): State<AppState>,
    ClientIp(client_ip): ClientIp,
    Query(query): Query<MediaQuery>,
) -> Response {
    let audio = query.audio.as_deref().map(str::trim) == Some("1");
    handle_download(&state, Platform::YouTube, query.url, audio, client_ip).await
}

async fn download_instagram(
    State(state): State<AppState>,
    ClientIp(client_ip): ClientIp,
    Query(query): Query<MediaQuery>,
) -> Response {
    handle_download(&state, Platform::Instagram, query.url, false, client_ip).await
}

async fn handle_download(
    state: &AppState,
    platform: Platform,
    raw_url: Option<String>,
    audio: bool,
    client_ip: String,
) -> Response {
    let request = match DownloadRequest::new(platform, raw_url.as_deref(), audio, client_ip.as_str())
    {
        Ok(request) => request,
        Err(error) => {
            let logged_url = raw_url.as_deref().and_then(non_empty).unwrap_or("N/A");
            state
                .audit
                .record(LogEntry::failure(
                    &client_ip,
                    logged_url,
                    platform.slug(),
                    error.to_string(),
                ))
                .await;
            return ApiError::from(error).into_response();
        }
    };

    let logged_url = raw_url.as_deref().map(str::trim).unwrap_or_default();
    let ticket = state
        .audit
        .ticket(&request.client_ip, logged_url, request.mode.as_str());

    let job = match state.downloader.run(&request).await {
        Ok(job) => job,
        Err(error) => {
            warn!("{} download failed: {error}", platform.label());
            ticket.failure(error.to_string()).await;
            return ApiError::from(error).into_response();
        }
    };

    match delivery::deliver(&job, platform, request.mode, &state.cleanup, ticket).await {
        Ok(response) => response,
        Err(error) => ApiError::from(error).into_response(),
    }
}

async fn upload_cookies(
    State(state): State<AppState>,
    ClientIp(client_ip): ClientIp,
    Query(query): Query<PlatformQuery>,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let platform = query.platform();

    let result = async {
        let (file_name, bytes) = read_cookies_field(multipart).await?;
        state.cookies.upload(platform, &file_name, &bytes).await
    }
    .await;

    match result {
        Ok(stored) => {
            info!(
                "Cookies file uploaded by {client_ip}: {}",
                stored.path.display()
            );
            state
                .audit
                .record(LogEntry::success(&client_ip, "cookies-upload", "cookies"))
                .await;
            Ok(Json(json!({
                "success": true,
                "message": "Cookies file uploaded successfully",
                "filename": stored.file_name(),
                "size": stored.size,
            })))
        }
        Err(error) => {
            state
                .audit
                .record(LogEntry::failure(
                    &client_ip,
                    "cookies-upload",
                    "cookies",
                    error.to_string(),
                ))
                .await;
            Err(error.into())
        }
    }
}

async fn read_cookies_field(mut multipart: Multipart) -> Result<(String, Vec<u8>), CookieError> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(COOKIES_FIELD) {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        validate_upload(&file_name, 0)?;
        let bytes = field.bytes().await.map_err(multipart_error)?;
        return Ok((file_name, bytes.to_vec()));
    }

    Err(CookieError::MissingFile)
}

fn multipart_error(error: MultipartError) -> CookieError {
    if error.status() == StatusCode::PAYLOAD_TOO_LARGE {
        CookieError::TooLarge
    } else {
        debug!("Rejected multipart upload: {error}");
        CookieError::MissingFile
    }
}

async fn cookies_status(
    State(state): State<AppState>,
    Query(query): Query<PlatformQuery>,
) -> Result<Json<Value>, ApiError> {
    let status = state.cookies.status(query.platform()).await?;

    let cookies = match &status {
        Some(file) => json!({
            "exists": true,
            "size": file.size,
            "uploaded": file.uploaded.to_rfc3339_opts(SecondsFormat::Millis, true),
            "path": file.file_name(),
        }),
        None => json!({ "exists": false }),
    };

    Ok(Json(json!({
        "hasCookies": status.is_some(),
        "cookies": cookies,
    })))
}

async fn delete_cookies(
    State(state): State<AppState>,
    ClientIp(client_ip): ClientIp,
    Query(query): Query<PlatformQuery>,
) -> Result<Json<Value>, ApiError> {
    let platform = query.platform();
    let audit_target = format!("{}-cookies-delete", platform.slug());

    match state.cookies.delete(platform).await {
        Ok(()) => {
            info!("{} cookies file deleted by {client_ip}", platform.label());
            state
                .audit
                .record(LogEntry::success(&client_ip, &audit_target, "cookies"))
                .await;
            Ok(Json(json!({
                "success": true,
                "message": format!("{} cookies file deleted successfully", platform.label()),
            })))
        }
        Err(error @ CookieError::NotFound { .. }) => Err(error.into()),
        Err(error) => {
            warn!("Failed to delete {} cookies: {error}", platform.label());
            state
                .audit
                .record(LogEntry::failure(
                    &client_ip,
                    &audit_target,
                    "cookies",
                    error.to_string(),
                ))
                .await;
            Err(error.into())
        }
    }
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let ytdlp_path = state.locator.locate();
    let mut cookies = serde_json::Map::new();
    for platform in Platform::ALL {
        let active = state.cookies.active_path(platform).await;
        cookies.insert(
            platform.slug().to_string(),
            json!({
                "available": active.is_some(),
                "path": active.map(|_| platform.cookie_file_name()),
            }),
        );
    }

    Json(json!({
        "status": "OK",
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        "ytdlp": {
            "path": ytdlp_path.to_string_lossy(),
            "available": ToolLocator::is_available(&ytdlp_path),
        },
        "cookies": cookies,
    }))
}

async fn recent_logs(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let logs = state
        .audit
        .recent(RECENT_LOG_LINES)
        .await
        .map_err(|error| ApiError::internal(format!("Failed to read download log: {error}")))?;
    Ok(Json(json!({ "logs": logs })))
}

/// Proxy headers consulted, in order, when `TRUST_PROXY_HEADERS` is set.
const FORWARDING_HEADERS: [&str; 3] = ["x-forwarded-for", "cf-connecting-ip", "x-real-ip"];

/// Address recorded in audit entries: the first parseable forwarded address
/// when proxies are trusted, otherwise the socket peer.
struct ClientIp(String);

impl FromRequestParts<AppState> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let forwarded = if state.config.trust_proxy_headers {
            forwarded_ip(&parts.headers)
        } else {
            None
        };
        let peer = ConnectInfo::<SocketAddr>::from_request_parts(parts, state)
            .await
            .ok()
            .map(|ConnectInfo(addr)| addr.ip());

        Ok(Self(
            forwarded
                .or(peer)
                .map_or_else(|| "unknown".to_string(), |ip| ip.to_string()),
        ))
    }
}

fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    FORWARDING_HEADERS.iter().find_map(|name| {
        let value = headers.get(*name)?.to_str().ok()?;
        value.split(',').next()?.trim().parse().ok()
    })
}

fn build_cors_layer(configured: &[String]) -> Result<CorsLayer, ApiError> {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any)
        .expose_headers([CONTENT_DISPOSITION]);

    if configured.is_empty() {
        return Ok(layer.allow_origin(Any));
    }

    let mut allowed = HashSet::new();
    for origin in configured {
        let Some(key) = origin_key(origin) else {
            return Err(ApiError::internal(format!(
                "Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com"
            )));
        };
        allowed.insert(key);
    }
    info!("CORS restricted to {} origin(s)", allowed.len());

    Ok(layer.allow_origin(AllowOrigin::predicate(
        move |origin: &HeaderValue, _| {
            origin
                .to_str()
                .ok()
                .and_then(origin_key)
                .is_some_and(|key| allowed.contains(&key))
        },
    )))
}

/// Serialized web origin of a bare `http`/`https` URL, default port elided.
fn origin_key(value: &str) -> Option<String> {
    let url = Url::parse(value.trim()).ok()?;
    let web = matches!(url.scheme(), "http" | "https") && url.has_host();
    let bare = url.path() == "/" && url.query().is_none() && url.fragment().is_none();
    (web && bare).then(|| url.origin().ascii_serialization())
}
