use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";
const POST_STREAM_DELETE_DELAY_SECONDS: u64 = 5;
const SWEEP_INTERVAL_SECONDS: u64 = 30 * 60;
const TEMP_MAX_AGE_SECONDS: u64 = 30 * 60;

/// Runtime settings resolved once at startup and handed to every component.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub temp_dir: PathBuf,
    pub cookies_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub ytdlp_override: Option<PathBuf>,
    pub max_concurrent_downloads: Option<usize>,
    pub trust_proxy_headers: bool,
    pub allowed_origins: Vec<String>,
    pub delete_delay: Duration,
    pub sweep_interval: Duration,
    pub temp_max_age: Duration,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str| lookup(key).and_then(|value| non_empty(&value).map(str::to_string));

        let data_dir = read("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            bind_addr: resolve_bind_addr(&read),
            temp_dir: data_dir.join("temp"),
            cookies_dir: data_dir.join("cookies"),
            logs_dir: data_dir.join("logs"),
            ytdlp_override: read("YTDLP_PATH").map(PathBuf::from),
            max_concurrent_downloads: read("MAX_CONCURRENT_DOWNLOADS")
                .and_then(|value| value.parse::<usize>().ok())
                .filter(|value| *value > 0),
            trust_proxy_headers: read("TRUST_PROXY_HEADERS")
                .and_then(|value| parse_bool(&value))
                .unwrap_or(false),
            allowed_origins: read("ALLOWED_ORIGINS")
                .map(|value| {
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|origin| !origin.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            delete_delay: Duration::from_secs(POST_STREAM_DELETE_DELAY_SECONDS),
            sweep_interval: Duration::from_secs(SWEEP_INTERVAL_SECONDS),
            temp_max_age: Duration::from_secs(TEMP_MAX_AGE_SECONDS),
        }
    }

    /// Settings rooted at `data_dir` with default timings, used by tests and embedders.
    pub fn rooted_at(data_dir: &Path) -> Self {
        let data_dir = data_dir.to_string_lossy().into_owned();
        Self::from_lookup(|key| (key == "DATA_DIR").then(|| data_dir.clone()))
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.logs_dir.join("downloads.log")
    }

    pub async fn ensure_dirs(&self) -> io::Result<()> {
        for dir in [&self.temp_dir, &self.cookies_dir, &self.logs_dir] {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }
}

fn resolve_bind_addr(read: &impl Fn(&str) -> Option<String>) -> String {
    if let Some(configured) = read("APP_ADDR") {
        return configured;
    }

    if let Some(port) = read("PORT").and_then(|value| value.parse::<u16>().ok()) {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
