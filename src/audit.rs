use std::{io::ErrorKind, path::PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::io::AsyncWriteExt;
use tracing::warn;

pub const RECENT_LOG_LINES: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Success,
    Error,
}

impl DownloadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadStatus::Success => "success",
            DownloadStatus::Error => "error",
        }
    }
}

/// One terminal outcome, rendered as a single `|`-separated line.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub url: String,
    pub kind: String,
    pub status: DownloadStatus,
    pub error: Option<String>,
}

impl LogEntry {
    pub fn success(client_ip: &str, url: &str, kind: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            client_ip: client_ip.to_string(),
            url: url.to_string(),
            kind: kind.to_string(),
            status: DownloadStatus::Success,
            error: None,
        }
    }

    pub fn failure(client_ip: &str, url: &str, kind: &str, error: impl Into<String>) -> Self {
        Self {
            status: DownloadStatus::Error,
            error: Some(error.into()),
            ..Self::success(client_ip, url, kind)
        }
    }

    pub fn render(&self) -> String {
        let mut line = format!(
            "{} | IP: {} | URL: {} | Type: {} | Status: {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            single_line(&self.client_ip),
            single_line(&self.url),
            self.kind,
            self.status.as_str()
        );
        if let Some(error) = &self.error {
            line.push_str(" | Error: ");
            line.push_str(&single_line(error));
        }
        line.push('\n');
        line
    }
}

/// Append-only audit file shared by all requests.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Appends the entry. Failures are reported through tracing and swallowed.
    pub async fn record(&self, entry: LogEntry) {
        if let Err(error) = self.append(entry.render().as_bytes()).await {
            warn!("Failed to write to audit log {:?}: {error}", self.path);
        }
    }

    async fn append(&self, line: &[u8]) -> std::io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line).await?;
        file.flush().await
    }

    /// Opens the single terminal entry for one request.
    pub fn ticket(&self, client_ip: &str, url: &str, kind: &str) -> AuditTicket {
        AuditTicket {
            log: self.clone(),
            client_ip: client_ip.to_string(),
            url: url.to_string(),
            kind: kind.to_string(),
            settled: false,
        }
    }

    pub async fn recent(&self, limit: usize) -> std::io::Result<Vec<String>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error),
        };

        let lines: Vec<String> = contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(ToString::to_string)
            .collect();
        let skip = lines.len().saturating_sub(limit);
        Ok(lines.into_iter().skip(skip).collect())
    }
}

/// Guarantees exactly one audit entry per request. Settling consumes the
/// ticket; dropping it unsettled (the client went away mid-request) records
/// an error entry from a background task.
#[derive(Debug)]
pub struct AuditTicket {
    log: AuditLog,
    client_ip: String,
    url: String,
    kind: String,
    settled: bool,
}

impl AuditTicket {
    pub async fn success(mut self) {
        self.settled = true;
        let entry = LogEntry::success(&self.client_ip, &self.url, &self.kind);
        self.log.record(entry).await;
    }

    pub async fn failure(mut self, error: impl Into<String>) {
        self.settled = true;
        let entry = LogEntry::failure(&self.client_ip, &self.url, &self.kind, error);
        self.log.record(entry).await;
    }
}

impl Drop for AuditTicket {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Dropped unsettled audit entry for {} outside a runtime", self.url);
            return;
        };
        let log = self.log.clone();
        let entry = LogEntry::failure(
            &self.client_ip,
            &self.url,
            &self.kind,
            "Client disconnected before completion",
        );
        runtime.spawn(async move { log.record(entry).await });
    }
}

fn single_line(value: &str) -> String {
    value
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
