use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use axum::{
    body::Body,
    http::{
        HeaderMap, HeaderValue,
        header::{CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures_util::{StreamExt, stream};
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::{
    audit::AuditTicket,
    cleanup::CleanupScheduler,
    download::{DownloadError, DownloadJob, DownloadMode, Platform},
};

/// Files in `dir` whose name starts with `prefix`, newest first.
///
/// Several matches are not expected for a fresh job id; when they occur the
/// most recently modified file wins and ties fall back to file name order.
pub async fn find_artifacts(dir: &Path, prefix: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut matches: Vec<(SystemTime, PathBuf)> = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(prefix) {
            continue;
        }
        let metadata = match entry.metadata().await {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => continue,
        };
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        matches.push((modified, entry.path()));
    }

    matches.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    Ok(matches.into_iter().map(|(_, path)| path).collect())
}

pub fn content_type_for(mode: DownloadMode) -> &'static str {
    match mode {
        DownloadMode::Audio => "audio/mpeg",
        DownloadMode::Video => "video/mp4",
    }
}

/// `<platform>_<mode>_<epoch-ms>[.<ext>]`, keeping only ASCII alphanumerics of
/// the source extension.
pub fn download_filename(
    platform: Platform,
    mode: DownloadMode,
    source: &Path,
    epoch_ms: i64,
) -> String {
    let extension = source
        .extension()
        .map(|ext| {
            ext.to_string_lossy()
                .chars()
                .filter(char::is_ascii_alphanumeric)
                .collect::<String>()
        })
        .filter(|ext| !ext.is_empty());

    match extension {
        Some(ext) => format!("{}_{}_{epoch_ms}.{ext}", platform.slug(), mode.as_str()),
        None => format!("{}_{}_{epoch_ms}", platform.slug(), mode.as_str()),
    }
}

/// Finds the job's output and streams it back.
///
/// Always settles `ticket` and hands every matching artifact to `cleanup`,
/// whether the stream completes, fails mid-transfer, or the client goes away.
pub async fn deliver(
    job: &DownloadJob,
    platform: Platform,
    mode: DownloadMode,
    cleanup: &CleanupScheduler,
    ticket: AuditTicket,
) -> Result<Response, DownloadError> {
    let artifacts = match find_artifacts(&job.dir, &job.prefix()).await {
        Ok(artifacts) => artifacts,
        Err(error) => {
            ticket.failure(format!("Temp directory error: {error}")).await;
            return Err(DownloadError::Io(error));
        }
    };
    let Some(selected) = artifacts.first().cloned() else {
        let error = DownloadError::NoOutput { platform };
        warn!("{error} (job {})", job.id);
        ticket.failure(error.to_string()).await;
        return Err(error);
    };
    if artifacts.len() > 1 {
        warn!(
            "Job {} produced {} files, streaming {:?}",
            job.id,
            artifacts.len(),
            selected.file_name()
        );
    }
    info!("Found downloaded file {:?}", selected.file_name());

    let delivery = Delivery {
        ticket: Some(ticket),
        cleanup: cleanup.clone(),
        artifacts,
    };

    let opened = match tokio::fs::File::open(&selected).await {
        Ok(file) => file.metadata().await.map(|metadata| (file, metadata.len())),
        Err(error) => Err(error),
    };
    let (file, length) = match opened {
        Ok(opened) => opened,
        Err(error) => {
            let error = DownloadError::Stream(error);
            delivery.finish(Some(error.to_string())).await;
            return Err(error);
        }
    };

    let filename = download_filename(platform, mode, &selected, Utc::now().timestamp_millis());
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type_for(mode)));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!("attachment; filename=\"{filename}\""))
            .unwrap_or_else(|_| HeaderValue::from_static("attachment")),
    );
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));

    if length == 0 {
        delivery.finish(None).await;
        return Ok((headers, Body::empty()).into_response());
    }

    Ok((headers, streaming_body(file, length, delivery)).into_response())
}

/// Streams `reader` and settles `delivery` as soon as `length` bytes have been
/// read. hyper stops polling a body whose `Content-Length` is satisfied, so the
/// end of the reader is never observed on a real connection.
fn streaming_body<R>(reader: R, length: u64, delivery: Delivery) -> Body
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let state = StreamState {
        reader: ReaderStream::new(reader),
        remaining: length,
        delivery,
    };

    Body::from_stream(stream::unfold(Some(state), |state| async move {
        let Some(mut state) = state else {
            return None;
        };
        match state.reader.next().await {
            Some(Ok(mut chunk)) => {
                if chunk.len() as u64 > state.remaining {
                    chunk.truncate(state.remaining as usize);
                }
                state.remaining = state.remaining.saturating_sub(chunk.len() as u64);
                if state.remaining == 0 {
                    state.delivery.finish(None).await;
                    Some((Ok(chunk), None))
                } else {
                    Some((Ok(chunk), Some(state)))
                }
            }
            Some(Err(error)) => {
                warn!("File stream error: {error}");
                state
                    .delivery
                    .finish(Some(format!("Stream error: {error}")))
                    .await;
                Some((Err(error), None))
            }
            None => {
                let error = format!(
                    "Stream error: file ended {} byte(s) short",
                    state.remaining
                );
                warn!("{error}");
                state.delivery.finish(Some(error)).await;
                None
            }
        }
    }))
}

struct StreamState<R> {
    reader: ReaderStream<R>,
    remaining: u64,
    delivery: Delivery,
}

/// Terminal bookkeeping for one streamed artifact.
struct Delivery {
    ticket: Option<AuditTicket>,
    cleanup: CleanupScheduler,
    artifacts: Vec<PathBuf>,
}

impl Delivery {
    fn release_artifacts(&mut self) {
        for path in self.artifacts.drain(..) {
            self.cleanup.schedule_delete(path);
        }
    }

    async fn finish(mut self, error: Option<String>) {
        self.release_artifacts();
        let Some(ticket) = self.ticket.take() else {
            return;
        };
        match error {
            None => {
                info!("Download streamed successfully");
                ticket.success().await;
            }
            Some(error) => ticket.failure(error).await,
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if !self.artifacts.is_empty() && tokio::runtime::Handle::try_current().is_ok() {
            self.release_artifacts();
        }
    }
}
