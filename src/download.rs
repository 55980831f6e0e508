use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use serde::Deserialize;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    sync::{OwnedSemaphorePermit, Semaphore},
};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::{cookies::CookieStore, locator::ToolLocator};

const YOUTUBE_VIDEO_FORMAT: &str = "best[height<=720][ext=mp4]/best[ext=mp4]/best";
const INSTAGRAM_VIDEO_FORMAT: &str = "best[ext=mp4]/best";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    YouTube,
    Instagram,
}

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::YouTube, Platform::Instagram];

    pub fn slug(self) -> &'static str {
        match self {
            Platform::YouTube => "youtube",
            Platform::Instagram => "instagram",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Platform::YouTube => "YouTube",
            Platform::Instagram => "Instagram",
        }
    }

    /// Qualifier used in user-facing messages; YouTube is the unqualified default.
    pub fn scope(self) -> &'static str {
        match self {
            Platform::YouTube => "",
            Platform::Instagram => "Instagram ",
        }
    }

    pub fn cookie_file_name(self) -> &'static str {
        match self {
            Platform::YouTube => "youtube_cookies.txt",
            Platform::Instagram => "instagram_cookies.txt",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadMode {
    Video,
    Audio,
}

impl DownloadMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadMode::Video => "video",
            DownloadMode::Audio => "audio",
        }
    }
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Invalid URL provided")]
    InvalidUrl { platform: Platform },
    #[error("yt-dlp executable not found: {}", .path.display())]
    ToolMissing { path: PathBuf },
    #[error("Failed to start {}download process: {source}", .platform.scope())]
    Spawn {
        platform: Platform,
        #[source]
        source: io::Error,
    },
    #[error(
        "{} download failed with exit code {}: {}",
        .platform.label(),
        exit_code_label(.code),
        .stderr.trim()
    )]
    Failed {
        platform: Platform,
        code: Option<i32>,
        stderr: String,
    },
    #[error("No output file found after {}download", .platform.scope())]
    NoOutput { platform: Platform },
    #[error("Stream error: {0}")]
    Stream(#[source] io::Error),
    #[error("Download capacity is unavailable")]
    AdmissionClosed,
    #[error("Lost track of {}download process: {source}", .platform.scope())]
    Wait {
        platform: Platform,
        #[source]
        source: io::Error,
    },
    #[error("Temp directory error: {0}")]
    Io(#[source] io::Error),
}

fn exit_code_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "none (signal)".to_string(), |code| code.to_string())
}

/// A validated inbound download.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: Url,
    pub platform: Platform,
    pub mode: DownloadMode,
    pub client_ip: String,
}

impl DownloadRequest {
    /// Validates the raw URL. Instagram has no audio-only mode, so `audio` is
    /// ignored there.
    pub fn new(
        platform: Platform,
        raw_url: Option<&str>,
        audio: bool,
        client_ip: impl Into<String>,
    ) -> Result<Self, DownloadError> {
        let url = raw_url
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .and_then(|value| Url::parse(value).ok())
            .ok_or(DownloadError::InvalidUrl { platform })?;

        let mode = match platform {
            Platform::YouTube if audio => DownloadMode::Audio,
            _ => DownloadMode::Video,
        };

        Ok(Self {
            url,
            platform,
            mode,
            client_ip: client_ip.into(),
        })
    }
}

/// One subprocess invocation and the temp-file prefix it will produce.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub id: Uuid,
    pub dir: PathBuf,
    pub output_template: String,
}

impl DownloadJob {
    pub fn new(dir: &Path) -> Self {
        let id = Uuid::new_v4();
        let output_template = dir
            .join(format!("{id}.%(ext)s"))
            .to_string_lossy()
            .into_owned();
        Self {
            id,
            dir: dir.to_path_buf(),
            output_template,
        }
    }

    pub fn prefix(&self) -> String {
        self.id.to_string()
    }
}

/// Entry gate for subprocess spawning. Unbounded unless a cap is configured.
#[derive(Debug, Clone)]
pub struct Admission {
    limit: Option<Arc<Semaphore>>,
}

impl Admission {
    pub fn new(max_concurrent: Option<usize>) -> Self {
        Self {
            limit: max_concurrent.map(|permits| Arc::new(Semaphore::new(permits))),
        }
    }

    pub async fn enter(&self) -> Result<Option<OwnedSemaphorePermit>, DownloadError> {
        match &self.limit {
            Some(semaphore) => Arc::clone(semaphore)
                .acquire_owned()
                .await
                .map(Some)
                .map_err(|_| DownloadError::AdmissionClosed),
            None => Ok(None),
        }
    }
}

pub fn build_args(
    request: &DownloadRequest,
    output_template: &str,
    cookies: Option<&Path>,
) -> Vec<String> {
    let mut args = vec![
        request.url.to_string(),
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "--output".to_string(),
        output_template.to_string(),
        "--restrict-filenames".to_string(),
    ];

    if let Some(cookies) = cookies {
        args.push("--cookies".to_string());
        args.push(cookies.to_string_lossy().into_owned());
    }

    match (request.platform, request.mode) {
        (Platform::YouTube, DownloadMode::Audio) => {
            args.extend(
                [
                    "--extract-audio",
                    "--audio-format",
                    "mp3",
                    "--audio-quality",
                    "192K",
                    "--embed-metadata",
                ]
                .map(str::to_string),
            );
        }
        (Platform::YouTube, DownloadMode::Video) => {
            args.extend(
                [
                    "--format",
                    YOUTUBE_VIDEO_FORMAT,
                    "--merge-output-format",
                    "mp4",
                ]
                .map(str::to_string),
            );
        }
        (Platform::Instagram, _) => {
            args.extend(
                [
                    "--format",
                    INSTAGRAM_VIDEO_FORMAT,
                    "--merge-output-format",
                    "mp4",
                ]
                .map(str::to_string),
            );
        }
    }

    args
}

/// Runs `yt-dlp` for one request and waits for it to exit.
#[derive(Debug, Clone)]
pub struct Downloader {
    locator: ToolLocator,
    cookies: CookieStore,
    temp_dir: PathBuf,
    admission: Admission,
}

impl Downloader {
    pub fn new(
        locator: ToolLocator,
        cookies: CookieStore,
        temp_dir: impl Into<PathBuf>,
        admission: Admission,
    ) -> Self {
        Self {
            locator,
            cookies,
            temp_dir: temp_dir.into(),
            admission,
        }
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Returns the finished job once the process exits with status 0.
    pub async fn run(&self, request: &DownloadRequest) -> Result<DownloadJob, DownloadError> {
        let _permit = self.admission.enter().await?;

        let job = DownloadJob::new(&self.temp_dir);
        let cookies = self.cookies.active_path(request.platform).await;
        if cookies.is_some() {
            info!("Using {} cookies file for enhanced access", request.platform.label());
        }
        let args = build_args(request, &job.output_template, cookies.as_deref());
        let program = self.locator.locate();

        info!(
            "Starting {} {} download {} for {}",
            request.platform.label(),
            request.mode.as_str(),
            job.id,
            request.url
        );
        debug!("Using yt-dlp at {:?}", program);

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| {
                if source.kind() == ErrorKind::NotFound {
                    DownloadError::ToolMissing {
                        path: program.clone(),
                    }
                } else {
                    DownloadError::Spawn {
                        platform: request.platform,
                        source,
                    }
                }
            })?;

        let stdout_reader = child.stdout.take().map(|stdout| {
            tokio::spawn(drain_lines(stdout, |line| debug!("[yt-dlp stdout] {line}")))
        });

        let stderr_reader = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut captured = String::new();
                drain_lines(stderr, |line| {
                    warn!("[yt-dlp stderr] {line}");
                    captured.push_str(line);
                    captured.push('\n');
                })
                .await;
                captured
            })
        });

        let status = child.wait().await.map_err(|source| DownloadError::Wait {
            platform: request.platform,
            source,
        })?;

        if let Some(reader) = stdout_reader {
            let _ = reader.await;
        }
        let stderr = match stderr_reader {
            Some(reader) => reader.await.unwrap_or_default(),
            None => String::new(),
        };

        info!("yt-dlp job {} exited with {}", job.id, status);

        if !status.success() {
            return Err(DownloadError::Failed {
                platform: request.platform,
                code: status.code(),
                stderr,
            });
        }

        Ok(job)
    }
}

/// Reads `pipe` to EOF line by line. Bytes that are not UTF-8 are replaced
/// rather than ending the read, so the child never sees a closed pipe.
async fn drain_lines<R>(pipe: R, mut on_line: impl FnMut(&str))
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => on_line(String::from_utf8_lossy(&buf).trim_end()),
            Err(error) => {
                warn!("Failed to read yt-dlp output: {error}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TOOL_LOCK;
    #[cfg(unix)]
    use crate::test_support::{write_chatty_tool, write_fake_tool};

    fn youtube(audio: bool) -> DownloadRequest {
        DownloadRequest::new(
            Platform::YouTube,
            Some("https://www.youtube.com/watch?v=dQw4w9WgXcQ"),
            audio,
            "127.0.0.1",
        )
        .unwrap()
    }

    fn downloader(tool: PathBuf, temp_dir: &Path, cookies_dir: &Path) -> Downloader {
        Downloader::new(
            ToolLocator::with_candidates(Some(tool), Vec::new()),
            CookieStore::new(cookies_dir),
            temp_dir,
            Admission::new(None),
        )
    }

    #[test]
    fn rejects_missing_and_malformed_urls() {
        for raw in [None, Some(""), Some("   "), Some("not-a-url"), Some("/watch?v=1")] {
            let error = DownloadRequest::new(Platform::Instagram, raw, false, "ip").unwrap_err();
            assert!(matches!(
                error,
                DownloadError::InvalidUrl {
                    platform: Platform::Instagram
                }
            ));
        }
    }

    #[test]
    fn instagram_is_always_video() {
        let request = DownloadRequest::new(
            Platform::Instagram,
            Some("https://www.instagram.com/reel/abc/"),
            true,
            "ip",
        )
        .unwrap();
        assert_eq!(request.mode, DownloadMode::Video);
        assert_eq!(youtube(true).mode, DownloadMode::Audio);
    }

    #[test]
    fn job_template_uses_id_prefix() {
        let job = DownloadJob::new(Path::new("/srv/temp"));
        assert_eq!(job.output_template, format!("/srv/temp/{}.%(ext)s", job.id));
        assert!(job.output_template.contains(&job.prefix()));
        assert_ne!(DownloadJob::new(Path::new("/srv/temp")).id, job.id);
    }

    #[test]
    fn youtube_audio_args() {
        let args = build_args(&youtube(true), "/t/x.%(ext)s", None);
        assert_eq!(
            args,
            vec![
                "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
                "--no-playlist",
                "--no-warnings",
                "--output",
                "/t/x.%(ext)s",
                "--restrict-filenames",
                "--extract-audio",
                "--audio-format",
                "mp3",
                "--audio-quality",
                "192K",
                "--embed-metadata",
            ]
        );
    }

    #[test]
    fn youtube_video_args_with_cookies() {
        let args = build_args(
            &youtube(false),
            "/t/x.%(ext)s",
            Some(Path::new("/c/youtube_cookies.txt")),
        );
        assert_eq!(
            &args[6..],
            &[
                "--cookies",
                "/c/youtube_cookies.txt",
                "--format",
                YOUTUBE_VIDEO_FORMAT,
                "--merge-output-format",
                "mp4",
            ]
        );
    }

    #[test]
    fn instagram_args_never_extract_audio() {
        let request = DownloadRequest::new(
            Platform::Instagram,
            Some("https://www.instagram.com/reel/abc/"),
            true,
            "ip",
        )
        .unwrap();
        let args = build_args(&request, "/t/x.%(ext)s", None);
        assert!(!args.iter().any(|arg| arg == "--extract-audio"));
        assert_eq!(
            &args[6..],
            &["--format", INSTAGRAM_VIDEO_FORMAT, "--merge-output-format", "mp4"]
        );
    }

    #[tokio::test]
    async fn bounded_admission_limits_permits() {
        let admission = Admission::new(Some(1));
        let first = admission.enter().await.unwrap();
        assert!(first.is_some());

        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            admission.enter(),
        )
        .await;
        assert!(blocked.is_err());

        drop(first);
        assert!(admission.enter().await.unwrap().is_some());
        assert!(Admission::new(None).enter().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_tool_is_reported_distinctly() {
        let _guard = TOOL_LOCK.lock().await;
        let dir = tempfile::tempdir().unwrap();
        let downloader = downloader(
            dir.path().join("no-such-yt-dlp"),
            dir.path(),
            dir.path(),
        );

        let error = downloader.run(&youtube(false)).await.unwrap_err();
        assert!(matches!(error, DownloadError::ToolMissing { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_run_leaves_prefixed_artifact() {
        let _guard = TOOL_LOCK.lock().await;
        let tools = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let cookies = tempfile::tempdir().unwrap();
        let tool = write_fake_tool(tools.path(), "mp3", 0);

        let job = downloader(tool, temp.path(), cookies.path())
            .run(&youtube(true))
            .await
            .unwrap();

        let expected = temp.path().join(format!("{}.mp3", job.id));
        assert_eq!(std::fs::read(expected).unwrap(), b"fake-media-bytes");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cookies_are_passed_when_present() {
        let _guard = TOOL_LOCK.lock().await;
        let tools = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let cookies = tempfile::tempdir().unwrap();
        let tool = write_fake_tool(tools.path(), "mp4", 0);
        CookieStore::new(cookies.path())
            .upload(Platform::YouTube, "cookies.txt", b"# Netscape HTTP Cookie File\n")
            .await
            .unwrap();

        downloader(tool.clone(), temp.path(), cookies.path())
            .run(&youtube(false))
            .await
            .unwrap();

        let recorded = std::fs::read_to_string(tool.with_extension("args")).unwrap();
        let expected = cookies.path().join("youtube_cookies.txt");
        assert!(recorded.lines().any(|line| line == "--cookies"));
        assert!(recorded.lines().any(|line| Path::new(line) == expected));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_carries_stderr() {
        let _guard = TOOL_LOCK.lock().await;
        let tools = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let tool = write_fake_tool(tools.path(), "mp4", 3);

        let error = downloader(tool, temp.path(), temp.path())
            .run(&youtube(false))
            .await
            .unwrap_err();

        match error {
            DownloadError::Failed {
                platform,
                code,
                stderr,
            } => {
                assert_eq!(platform, Platform::YouTube);
                assert_eq!(code, Some(3));
                assert!(stderr.contains("ERROR: simulated failure"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_utf8_output_does_not_break_the_pipe() {
        let _guard = TOOL_LOCK.lock().await;
        let tools = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let chatter = r#"printf '[download] caf\351.mp4\n'
i=0
while [ $i -lt 5000 ]; do echo "[download] progress $i"; i=$((i+1)); done
printf 'WARNING: caf\351 title\n' >&2
echo "WARNING: still talking" >&2"#;
        let tool = write_chatty_tool(tools.path(), "mp4", 0, chatter);

        let job = downloader(tool, temp.path(), temp.path())
            .run(&youtube(false))
            .await
            .unwrap();

        let expected = temp.path().join(format!("{}.mp4", job.id));
        assert_eq!(std::fs::read(expected).unwrap(), b"fake-media-bytes");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stderr_after_invalid_bytes_is_kept() {
        let _guard = TOOL_LOCK.lock().await;
        let tools = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let tool = write_chatty_tool(
            tools.path(),
            "mp4",
            2,
            r"printf 'ERROR: bad \351 byte\n' >&2",
        );

        let error = downloader(tool, temp.path(), temp.path())
            .run(&youtube(false))
            .await
            .unwrap_err();

        match error {
            DownloadError::Failed { code, stderr, .. } => {
                assert_eq!(code, Some(2));
                assert!(stderr.contains("ERROR: bad \u{FFFD} byte"));
                assert!(stderr.contains("ERROR: simulated failure"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
