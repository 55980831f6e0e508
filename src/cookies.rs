use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;

use crate::download::Platform;

pub const MAX_COOKIE_BYTES: usize = 1024 * 1024;
const COOKIE_EXTENSION: &str = ".txt";

#[derive(Debug, Error)]
pub enum CookieError {
    #[error("No cookies file uploaded")]
    MissingFile,
    #[error("Only .txt files are allowed for cookies")]
    WrongType,
    #[error("Cookies file too large (max 1MB)")]
    TooLarge,
    #[error("No {} cookies file found", .platform.label())]
    NotFound { platform: Platform },
    #[error("Failed to access {} cookies file: {source}", .platform.label())]
    Io {
        platform: Platform,
        #[source]
        source: std::io::Error,
    },
}

/// Metadata of the stored cookie file for one platform.
#[derive(Debug, Clone)]
pub struct CookieFile {
    pub platform: Platform,
    pub path: PathBuf,
    pub size: u64,
    pub uploaded: DateTime<Utc>,
}

impl CookieFile {
    pub fn file_name(&self) -> &'static str {
        self.platform.cookie_file_name()
    }
}

/// One fixed-name cookie file per platform inside a single directory.
#[derive(Debug, Clone)]
pub struct CookieStore {
    dir: PathBuf,
}

impl CookieStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, platform: Platform) -> PathBuf {
        self.dir.join(platform.cookie_file_name())
    }

    /// Path handed to `--cookies`, present only while the slot is filled.
    pub async fn active_path(&self, platform: Platform) -> Option<PathBuf> {
        let path = self.path_for(platform);
        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Some(path),
            _ => None,
        }
    }

    pub async fn status(&self, platform: Platform) -> Result<Option<CookieFile>, CookieError> {
        let path = self.path_for(platform);
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Ok(None),
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CookieError::Io { platform, source }),
        };

        let uploaded = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .map_err(|source| CookieError::Io { platform, source })?;

        Ok(Some(CookieFile {
            platform,
            path,
            size: metadata.len(),
            uploaded,
        }))
    }

    /// Replaces the platform's slot wholesale. The contents are not inspected.
    pub async fn upload(
        &self,
        platform: Platform,
        original_name: &str,
        bytes: &[u8],
    ) -> Result<CookieFile, CookieError> {
        validate_upload(original_name, bytes.len())?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| CookieError::Io { platform, source })?;
        let path = self.path_for(platform);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|source| CookieError::Io { platform, source })?;
        info!(
            "Stored {} cookies file {} ({} bytes)",
            platform.label(),
            path.display(),
            bytes.len()
        );

        self.status(platform).await?.ok_or(CookieError::NotFound { platform })
    }

    pub async fn delete(&self, platform: Platform) -> Result<(), CookieError> {
        match tokio::fs::remove_file(self.path_for(platform)).await {
            Ok(()) => {
                info!("Deleted {} cookies file", platform.label());
                Ok(())
            }
            Err(error) if error.kind() == ErrorKind::NotFound => {
                Err(CookieError::NotFound { platform })
            }
            Err(source) => Err(CookieError::Io { platform, source }),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

pub fn validate_upload(original_name: &str, size: usize) -> Result<(), CookieError> {
    if !original_name.ends_with(COOKIE_EXTENSION) {
        return Err(CookieError::WrongType);
    }
    if size > MAX_COOKIE_BYTES {
        return Err(CookieError::TooLarge);
    }
    Ok(())
}
