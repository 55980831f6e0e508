use std::path::{Path, PathBuf};

const BARE_COMMAND: &str = "yt-dlp";
const LINUX_VENV_PATH: &str = "/root/project/venv/bin/yt-dlp";

/// Resolves which `yt-dlp` executable to spawn.
///
/// An explicit override always wins. Otherwise the candidates are checked in
/// order and the first existing file is used; if none exist the bare command
/// name is returned and resolution is left to the `PATH` search at spawn time.
/// Nothing here checks that the result is actually executable.
#[derive(Debug, Clone)]
pub struct ToolLocator {
    override_path: Option<PathBuf>,
    candidates: Vec<PathBuf>,
}

impl ToolLocator {
    pub fn new(override_path: Option<PathBuf>) -> Self {
        Self::with_candidates(override_path, default_candidates(std::env::var_os("APPDATA")))
    }

    pub fn with_candidates(override_path: Option<PathBuf>, candidates: Vec<PathBuf>) -> Self {
        Self {
            override_path,
            candidates,
        }
    }

    pub fn locate(&self) -> PathBuf {
        if let Some(path) = &self.override_path {
            return path.clone();
        }

        self.candidates
            .iter()
            .find(|candidate| candidate.is_file())
            .cloned()
            .unwrap_or_else(|| PathBuf::from(BARE_COMMAND))
    }

    /// Best-effort availability for health reporting: the file exists, or the
    /// path is a bare command that will be looked up on `PATH`.
    pub fn is_available(path: &Path) -> bool {
        path.exists()
            || path
                .parent()
                .is_some_and(|parent| parent.as_os_str().is_empty())
    }
}

fn default_candidates(app_data: Option<std::ffi::OsString>) -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from(LINUX_VENV_PATH)];
    if let Some(app_data) = app_data {
        candidates.push(
            PathBuf::from(app_data)
                .join("Python")
                .join("Python313")
                .join("Scripts")
                .join("yt-dlp.exe"),
        );
    }
    candidates
}
