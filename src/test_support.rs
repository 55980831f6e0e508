use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

/// Serializes tests that write an executable and then spawn it, so no other
/// test forks while a script is still open for writing.
pub static TOOL_LOCK: Mutex<()> = Mutex::const_new(());

/// Writes a stand-in for `yt-dlp` that records its arguments next to itself,
/// writes `fake-media-bytes` to the `--output` template with `%(ext)s`
/// replaced by `ext` (nothing when `ext` is empty) and exits with `exit_code`.
#[cfg(unix)]
pub fn write_fake_tool(dir: &Path, ext: &str, exit_code: i32) -> PathBuf {
    write_chatty_tool(dir, ext, exit_code, "")
}

/// Like [`write_fake_tool`], but runs the shell snippet `chatter` first.
#[cfg(unix)]
pub fn write_chatty_tool(dir: &Path, ext: &str, exit_code: i32, chatter: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let script = format!(
        r#"#!/bin/sh
printf '%s\n' "$@" > "$0.args"
{chatter}
out=""
prev=""
for arg in "$@"; do
  if [ "$prev" = "--output" ]; then out="$arg"; fi
  prev="$arg"
done
echo "[download] Destination: $out"
echo "WARNING: simulated notice" >&2
if [ {exit_code} -ne 0 ]; then
  echo "ERROR: simulated failure" >&2
  exit {exit_code}
fi
if [ -n "{ext}" ]; then
  target=$(printf '%s' "$out" | sed 's/%(ext)s/{ext}/')
  printf 'fake-media-bytes' > "$target"
fi
exit 0
"#
    );

    let path = dir.join("yt-dlp");
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
