use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};
use serde::Serialize;

static TEMP_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Serializes `value` as pretty JSON and swaps it into `path` via temp file + rename.
///
/// Readers never observe a half-written registry file.
pub fn write_json_atomic<T>(path: &Path, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
{
    if path.as_os_str().is_empty() {
        bail!("registry path cannot be empty");
    }
    if path.is_dir() {
        bail!("registry path '{}' is a directory", path.display());
    }

    let mut rendered =
        serde_json::to_string_pretty(value).context("failed to serialize registry payload")?;
    rendered.push('\n');

    let parent_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent_dir)
        .with_context(|| format!("failed to create {}", parent_dir.display()))?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("services.json");
    let temp_path = parent_dir.join(format!(
        ".{file_name}.tmp-{}-{}",
        std::process::id(),
        TEMP_SEQUENCE.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::write(&temp_path, rendered.as_bytes())
        .with_context(|| format!("failed to write {}", temp_path.display()))?;
    if let Err(error) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(error).with_context(|| {
            format!(
                "failed to move {} into place at {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}
