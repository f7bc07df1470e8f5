use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;

/// Create a directory (and parents) if it doesn't exist yet.
pub fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory {}", path.display()))?;
    }
    Ok(())
}

/// Atomically write a value as pretty JSON: serialize, write to a temp file
/// next to the target, fsync, then rename over the target.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    use std::io::Write;

    let json = serde_json::to_vec_pretty(value).map_err(std::io::Error::other)?;

    let tmp = path.with_extension("json.tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}
