//! Atomic JSON persistence shared by the session, cron, and pairing stores.
//!
//! Write path: serialize to `<path>.<pid>.<rand>.tmp`, rename over the
//! final file, then best-effort copy to `<path>.bak`. A reader racing a
//! writer sees either the old or the new file, never a partial one.

use std::path::Path;

use anyhow::{Context, Result};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub fn save_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    match write_and_rename(path, &json) {
        Ok(()) => {}
        Err(err) => {
            // Missing parent gets one mkdir+retry; anything else surfaces.
            let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
            match parent {
                Some(parent) if !parent.exists() => {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("creating {}", parent.display()))?;
                    write_and_rename(path, &json)?;
                }
                _ => return Err(err),
            }
        }
    }

    let bak = path.with_extension("json.bak");
    if let Err(err) = std::fs::copy(path, &bak) {
        tracing::debug!("backup copy to {} failed: {err}", bak.display());
    }
    Ok(())
}

fn write_and_rename(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_file_name(format!(
        "{}.{}.{:08x}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "store".into()),
        std::process::id(),
        rand::thread_rng().gen::<u32>(),
    ));
    std::fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;
    if let Err(err) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(err)
            .with_context(|| format!("renaming {} over {}", tmp.display(), path.display()));
    }
    Ok(())
}

/// Load a JSON file, treating a missing or unreadable file as the default.
pub fn load_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    match std::fs::read(path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!("failed to parse {}: {err}; starting empty", path.display());
                T::default()
            }
        },
        Err(_) => T::default(),
    }
}

pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let value =
        serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(value))
}
