//! Crash-safe binary snapshots
//!
//! Actors report state changes through a `Heartbeat` callback; whoever owns
//! the callback decides when to actually flush. Snapshots are written to a
//! temporary file first, the previous snapshot is kept as a `.bak` sibling,
//! and loading falls back to the backup when the primary fails to decode.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{CarouselError, Result};

/// Fired by actors after any state change worth persisting.
pub type Heartbeat = Arc<dyn Fn() + Send + Sync>;

/// A heartbeat that drops every signal. Useful in tests and for callers that
/// manage persistence themselves.
pub fn noop_heartbeat() -> Heartbeat {
    Arc::new(|| {})
}

/// A heartbeat wired to a [`Notify`], for debounced flush loops.
pub fn notify_heartbeat() -> (Heartbeat, Arc<Notify>) {
    let notify = Arc::new(Notify::new());
    let signal = notify.clone();
    let heartbeat: Heartbeat = Arc::new(move || {
        signal.notify_one();
    });
    (heartbeat, notify)
}

fn backup_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".bak");
    PathBuf::from(os)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Write a snapshot atomically: encode to a temp file, demote the current
/// primary to `.bak`, then rename the temp file into place.
pub fn save_snapshot<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let encoded = bincode::serialize(value)
        .map_err(|e| CarouselError::Persistence(format!("encode failed: {}", e)))?;

    let tmp = tmp_path(path);
    std::fs::write(&tmp, &encoded)?;

    if path.exists() {
        std::fs::rename(path, backup_path(path))?;
    }
    std::fs::rename(&tmp, path)?;

    debug!(path = %path.display(), bytes = encoded.len(), "snapshot written");
    Ok(())
}

/// Load a snapshot, falling back to the `.bak` sibling when the primary is
/// missing or corrupt. Returns `Ok(None)` when neither file yields a value.
pub fn load_snapshot<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    for candidate in [path.to_path_buf(), backup_path(path)] {
        let bytes = match std::fs::read(&candidate) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        match bincode::deserialize(&bytes) {
            Ok(value) => {
                debug!(path = %candidate.display(), "snapshot loaded");
                return Ok(Some(value));
            }
            Err(e) => {
                warn!(path = %candidate.display(), error = %e, "snapshot failed to decode");
            }
        }
    }
    Ok(None)
}
