//! Per-feature agent session tokens (`.autopilot/sessions/<feature>.session`).
//!
//! A token lets the next invocation resume the previous agent conversation.
//! Contents are opaque here: stored trimmed, returned as-is.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

/// Location of the session file for `feature` under `root`.
pub fn session_path(root: &Path, feature: &str) -> PathBuf {
    root.join(".autopilot")
        .join("sessions")
        .join(format!("{feature}.session"))
}

/// Load the saved token. Missing, unreadable or empty files yield `None`.
pub fn load(root: &Path, feature: &str) -> Option<String> {
    let path = session_path(root, feature);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), err = %err, "ignoring unreadable session file");
            }
            return None;
        }
    };
    let token = contents.trim();
    if token.is_empty() {
        return None;
    }
    debug!(feature, "loaded session token");
    Some(token.to_string())
}

/// Atomically write `token` (trimmed), creating parent directories.
pub fn save(root: &Path, feature: &str, token: &str) -> Result<()> {
    let path = session_path(root, feature);
    debug!(path = %path.display(), "writing session token");
    write_atomic(&path, token.trim())
}

/// Remove the saved token. Absent files are not an error.
pub fn clear(root: &Path, feature: &str) -> Result<()> {
    let path = session_path(root, feature);
    match fs::remove_file(&path) {
        Ok(()) => {
            debug!(path = %path.display(), "cleared session token");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove session {}", path.display())),
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("session path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("session.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp session {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace session {}", path.display()))?;
    Ok(())
}
