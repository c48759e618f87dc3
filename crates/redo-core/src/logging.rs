//! Tracing bootstrap for embedders that don't install their own subscriber.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::Level;

use crate::error::RedoError;

/// Default log file location, under the invoking user's home directory.
pub fn default_log_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".redo")
        .join("redo.log")
}

/// Install a process-wide fmt subscriber at the given level.
///
/// With `log_file` set, events append to that file (parent directories are
/// created as needed); otherwise they go to stderr. When a subscriber is
/// already installed (by an earlier call or by the embedding application),
/// this quietly leaves it in place.
pub fn init(level: Level, log_file: Option<&Path>) -> Result<(), RedoError> {
    match log_file {
        Some(path) => {
            if let Some(dir) = path.parent()
                && !dir.as_os_str().is_empty()
            {
                fs::create_dir_all(dir).map_err(|e| {
                    RedoError::Configure(format!("create log dir {}: {e}", dir.display()))
                })?;
            }
            let file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(path)
                .map_err(|e| {
                    RedoError::Configure(format!("open log file {}: {e}", path.display()))
                })?;
            let _ = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::fmt().with_max_level(level).try_init();
        }
    }
    Ok(())
}
