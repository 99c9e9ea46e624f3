//! Startup script executed inside the container when an instance boots.
//!
//! The default script redirects its own output to `/root/onstart.log`, clears
//! any stale VS Code server cache, and logs into the Hugging Face CLI with the
//! token exported in the container environment. A file can replace it.

use thiserror::Error;

use crate::paths::{expand_path, read_to_string_ambient};

/// Path the startup script logs to inside the container.
pub const ONSTART_LOG_PATH: &str = "/root/onstart.log";

/// Script run on container start unless a file overrides it.
pub const DEFAULT_ONSTART_SCRIPT: &str = r#"#!/bin/bash
set -e
exec > /root/onstart.log 2>&1
echo "--- Starting onstart script ---"
echo "[+] Removing previous .vscode-server directory"
rm -rf /root/.vscode-server
echo "[+] Logging into Hugging Face CLI..."
huggingface-cli login --token "${HUGGING_FACE_TOKEN}" --add-to-git-credential
echo "[+] Hugging Face login complete."
"#;

/// Errors raised while resolving the startup script.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum StartupError {
    /// Raised when the configured path is empty or only whitespace.
    #[error("startup script path must not be empty")]
    PathEmpty,
    /// Raised when the file resolves to empty or only whitespace.
    #[error("startup script file `{path}` is empty")]
    FileEmpty {
        /// Expanded path of the empty file.
        path: String,
    },
    /// Raised when reading the file fails.
    #[error("failed to read startup script `{path}`: {message}")]
    FileRead {
        /// Expanded path that failed to read.
        path: String,
        /// Underlying error message.
        message: String,
    },
}

/// Returns the startup script from `file`, or the built-in script when no
/// file is configured.
///
/// # Errors
///
/// Returns [`StartupError`] when the path is blank or the file is unreadable
/// or empty.
pub fn resolve_startup_script(file: Option<&str>) -> Result<String, StartupError> {
    let Some(path) = file else {
        return Ok(DEFAULT_ONSTART_SCRIPT.to_owned());
    };
    if path.trim().is_empty() {
        return Err(StartupError::PathEmpty);
    }

    let expanded = expand_path(path.trim());
    let content = read_to_string_ambient(&expanded).map_err(|message| StartupError::FileRead {
        path: expanded.to_string(),
        message,
    })?;
    if content.trim().is_empty() {
        return Err(StartupError::FileEmpty {
            path: expanded.to_string(),
        });
    }
    Ok(content)
}

/// Returns true when `logs` show that the startup script got far enough to
/// create its log file.
#[must_use]
pub fn startup_log_present(logs: &str) -> bool {
    logs.contains(ONSTART_LOG_PATH)
}
