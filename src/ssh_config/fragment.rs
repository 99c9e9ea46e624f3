//! Per-instance SSH configuration fragments under `~/.ssh/config.d/`.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tracing::warn;

use super::parser;
use crate::backend::ConnectionDetails;

/// Directory, relative to the SSH directory, that receives fragments.
pub const FRAGMENT_DIR: &str = "config.d";
/// File name prefix for generated fragments.
pub const FRAGMENT_PREFIX: &str = "vast-ai-";

/// Errors raised while writing a fragment.
#[derive(Debug, Error)]
pub enum FragmentError {
    /// Raised when the alias cannot be used as a host name or file name.
    #[error("invalid host alias '{alias}': must be non-empty without whitespace or '/'")]
    InvalidAlias {
        /// Alias that was rejected.
        alias: String,
    },
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
}

/// Writes local SSH access configuration for a ready instance.
pub trait AccessWriter {
    /// Writes a host block binding `alias` to `details` and returns the file
    /// that was written.
    ///
    /// # Errors
    ///
    /// Returns [`FragmentError`] when the alias is unusable or the file cannot
    /// be written.
    fn write_access(
        &self,
        alias: &str,
        details: &ConnectionDetails,
    ) -> Result<Utf8PathBuf, FragmentError>;
}

/// Renders the host block written for an instance.
#[must_use]
pub fn render_fragment(
    alias: &str,
    details: &ConnectionDetails,
    user: &str,
    connect_timeout_secs: u64,
) -> String {
    format!(
        concat!(
            "Host {alias}\n",
            "    HostName {host}\n",
            "    User {user}\n",
            "    Port {port}\n",
            "    StrictHostKeyChecking no\n",
            "    UserKnownHostsFile /dev/null\n",
            "    ConnectTimeout {timeout}\n",
        ),
        alias = alias,
        host = details.host,
        user = user,
        port = details.port,
        timeout = connect_timeout_secs,
    )
}

/// Writes fragments into `<ssh_dir>/config.d/vast-ai-<alias>`.
#[derive(Clone, Debug)]
pub struct FragmentStore {
    ssh_dir: Utf8PathBuf,
    user: String,
    connect_timeout_secs: u64,
}

impl FragmentStore {
    /// Creates a store rooted at `ssh_dir`.
    pub fn new(
        ssh_dir: impl Into<Utf8PathBuf>,
        user: impl Into<String>,
        connect_timeout_secs: u64,
    ) -> Self {
        Self {
            ssh_dir: ssh_dir.into(),
            user: user.into(),
            connect_timeout_secs,
        }
    }

    /// Returns the path a fragment for `alias` is written to.
    #[must_use]
    pub fn fragment_path(&self, alias: &str) -> Utf8PathBuf {
        self.ssh_dir
            .join(FRAGMENT_DIR)
            .join(format!("{FRAGMENT_PREFIX}{alias}"))
    }

    fn validate_alias(alias: &str) -> Result<(), FragmentError> {
        if alias.is_empty() || alias.contains('/') || alias.chars().any(char::is_whitespace) {
            return Err(FragmentError::InvalidAlias {
                alias: alias.to_owned(),
            });
        }
        Ok(())
    }

    /// Logs a warning when the root `config` does not include the fragment
    /// directory, since `ssh` would then ignore the new fragment.
    fn warn_if_not_included(&self) {
        let root = self.ssh_dir.join("config");
        let Ok(contents) = parser::read(&root) else {
            warn!(path = %root, "no ssh config found; add `Include {FRAGMENT_DIR}/*` to use the alias");
            return;
        };
        let included = parser::include_patterns(&contents)
            .iter()
            .any(|pattern| pattern.contains(FRAGMENT_DIR));
        if !included {
            warn!(path = %root, "ssh config does not include {FRAGMENT_DIR}/; add `Include {FRAGMENT_DIR}/*`");
        }
    }
}

impl AccessWriter for FragmentStore {
    fn write_access(
        &self,
        alias: &str,
        details: &ConnectionDetails,
    ) -> Result<Utf8PathBuf, FragmentError> {
        Self::validate_alias(alias)?;
        let dir_path = self.ssh_dir.join(FRAGMENT_DIR);
        create_dir(&dir_path)?;

        let dir = Dir::open_ambient_dir(&dir_path, ambient_authority()).map_err(|err| {
            FragmentError::Io {
                path: dir_path.clone(),
                message: err.to_string(),
            }
        })?;

        let file_name = format!("{FRAGMENT_PREFIX}{alias}");
        let rendered = render_fragment(alias, details, &self.user, self.connect_timeout_secs);
        let path = dir_path.join(&file_name);
        dir.write(&file_name, rendered)
            .map_err(|err| FragmentError::Io {
                path: path.clone(),
                message: err.to_string(),
            })?;

        self.warn_if_not_included();
        Ok(path)
    }
}

fn create_dir(path: &Utf8Path) -> Result<(), FragmentError> {
    match Dir::create_ambient_dir_all(path, ambient_authority()) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(FragmentError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }),
    }
}
