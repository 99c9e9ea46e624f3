//! Transfer configuration structures and validation.
//!
//! [`TransferConfig`] is loaded via `ortho-config`, which merges defaults,
//! configuration files, and environment variables.

use std::ffi::OsString;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::paths::expand_path;

/// Flags passed to every `rsync` invocation.
pub const DEFAULT_RSYNC_FLAGS: [&str; 2] = ["-avz", "--progress"];

/// `rsync` and SSH settings used by file transfers.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "VASTDEV_TRANSFER",
    discovery(
        app_name = "vastdev",
        env_var = "VASTDEV_CONFIG_PATH",
        config_file_name = "vastdev.toml",
        dotfile_name = ".vastdev.toml",
        project_file_name = "vastdev.toml"
    )
)]
pub struct TransferConfig {
    /// Path to the `rsync` executable.
    #[ortho_config(default = "rsync".to_owned())]
    pub rsync_bin: String,
    /// Directory whose `config` file lists the SSH host aliases.
    #[ortho_config(default = "~/.ssh".to_owned())]
    pub ssh_dir: String,
}

/// Errors raised when loading the transfer configuration.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum TransferConfigError {
    /// Indicates that parsing or merging configuration layers failed.
    #[error("transfer configuration parsing failed: {0}")]
    Parse(String),
    /// Raised when a required value is empty.
    #[error("missing {field}: set VASTDEV_TRANSFER_{env_suffix} or add {field} to vastdev.toml", env_suffix = field.to_uppercase())]
    InvalidConfig {
        /// Configuration field that failed validation.
        field: String,
    },
}

impl TransferConfig {
    /// Loads configuration using defaults, configuration files, and
    /// environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`TransferConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, TransferConfigError> {
        Self::load_from_iter([OsString::from("vastdev")])
            .map_err(|err| TransferConfigError::Parse(err.to_string()))
    }

    /// Ensures required values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`TransferConfigError::InvalidConfig`] naming the empty field.
    pub fn validate(&self) -> Result<(), TransferConfigError> {
        Self::require_value(&self.rsync_bin, "rsync_bin")?;
        Self::require_value(&self.ssh_dir, "ssh_dir")?;
        Ok(())
    }

    fn require_value(value: &str, field: &str) -> Result<(), TransferConfigError> {
        if value.trim().is_empty() {
            return Err(TransferConfigError::InvalidConfig {
                field: field.to_owned(),
            });
        }
        Ok(())
    }

    /// Root SSH configuration file, `<ssh_dir>/config`.
    #[must_use]
    pub fn ssh_config_path(&self) -> Utf8PathBuf {
        expand_path(&self.ssh_dir).join("config")
    }
}
