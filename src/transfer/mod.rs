//! `rsync` wrappers moving files and folders to and from an SSH alias.
//!
//! Every operation first resolves the alias through an [`AliasSource`], then
//! runs `rsync -avz --progress` with the remote side written as
//! `<alias>:<path>`, so the user's SSH configuration supplies the host, port,
//! and key.

use std::ffi::OsString;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::shell::{CommandRunner, ProcessCommandRunner, ShellError};
use crate::ssh_config::{AliasSource, DiscoveryError};

mod config;

pub use config::{DEFAULT_RSYNC_FLAGS, TransferConfig, TransferConfigError};

/// Errors surfaced by file transfers.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransferError {
    /// Raised when no alias could be resolved.
    #[error("error retrieving SSH details: {0}")]
    Discovery(#[from] DiscoveryError),
    /// Raised when the local source does not exist.
    #[error("local path does not exist: {path}")]
    MissingLocalPath {
        /// Path that was expected to exist.
        path: Utf8PathBuf,
    },
    /// Raised when a file upload is given something other than a file.
    #[error("local path is not a file: {path}")]
    NotAFile {
        /// Offending path.
        path: Utf8PathBuf,
    },
    /// Raised when a folder upload is given something other than a directory.
    #[error("local path is not a directory: {path}")]
    NotADirectory {
        /// Offending path.
        path: Utf8PathBuf,
    },
    /// Raised when a local destination directory cannot be created.
    #[error("error creating directory {path}: {message}")]
    CreateDirectory {
        /// Directory that could not be created.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when `rsync` cannot be run.
    #[error(transparent)]
    Shell(#[from] ShellError),
    /// Raised when `rsync` completes with a non-zero exit code.
    #[error("{program} exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Command name used for the attempted operation.
        program: String,
        /// Exit status as reported by the OS.
        status: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the process.
        stderr: String,
    },
}

/// Direction and shape of a transfer, used for log messages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Operation {
    UploadFile,
    DownloadFile,
    UploadFolder,
    DownloadFolder,
}

impl Operation {
    const fn label(self) -> &'static str {
        match self {
            Self::UploadFile => "upload",
            Self::DownloadFile => "download",
            Self::UploadFolder => "folder upload",
            Self::DownloadFolder => "folder download",
        }
    }
}

/// Moves files between the local machine and the aliased remote host.
#[derive(Clone, Debug)]
pub struct Transfer<R, A> {
    config: TransferConfig,
    runner: R,
    aliases: A,
}

impl<A: AliasSource> Transfer<ProcessCommandRunner, A> {
    /// Convenience constructor that wires the real process runner.
    ///
    /// # Errors
    ///
    /// Returns [`TransferConfigError::InvalidConfig`] when validation fails.
    pub fn with_process_runner(
        config: TransferConfig,
        aliases: A,
    ) -> Result<Self, TransferConfigError> {
        Self::new(config, ProcessCommandRunner, aliases)
    }
}

impl<R: CommandRunner, A: AliasSource> Transfer<R, A> {
    /// Creates a transfer helper.
    ///
    /// # Errors
    ///
    /// Returns [`TransferConfigError::InvalidConfig`] when validation fails.
    pub fn new(
        config: TransferConfig,
        runner: R,
        aliases: A,
    ) -> Result<Self, TransferConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            runner,
            aliases,
        })
    }

    /// Uploads one file. A remote path ending in `/` receives the local file
    /// name.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError`] when the alias cannot be resolved, the local
    /// path is not an existing file, or `rsync` fails.
    pub fn upload_file(&self, local: &Utf8Path, remote: &str) -> Result<(), TransferError> {
        logged(Operation::UploadFile, || {
            let alias = self.aliases.resolve_alias()?;
            require_existing(local)?;
            if !local.is_file() {
                return Err(TransferError::NotAFile {
                    path: local.to_path_buf(),
                });
            }
            let remote_file = remote_file_path(local, remote);
            self.rsync(
                Operation::UploadFile,
                OsString::from(local.as_str()),
                remote_spec(&alias, &remote_file),
            )
        })
    }

    /// Downloads one file, creating the local parent directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError`] when the alias cannot be resolved, the
    /// parent directory cannot be created, or `rsync` fails.
    pub fn download_file(&self, remote: &str, local: &Utf8Path) -> Result<(), TransferError> {
        logged(Operation::DownloadFile, || {
            let alias = self.aliases.resolve_alias()?;
            if let Some(parent) = local.parent()
                && !parent.as_str().is_empty()
            {
                ensure_directory(parent)?;
            }
            self.rsync(
                Operation::DownloadFile,
                remote_spec(&alias, remote),
                OsString::from(local.as_str()),
            )
        })
    }

    /// Uploads the contents of a local directory into a remote directory.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError`] when the alias cannot be resolved, the local
    /// path is not an existing directory, or `rsync` fails.
    pub fn upload_folder(&self, local: &Utf8Path, remote: &str) -> Result<(), TransferError> {
        logged(Operation::UploadFolder, || {
            let alias = self.aliases.resolve_alias()?;
            require_existing(local)?;
            if !local.is_dir() {
                return Err(TransferError::NotADirectory {
                    path: local.to_path_buf(),
                });
            }
            self.rsync(
                Operation::UploadFolder,
                OsString::from(with_trailing_slash(local.as_str())),
                remote_spec(&alias, &with_trailing_slash(remote)),
            )
        })
    }

    /// Downloads the contents of a remote directory into a local directory,
    /// creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError`] when the alias cannot be resolved, the local
    /// directory cannot be created, or `rsync` fails.
    pub fn download_folder(&self, remote: &str, local: &Utf8Path) -> Result<(), TransferError> {
        logged(Operation::DownloadFolder, || {
            let alias = self.aliases.resolve_alias()?;
            ensure_directory(local)?;
            self.rsync(
                Operation::DownloadFolder,
                remote_spec(&alias, &with_trailing_slash(remote)),
                OsString::from(with_trailing_slash(local.as_str())),
            )
        })
    }

    fn rsync(
        &self,
        operation: Operation,
        source: OsString,
        destination: OsString,
    ) -> Result<(), TransferError> {
        let mut args: Vec<OsString> = DEFAULT_RSYNC_FLAGS.iter().map(OsString::from).collect();
        info!(
            operation = operation.label(),
            source = %source.to_string_lossy(),
            destination = %destination.to_string_lossy(),
            "starting transfer"
        );
        args.push(source);
        args.push(destination);

        let output = self.runner.run(&self.config.rsync_bin, &args)?;
        if !output.stdout.is_empty() {
            debug!(operation = operation.label(), stdout = %output.stdout, "rsync output");
        }
        if output.is_success() {
            info!(operation = operation.label(), "transfer complete");
            return Ok(());
        }

        Err(TransferError::CommandFailure {
            program: self.config.rsync_bin.clone(),
            status: output.code,
            status_text: output.status_text(),
            stderr: output.stderr,
        })
    }
}

fn logged<F>(operation: Operation, transfer: F) -> Result<(), TransferError>
where
    F: FnOnce() -> Result<(), TransferError>,
{
    transfer().inspect_err(|err| {
        error!(operation = operation.label(), error = %err, "transfer failed");
    })
}

fn require_existing(path: &Utf8Path) -> Result<(), TransferError> {
    if path.exists() {
        return Ok(());
    }
    Err(TransferError::MissingLocalPath {
        path: path.to_path_buf(),
    })
}

fn ensure_directory(path: &Utf8Path) -> Result<(), TransferError> {
    if path.is_dir() {
        return Ok(());
    }
    match Dir::create_ambient_dir_all(path, ambient_authority()) {
        Ok(()) => {
            info!(path = %path, "created directory");
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        Err(err) => Err(TransferError::CreateDirectory {
            path: path.to_path_buf(),
            message: err.to_string(),
        }),
    }
}

/// Appends the local file name when `remote` names a directory.
fn remote_file_path(local: &Utf8Path, remote: &str) -> String {
    match local.file_name() {
        Some(name) if remote.ends_with('/') => format!("{remote}{name}"),
        _ => remote.to_owned(),
    }
}

/// Forces "copy the contents" semantics for `rsync`.
fn with_trailing_slash(path: &str) -> String {
    format!("{}/", path.trim_end_matches('/'))
}

fn remote_spec(alias: &str, path: &str) -> OsString {
    OsString::from(format!("{alias}:{path}"))
}

#[cfg(test)]
mod tests;
