//! Command-line interface definitions for the `vastdev` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser};

/// Top-level CLI for the `vastdev` binary.
#[derive(Debug, Parser)]
#[command(
    name = "vastdev",
    about = "Rent a Vast.ai GPU instance, verify SSH, and move files to it",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Rent an instance, wait for SSH, and write the local SSH alias.
    #[command(
        name = "up",
        about = "Rent an instance, wait for SSH, and write the local SSH alias"
    )]
    Up(UpCommand),
    /// Print the startup logs of an instance.
    #[command(name = "logs", about = "Print the startup logs of an instance")]
    Logs(LogsCommand),
    /// List host aliases declared in the SSH configuration.
    #[command(name = "hosts", about = "List host aliases declared in the SSH configuration")]
    Hosts,
    /// Upload one file to the remote host.
    #[command(name = "upload-file", about = "Upload one file to the remote host")]
    UploadFile(TransferCommand),
    /// Download one file from the remote host.
    #[command(name = "download-file", about = "Download one file from the remote host")]
    DownloadFile(TransferCommand),
    /// Upload the contents of a folder to the remote host.
    #[command(
        name = "upload-folder",
        about = "Upload the contents of a folder to the remote host"
    )]
    UploadFolder(TransferCommand),
    /// Download the contents of a remote folder.
    #[command(name = "download-folder", about = "Download the contents of a remote folder")]
    DownloadFolder(TransferCommand),
}

/// Arguments for the `vastdev up` subcommand.
#[derive(Debug, Args)]
pub(crate) struct UpCommand {
    /// Override the SSH alias written for the new instance.
    #[arg(long, value_name = "NAME")]
    pub(crate) alias: Option<String>,
}

/// Arguments for the `vastdev logs` subcommand.
#[derive(Debug, Args)]
pub(crate) struct LogsCommand {
    /// Marketplace instance id.
    #[arg(value_name = "INSTANCE_ID")]
    pub(crate) instance_id: u64,
}

/// Arguments shared by the four transfer subcommands.
#[derive(Debug, Args)]
pub(crate) struct TransferCommand {
    /// Source path. Remote paths are given without the `alias:` prefix.
    #[arg(value_name = "SRC")]
    pub(crate) source: String,
    /// Destination path. Remote paths are given without the `alias:` prefix.
    #[arg(value_name = "DST")]
    pub(crate) destination: String,
    /// Use this SSH alias instead of choosing one interactively.
    #[arg(long, value_name = "ALIAS")]
    pub(crate) host: Option<String>,
}
