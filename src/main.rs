//! Binary entry point for the `vastdev` CLI.

mod cli;

use std::io::{self, Write};
use std::process;

use camino::Utf8PathBuf;
use clap::Parser;
use thiserror::Error;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use vastdev::backend::LogFetch;
use vastdev::provision::BoxedFailure;
use vastdev::{
    ConfigError, DiscoveryError, HostDiscovery, InstanceHandle, ProvisionOutcome, ProvisionPlan,
    ProvisioningWorkflow, SelectorChoice, SshProbe, StartupError, Transfer, TransferConfig,
    TransferError, VastBackend, VastBackendError, VastConfig, discover_hosts,
    resolve_startup_script, startup_log_present,
};

use cli::{Cli, LogsCommand, TransferCommand, UpCommand};

const LOG_BANNER_FILL: &str = "=========================";

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Backend(#[from] VastBackendError),
    #[error("startup script error: {0}")]
    Startup(#[from] StartupError),
    #[error("{0}")]
    Discovery(#[from] DiscoveryError),
    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),
    #[error("provisioning failed: {0}")]
    Provision(BoxedFailure<VastBackendError>),
}

impl From<ConfigError> for CliError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Direction {
    UploadFile,
    DownloadFile,
    UploadFolder,
    DownloadFolder,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vastdev=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    match cli {
        Cli::Up(args) => up(args).await,
        Cli::Logs(args) => logs(args).await,
        Cli::Hosts => hosts(),
        Cli::UploadFile(args) => transfer(Direction::UploadFile, args),
        Cli::DownloadFile(args) => transfer(Direction::DownloadFile, args),
        Cli::UploadFolder(args) => transfer(Direction::UploadFolder, args),
        Cli::DownloadFolder(args) => transfer(Direction::DownloadFolder, args),
    }
}

async fn up(args: UpCommand) -> Result<(), CliError> {
    let mut config = VastConfig::load_without_cli_args()?;
    if let Some(alias) = args.alias {
        config.ssh_alias = alias;
    }
    config.validate()?;

    let hugging_face_token = config.require_hugging_face_token()?;
    let public_key = config.read_public_key()?;
    let onstart = resolve_startup_script(config.onstart_file.as_deref())?;
    let plan = ProvisionPlan {
        query: config.offer_query()?,
        launch: config.launch_request(&public_key, &hugging_face_token, onstart),
        public_key: Some(public_key),
    };

    let backend = VastBackend::new(&config)?;
    let probe = SshProbe::new(config.probe_settings());
    let workflow = ProvisioningWorkflow::new(
        backend,
        probe,
        config.fragment_store(),
        config.workflow_settings(),
    );

    match workflow.execute(&plan).await {
        Ok(outcome) => {
            write_success(io::stdout(), &outcome);
            Ok(())
        }
        Err(failure) => {
            if failure.instance.is_some() {
                write_logs(io::stdout(), failure.startup_log.as_deref());
            }
            Err(CliError::Provision(failure))
        }
    }
}

async fn logs(LogsCommand { instance_id }: LogsCommand) -> Result<(), CliError> {
    let config = VastConfig::load_without_cli_args()?;
    let backend = VastBackend::new(&config)?;
    let handle = InstanceHandle { id: instance_id };

    let contents = backend.fetch_logs(&handle).await?;
    write_logs(io::stdout(), Some(&contents));
    if !startup_log_present(&contents) {
        warn!(
            instance_id = handle.id,
            "startup log was not found; the onstart script may not have run"
        );
    }
    Ok(())
}

fn hosts() -> Result<(), CliError> {
    let config = load_transfer_config()?;
    let aliases = discover_hosts(&config.ssh_config_path())?;
    let mut stdout = io::stdout();
    for alias in aliases {
        writeln!(stdout, "{alias}").ok();
    }
    Ok(())
}

fn transfer(direction: Direction, args: TransferCommand) -> Result<(), CliError> {
    let config = load_transfer_config()?;
    let aliases = HostDiscovery::new(
        config.ssh_config_path(),
        SelectorChoice::from_option(args.host),
    );
    let helper = Transfer::with_process_runner(config, aliases)
        .map_err(|err| CliError::Config(err.to_string()))?;

    let outcome = match direction {
        Direction::UploadFile => {
            helper.upload_file(&Utf8PathBuf::from(args.source), &args.destination)
        }
        Direction::DownloadFile => {
            helper.download_file(&args.source, &Utf8PathBuf::from(args.destination))
        }
        Direction::UploadFolder => {
            helper.upload_folder(&Utf8PathBuf::from(args.source), &args.destination)
        }
        Direction::DownloadFolder => {
            helper.download_folder(&args.source, &Utf8PathBuf::from(args.destination))
        }
    };
    outcome.map_err(CliError::from)
}

fn load_transfer_config() -> Result<TransferConfig, CliError> {
    let config = TransferConfig::load_without_cli_args()
        .map_err(|err| CliError::Config(err.to_string()))?;
    config
        .validate()
        .map_err(|err| CliError::Config(err.to_string()))?;
    Ok(config)
}

fn write_success(mut target: impl Write, outcome: &ProvisionOutcome) {
    writeln!(target, "Instance {} is ready.", outcome.instance.id).ok();
    writeln!(
        target,
        "Connect with: ssh {}   ({} {}:{})",
        outcome.alias,
        outcome.details.mode.as_str(),
        outcome.details.host,
        outcome.details.port
    )
    .ok();
    writeln!(target, "SSH config written to {}", outcome.fragment_path).ok();
}

fn write_logs(mut target: impl Write, logs: Option<&str>) {
    writeln!(target, "{LOG_BANNER_FILL} INSTANCE LOGS {LOG_BANNER_FILL}").ok();
    match logs.map(str::trim) {
        Some(contents) if !contents.is_empty() => {
            writeln!(target, "{contents}").ok();
        }
        _ => {
            writeln!(target, "Logs were empty.").ok();
        }
    }
    writeln!(target, "{LOG_BANNER_FILL}{LOG_BANNER_FILL}{LOG_BANNER_FILL}").ok();
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use vastdev::{ConnectionDetails, ConnectionMode, Offer};

    fn render<F: FnOnce(&mut Vec<u8>)>(write: F) -> String {
        let mut buf = Vec::new();
        write(&mut buf);
        String::from_utf8(buf).expect("utf8")
    }

    #[test]
    fn write_logs_wraps_contents_in_banners() {
        let rendered = render(|buf| write_logs(buf, Some("booting\nready\n")));

        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(
            lines.first().copied(),
            Some("========================= INSTANCE LOGS =========================")
        );
        assert!(rendered.contains("booting\nready\n"));
        assert_eq!(lines.last().map(|line| line.len()), Some(75));
    }

    #[test]
    fn write_logs_reports_empty_logs() {
        let rendered = render(|buf| write_logs(buf, Some("  \n")));

        assert!(rendered.contains("Logs were empty."));
    }

    #[test]
    fn write_logs_reports_missing_logs() {
        let rendered = render(|buf| write_logs(buf, None));

        assert!(rendered.contains("Logs were empty."));
    }

    #[test]
    fn write_success_names_alias_and_endpoint() {
        let outcome = ProvisionOutcome {
            offer: Offer {
                id: 9,
                dph_total: 0.2,
                gpu_name: "RTX_A5000".to_owned(),
                num_gpus: 1,
                score: 10.0,
            },
            instance: InstanceHandle { id: 42 },
            details: ConnectionDetails {
                host: "203.0.113.7".to_owned(),
                port: 41022,
                mode: ConnectionMode::Direct,
            },
            alias: "vast-ai-dev".to_owned(),
            fragment_path: Utf8PathBuf::from("/home/u/.ssh/config.d/vast-ai-vast-ai-dev"),
            states: Vec::new(),
        };

        let rendered = render(|buf| write_success(buf, &outcome));

        assert!(rendered.contains("Instance 42 is ready."));
        assert!(rendered.contains("ssh vast-ai-dev"));
        assert!(rendered.contains("203.0.113.7:41022"));
    }

    #[test]
    fn write_error_renders_discovery_failures() {
        let err = CliError::Discovery(DiscoveryError::SelectionCancelled);

        let rendered = render(|buf| write_error(buf, &err));

        assert_eq!(rendered, "host selection cancelled\n");
    }
}
