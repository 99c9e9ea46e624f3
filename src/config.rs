//! Configuration loading via `ortho-config`.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::backend::{LaunchRequest, OfferQuery};
use crate::paths::{expand_path, read_to_string_ambient};
use crate::probe::ProbeSettings;
use crate::provision::WorkflowSettings;
use crate::ssh_config::FragmentStore;

/// Default Vast.ai REST endpoint.
pub const DEFAULT_API_URL: &str = "https://console.vast.ai/api/v0";

/// Environment variable holding the Hugging Face token when it is not set
/// through the `VASTAI_` prefix or a configuration file.
pub const HUGGING_FACE_TOKEN_ENV: &str = "HUGGING_FACE_TOKEN";

/// Vast.ai marketplace and workflow settings derived from environment
/// variables and configuration files.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq)]
#[ortho_config(
    prefix = "VASTAI",
    discovery(
        app_name = "vastdev",
        env_var = "VASTDEV_CONFIG_PATH",
        config_file_name = "vastdev.toml",
        dotfile_name = ".vastdev.toml",
        project_file_name = "vastdev.toml"
    )
)]
pub struct VastConfig {
    /// API key for the Vast.ai account. Required; empty until supplied.
    #[ortho_config(default = String::new())]
    pub api_key: String,
    /// Base URL of the REST API.
    #[ortho_config(default = DEFAULT_API_URL.to_owned())]
    pub api_url: String,
    /// Token forwarded to the container for the Hugging Face CLI login.
    /// Falls back to the bare `HUGGING_FACE_TOKEN` variable.
    pub hugging_face_token: Option<String>,
    /// Container image to boot.
    #[ortho_config(default = "motilin/huggingface-pytorch-ml:latest".to_owned())]
    pub image: String,
    /// Accelerator model to rent.
    #[ortho_config(default = "RTX_A5000".to_owned())]
    pub gpu_name: String,
    /// Number of accelerators per machine.
    #[ortho_config(default = 1)]
    pub gpu_count: u32,
    /// Hourly price ceiling in dollars.
    #[ortho_config(default = 0.3)]
    pub max_price: f64,
    /// Disk size in gigabytes.
    #[ortho_config(default = 70)]
    pub disk_gb: u32,
    /// Extra container port published next to SSH.
    #[ortho_config(default = 8080)]
    pub exposed_port: u16,
    /// Public key registered with the account and exported to the container.
    #[ortho_config(default = "~/.ssh/id_ed25519.pub".to_owned())]
    pub ssh_public_key: String,
    /// Alias written to the local SSH configuration.
    #[ortho_config(default = "vast-ai-dev".to_owned())]
    pub ssh_alias: String,
    /// Remote user for SSH.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// `ssh` executable used by the readiness probe.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Directory holding the local SSH configuration.
    #[ortho_config(default = "~/.ssh".to_owned())]
    pub ssh_dir: String,
    /// Optional file replacing the built-in startup script.
    pub onstart_file: Option<String>,
    /// Total time to wait for SSH readiness, in seconds.
    #[ortho_config(default = 300)]
    pub poll_timeout_secs: u64,
    /// Delay between readiness polls, in seconds.
    #[ortho_config(default = 20)]
    pub poll_interval_secs: u64,
    /// Hard deadline for one probe `ssh` invocation, in seconds.
    #[ortho_config(default = 15)]
    pub probe_timeout_secs: u64,
    /// `ConnectTimeout` used by the probe and the generated fragment.
    #[ortho_config(default = 10)]
    pub connect_timeout_secs: u64,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to vastdev.toml",
            self.description, self.env_var, self.toml_key
        ))
    }

    fn invalid(&self, reason: &str) -> ConfigError {
        ConfigError::InvalidValue(format!(
            "{} {reason}: check {} or {} in vastdev.toml",
            self.description, self.env_var, self.toml_key
        ))
    }
}

impl VastConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(metadata.missing());
        }
        Ok(())
    }

    fn require_positive(value: u64, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(metadata.invalid("must be greater than zero"));
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("vastdev")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Messages name the environment variable
    /// and TOML key that supply the offending value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required value is empty
    /// and [`ConfigError::InvalidValue`] when a number is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.api_key,
            &FieldMetadata::new("Vast.ai API key", "VASTAI_API_KEY", "api_key"),
        )?;
        Self::require_field(
            &self.api_url,
            &FieldMetadata::new("Vast.ai API URL", "VASTAI_API_URL", "api_url"),
        )?;
        Self::require_field(
            &self.image,
            &FieldMetadata::new("container image", "VASTAI_IMAGE", "image"),
        )?;
        Self::require_field(
            &self.ssh_alias,
            &FieldMetadata::new("SSH alias", "VASTAI_SSH_ALIAS", "ssh_alias"),
        )?;
        Self::require_field(
            &self.ssh_public_key,
            &FieldMetadata::new(
                "SSH public key path",
                "VASTAI_SSH_PUBLIC_KEY",
                "ssh_public_key",
            ),
        )?;
        Self::require_field(
            &self.ssh_user,
            &FieldMetadata::new("SSH user", "VASTAI_SSH_USER", "ssh_user"),
        )?;
        Self::require_field(
            &self.ssh_bin,
            &FieldMetadata::new("ssh executable", "VASTAI_SSH_BIN", "ssh_bin"),
        )?;
        Self::require_positive(
            u64::from(self.disk_gb),
            &FieldMetadata::new("disk size", "VASTAI_DISK_GB", "disk_gb"),
        )?;
        Self::require_positive(
            self.poll_timeout_secs,
            &FieldMetadata::new(
                "readiness timeout",
                "VASTAI_POLL_TIMEOUT_SECS",
                "poll_timeout_secs",
            ),
        )?;
        Self::require_positive(
            self.poll_interval_secs,
            &FieldMetadata::new(
                "poll interval",
                "VASTAI_POLL_INTERVAL_SECS",
                "poll_interval_secs",
            ),
        )?;
        Self::require_positive(
            self.probe_timeout_secs,
            &FieldMetadata::new(
                "probe timeout",
                "VASTAI_PROBE_TIMEOUT_SECS",
                "probe_timeout_secs",
            ),
        )?;
        self.offer_query().map(|_| ())
    }

    /// Returns the Hugging Face token from configuration or the bare
    /// `HUGGING_FACE_TOKEN` environment variable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when neither source is set.
    pub fn require_hugging_face_token(&self) -> Result<String, ConfigError> {
        self.hugging_face_token
            .clone()
            .or_else(|| std::env::var(HUGGING_FACE_TOKEN_ENV).ok())
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| {
                FieldMetadata::new(
                    "Hugging Face token",
                    HUGGING_FACE_TOKEN_ENV,
                    "hugging_face_token",
                )
                .missing()
            })
    }

    /// Builds the offer filter.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] when the GPU fields or price
    /// ceiling are unusable.
    pub fn offer_query(&self) -> Result<OfferQuery, ConfigError> {
        OfferQuery::builder()
            .gpu_name(&self.gpu_name)
            .gpu_count(self.gpu_count)
            .max_price(self.max_price)
            .build()
            .map_err(|err| ConfigError::InvalidValue(err.to_string()))
    }

    /// Reads the configured public key, trimmed.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::PublicKey`] when the file cannot be read or is
    /// empty.
    pub fn read_public_key(&self) -> Result<String, ConfigError> {
        let path = expand_path(&self.ssh_public_key);
        let contents = read_to_string_ambient(&path).map_err(|message| ConfigError::PublicKey {
            path: path.clone(),
            message,
        })?;
        let key = contents.trim();
        if key.is_empty() {
            return Err(ConfigError::PublicKey {
                path,
                message: String::from("file is empty"),
            });
        }
        Ok(key.to_owned())
    }

    /// Builds the launch request sent when renting an offer. A fresh label is
    /// generated on every call.
    #[must_use]
    pub fn launch_request(
        &self,
        public_key: &str,
        hugging_face_token: &str,
        onstart: String,
    ) -> LaunchRequest {
        let env = BTreeMap::from([
            (
                HUGGING_FACE_TOKEN_ENV.to_owned(),
                hugging_face_token.to_owned(),
            ),
            (String::from("SSH_PUB_KEY"), public_key.to_owned()),
        ]);
        LaunchRequest {
            image: self.image.clone(),
            disk_gb: self.disk_gb,
            env,
            exposed_ports: vec![self.exposed_port],
            onstart,
            direct: true,
            label: format!("vastdev-{}", Uuid::new_v4().simple()),
        }
    }

    /// Timing and alias settings for the provisioning workflow.
    #[must_use]
    pub fn workflow_settings(&self) -> WorkflowSettings {
        WorkflowSettings {
            alias: self.ssh_alias.clone(),
            poll_timeout: Duration::from_secs(self.poll_timeout_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
        }
    }

    /// Settings for the SSH readiness probe.
    #[must_use]
    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            ssh_bin: self.ssh_bin.clone(),
            user: self.ssh_user.clone(),
            connect_timeout_secs: self.connect_timeout_secs,
            timeout: Duration::from_secs(self.probe_timeout_secs),
        }
    }

    /// Returns the expanded SSH directory.
    #[must_use]
    pub fn ssh_dir(&self) -> Utf8PathBuf {
        expand_path(&self.ssh_dir)
    }

    /// Fragment writer rooted at the configured SSH directory.
    #[must_use]
    pub fn fragment_store(&self) -> FragmentStore {
        FragmentStore::new(
            self.ssh_dir(),
            self.ssh_user.clone(),
            self.connect_timeout_secs,
        )
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configuration value is present but unusable.
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
    /// Raised when the SSH public key cannot be read.
    #[error("failed to read SSH public key {path}: {message}")]
    PublicKey {
        /// Expanded key path.
        path: Utf8PathBuf,
        /// Underlying error message.
        message: String,
    },
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
