//! Core library for the `vastdev` GPU development tool.
//!
//! The crate rents a single GPU instance from the Vast.ai marketplace, waits
//! until SSH genuinely answers, and binds a local SSH alias to it. Failed
//! launches are torn down after their startup logs are retrieved. Files and
//! folders move to and from the aliased host with `rsync`.

pub mod backend;
pub mod config;
pub mod paths;
pub mod probe;
pub mod provision;
pub mod shell;
pub mod ssh_config;
pub mod startup;
pub mod test_support;
pub mod transfer;
pub mod vast;

pub use backend::{
    ConnectionDetails, ConnectionMode, InstanceHandle, InstanceSnapshot, LaunchRequest, Offer,
    OfferQuery,
};
pub use config::{ConfigError, VastConfig};
pub use probe::{ProbeError, ReachabilityProbe, SshProbe};
pub use provision::{
    ProvisionError, ProvisionFailure, ProvisionOutcome, ProvisionPlan, ProvisionState,
    ProvisioningWorkflow, WorkflowSettings,
};
pub use shell::{CommandOutput, CommandRunner, ProcessCommandRunner, ShellError};
pub use ssh_config::{
    AliasSource, DiscoveryError, FragmentStore, HostDiscovery, SelectorChoice, discover_hosts,
};
pub use startup::{StartupError, resolve_startup_script, startup_log_present};
pub use transfer::{Transfer, TransferConfig, TransferConfigError, TransferError};
pub use vast::{VastBackend, VastBackendError};
