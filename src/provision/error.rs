//! Error types for the provisioning workflow.

use std::fmt::{self, Display};
use std::time::Duration;

use thiserror::Error;

use super::ProvisionState;
use crate::backend::InstanceHandle;
use crate::ssh_config::FragmentError;

/// Reasons the workflow could not produce a ready instance.
#[derive(Debug, Error)]
pub enum ProvisionError<E>
where
    E: std::error::Error + 'static,
{
    /// Raised when no offer matches the search filter.
    #[error("no matching offers found")]
    NoOffers,
    /// Raised when the offer search itself fails.
    #[error("offer search failed: {0}")]
    Search(#[source] E),
    /// Raised when the marketplace refuses to create the instance.
    #[error("failed to create instance from offer {offer_id}: {source}")]
    Create {
        /// Offer that was selected.
        offer_id: u64,
        /// Provider error.
        #[source]
        source: E,
    },
    /// Raised when the instance reports an error status while polling.
    #[error("instance {instance_id} entered failed state: {status}")]
    InstanceFailed {
        /// Instance that failed.
        instance_id: u64,
        /// Status message reported by the marketplace.
        status: String,
    },
    /// Raised when SSH does not answer before the poll timeout.
    #[error("instance {instance_id} did not become reachable over SSH within {timeout:?}")]
    ReadinessTimeout {
        /// Instance that never became ready.
        instance_id: u64,
        /// Configured poll timeout.
        timeout: Duration,
    },
    /// Raised when the local SSH fragment cannot be written.
    #[error("failed to configure local SSH access: {0}")]
    LocalAccess(#[source] FragmentError),
}

/// A workflow failure together with the outcome of the cleanup it
/// triggered.
///
/// Cleanup problems are recorded alongside the original error and never
/// replace it.
#[derive(Debug)]
pub struct ProvisionFailure<E>
where
    E: std::error::Error + 'static,
{
    /// The error that stopped the workflow.
    pub error: ProvisionError<E>,
    /// Instance created before the failure, if any.
    pub instance: Option<InstanceHandle>,
    /// Startup logs retrieved during cleanup.
    pub startup_log: Option<String>,
    /// Error raised while retrieving the startup logs.
    pub log_error: Option<E>,
    /// Error raised while destroying the instance.
    pub teardown_error: Option<E>,
    /// States visited, ending in [`ProvisionState::Terminated`].
    pub states: Vec<ProvisionState>,
}

impl<E> ProvisionFailure<E>
where
    E: std::error::Error + 'static,
{
    /// Returns true when the instance was created and its destruction
    /// succeeded, or when no instance was ever created.
    #[must_use]
    pub const fn cleaned_up(&self) -> bool {
        self.instance.is_none() || self.teardown_error.is_none()
    }
}

impl<E> Display for ProvisionFailure<E>
where
    E: std::error::Error + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        if let Some(log_error) = &self.log_error {
            write!(f, " (log retrieval also failed: {log_error})")?;
        }
        if let (Some(handle), Some(teardown)) = (&self.instance, &self.teardown_error) {
            write!(
                f,
                " (teardown of instance {} also failed: {teardown})",
                handle.id
            )?;
        }
        Ok(())
    }
}

impl<E> std::error::Error for ProvisionFailure<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
