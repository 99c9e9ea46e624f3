//! Provisioning workflow for a single GPU development instance.
//!
//! The workflow searches the marketplace, rents the best-scored offer, polls
//! until SSH actually answers, and writes a local SSH fragment for the new
//! host. If any step after creation fails it retrieves the instance's
//! startup logs and destroys the instance, so the operator is never left
//! paying for a half-configured machine.

mod error;

use std::fmt;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::backend::{
    ConnectionDetails, InstanceHandle, InstanceLifecycle, InstanceSnapshot, KeyRegistry,
    LaunchRequest, LogFetch, Offer, OfferQuery, OfferSearch,
};
use crate::probe::ReachabilityProbe;
use crate::ssh_config::AccessWriter;

pub use error::{ProvisionError, ProvisionFailure};

/// Stages of the workflow, logged on every transition.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProvisionState {
    /// Looking for a matching offer.
    Searching,
    /// Renting the selected offer.
    Creating,
    /// Waiting for SSH to answer.
    Polling,
    /// Writing local SSH configuration.
    Configuring,
    /// The instance is reachable and configured.
    Ready,
    /// A step failed.
    Failed,
    /// Retrieving logs and destroying the instance.
    Cleanup,
    /// Failure handling finished.
    Terminated,
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Searching => "searching",
            Self::Creating => "creating",
            Self::Polling => "polling",
            Self::Configuring => "configuring",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Cleanup => "cleanup",
            Self::Terminated => "terminated",
        };
        f.write_str(label)
    }
}

/// Alias and timing settings passed into the workflow.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkflowSettings {
    /// Alias written to the local SSH configuration.
    pub alias: String,
    /// Total wall-clock budget for readiness polling.
    pub poll_timeout: Duration,
    /// Delay between polls.
    pub poll_interval: Duration,
}

/// Everything needed to rent one instance.
#[derive(Clone, Debug, PartialEq)]
pub struct ProvisionPlan {
    /// Offer filter.
    pub query: OfferQuery,
    /// Parameters for the created instance.
    pub launch: LaunchRequest,
    /// Public key registered with the account before searching.
    pub public_key: Option<String>,
}

/// Result of a successful run.
#[derive(Clone, Debug, PartialEq)]
pub struct ProvisionOutcome {
    /// Offer that was rented.
    pub offer: Offer,
    /// Created instance. Ownership passes to the operator.
    pub instance: InstanceHandle,
    /// Verified SSH endpoint.
    pub details: ConnectionDetails,
    /// Alias bound to the endpoint.
    pub alias: String,
    /// Fragment file that was written.
    pub fragment_path: Utf8PathBuf,
    /// States visited, ending in [`ProvisionState::Ready`].
    pub states: Vec<ProvisionState>,
}

/// Boxed failure returned by [`ProvisioningWorkflow::execute`].
pub type BoxedFailure<E> = Box<ProvisionFailure<E>>;

#[derive(Debug, Default)]
struct StateLog {
    states: Vec<ProvisionState>,
}

impl StateLog {
    fn enter(&mut self, state: ProvisionState) {
        info!(%state, "workflow state");
        self.states.push(state);
    }
}

/// Drives search, creation, readiness polling, and local configuration.
#[derive(Debug)]
pub struct ProvisioningWorkflow<M, P, W> {
    marketplace: M,
    probe: P,
    writer: W,
    settings: WorkflowSettings,
}

impl<M, P, W> ProvisioningWorkflow<M, P, W>
where
    M: KeyRegistry + OfferSearch + InstanceLifecycle + LogFetch,
    P: ReachabilityProbe,
    W: AccessWriter,
{
    /// Creates a workflow from its collaborators.
    pub const fn new(marketplace: M, probe: P, writer: W, settings: WorkflowSettings) -> Self {
        Self {
            marketplace,
            probe,
            writer,
            settings,
        }
    }

    /// Runs the full workflow.
    ///
    /// On success the instance is left running and a fragment binding the
    /// configured alias to it has been written.
    ///
    /// # Errors
    ///
    /// Returns a [`ProvisionFailure`] describing the first error together
    /// with the retrieved startup logs and any cleanup error. When an
    /// instance was created it has been destroyed (or destruction was
    /// attempted) before this returns.
    pub async fn execute(
        &self,
        plan: &ProvisionPlan,
    ) -> Result<ProvisionOutcome, BoxedFailure<M::Error>> {
        if let Some(public_key) = &plan.public_key {
            self.ensure_ssh_key(public_key).await;
        }

        let mut log = StateLog::default();
        let (offer, instance) = match self.search_and_create(plan, &mut log).await {
            Ok(created) => created,
            Err(err) => return Err(self.fail(err, None, log).await),
        };

        log.enter(ProvisionState::Polling);
        let details = match self.poll_for_readiness(&instance).await {
            Ok(details) => details,
            Err(err) => return Err(self.fail(err, Some(instance), log).await),
        };

        log.enter(ProvisionState::Configuring);
        let fragment_path = match self.configure_local_access(&details) {
            Ok(path) => path,
            Err(err) => return Err(self.fail(err, Some(instance), log).await),
        };

        log.enter(ProvisionState::Ready);
        Ok(ProvisionOutcome {
            offer,
            instance,
            details,
            alias: self.settings.alias.clone(),
            fragment_path,
            states: log.states,
        })
    }

    /// Registers the public key with the account. Failures are logged and
    /// ignored because the key is usually registered already.
    ///
    /// Returns true when registration succeeded.
    pub async fn ensure_ssh_key(&self, public_key: &str) -> bool {
        match self.marketplace.register_ssh_key(public_key).await {
            Ok(()) => {
                info!("ssh key ensured on marketplace account");
                true
            }
            Err(err) => {
                warn!(error = %err, "could not add ssh key (it may already exist)");
                false
            }
        }
    }

    async fn search_and_create(
        &self,
        plan: &ProvisionPlan,
        log: &mut StateLog,
    ) -> Result<(Offer, InstanceHandle), ProvisionError<M::Error>> {
        log.enter(ProvisionState::Searching);
        info!(
            gpu = %plan.query.gpu_name,
            count = plan.query.gpu_count,
            max_price = plan.query.max_price,
            "searching for offers"
        );
        let offers = self
            .marketplace
            .search_offers(&plan.query)
            .await
            .map_err(ProvisionError::Search)?;
        let Some(offer) = offers.into_iter().next() else {
            return Err(ProvisionError::NoOffers);
        };

        log.enter(ProvisionState::Creating);
        info!(offer_id = offer.id, dph_total = offer.dph_total, "creating instance from offer");
        let instance = self
            .marketplace
            .create_instance(&offer, &plan.launch)
            .await
            .map_err(|source| ProvisionError::Create {
                offer_id: offer.id,
                source,
            })?;
        info!(instance_id = instance.id, "instance creation initiated");
        Ok((offer, instance))
    }

    /// Polls until the instance answers the SSH sentinel, reports an error
    /// status, or the poll timeout elapses.
    ///
    /// Missing instance records and fetch errors are retried. Every fetch,
    /// SSH check, and sleep is cut short at the deadline, so the timeout is
    /// reported within the poll budget no matter how slowly the marketplace
    /// or `ssh` respond.
    ///
    /// An error status is checked before the endpoint: a snapshot that
    /// carries both an error message and a mapped port fails immediately
    /// without attempting SSH.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::InstanceFailed`] as soon as the status
    /// message carries an error indicator, and
    /// [`ProvisionError::ReadinessTimeout`] when the budget is exhausted.
    pub async fn poll_for_readiness(
        &self,
        instance: &InstanceHandle,
    ) -> Result<ConnectionDetails, ProvisionError<M::Error>> {
        let deadline = Instant::now() + self.settings.poll_timeout;
        info!(instance_id = instance.id, "waiting for instance to become ready");

        loop {
            let Some(remaining) = time_left(deadline) else {
                return Err(self.readiness_timeout(instance));
            };
            match timeout(remaining, self.marketplace.fetch_instance(instance)).await {
                Ok(Ok(Some(snapshot))) => {
                    if let Some(details) = inspect_snapshot::<M::Error>(instance, snapshot)?
                        && self.verify_ssh(&details, deadline).await
                    {
                        info!(instance_id = instance.id, "ssh connection verified");
                        return Ok(details);
                    }
                }
                Ok(Ok(None)) => debug!(instance_id = instance.id, "instance not visible yet"),
                Ok(Err(err)) => warn!(error = %err, "warning during polling; retrying"),
                Err(_) => warn!(instance_id = instance.id, "instance fetch hit the deadline"),
            }

            let Some(remaining) = time_left(deadline) else {
                return Err(self.readiness_timeout(instance));
            };
            sleep(self.settings.poll_interval.min(remaining)).await;
        }
    }

    async fn verify_ssh(&self, details: &ConnectionDetails, deadline: Instant) -> bool {
        let Some(remaining) = time_left(deadline) else {
            return false;
        };
        match timeout(remaining, self.probe.probe(details)).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                info!(error = %err, "ssh not answering yet");
                false
            }
            Err(_) => {
                info!("ssh check abandoned at the deadline");
                false
            }
        }
    }

    fn readiness_timeout(&self, instance: &InstanceHandle) -> ProvisionError<M::Error> {
        error!(instance_id = instance.id, "timed out waiting for instance");
        ProvisionError::ReadinessTimeout {
            instance_id: instance.id,
            timeout: self.settings.poll_timeout,
        }
    }

    /// Writes the local SSH fragment for `details`.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::LocalAccess`] when the fragment cannot be
    /// written.
    pub fn configure_local_access(
        &self,
        details: &ConnectionDetails,
    ) -> Result<Utf8PathBuf, ProvisionError<M::Error>> {
        let path = self
            .writer
            .write_access(&self.settings.alias, details)
            .map_err(ProvisionError::LocalAccess)?;
        info!(alias = %self.settings.alias, path = %path, "ssh config written");
        Ok(path)
    }

    async fn fail(
        &self,
        err: ProvisionError<M::Error>,
        instance: Option<InstanceHandle>,
        mut log: StateLog,
    ) -> BoxedFailure<M::Error> {
        log.enter(ProvisionState::Failed);
        error!(error = %err, "workflow failed");

        let mut failure = ProvisionFailure {
            error: err,
            instance: None,
            startup_log: None,
            log_error: None,
            teardown_error: None,
            states: Vec::new(),
        };

        if let Some(handle) = instance {
            log.enter(ProvisionState::Cleanup);
            info!(instance_id = handle.id, "retrieving instance logs");
            match self.marketplace.fetch_logs(&handle).await {
                Ok(logs) => failure.startup_log = Some(logs),
                Err(log_err) => {
                    warn!(instance_id = handle.id, error = %log_err, "failed to fetch logs");
                    failure.log_error = Some(log_err);
                }
            }

            info!(instance_id = handle.id, "destroying failed instance");
            match self.marketplace.destroy_instance(&handle).await {
                Ok(()) => info!(instance_id = handle.id, "instance destroyed"),
                Err(teardown) => {
                    error!(instance_id = handle.id, error = %teardown, "failed to destroy instance");
                    failure.teardown_error = Some(teardown);
                }
            }
            failure.instance = Some(handle);
        }

        log.enter(ProvisionState::Terminated);
        failure.states = log.states;
        Box::new(failure)
    }
}

fn time_left(deadline: Instant) -> Option<Duration> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    (!remaining.is_zero()).then_some(remaining)
}

/// Checks a snapshot for an error status, then for an SSH endpoint.
fn inspect_snapshot<E>(
    instance: &InstanceHandle,
    snapshot: InstanceSnapshot,
) -> Result<Option<ConnectionDetails>, ProvisionError<E>>
where
    E: std::error::Error + 'static,
{
    if snapshot.has_error() {
        let status = snapshot.status_msg.unwrap_or_default();
        error!(instance_id = instance.id, %status, "instance entered failed state");
        return Err(ProvisionError::InstanceFailed {
            instance_id: instance.id,
            status,
        });
    }
    let Some(details) = snapshot.resolve_connection() else {
        info!(
            status = snapshot.actual_status.as_deref().unwrap_or("initializing"),
            "waiting for ssh handshake"
        );
        return Ok(None);
    };
    info!(
        mode = details.mode.as_str(),
        host = %details.host,
        port = details.port,
        "endpoint reported; verifying ssh"
    );
    Ok(Some(details))
}

#[cfg(test)]
mod tests;
