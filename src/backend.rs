//! Marketplace abstraction for renting disposable GPU instances.
//!
//! The provisioning workflow only talks to the capability traits defined
//! here, so tests can drive it with scripted doubles instead of the real
//! Vast.ai client.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

/// Port key used by the marketplace for the container's SSH daemon.
pub const SSH_PORT_KEY: &str = "22/tcp";

/// A rentable machine returned by an offer search.
#[derive(Clone, Debug, PartialEq)]
pub struct Offer {
    /// Marketplace identifier used to create an instance.
    pub id: u64,
    /// Total hourly price in dollars.
    pub dph_total: f64,
    /// Accelerator model, for example `RTX_A5000`.
    pub gpu_name: String,
    /// Number of accelerators on the machine.
    pub num_gpus: u32,
    /// Marketplace quality score used for ordering.
    pub score: f64,
}

/// Filter and ordering for an offer search.
#[derive(Clone, Debug, PartialEq)]
pub struct OfferQuery {
    /// Accelerator model to match exactly.
    pub gpu_name: String,
    /// Accelerator count to match exactly.
    pub gpu_count: u32,
    /// Upper bound on the hourly price.
    pub max_price: f64,
}

impl OfferQuery {
    /// Starts a builder for an [`OfferQuery`].
    #[must_use]
    pub fn builder() -> OfferQueryBuilder {
        OfferQueryBuilder::default()
    }

    /// Validates the query.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when the GPU name is empty, the
    /// count is zero, or the price ceiling is not a positive number.
    pub fn validate(&self) -> Result<(), BackendError> {
        if self.gpu_name.is_empty() {
            return Err(BackendError::Validation("gpu_name".to_owned()));
        }
        if self.gpu_count == 0 {
            return Err(BackendError::Validation("gpu_count".to_owned()));
        }
        if !self.max_price.is_finite() || self.max_price <= 0.0 {
            return Err(BackendError::Validation("max_price".to_owned()));
        }
        Ok(())
    }
}

/// Builder for [`OfferQuery`] that trims and validates on construction.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OfferQueryBuilder {
    gpu_name: String,
    gpu_count: u32,
    max_price: f64,
}

impl OfferQueryBuilder {
    /// Sets the accelerator model.
    #[must_use]
    pub fn gpu_name(mut self, value: impl Into<String>) -> Self {
        self.gpu_name = value.into();
        self
    }

    /// Sets the accelerator count.
    #[must_use]
    pub const fn gpu_count(mut self, value: u32) -> Self {
        self.gpu_count = value;
        self
    }

    /// Sets the hourly price ceiling.
    #[must_use]
    pub const fn max_price(mut self, value: f64) -> Self {
        self.max_price = value;
        self
    }

    /// Builds and validates the query.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] naming the first invalid field.
    pub fn build(self) -> Result<OfferQuery, BackendError> {
        let query = OfferQuery {
            gpu_name: self.gpu_name.trim().to_owned(),
            gpu_count: self.gpu_count,
            max_price: self.max_price,
        };
        query.validate()?;
        Ok(query)
    }
}

/// Parameters used to create an instance from an offer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchRequest {
    /// Container image to boot.
    pub image: String,
    /// Disk size in gigabytes.
    pub disk_gb: u32,
    /// Environment variables exported inside the container.
    pub env: BTreeMap<String, String>,
    /// Extra container ports published alongside SSH.
    pub exposed_ports: Vec<u16>,
    /// Shell script executed when the container starts.
    pub onstart: String,
    /// Whether SSH should be reachable on the host's public address rather
    /// than only through the marketplace proxy.
    pub direct: bool,
    /// Label attached to the instance for identification.
    pub label: String,
}

impl LaunchRequest {
    /// Validates the request.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when the image or label is empty
    /// or the disk size is zero.
    pub fn validate(&self) -> Result<(), BackendError> {
        if self.image.trim().is_empty() {
            return Err(BackendError::Validation("image".to_owned()));
        }
        if self.disk_gb == 0 {
            return Err(BackendError::Validation("disk_gb".to_owned()));
        }
        if self.label.trim().is_empty() {
            return Err(BackendError::Validation("label".to_owned()));
        }
        Ok(())
    }
}

/// Handle returned once an instance has been created.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceHandle {
    /// Marketplace identifier of the instance contract.
    pub id: u64,
}

/// One host side binding of a container port.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PortBinding {
    /// Address the port is bound to on the host.
    pub host_ip: String,
    /// Host port forwarded to the container port.
    pub host_port: u16,
}

/// Point-in-time view of an instance, refreshed on every poll.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstanceSnapshot {
    /// Marketplace identifier.
    pub id: u64,
    /// Lifecycle status such as `loading` or `running`.
    pub actual_status: Option<String>,
    /// Free-form status message reported by the host.
    pub status_msg: Option<String>,
    /// Public address of the host machine.
    pub public_ipaddr: Option<String>,
    /// Container port table keyed by `<port>/<proto>`.
    pub ports: BTreeMap<String, Vec<PortBinding>>,
    /// Marketplace SSH proxy host.
    pub ssh_host: Option<String>,
    /// Marketplace SSH proxy port.
    pub ssh_port: Option<u16>,
}

impl InstanceSnapshot {
    /// Returns true when the status message carries an error indicator.
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.status_msg
            .as_deref()
            .is_some_and(|message| message.to_ascii_lowercase().contains("error"))
    }

    /// Resolves where SSH can be reached, preferring the direct mapping.
    ///
    /// Returns `None` while neither the direct mapping nor the proxy fields
    /// are populated.
    #[must_use]
    pub fn resolve_connection(&self) -> Option<ConnectionDetails> {
        let direct_port = self
            .ports
            .get(SSH_PORT_KEY)
            .and_then(|bindings| bindings.first())
            .map(|binding| binding.host_port);
        if let Some(port) = direct_port
            && let Some(host) = non_empty(self.public_ipaddr.as_deref())
        {
            return Some(ConnectionDetails {
                host: host.to_owned(),
                port,
                mode: ConnectionMode::Direct,
            });
        }

        let host = non_empty(self.ssh_host.as_deref())?;
        let port = self.ssh_port.filter(|port| *port != 0)?;
        Some(ConnectionDetails {
            host: host.to_owned(),
            port,
            mode: ConnectionMode::Proxy,
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|text| !text.is_empty())
}

/// How SSH reaches the instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionMode {
    /// The host's public address and the mapped container port.
    Direct,
    /// The marketplace's relay host and port.
    Proxy,
}

impl ConnectionMode {
    /// Lowercase name used in log output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Proxy => "proxy",
        }
    }
}

/// Resolved SSH endpoint for an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionDetails {
    /// Host name or address to connect to.
    pub host: String,
    /// TCP port of the SSH endpoint.
    pub port: u16,
    /// Whether the endpoint is direct or proxied.
    pub mode: ConnectionMode,
}

/// Errors raised by marketplace-independent validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum BackendError {
    /// Raised when a request is missing a required field.
    #[error("missing or invalid field: {0}")]
    Validation(String),
}

/// Future returned by marketplace operations.
pub type BackendFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Shared error type of the marketplace capabilities.
pub trait Marketplace {
    /// Provider specific error type.
    type Error: std::error::Error + Send + Sync + 'static;
}

/// Registers the operator's SSH public key with the account.
pub trait KeyRegistry: Marketplace {
    /// Uploads `public_key`. Registering an existing key is not an error for
    /// callers; they log and continue.
    fn register_ssh_key<'a>(&'a self, public_key: &'a str) -> BackendFuture<'a, (), Self::Error>;
}

/// Searches the marketplace for rentable offers.
pub trait OfferSearch: Marketplace {
    /// Returns offers matching `query`, ordered by descending score.
    fn search_offers<'a>(&'a self, query: &'a OfferQuery)
    -> BackendFuture<'a, Vec<Offer>, Self::Error>;
}

/// Creates, inspects, and destroys instances.
pub trait InstanceLifecycle: Marketplace {
    /// Rents `offer` with the supplied launch parameters.
    fn create_instance<'a>(
        &'a self,
        offer: &'a Offer,
        request: &'a LaunchRequest,
    ) -> BackendFuture<'a, InstanceHandle, Self::Error>;

    /// Fetches the current state of an instance. `None` means the
    /// marketplace does not (yet) report it.
    fn fetch_instance<'a>(
        &'a self,
        handle: &'a InstanceHandle,
    ) -> BackendFuture<'a, Option<InstanceSnapshot>, Self::Error>;

    /// Destroys the instance and releases the rental.
    fn destroy_instance<'a>(&'a self, handle: &'a InstanceHandle)
    -> BackendFuture<'a, (), Self::Error>;
}

/// Retrieves the startup logs of an instance.
pub trait LogFetch: Marketplace {
    /// Returns the tail of the instance's container log.
    fn fetch_logs<'a>(&'a self, handle: &'a InstanceHandle)
    -> BackendFuture<'a, String, Self::Error>;
}
