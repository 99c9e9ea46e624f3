//! SSH configuration discovery and local access wiring.
//!
//! Discovery reads the root `~/.ssh/config`, follows its `Include`
//! directives, and collects the declared host aliases. When more than one
//! alias exists an [`AliasSelector`] decides which one to use. The
//! [`fragment`] submodule writes the per-instance host blocks that discovery
//! later finds.

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

pub mod fragment;
mod parser;
mod select;

pub use fragment::{AccessWriter, FragmentError, FragmentStore, render_fragment};
pub use select::{AliasSelector, FixedSelector, PromptSelector, SelectorChoice};

use crate::paths::expand_path;

/// Default location of the root SSH configuration.
pub const DEFAULT_SSH_CONFIG: &str = "~/.ssh/config";

/// Errors raised while discovering or choosing a host alias.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DiscoveryError {
    /// Raised when the root configuration file does not exist.
    #[error("no SSH config at {path}")]
    ConfigMissing {
        /// Path that was expected to exist.
        path: Utf8PathBuf,
    },
    /// Raised when the root configuration cannot be read.
    #[error("failed to read {path}: {message}")]
    Read {
        /// Path that could not be read.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when no usable `Host` alias is declared.
    #[error("no SSH hosts found in {path} or its includes")]
    NoHosts {
        /// Root configuration that was scanned.
        path: Utf8PathBuf,
    },
    /// Raised when the operator cancels the selection prompt.
    #[error("host selection cancelled")]
    SelectionCancelled,
    /// Raised when a pre-chosen alias is not declared.
    #[error("host alias '{alias}' not found; available: {available}")]
    UnknownAlias {
        /// Alias that was requested.
        alias: String,
        /// Comma separated list of declared aliases.
        available: String,
    },
    /// Raised when the console prompt cannot be read or written.
    #[error("host selection prompt failed: {message}")]
    Prompt {
        /// Underlying I/O error string.
        message: String,
    },
}

/// Source of a host alias for commands that talk to the remote machine.
pub trait AliasSource {
    /// Resolves exactly one alias.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError`] when no alias can be determined.
    fn resolve_alias(&self) -> Result<String, DiscoveryError>;
}

/// Collects the unique host aliases declared by `root` and its includes, in
/// file-then-line order.
///
/// Included files that cannot be read are logged and skipped.
///
/// # Errors
///
/// Returns [`DiscoveryError::ConfigMissing`] when `root` does not exist,
/// [`DiscoveryError::Read`] when it cannot be read, and
/// [`DiscoveryError::NoHosts`] when no alias is declared anywhere.
pub fn discover_hosts(root: &Utf8Path) -> Result<Vec<String>, DiscoveryError> {
    let files = parser::config_files(root)?;
    let mut aliases = Vec::new();

    for path in &files {
        match parser::read(path) {
            Ok(contents) => parser::collect_hosts(&contents, &mut aliases),
            Err(err) if path.as_path() == root => return Err(err),
            Err(err) => warn!(error = %err, "skipping unreadable ssh config include"),
        }
    }

    debug!(root = %root, files = files.len(), hosts = aliases.len(), "scanned ssh config");
    if aliases.is_empty() {
        return Err(DiscoveryError::NoHosts {
            path: root.to_path_buf(),
        });
    }
    Ok(aliases)
}

/// Discovers aliases under a root configuration and selects one of them.
#[derive(Debug)]
pub struct HostDiscovery<S> {
    root: Utf8PathBuf,
    selector: S,
}

impl<S: AliasSelector> HostDiscovery<S> {
    /// Creates a discovery rooted at an explicit configuration path.
    pub fn new(root: impl Into<Utf8PathBuf>, selector: S) -> Self {
        Self {
            root: root.into(),
            selector,
        }
    }

    /// Creates a discovery rooted at `~/.ssh/config`.
    pub fn with_default_root(selector: S) -> Self {
        Self::new(expand_path(DEFAULT_SSH_CONFIG), selector)
    }

    /// Returns every declared alias without selecting one.
    ///
    /// # Errors
    ///
    /// See [`discover_hosts`].
    pub fn hosts(&self) -> Result<Vec<String>, DiscoveryError> {
        discover_hosts(&self.root)
    }
}

impl<S: AliasSelector> AliasSource for HostDiscovery<S> {
    fn resolve_alias(&self) -> Result<String, DiscoveryError> {
        let aliases = self.hosts()?;
        if let [only] = aliases.as_slice()
            && !self.selector.is_explicit()
        {
            return Ok(only.clone());
        }
        self.selector.select(&aliases)
    }
}
