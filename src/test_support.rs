//! Test support utilities shared across unit and integration tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::rc::Rc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;

use crate::backend::{
    BackendFuture, ConnectionDetails, InstanceHandle, InstanceLifecycle, InstanceSnapshot,
    KeyRegistry, LaunchRequest, LogFetch, Marketplace, Offer, OfferQuery, OfferSearch,
};
use crate::probe::{ProbeError, ProbeFuture, ReachabilityProbe};
use crate::shell::{CommandOutput, CommandRunner, ShellError};

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Rc<RefCell<VecDeque<Result<CommandOutput, ShellError>>>>,
    invocations: Rc<RefCell<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations.borrow().clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32, stderr: impl Into<String>) {
        self.push_output(Some(code), "", stderr);
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses.borrow_mut().push_back(Ok(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }));
    }

    /// Pushes an error such as a spawn failure or timeout.
    pub fn push_error(&self, error: ShellError) {
        self.responses.borrow_mut().push_back(Err(error));
    }

    fn next_response(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, ShellError> {
        self.invocations.borrow_mut().push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        self.responses
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| {
                Err(ShellError::Spawn {
                    program: program.to_owned(),
                    message: String::from("no scripted response available"),
                })
            })
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, ShellError> {
        self.next_response(program, args)
    }
}

/// Error returned by [`ScriptedMarketplace`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{0}")]
pub struct ScriptedFailure(pub String);

impl ScriptedFailure {
    /// Wraps a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A call recorded by [`ScriptedMarketplace`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MarketplaceCall {
    /// `register_ssh_key`.
    RegisterKey,
    /// `search_offers`.
    Search,
    /// `create_instance` with the chosen offer id.
    Create {
        /// Offer that was rented.
        offer_id: u64,
    },
    /// `fetch_instance`.
    Fetch {
        /// Instance that was polled.
        instance_id: u64,
    },
    /// `fetch_logs`.
    FetchLogs {
        /// Instance whose logs were requested.
        instance_id: u64,
    },
    /// `destroy_instance`.
    Destroy {
        /// Instance that was destroyed.
        instance_id: u64,
    },
}

#[derive(Debug)]
struct MarketplaceState {
    register: Result<(), ScriptedFailure>,
    offers: Result<Vec<Offer>, ScriptedFailure>,
    create: Result<InstanceHandle, ScriptedFailure>,
    snapshots: VecDeque<Result<Option<InstanceSnapshot>, ScriptedFailure>>,
    logs: Result<String, ScriptedFailure>,
    destroy: Result<(), ScriptedFailure>,
    calls: Vec<MarketplaceCall>,
}

/// Marketplace double with scripted responses and a call log.
///
/// Polls consume queued snapshots in order; once one remains it is
/// returned for every further poll, which lets tests model an instance that
/// never becomes ready.
#[derive(Clone, Debug)]
pub struct ScriptedMarketplace {
    state: Arc<Mutex<MarketplaceState>>,
}

impl Default for ScriptedMarketplace {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedMarketplace {
    /// Creates a marketplace with no offers, instance `1` on creation, no
    /// snapshots, empty logs, and successful destruction.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MarketplaceState {
                register: Ok(()),
                offers: Ok(Vec::new()),
                create: Ok(InstanceHandle { id: 1 }),
                snapshots: VecDeque::new(),
                logs: Ok(String::new()),
                destroy: Ok(()),
                calls: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MarketplaceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the key registration result.
    #[must_use]
    pub fn with_register_result(self, result: Result<(), ScriptedFailure>) -> Self {
        self.lock().register = result;
        self
    }

    /// Sets the offers returned by a search.
    #[must_use]
    pub fn with_offers(self, offers: Vec<Offer>) -> Self {
        self.lock().offers = Ok(offers);
        self
    }

    /// Makes the search fail.
    #[must_use]
    pub fn with_search_failure(self, message: &str) -> Self {
        self.lock().offers = Err(ScriptedFailure::new(message));
        self
    }

    /// Sets the creation result.
    #[must_use]
    pub fn with_create_result(self, result: Result<InstanceHandle, ScriptedFailure>) -> Self {
        self.lock().create = result;
        self
    }

    /// Queues one poll response.
    #[must_use]
    pub fn with_snapshot(self, snapshot: Result<Option<InstanceSnapshot>, ScriptedFailure>) -> Self {
        self.lock().snapshots.push_back(snapshot);
        self
    }

    /// Sets the log retrieval result.
    #[must_use]
    pub fn with_logs(self, result: Result<String, ScriptedFailure>) -> Self {
        self.lock().logs = result;
        self
    }

    /// Sets the destruction result.
    #[must_use]
    pub fn with_destroy_result(self, result: Result<(), ScriptedFailure>) -> Self {
        self.lock().destroy = result;
        self
    }

    /// Returns every call made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<MarketplaceCall> {
        self.lock().calls.clone()
    }

    /// Returns the ids passed to `destroy_instance`.
    #[must_use]
    pub fn destroyed(&self) -> Vec<u64> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MarketplaceCall::Destroy { instance_id } => Some(instance_id),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: MarketplaceCall) {
        self.lock().calls.push(call);
    }

    fn next_snapshot(&self) -> Result<Option<InstanceSnapshot>, ScriptedFailure> {
        let mut state = self.lock();
        if state.snapshots.len() > 1 {
            return state.snapshots.pop_front().unwrap_or(Ok(None));
        }
        state.snapshots.front().cloned().unwrap_or(Ok(None))
    }
}

impl Marketplace for ScriptedMarketplace {
    type Error = ScriptedFailure;
}

impl KeyRegistry for ScriptedMarketplace {
    fn register_ssh_key<'a>(&'a self, _public_key: &'a str) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.record(MarketplaceCall::RegisterKey);
            self.lock().register.clone()
        })
    }
}

impl OfferSearch for ScriptedMarketplace {
    fn search_offers<'a>(
        &'a self,
        _query: &'a OfferQuery,
    ) -> BackendFuture<'a, Vec<Offer>, Self::Error> {
        Box::pin(async move {
            self.record(MarketplaceCall::Search);
            self.lock().offers.clone()
        })
    }
}

impl InstanceLifecycle for ScriptedMarketplace {
    fn create_instance<'a>(
        &'a self,
        offer: &'a Offer,
        _request: &'a LaunchRequest,
    ) -> BackendFuture<'a, InstanceHandle, Self::Error> {
        Box::pin(async move {
            self.record(MarketplaceCall::Create { offer_id: offer.id });
            self.lock().create.clone()
        })
    }

    fn fetch_instance<'a>(
        &'a self,
        handle: &'a InstanceHandle,
    ) -> BackendFuture<'a, Option<InstanceSnapshot>, Self::Error> {
        Box::pin(async move {
            self.record(MarketplaceCall::Fetch {
                instance_id: handle.id,
            });
            self.next_snapshot()
        })
    }

    fn destroy_instance<'a>(
        &'a self,
        handle: &'a InstanceHandle,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.record(MarketplaceCall::Destroy {
                instance_id: handle.id,
            });
            self.lock().destroy.clone()
        })
    }
}

impl LogFetch for ScriptedMarketplace {
    fn fetch_logs<'a>(&'a self, handle: &'a InstanceHandle) -> BackendFuture<'a, String, Self::Error> {
        Box::pin(async move {
            self.record(MarketplaceCall::FetchLogs {
                instance_id: handle.id,
            });
            self.lock().logs.clone()
        })
    }
}

/// Reachability probe returning queued results, then failing once the
/// queue is empty.
#[derive(Clone, Debug, Default)]
pub struct ScriptedProbe {
    state: Arc<Mutex<ProbeState>>,
}

#[derive(Debug, Default)]
struct ProbeState {
    results: VecDeque<Result<(), ProbeError>>,
    probed: Vec<ConnectionDetails>,
    delay: Duration,
}

impl ScriptedProbe {
    /// Creates a probe that never succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every probe take `delay` before answering, like an `ssh`
    /// waiting out its connect timeout.
    #[must_use]
    pub fn with_delay(self, delay: Duration) -> Self {
        self.lock().delay = delay;
        self
    }

    fn lock(&self) -> MutexGuard<'_, ProbeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a successful probe.
    pub fn push_reachable(&self) {
        self.lock().results.push_back(Ok(()));
    }

    /// Queues a failed probe.
    pub fn push_unreachable(&self) {
        self.lock().results.push_back(Err(unreachable_error()));
    }

    /// Returns every endpoint probed so far.
    #[must_use]
    pub fn probed(&self) -> Vec<ConnectionDetails> {
        self.lock().probed.clone()
    }
}

fn unreachable_error() -> ProbeError {
    ProbeError::Unreachable {
        status_text: String::from("255"),
        stdout: String::new(),
        stderr: String::from("Connection refused"),
    }
}

impl ReachabilityProbe for ScriptedProbe {
    fn probe<'a>(&'a self, details: &'a ConnectionDetails) -> ProbeFuture<'a> {
        Box::pin(async move {
            let delay = {
                let mut state = self.lock();
                state.probed.push(details.clone());
                state.delay
            };
            if !delay.is_zero() {
                sleep(delay).await;
            }
            self.lock()
                .results
                .pop_front()
                .unwrap_or_else(|| Err(unreachable_error()))
        })
    }
}
