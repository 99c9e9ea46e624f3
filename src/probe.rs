//! SSH sentinel probe confirming an instance is actually reachable.
//!
//! Marketplace status flips to `running` well before `sshd` accepts
//! connections, so readiness is only declared once a trivial remote command
//! echoes the sentinel back.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

use crate::backend::ConnectionDetails;
use crate::shell::{CommandOutput, ShellError};

/// Text the remote side echoes when the probe succeeds.
pub const SENTINEL: &str = "SSH_OK";

/// Boxed future returned by [`ReachabilityProbe::probe`].
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ProbeError>> + Send + 'a>>;

/// Errors explaining why a probe did not confirm reachability.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProbeError {
    /// Raised when `ssh` ran but did not echo the sentinel.
    #[error("ssh exited with status {status_text} (stdout: {stdout:?}, stderr: {stderr:?})")]
    Unreachable {
        /// Human readable exit status.
        status_text: String,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
    },
    /// Raised when `ssh` could not be run or exceeded the probe timeout.
    #[error(transparent)]
    Shell(#[from] ShellError),
}

/// Checks whether an SSH endpoint accepts connections.
///
/// Dropping the returned future abandons the probe; implementations must not
/// leave work running afterwards.
pub trait ReachabilityProbe {
    /// Probes `details` once.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError`] when the endpoint is not (yet) reachable.
    fn probe<'a>(&'a self, details: &'a ConnectionDetails) -> ProbeFuture<'a>;
}

/// Settings for [`SshProbe`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProbeSettings {
    /// `ssh` executable.
    pub ssh_bin: String,
    /// Remote user.
    pub user: String,
    /// Value passed as `ConnectTimeout`.
    pub connect_timeout_secs: u64,
    /// Hard deadline after which the `ssh` process is killed.
    pub timeout: Duration,
}

/// Probe that runs `ssh ... echo SSH_OK` as a child process.
#[derive(Clone, Debug)]
pub struct SshProbe {
    settings: ProbeSettings,
}

impl SshProbe {
    /// Creates a probe from its settings.
    #[must_use]
    pub const fn new(settings: ProbeSettings) -> Self {
        Self { settings }
    }

    /// Builds the `ssh` argument list for `details`.
    #[must_use]
    pub fn build_args(&self, details: &ConnectionDetails) -> Vec<String> {
        vec![
            String::from("-p"),
            details.port.to_string(),
            String::from("-o"),
            format!("ConnectTimeout={}", self.settings.connect_timeout_secs),
            String::from("-o"),
            String::from("BatchMode=yes"),
            String::from("-o"),
            String::from("StrictHostKeyChecking=no"),
            String::from("-o"),
            String::from("UserKnownHostsFile=/dev/null"),
            format!("{}@{}", self.settings.user, details.host),
            String::from("echo"),
            String::from(SENTINEL),
        ]
    }

    async fn run(&self, details: &ConnectionDetails) -> Result<CommandOutput, ProbeError> {
        let program = &self.settings.ssh_bin;
        let child = Command::new(program)
            .args(self.build_args(details))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| ShellError::Spawn {
                program: program.clone(),
                message: err.to_string(),
            })?;

        match timeout(self.settings.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandOutput::from(output)),
            Ok(Err(err)) => Err(ShellError::Spawn {
                program: program.clone(),
                message: err.to_string(),
            }
            .into()),
            Err(_) => Err(ShellError::Timeout {
                program: program.clone(),
                timeout: self.settings.timeout,
            }
            .into()),
        }
    }
}

impl ReachabilityProbe for SshProbe {
    fn probe<'a>(&'a self, details: &'a ConnectionDetails) -> ProbeFuture<'a> {
        Box::pin(async move {
            let output = self.run(details).await?;
            if output.is_success() && output.stdout.contains(SENTINEL) {
                return Ok(());
            }
            Err(ProbeError::Unreachable {
                status_text: output.status_text(),
                stdout: output.stdout.trim().to_owned(),
                stderr: output.stderr.trim().to_owned(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ConnectionMode;
    use rstest::{fixture, rstest};

    #[fixture]
    fn details() -> ConnectionDetails {
        ConnectionDetails {
            host: "ssh5.vast.ai".to_owned(),
            port: 31022,
            mode: ConnectionMode::Proxy,
        }
    }

    fn probe_with(ssh_bin: &str, timeout: Duration) -> SshProbe {
        SshProbe::new(ProbeSettings {
            ssh_bin: ssh_bin.to_owned(),
            user: "root".to_owned(),
            connect_timeout_secs: 10,
            timeout,
        })
    }

    #[rstest]
    fn args_disable_prompts_and_host_key_checks(details: ConnectionDetails) {
        let args = probe_with("ssh", Duration::from_secs(15)).build_args(&details);

        assert_eq!(
            args.join(" "),
            "-p 31022 -o ConnectTimeout=10 -o BatchMode=yes \
             -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null \
             root@ssh5.vast.ai echo SSH_OK"
        );
    }

    // `echo` stands in for `ssh`: it exits 0 and prints its arguments, which
    // end with the sentinel.
    #[cfg(unix)]
    #[rstest]
    #[tokio::test]
    async fn succeeds_when_sentinel_echoed(details: ConnectionDetails) {
        probe_with("echo", Duration::from_secs(5))
            .probe(&details)
            .await
            .expect("probe should succeed");
    }

    #[cfg(unix)]
    #[rstest]
    #[tokio::test]
    async fn non_zero_exit_is_unreachable(details: ConnectionDetails) {
        let err = probe_with("false", Duration::from_secs(5))
            .probe(&details)
            .await
            .expect_err("probe should fail");

        assert!(
            matches!(err, ProbeError::Unreachable { ref status_text, .. } if status_text == "1"),
            "unexpected: {err}"
        );
    }

    #[cfg(unix)]
    #[rstest]
    #[tokio::test]
    async fn slow_ssh_is_killed_at_the_deadline(details: ConnectionDetails) {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().expect("tempdir");
        let script = dir.path().join("slow-ssh");
        std::fs::write(&script, "#!/bin/sh\nsleep 5\n").expect("write script");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .expect("chmod script");
        let started = std::time::Instant::now();

        let err = probe_with(script.to_str().expect("utf8 path"), Duration::from_millis(200))
            .probe(&details)
            .await
            .expect_err("probe should time out");

        assert!(
            matches!(err, ProbeError::Shell(ShellError::Timeout { .. })),
            "unexpected: {err}"
        );
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[rstest]
    #[tokio::test]
    async fn missing_binary_is_a_spawn_error(details: ConnectionDetails) {
        let err = probe_with("vastdev-definitely-missing-ssh", Duration::from_secs(5))
            .probe(&details)
            .await
            .expect_err("spawn should fail");

        assert!(matches!(err, ProbeError::Shell(ShellError::Spawn { .. })));
    }
}
