//! Remote command execution.
//!
//! `RemoteExecutor` is the seam the pipeline runner and release manager talk
//! to. `SshExecutor` is the production implementation; it shells out to the
//! system `ssh` binary so authentication stays with the user's agent and
//! `~/.ssh/config`.

mod client;

pub use client::{
    is_connection_failure, is_local_host, run_with_deadline, CommandOutput, SshClient,
    TIMEOUT_EXIT_CODE,
};

use std::time::Duration;

use crate::error::{
    Error, RemoteCommandFailedDetails, RemoteCommandTimeoutDetails, Result, TargetDetails,
};
use crate::host::HostConfig;

/// One command to run on a host.
#[derive(Debug, Clone)]
pub struct RemoteCommand {
    pub script: String,
    pub working_dir: String,
    pub timeout: Duration,
    /// Treat a nonzero exit as success (idempotent "restart if running" steps).
    pub tolerate_failure: bool,
}

impl RemoteCommand {
    pub fn new(script: impl Into<String>, working_dir: impl Into<String>, timeout: Duration) -> Self {
        Self {
            script: script.into(),
            working_dir: working_dir.into(),
            timeout,
            tolerate_failure: false,
        }
    }

    pub fn tolerating_failure(mut self) -> Self {
        self.tolerate_failure = true;
        self
    }
}

pub trait RemoteExecutor: Send + Sync {
    /// Run a command on `host`.
    ///
    /// Errors: `ssh.connect_failed` when the host cannot be reached or refuses
    /// authentication, `remote.command_timeout` when the command outlives its
    /// timeout (it is killed), `remote.command_failed` on a nonzero exit
    /// unless the command tolerates failure.
    fn execute(&self, host: &HostConfig, command: &RemoteCommand) -> Result<CommandOutput>;
}

#[derive(Debug, Clone)]
pub struct SshExecutor {
    pub connect_timeout_secs: u64,
    pub max_attempts: u32,
}

impl Default for SshExecutor {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            max_attempts: 3,
        }
    }
}

impl RemoteExecutor for SshExecutor {
    fn execute(&self, host: &HostConfig, command: &RemoteCommand) -> Result<CommandOutput> {
        let client = SshClient::from_host(host, self.connect_timeout_secs)?;
        let output = client.execute_with_retry(
            &command.script,
            &command.working_dir,
            command.timeout,
            self.max_attempts,
        );
        classify(host, command, output, client.is_local)
    }
}

fn target(host: &HostConfig) -> TargetDetails {
    TargetDetails {
        host: host.name.clone(),
        address: host.address.clone(),
    }
}

/// Map raw process output onto the executor's error contract.
pub fn classify(
    host: &HostConfig,
    command: &RemoteCommand,
    output: CommandOutput,
    is_local: bool,
) -> Result<CommandOutput> {
    if output.timed_out || (!is_local && output.exit_code == TIMEOUT_EXIT_CODE) {
        return Err(Error::command_timeout(RemoteCommandTimeoutDetails {
            command: command.script.clone(),
            timeout_secs: command.timeout.as_secs(),
            target: target(host),
        }));
    }

    if output.success {
        return Ok(output);
    }

    if !is_local && is_connection_failure(&output) {
        return Err(Error::connection_failed(
            target(host),
            output.exit_code,
            output.stderr,
        ));
    }

    if command.tolerate_failure {
        tracing::debug!(
            host = %host.name,
            exit_code = output.exit_code,
            "tolerated failure: {}",
            command.script
        );
        return Ok(output);
    }

    Err(Error::remote_command_failed(RemoteCommandFailedDetails {
        command: command.script.clone(),
        exit_code: output.exit_code,
        stdout: output.stdout,
        stderr: output.stderr,
        target: target(host),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn host() -> HostConfig {
        HostConfig::new("web", "web.example.com", "deploy")
    }

    fn cmd() -> RemoteCommand {
        RemoteCommand::new("systemctl restart php-fpm", "/var/www", Duration::from_secs(30))
    }

    fn failed(exit_code: i32, stderr: &str) -> CommandOutput {
        CommandOutput {
            stderr: stderr.to_string(),
            exit_code,
            ..CommandOutput::default()
        }
    }

    #[test]
    fn remote_timeout_exit_maps_to_timeout_error() {
        let err = classify(&host(), &cmd(), failed(124, ""), false).unwrap_err();
        assert_eq!(err.code, ErrorCode::RemoteCommandTimeout);
    }

    #[test]
    fn unreachable_host_maps_to_connection_error() {
        let err = classify(
            &host(),
            &cmd(),
            failed(255, "ssh: Could not resolve hostname web.example.com"),
            false,
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::SshConnectFailed);
    }

    #[test]
    fn nonzero_exit_maps_to_command_failed_with_code() {
        let err = classify(&host(), &cmd(), failed(2, "unit not found"), false).unwrap_err();
        assert_eq!(err.code, ErrorCode::RemoteCommandFailed);
        assert_eq!(err.remote_exit_code(), Some(2));
    }

    #[test]
    fn tolerated_failure_is_ok() {
        let out = classify(&host(), &cmd().tolerating_failure(), failed(3, ""), false).unwrap();
        assert_eq!(out.exit_code, 3);
    }

    #[test]
    fn local_exit_124_is_a_plain_failure() {
        let err = classify(&host(), &cmd(), failed(124, ""), true).unwrap_err();
        assert_eq!(err.code, ErrorCode::RemoteCommandFailed);
    }

    #[test]
    fn application_connection_error_is_a_command_failure() {
        let err = classify(
            &host(),
            &cmd(),
            failed(1, "SQLSTATE[HY000] [2002] Connection refused"),
            false,
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::RemoteCommandFailed);
        assert_eq!(err.remote_exit_code(), Some(1));
    }
}
