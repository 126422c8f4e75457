use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::host::HostConfig;
use crate::utils::shell;

/// Grace period the remote `timeout` wrapper gives a command after TERM
/// before it sends KILL.
const REMOTE_KILL_AFTER_SECS: u64 = 5;

/// Exit status `timeout(1)` reports when it had to stop the command.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit status ssh uses for its own errors.
pub const SSH_ERROR_EXIT_CODE: i32 = 255;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub struct SshClient {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub identity_file: Option<String>,
    pub connect_timeout_secs: u64,
    /// When true, all commands run locally instead of over SSH.
    /// Set automatically when the host address is localhost/127.0.0.1/::1.
    pub is_local: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub exit_code: i32,
    /// The local deadline passed and the process was killed.
    pub timed_out: bool,
}

impl SshClient {
    pub fn from_host(host: &HostConfig, connect_timeout_secs: u64) -> Result<Self> {
        let identity_file = match &host.identity_ref {
            Some(reference) if !reference.is_empty() => {
                Some(shellexpand::tilde(reference).to_string())
            }
            _ => None,
        };

        let is_local = is_local_host(&host.address);
        if is_local {
            tracing::debug!(host = %host.name, "localhost target, using local execution");
        }

        Ok(Self {
            host: host.address.clone(),
            user: host.user.clone(),
            port: host.port,
            identity_file,
            connect_timeout_secs,
            is_local,
        })
    }

    fn build_ssh_args(&self, command: &str) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(identity_file) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity_file.clone());
        }

        if self.port != 22 {
            args.push("-p".to_string());
            args.push(self.port.to_string());
        }

        // Never prompt: a deploy must fail instead of hanging on a password or
        // host-key question.
        args.extend([
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "-o".to_string(),
            "ServerAliveInterval=15".to_string(),
            "-o".to_string(),
            "ServerAliveCountMax=3".to_string(),
        ]);

        args.push(format!("{}@{}", self.user, self.host));
        args.push(command.to_string());

        args
    }

    /// Run `script` inside `working_dir`, killing it once `timeout` elapses.
    ///
    /// Remote commands are wrapped in `timeout(1)` so the remote process is
    /// stopped even if the local ssh client is killed first.
    pub fn execute(&self, script: &str, working_dir: &str, timeout: Duration) -> CommandOutput {
        let scoped = shell::in_dir(working_dir, script);

        if self.is_local {
            let mut cmd = Command::new("sh");
            cmd.args(["-c", &scoped]);
            return run_with_deadline(cmd, timeout);
        }

        let secs = timeout.as_secs().max(1);
        let remote = format!(
            "timeout --kill-after={} {} sh -c {}",
            REMOTE_KILL_AFTER_SECS,
            secs,
            shell::escape_command_for_shell(&scoped)
        );

        let mut cmd = Command::new("ssh");
        cmd.args(self.build_ssh_args(&remote));
        // Local deadline leaves room for the remote wrapper to act first.
        run_with_deadline(
            cmd,
            timeout + Duration::from_secs(REMOTE_KILL_AFTER_SECS + self.connect_timeout_secs),
        )
    }

    /// Run with retries on transient connection errors, not command failures.
    pub fn execute_with_retry(
        &self,
        script: &str,
        working_dir: &str,
        timeout: Duration,
        max_attempts: u32,
    ) -> CommandOutput {
        let backoff_secs = [0, 2, 5];
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let result = self.execute(script, working_dir, timeout);
            attempt += 1;

            if result.success
                || result.timed_out
                || attempt >= max_attempts
                || self.is_local
                || !is_transient_ssh_error(&result)
            {
                return result;
            }

            let delay = backoff_secs.get(attempt as usize).copied().unwrap_or(5);
            log_status!(
                "ssh",
                "Connection to {} failed (attempt {}/{}), retrying in {}s",
                self.host,
                attempt,
                max_attempts,
                delay
            );
            thread::sleep(Duration::from_secs(delay));
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(source: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut source) = source {
            let _ = source.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).to_string()
    })
}

#[cfg(unix)]
fn isolate_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn kill_tree(child: &mut Child) {
    // The child leads its own process group, so this reaches anything the
    // shell spawned as well.
    unsafe {
        libc::kill(-(child.id() as libc::pid_t), libc::SIGKILL);
    }
    let _ = child.kill();
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) {
    let _ = child.kill();
}

/// Spawn `cmd`, capture its output and kill it if it outlives `timeout`.
pub fn run_with_deadline(mut cmd: Command, timeout: Duration) -> CommandOutput {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    isolate_process_group(&mut cmd);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return CommandOutput {
                stderr: format!("Command error: {}", e),
                exit_code: -1,
                ..CommandOutput::default()
            }
        }
    };

    let stdout = spawn_reader(child.stdout.take());
    let stderr = spawn_reader(child.stderr.take());
    let deadline = Instant::now() + timeout;

    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) if Instant::now() >= deadline => {
                timed_out = true;
                kill_tree(&mut child);
                break child.wait().ok();
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(_) => break None,
        }
    };

    let stdout = stdout.join().unwrap_or_default();
    let stderr = stderr.join().unwrap_or_default();

    match status {
        Some(status) if !timed_out => CommandOutput {
            stdout,
            stderr,
            success: status.success(),
            exit_code: status.code().unwrap_or(-1),
            timed_out: false,
        },
        _ => CommandOutput {
            stdout,
            stderr,
            success: false,
            exit_code: -1,
            timed_out,
        },
    }
}

/// Check if a host address refers to the local machine.
pub fn is_local_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

/// Whether a failed ssh invocation never reached the remote command.
///
/// ssh reports its own failures (refused, auth, dns) as exit code 255. Any
/// other code came from the remote command, whatever its stderr says.
pub fn is_connection_failure(output: &CommandOutput) -> bool {
    output.exit_code == SSH_ERROR_EXIT_CODE
}

/// Check if an SSH failure is a transient connection error worth retrying.
/// Authentication failures are not.
fn is_transient_ssh_error(output: &CommandOutput) -> bool {
    if !is_connection_failure(output) {
        return false;
    }
    let stderr = output.stderr.to_lowercase();

    let transient_patterns = [
        "connection refused",
        "connection reset",
        "connection timed out",
        "no route to host",
        "network is unreachable",
        "temporary failure in name resolution",
        "could not resolve hostname",
        "broken pipe",
        "ssh_exchange_identification",
        "connection closed by remote host",
    ];

    transient_patterns.iter().any(|p| stderr.contains(p))
}
