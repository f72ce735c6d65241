use crate::process::{self, ProcessStream};
use crate::request::HostCredential;
use crate::{log_debug, log_info, log_warn, MigrateError, Result};
use async_trait::async_trait;
use base64::Engine;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Collected result of one blocking remote command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Authenticated shell channel to one host.
///
/// `exec_no_wait` is deliberately a separate operation from `exec`: it fires
/// the command and returns without output, and exists only for commands
/// expected to sever the connection (network reconfiguration).
#[async_trait]
pub trait RemoteShell: Send + Sync {
    fn host(&self) -> &str;

    /// Run a command and block until it completes, with the default timeout.
    async fn exec(&self, cmd: &str) -> Result<CommandOutput>;

    /// Run a command with a command-specific timeout.
    async fn exec_timeout(&self, cmd: &str, timeout: Duration) -> Result<CommandOutput>;

    /// Run a command under privilege elevation.
    async fn exec_sudo(&self, cmd: &str) -> Result<CommandOutput>;

    /// Fire a command and return immediately without waiting for exit or
    /// output. Used only when success is expected to break this session.
    async fn exec_no_wait(&self, cmd: &str) -> Result<()>;

    /// Write `content` to `remote_path` on the host.
    async fn upload(&self, remote_path: &str, content: &str) -> Result<()>;

    /// Run a command and stream its combined output line by line.
    async fn stream(&self, cmd: &str) -> Result<ProcessStream>;

    /// Tear down the channel. Safe to call on every exit path.
    async fn close(&self);
}

/// OpenSSH-backed shell using a multiplexed control master.
///
/// The master is authenticated once with `sshpass` (password logins are the
/// norm for freshly cloned guests); subsequent commands ride the control
/// socket. Host keys are not verified; endpoints in this domain are
/// self-signed and short-lived clones.
pub struct SshShell {
    credential: HostCredential,
    control_path: String,
}

impl SshShell {
    /// Establish the control master. Fails with `Auth` on a rejected
    /// password and `Connection` when the endpoint is unreachable.
    pub async fn connect(credential: HostCredential) -> Result<Self> {
        credential.validate()?;
        let control_path = format!("/tmp/vmigrate-ssh-{}", uuid::Uuid::new_v4());
        log_info!("Opening SSH session to {}", credential.address);

        let output = Command::new("sshpass")
            .arg("-p")
            .arg(&credential.password)
            .arg("ssh")
            .args(common_ssh_options(&control_path))
            .args(["-o", "ControlMaster=yes", "-o", "ControlPersist=600", "-M", "-N", "-f"])
            .arg(format!("{}@{}", credential.username, credential.address))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| MigrateError::Connection(format!("failed to spawn ssh: {}", e)))?;

        let code = output.status.code().unwrap_or(-1);
        if code != 0 {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(classify_ssh_failure(&credential.address, code, &stderr));
        }

        Ok(Self {
            credential,
            control_path,
        })
    }

    fn ssh_args(&self, cmd: &str) -> Vec<String> {
        let mut args: Vec<String> = common_ssh_options(&self.control_path)
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.push(format!(
            "{}@{}",
            self.credential.username, self.credential.address
        ));
        args.push(cmd.to_string());
        args
    }

    async fn run_collect(&self, cmd: &str, timeout: Duration) -> Result<CommandOutput> {
        log_debug!("[{}] exec: {}", self.credential.address, self.credential.redact(cmd));

        let future = Command::new("ssh")
            .args(self.ssh_args(cmd))
            .stdin(Stdio::null())
            .output();

        let output = tokio::time::timeout(timeout, future)
            .await
            .map_err(|_| MigrateError::timeout(format!("'{}' on {}", cmd, self.credential.address), timeout.as_secs()))?
            .map_err(|e| MigrateError::Connection(format!("failed to spawn ssh: {}", e)))?;

        let exit_code = output.status.code().unwrap_or(-1);
        if exit_code == 255 {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(classify_ssh_failure(&self.credential.address, exit_code, &stderr));
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
            exit_code,
        })
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    fn host(&self) -> &str {
        &self.credential.address
    }

    async fn exec(&self, cmd: &str) -> Result<CommandOutput> {
        self.run_collect(cmd, DEFAULT_COMMAND_TIMEOUT).await
    }

    async fn exec_timeout(&self, cmd: &str, timeout: Duration) -> Result<CommandOutput> {
        self.run_collect(cmd, timeout).await
    }

    async fn exec_sudo(&self, cmd: &str) -> Result<CommandOutput> {
        // Password goes over stdin, never into argv or logs.
        let wrapped = format!("sudo -S -p '' sh -c {}", shell_quote(cmd));
        log_debug!("[{}] exec (sudo): {}", self.credential.address, cmd);

        let mut child = Command::new("ssh")
            .args(self.ssh_args(&wrapped))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| MigrateError::Connection(format!("failed to spawn ssh: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin
                .write_all(format!("{}\n", self.credential.password).as_bytes())
                .await;
        }

        let output = tokio::time::timeout(DEFAULT_COMMAND_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| {
                MigrateError::timeout(
                    format!("sudo command on {}", self.credential.address),
                    DEFAULT_COMMAND_TIMEOUT.as_secs(),
                )
            })?
            .map_err(|e| MigrateError::Connection(format!("ssh wait failed: {}", e)))?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn exec_no_wait(&self, cmd: &str) -> Result<()> {
        log_info!(
            "[{}] fire-and-forget: {}",
            self.credential.address,
            self.credential.redact(cmd)
        );

        let mut child = Command::new("ssh")
            .args(self.ssh_args(cmd))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| MigrateError::Connection(format!("failed to spawn ssh: {}", e)))?;

        // Reap in the background; the command is expected to drop the link.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        Ok(())
    }

    async fn upload(&self, remote_path: &str, content: &str) -> Result<()> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(content);
        let cmd = format!("echo '{}' | base64 -d > {}", encoded, shell_quote_path(remote_path));
        let output = self.exec(&cmd).await?;
        if !output.success() {
            return Err(MigrateError::tool(
                format!("upload to {}", remote_path),
                output.exit_code,
                output.stderr,
            ));
        }
        Ok(())
    }

    async fn stream(&self, cmd: &str) -> Result<ProcessStream> {
        let args = self.ssh_args(cmd);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        process::stream_command("ssh", &arg_refs)
    }

    async fn close(&self) {
        log_debug!("Closing SSH session to {}", self.credential.address);
        let ok = process::run_quiet(
            "ssh",
            &[
                "-o",
                &format!("ControlPath={}", self.control_path),
                "-O",
                "exit",
                &format!("{}@{}", self.credential.username, self.credential.address),
            ],
        )
        .await
        .unwrap_or(false);
        if !ok {
            log_warn!(
                "SSH control socket for {} was already gone",
                self.credential.address
            );
        }
    }
}

fn common_ssh_options(control_path: &str) -> Vec<String> {
    vec![
        "-o".into(),
        "StrictHostKeyChecking=no".into(),
        "-o".into(),
        "UserKnownHostsFile=/dev/null".into(),
        "-o".into(),
        "LogLevel=ERROR".into(),
        "-o".into(),
        "ConnectTimeout=10".into(),
        "-o".into(),
        format!("ControlPath={}", control_path),
    ]
}

fn classify_ssh_failure(host: &str, exit_code: i32, stderr: &str) -> MigrateError {
    // sshpass exits 5 on a rejected password; ssh itself exits 255 for
    // transport-level failures, which includes auth when keys are in play.
    if exit_code == 5 || stderr.contains("Permission denied") {
        MigrateError::Auth(format!("{}: {}", host, stderr))
    } else {
        MigrateError::Connection(format!("{}: {}", host, stderr))
    }
}

/// Single-quote `s` for safe embedding in a remote `sh -c` invocation.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn shell_quote_path(s: &str) -> String {
    shell_quote(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_escapes_embedded_single_quotes() {
        assert_eq!(shell_quote("echo 'hi'"), r"'echo '\''hi'\'''");
    }

    #[test]
    fn rejected_password_maps_to_auth_error() {
        let err = classify_ssh_failure("10.0.0.1", 5, "");
        assert!(matches!(err, MigrateError::Auth(_)));

        let err = classify_ssh_failure("10.0.0.1", 255, "Permission denied (password)");
        assert!(matches!(err, MigrateError::Auth(_)));
    }

    #[test]
    fn unreachable_host_maps_to_connection_error() {
        let err = classify_ssh_failure("10.0.0.1", 255, "No route to host");
        assert!(matches!(err, MigrateError::Connection(_)));
    }
}
