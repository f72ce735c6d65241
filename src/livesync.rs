use crate::process::ProcessStream;
use crate::shell::RemoteShell;
use crate::status::SyncLogStore;
use crate::{log_info, log_warn, Result};
use std::sync::Arc;

/// Paths that must never be mirrored off a live Linux root filesystem.
const EXCLUDE_LIST: &str = "/proc/\n/sys/\n/tmp/\n/run/\n/mnt/\n/media/\n/lost+found/\n/dev/\n\
/var/lock/\n/var/run/\n/var/tmp/\n/root/.ssh/\n/var/log/lsyncd/\n/etc/lsyncd.conf\n\
/etc/lsyncd.exclude\n/usr/bin/lsyncd\n/etc/systemd/system/lsyncd*\n/lib/systemd/system/lsyncd*";

const LSYNCD_LOG: &str = "/var/log/lsyncd/lsyncd.log";

/// Which live-sync operation a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Start,
    Stop,
    Logs,
}

/// Replication daemon configuration for a full-root mirror to `target_ip`.
///
/// Delete-on-remove semantics plus the fixed exclude file keep the target a
/// faithful mirror without clobbering its own volatile paths.
pub fn lsyncd_config(target_ip: &str) -> String {
    format!(
        r#"settings {{
   logfile = "{log}",
   statusFile = "/var/log/lsyncd/lsyncd.status",
   nodaemon = true,
   insist = true,
   inotifyMode = "CloseWrite",
   maxProcesses = 1,
}}
sync {{
   default.rsyncssh,
   source = "/",
   host = "{target_ip}",
   targetdir = "/",
   delay = 0,
   rsync = {{
      archive = true,
      compress = true,
      verbose = true,
      rsh = "/usr/bin/ssh -o StrictHostKeyChecking=no",
      _extra = {{
         "--delete", "--exclude-from=/etc/lsyncd.exclude"
      }},
   }}
}}
"#,
        log = LSYNCD_LOG,
        target_ip = target_ip,
    )
}

/// Linux live-sync: lsyncd on the source pushing to the target over rsync.
///
/// Unlike the terminal workflows, every action rebuilds a free-form
/// transcript for the pair's log key. Failures land in the transcript, not
/// in a structured error status.
pub struct LinuxSync {
    source: Arc<dyn RemoteShell>,
    target: Arc<dyn RemoteShell>,
    target_ip: String,
    username: String,
    logs: Arc<SyncLogStore>,
    key: String,
}

impl LinuxSync {
    pub fn new(
        source: Arc<dyn RemoteShell>,
        target: Arc<dyn RemoteShell>,
        target_ip: impl Into<String>,
        username: impl Into<String>,
        logs: Arc<SyncLogStore>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            source,
            target,
            target_ip: target_ip.into(),
            username: username.into(),
            logs,
            key: key.into(),
        }
    }

    /// Run one action to completion, then publish the transcript.
    pub async fn run(self, action: SyncAction) {
        let mut transcript = String::new();
        let result = match action {
            SyncAction::Start => self.start(&mut transcript).await,
            SyncAction::Stop => self.stop(&mut transcript).await,
            SyncAction::Logs => self.fetch_logs(&mut transcript).await,
        };
        if let Err(err) = result {
            transcript.push_str(&format!("\n--- An unexpected error occurred: {} ---\n", err));
            log_warn!("Live sync action failed for '{}': {}", self.key, err);
        }
        self.logs.replace(&self.key, transcript);
        self.source.close().await;
        self.target.close().await;
    }

    async fn start(&self, buf: &mut String) -> Result<()> {
        buf.push_str("--- Starting Live Sync Setup ---\n");

        self.logged_sudo(&self.source, "systemctl is-active sshd", buf).await?;
        self.logged_sudo(&self.target, "systemctl is-active sshd", buf).await?;

        self.bootstrap_key(buf).await?;

        self.logged(&self.source, "command -v lsyncd", buf).await?;
        self.logged(&self.target, "command -v rsync", buf).await?;

        buf.push_str("Updating lsyncd configuration on source...\n");
        upload_privileged(self.source.as_ref(), "/etc/lsyncd.conf", &lsyncd_config(&self.target_ip))
            .await?;
        upload_privileged(self.source.as_ref(), "/etc/lsyncd.exclude", EXCLUDE_LIST).await?;
        buf.push_str("lsyncd configuration updated.\n");

        buf.push_str("--- Setup Complete, Starting Live Sync ---\n");
        self.logged_sudo(&self.source, "systemctl start lsyncd", buf).await?;
        buf.push_str("lsyncd service started.\n");
        log_info!("Live sync started for '{}'", self.key);
        Ok(())
    }

    async fn stop(&self, buf: &mut String) -> Result<()> {
        buf.push_str("--- Stopping Live Sync ---\n");
        self.logged_sudo(&self.source, "systemctl stop lsyncd", buf).await?;
        buf.push_str("lsyncd service stopped.\n");
        Ok(())
    }

    async fn fetch_logs(&self, buf: &mut String) -> Result<()> {
        buf.push_str("--- Fetching Logs ---\n");
        let output = self
            .logged_sudo(&self.source, &format!("tail -n 100 {}", LSYNCD_LOG), buf)
            .await?;
        if output.trim().is_empty() {
            buf.push_str("Log file is empty or does not exist.\n");
        }
        Ok(())
    }

    /// Generate a key pair on the source if absent, install the public key
    /// on the target, and prove a non-interactive login works.
    async fn bootstrap_key(&self, buf: &mut String) -> Result<()> {
        buf.push_str("Checking/creating SSH key on source...\n");
        let exists = self
            .logged(&self.source, "[ -f ~/.ssh/id_rsa ] && echo yes || echo no", buf)
            .await?;
        if !exists.contains("yes") {
            self.logged(
                &self.source,
                "ssh-keygen -t rsa -b 2048 -N \"\" -f ~/.ssh/id_rsa -q",
                buf,
            )
            .await?;
        }

        let pub_key = self.logged(&self.source, "cat ~/.ssh/id_rsa.pub", buf).await?;
        if pub_key.trim().is_empty() {
            return Err(crate::MigrateError::Precondition(
                "failed to retrieve public key from source".into(),
            ));
        }

        buf.push_str("Configuring SSH key on target...\n");
        self.logged(&self.target, "mkdir -p ~/.ssh && chmod 700 ~/.ssh", buf).await?;
        self.logged(
            &self.target,
            &format!(
                "echo \"{}\" >> ~/.ssh/authorized_keys && chmod 600 ~/.ssh/authorized_keys",
                pub_key.trim()
            ),
            buf,
        )
        .await?;

        buf.push_str("Testing passwordless SSH from source to target...\n");
        let test = format!(
            "ssh -o BatchMode=yes -o StrictHostKeyChecking=no {}@{} \"echo ok\"",
            self.username, self.target_ip
        );
        let output = self.source.exec(&test).await?;
        append_host_output(buf, self.source.host(), &output.stdout, &output.stderr);

        if output.stdout.contains("ok") && output.stderr.trim().is_empty() {
            buf.push_str("Passwordless SSH setup successful.\n");
            Ok(())
        } else {
            Err(crate::MigrateError::Precondition(format!(
                "failed to setup passwordless SSH: {}",
                output.stderr.trim()
            )))
        }
    }

    async fn logged(
        &self,
        shell: &Arc<dyn RemoteShell>,
        cmd: &str,
        buf: &mut String,
    ) -> Result<String> {
        let output = shell.exec(cmd).await?;
        append_host_output(buf, shell.host(), &output.stdout, &output.stderr);
        Ok(output.stdout)
    }

    async fn logged_sudo(
        &self,
        shell: &Arc<dyn RemoteShell>,
        cmd: &str,
        buf: &mut String,
    ) -> Result<String> {
        let output = shell.exec_sudo(cmd).await?;
        append_host_output(buf, shell.host(), &output.stdout, &output.stderr);
        Ok(output.stdout)
    }
}

fn append_host_output(buf: &mut String, host: &str, stdout: &str, stderr: &str) {
    if !stdout.trim().is_empty() {
        buf.push_str(&format!("Output from {}: {}\n", host, stdout.trim()));
    }
    if !stderr.trim().is_empty() {
        buf.push_str(&format!("Error from {}: {}\n", host, stderr.trim()));
    }
}

/// Write `content` to a root-owned path via an elevated tee.
async fn upload_privileged(shell: &dyn RemoteShell, path: &str, content: &str) -> Result<()> {
    use base64::Engine;
    let encoded = base64::engine::general_purpose::STANDARD.encode(content);
    let cmd = format!("echo \"{}\" | base64 -d | tee {} > /dev/null", encoded, path);
    shell.exec_sudo(&cmd).await?;
    Ok(())
}

/// Mirroring script for the Windows drive-share sync path.
///
/// Exit codes 0 and 1 from the copy tool are both success: 1 means "files
/// were copied," which during a live mirror is the normal case. The system
/// drive additionally excludes OS directories and volatile files that must
/// not land on a clone about to boot.
pub fn robocopy_script(
    source_ip: &str,
    target_ip: &str,
    username: &str,
    password: &str,
    drive_letters: &[String],
) -> String {
    let drives = drive_letters
        .iter()
        .map(|d| format!("\"{}\"", d))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        r#"$ErrorActionPreference = "Stop"
$sourceVMIP = "{source_ip}"
$cloneVMIP = "{target_ip}"
$username = "{username}"
$password = "{password}"
$retry = 1
$wait = 1
$driveLetters = {drives}

function Test-NetUse {{
    param ($Path, $User, $Pass)
    try {{
        net use $Path /user:$User $Pass 2>&1 | Out-Null
        if ($LASTEXITCODE -eq 0) {{
            Write-Host "Successfully connected to $Path"
            return $true
        }} else {{
            Write-Host "Failed to connect to $Path"
            return $false
        }}
    }} catch {{
        Write-Host "Error connecting to $Path : $_"
        return $false
    }}
}}

if (-not (Test-NetUse "\\$sourceVMIP\C$" $username $password)) {{
    Write-Error "Failed to connect to source VM C$ share"
    exit 1
}}
if (-not (Test-NetUse "\\$cloneVMIP\C$" $username $password)) {{
    Write-Error "Failed to connect to target VM C$ share"
    exit 1
}}

foreach ($drive in $driveLetters) {{
    $sourcePath = "\\$sourceVMIP\$drive`$"
    $targetPath = "\\$cloneVMIP\$drive`$"
    Write-Host "`nSyncing $sourcePath -> $targetPath..."
    $baseOptions = @(
        "robocopy",
        "`"$sourcePath`"",
        "`"$targetPath`"",
        "/MIR",
        "/Z",
        "/R:$retry",
        "/W:$wait",
        "/COPY:DAT",
        "/DCOPY:T",
        "/FFT",
        "/LOG+:robocopy_log.txt"
    )
    if ($drive -eq "C") {{
        $baseOptions += @(
            "/XD",
                "`"$sourcePath\Windows`"",
                "`"$sourcePath\Program Files`"",
                "`"$sourcePath\Program Files (x86)`"",
                "`"$sourcePath\ProgramData`"",
                "`"$sourcePath\System Volume Information`"",
                "`"$sourcePath\$Recycle.Bin`"",
                "`"$sourcePath\Recovery`"",
                "`"$sourcePath\PerfLogs`"",
            "/XF",
                "pagefile.sys",
                "hiberfil.sys",
                "swapfile.sys",
                "DumpStack.log.tmp",
                "*.etl",
                "*.evtx",
                "*.log1"
        )
    }}
    $cmd = $baseOptions -join " "
    Write-Host "Executing: $cmd"
    try {{
        Invoke-Expression $cmd
        if ($LASTEXITCODE -eq 0 -or $LASTEXITCODE -eq 1) {{
            Write-Host "Robocopy completed successfully for drive $drive"
        }} else {{
            Write-Host "Robocopy failed for drive $drive with exit code $LASTEXITCODE"
        }}
    }} catch {{
        Write-Host "Error executing robocopy for drive $drive : $_"
    }}
}}
"#
    )
}

/// Launcher indirection so tests can feed a fabricated output stream.
pub type ScriptLauncher = Box<dyn Fn(&str) -> Result<ProcessStream> + Send + Sync>;

pub fn powershell_launcher() -> ScriptLauncher {
    Box::new(|script: &str| {
        crate::process::stream_command(
            "powershell.exe",
            &["-NoProfile", "-ExecutionPolicy", "Bypass", "-Command", script],
        )
    })
}

/// Windows live-sync: drive-share mirroring driven by a generated script,
/// with the tool's output streamed into the pair's log buffer as it runs.
pub struct WindowsSync {
    launcher: ScriptLauncher,
    logs: Arc<SyncLogStore>,
    key: String,
}

impl WindowsSync {
    pub fn new(launcher: ScriptLauncher, logs: Arc<SyncLogStore>, key: impl Into<String>) -> Self {
        Self {
            launcher,
            logs,
            key: key.into(),
        }
    }

    pub async fn run(self, script: String, source_ip: &str, target_ip: &str) {
        self.logs.replace(
            &self.key,
            format!("Initiating Robocopy sync for {} -> {}...\n", source_ip, target_ip),
        );

        let mut stream = match (self.launcher)(&script) {
            Ok(stream) => stream,
            Err(err) => {
                self.logs
                    .append(&self.key, &format!("Failed to launch sync script: {}\n", err));
                return;
            }
        };

        while let Some(line) = stream.next_line().await {
            self.logs.append(&self.key, &format!("{}\n", line));
        }
        match stream.wait().await {
            Ok(code) => self
                .logs
                .append(&self.key, &format!("Sync script exited with code {}\n", code)),
            Err(err) => self
                .logs
                .append(&self.key, &format!("Sync script wait failed: {}\n", err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::sync_log_key;
    use crate::OsFamily;

    #[test]
    fn lsyncd_config_targets_the_right_host() {
        let config = lsyncd_config("192.168.1.50");
        assert!(config.contains("host = \"192.168.1.50\""));
        assert!(config.contains("--delete"));
        assert!(config.contains("--exclude-from=/etc/lsyncd.exclude"));
        assert!(config.contains("default.rsyncssh"));
    }

    #[test]
    fn exclude_list_covers_volatile_paths() {
        for path in ["/proc/", "/sys/", "/dev/", "/root/.ssh/", "/etc/lsyncd.conf"] {
            assert!(EXCLUDE_LIST.contains(path), "missing {}", path);
        }
    }

    #[test]
    fn robocopy_script_mirrors_with_system_drive_exclusions() {
        let drives = vec!["C".to_string(), "D".to_string()];
        let script = robocopy_script("10.0.0.1", "10.0.0.2", "admin", "pw", &drives);
        assert!(script.contains("/MIR"));
        assert!(script.contains("/R:$retry"));
        assert!(script.contains("pagefile.sys"));
        // Exclusions are gated on the system drive only.
        assert!(script.contains("if ($drive -eq \"C\")"));
        assert!(script.contains("$LASTEXITCODE -eq 0 -or $LASTEXITCODE -eq 1"));
        assert!(script.contains("\"C\", \"D\""));
    }

    #[tokio::test]
    async fn windows_sync_streams_output_into_log_buffer() {
        let logs = SyncLogStore::new();
        let key = sync_log_key("10.0.0.1", "10.0.0.2", OsFamily::Windows);

        let launcher: ScriptLauncher = Box::new(|_script| {
            let (line_tx, line_rx) = tokio::sync::mpsc::channel(8);
            let (exit_tx, exit_rx) = tokio::sync::oneshot::channel();
            line_tx.try_send("Syncing C...".to_string()).unwrap();
            line_tx
                .try_send("Robocopy completed successfully for drive C".to_string())
                .unwrap();
            drop(line_tx);
            exit_tx.send(0).unwrap();
            Ok(ProcessStream::from_parts(line_rx, exit_rx))
        });

        let sync = WindowsSync::new(launcher, logs.clone(), key.clone());
        let script = robocopy_script("10.0.0.1", "10.0.0.2", "admin", "pw", &["C".to_string()]);
        sync.run(script, "10.0.0.1", "10.0.0.2").await;

        let transcript = logs.get(&key).unwrap();
        assert!(transcript.contains("Initiating Robocopy sync"));
        assert!(transcript.contains("completed successfully for drive C"));
        assert!(transcript.contains("exited with code 0"));
    }
}
