use crate::shell::RemoteShell;
use crate::{log_warn, MigrateError, Result};
use std::collections::BTreeMap;
use std::time::Duration;

const PING_TIMEOUT: Duration = Duration::from_secs(5);
const CHKDSK_PATH: &str = r"C:\Windows\System32\chkdsk.exe";

/// Reachability of one host from the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingStatus {
    Success,
    Failed,
}

impl PingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PingStatus::Success => "success",
            PingStatus::Failed => "failed",
        }
    }
}

/// Single-packet reachability probe. Any failure mode (bad hostname,
/// nonzero exit, timeout) collapses to `Failed`. This is an operator
/// sanity check, not a diagnosis.
pub async fn ping_host(hostname: &str) -> PingStatus {
    if hostname.is_empty() || hostname == "N/A" {
        return PingStatus::Failed;
    }

    let probe = tokio::process::Command::new("ping")
        .args(["-c", "1", hostname])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status();

    match tokio::time::timeout(PING_TIMEOUT, probe).await {
        Ok(Ok(status)) if status.success() => PingStatus::Success,
        _ => PingStatus::Failed,
    }
}

/// Probe a list of hosts, preserving input order in the result map.
pub async fn ping_hosts(hostnames: &[String]) -> BTreeMap<String, PingStatus> {
    let mut results = BTreeMap::new();
    for hostname in hostnames {
        results.insert(hostname.clone(), ping_host(hostname).await);
    }
    results
}

/// Count files on a Linux guest via a recursive listing. Used to compare
/// source and target after a sync pass; an exact match is not expected,
/// the numbers just need to be in the same ballpark.
pub async fn remote_file_count(shell: &dyn RemoteShell) -> Result<u64> {
    let output = shell.exec("ls -laRt / | wc -l").await?;
    let trimmed = output.stdout.trim();
    if trimmed.is_empty() && !output.stderr.trim().is_empty() {
        return Err(MigrateError::tool(
            "remote file count",
            output.exit_code,
            output.stderr,
        ));
    }
    trimmed
        .parse::<u64>()
        .map_err(|_| MigrateError::Parse(format!("unexpected file count output: '{}'", trimmed)))
}

/// Present drive letters on a Windows guest.
pub async fn windows_drives(shell: &dyn RemoteShell) -> Result<Vec<String>> {
    let cmd = r"for %d in (A B C D E F G H I J K L M N O P Q R S T U V W X Y Z) do @if exist %d:\ echo %d:\";
    let output = shell.exec(cmd).await?;
    Ok(parse_drive_listing(&output.stdout))
}

pub fn parse_drive_listing(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim().trim_end_matches('\\').trim_end_matches(':');
            (trimmed.len() == 1 && trimmed.chars().all(|c| c.is_ascii_alphabetic()))
                .then(|| trimmed.to_string())
        })
        .collect()
}

/// Pull the `NNN KB in MMM files.` summary line out of a chkdsk report.
/// Everything else the tool prints is noise for this comparison.
pub fn extract_chkdsk_summary(output: &str) -> String {
    for line in output.lines() {
        if let Some(summary) = chkdsk_summary_of_line(line) {
            return summary;
        }
    }
    "File count not found".to_string()
}

fn chkdsk_summary_of_line(line: &str) -> Option<String> {
    let kb_pos = line.find(" KB in ")?;
    let kb: u64 = line[..kb_pos].split_whitespace().last()?.parse().ok()?;

    let rest = &line[kb_pos + " KB in ".len()..];
    let files_pos = rest.find(" files.")?;
    let files: u64 = rest[..files_pos].trim().parse().ok()?;

    Some(format!("{} KB in {} files.", kb, files))
}

/// Run chkdsk on every drive of a Windows guest and collect the per-drive
/// file summaries.
pub async fn windows_file_report(shell: &dyn RemoteShell) -> Result<BTreeMap<String, String>> {
    let drives = windows_drives(shell).await?;
    if drives.is_empty() {
        return Err(MigrateError::Precondition(
            "could not detect any drives on the Windows VM".into(),
        ));
    }

    let mut report = BTreeMap::new();
    for drive in drives {
        let cmd = format!("\"{}\" {}:", CHKDSK_PATH, drive);
        match shell.exec(&cmd).await {
            Ok(output) => {
                let text = if output.stdout.trim().is_empty() {
                    output.stderr
                } else {
                    output.stdout
                };
                report.insert(drive, extract_chkdsk_summary(&text));
            }
            Err(err) => {
                log_warn!("chkdsk failed on drive {}: {}", drive, err);
                report.insert(drive, format!("check failed: {}", err));
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drive_listing_parsed() {
        let output = "C:\\\nD:\\\n\nE:\\\n";
        assert_eq!(parse_drive_listing(output), vec!["C", "D", "E"]);
        assert!(parse_drive_listing("").is_empty());
    }

    #[test]
    fn chkdsk_summary_extracted() {
        let output = "\
The type of the file system is NTFS.\n\
WARNING!  /F parameter not specified.\n\
  243664895 KB in 154320 files.\n\
     443520 KB in 38232 indexes.\n";
        assert_eq!(extract_chkdsk_summary(output), "243664895 KB in 154320 files.");
    }

    #[test]
    fn chkdsk_summary_missing_is_reported() {
        assert_eq!(extract_chkdsk_summary("nothing useful"), "File count not found");
    }

    #[tokio::test]
    async fn empty_hostname_fails_fast() {
        assert_eq!(ping_host("").await, PingStatus::Failed);
        assert_eq!(ping_host("N/A").await, PingStatus::Failed);
    }
}
