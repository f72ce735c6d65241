use crate::{MigrateError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Address plus login for one endpoint (vCenter, KVM host, or guest).
///
/// Passwords never reach a status record or a log line verbatim; use
/// [`HostCredential::redact`] on anything derived from a remote command
/// before handing it to a status writer.
#[derive(Clone, Serialize, Deserialize)]
pub struct HostCredential {
    pub address: String,
    pub username: String,
    pub password: String,
}

impl HostCredential {
    pub fn new(
        address: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(MigrateError::InvalidRequest("host address is empty".into()));
        }
        if self.username.trim().is_empty() {
            return Err(MigrateError::InvalidRequest(format!(
                "no username supplied for host {}",
                self.address
            )));
        }
        Ok(())
    }

    /// Replace any occurrence of this credential's password in `line`.
    pub fn redact(&self, line: &str) -> String {
        if self.password.is_empty() {
            return line.to_string();
        }
        line.replace(&self.password, "******")
    }
}

// Keep passwords out of debug output and panics.
impl fmt::Debug for HostCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostCredential")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &"******")
            .finish()
    }
}

/// Closed set of guest platforms the network-changing workflows dispatch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Windows,
    Linux,
}

impl OsFamily {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "windows" => Ok(OsFamily::Windows),
            "linux" => Ok(OsFamily::Linux),
            other => Err(MigrateError::InvalidRequest(format!(
                "unsupported OS family '{}'",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OsFamily::Windows => "windows",
            OsFamily::Linux => "linux",
        }
    }
}

/// Guest OS classification derived from a hypervisor inventory entry.
pub fn classify_guest_os(guest_full_name: &str) -> Option<OsFamily> {
    let lower = guest_full_name.to_lowercase();
    if lower.contains("windows") {
        Some(OsFamily::Windows)
    } else if lower.contains("linux") {
        Some(OsFamily::Linux)
    } else {
        None
    }
}

/// Input for launching a clone of a powered-on source VM.
#[derive(Debug, Clone)]
pub struct CloneRequest {
    pub host: HostCredential,
    pub vm_name: String,
}

impl CloneRequest {
    pub fn validate(&self) -> Result<()> {
        self.host.validate()?;
        require_name(&self.vm_name, "vm name")
    }
}

/// Input for the clone-preparation workflow.
#[derive(Debug, Clone)]
pub struct PrepareRequest {
    pub host: HostCredential,
    pub clone_name: String,
}

impl PrepareRequest {
    pub fn validate(&self) -> Result<()> {
        self.host.validate()?;
        require_name(&self.clone_name, "clone name")
    }
}

/// Input for the disk/format conversion workflow.
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub source_host: HostCredential,
    pub target_host: HostCredential,
    pub clone_name: String,
}

impl ConversionRequest {
    pub fn validate(&self) -> Result<()> {
        self.source_host.validate()?;
        self.target_host.validate()?;
        require_name(&self.clone_name, "clone name")
    }
}

/// Input shared by live-sync and IP reassignment: a source/target guest pair
/// reached over SSH with one set of credentials.
#[derive(Debug, Clone)]
pub struct GuestPairRequest {
    pub source_ip: String,
    pub target_ip: String,
    pub username: String,
    pub password: String,
    pub os_family: OsFamily,
}

impl GuestPairRequest {
    pub fn validate(&self) -> Result<()> {
        require_ipv4(&self.source_ip, "source IP")?;
        require_ipv4(&self.target_ip, "target IP")?;
        if self.username.trim().is_empty() {
            return Err(MigrateError::InvalidRequest("username is empty".into()));
        }
        Ok(())
    }

    pub fn source_credential(&self) -> HostCredential {
        HostCredential::new(&self.source_ip, &self.username, &self.password)
    }

    pub fn target_credential(&self) -> HostCredential {
        HostCredential::new(&self.target_ip, &self.username, &self.password)
    }
}

fn require_name(value: &str, what: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(MigrateError::InvalidRequest(format!("{} is empty", what)))
    } else {
        Ok(())
    }
}

fn require_ipv4(value: &str, what: &str) -> Result<()> {
    value.parse::<Ipv4Addr>().map(|_| ()).map_err(|_| {
        MigrateError::InvalidRequest(format!("{} '{}' is not a valid IPv4 address", what, value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_hides_password() {
        let cred = HostCredential::new("10.0.0.1", "root", "s3cret");
        let rendered = format!("{:?}", cred);
        assert!(!rendered.contains("s3cret"));
        assert!(rendered.contains("******"));
    }

    #[test]
    fn redact_strips_password_from_line() {
        let cred = HostCredential::new("10.0.0.1", "root", "s3cret");
        let line = cred.redact("echo 's3cret' > /tmp/pass");
        assert!(!line.contains("s3cret"));
    }

    #[test]
    fn guest_pair_rejects_bad_ip() {
        let req = GuestPairRequest {
            source_ip: "not-an-ip".into(),
            target_ip: "10.0.0.2".into(),
            username: "root".into(),
            password: "pw".into(),
            os_family: OsFamily::Linux,
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn classify_guest_os_matches_inventory_strings() {
        assert_eq!(
            classify_guest_os("Microsoft Windows Server 2019 (64-bit)"),
            Some(OsFamily::Windows)
        );
        assert_eq!(
            classify_guest_os("Ubuntu Linux (64-bit)"),
            Some(OsFamily::Linux)
        );
        assert_eq!(classify_guest_os("FreeBSD 13"), None);
    }
}
