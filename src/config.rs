use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Deployment-specific settings, loaded from a TOML `Migratefile`.
///
/// Everything here has a default matching a typical single-site deployment;
/// the file only needs the fields that differ.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateConfig {
    #[serde(default)]
    pub conversion: ConversionConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub livesync: LiveSyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionConfig {
    /// Mounted datastore on the KVM host that receives converted disks.
    #[serde(default = "default_output_datastore")]
    pub output_datastore: String,
    /// VDDK library directory on the KVM host.
    #[serde(default = "default_vddk_libdir")]
    pub vddk_libdir: String,
    /// Inventory path appended to the vpx:// connection URL.
    #[serde(default = "default_vcenter_path")]
    pub vcenter_path: String,
    /// Libvirt network the converted domain attaches to.
    #[serde(default = "default_target_network")]
    pub target_network: String,
    /// Bridge name the conversion tool emits, to be rewritten.
    #[serde(default = "default_source_bridge")]
    pub source_bridge: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Bound on any single hypervisor task (clone excepted, it has its own
    /// polling surface).
    #[serde(default = "default_task_timeout")]
    pub task_secs: u64,
    /// Bound on waiting for guest tools after power-on.
    #[serde(default = "default_task_timeout")]
    pub tools_secs: u64,
    /// Bound on waiting for a graceful guest shutdown.
    #[serde(default = "default_task_timeout")]
    pub shutdown_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveSyncConfig {
    /// Drive letters mirrored by the Windows sync path.
    #[serde(default = "default_drive_letters")]
    pub drive_letters: Vec<String>,
}

fn default_output_datastore() -> String {
    "/mnt/migration-datastore".to_string()
}

fn default_vddk_libdir() -> String {
    "/opt/vmware-vix-disklib-distrib".to_string()
}

fn default_vcenter_path() -> String {
    "/Datacenter".to_string()
}

fn default_target_network() -> String {
    "Compute".to_string()
}

fn default_source_bridge() -> String {
    "VM Network".to_string()
}

fn default_task_timeout() -> u64 {
    600
}

fn default_drive_letters() -> Vec<String> {
    vec!["C".to_string(), "D".to_string(), "E".to_string()]
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            conversion: ConversionConfig::default(),
            timeouts: TimeoutConfig::default(),
            livesync: LiveSyncConfig::default(),
        }
    }
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            output_datastore: default_output_datastore(),
            vddk_libdir: default_vddk_libdir(),
            vcenter_path: default_vcenter_path(),
            target_network: default_target_network(),
            source_bridge: default_source_bridge(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            task_secs: default_task_timeout(),
            tools_secs: default_task_timeout(),
            shutdown_secs: default_task_timeout(),
        }
    }
}

impl Default for LiveSyncConfig {
    fn default() -> Self {
        Self {
            drive_letters: default_drive_letters(),
        }
    }
}

impl MigrateConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let config: MigrateConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let config = MigrateConfig::load(Path::new("/nonexistent/Migratefile")).unwrap();
        assert_eq!(config.conversion.target_network, "Compute");
        assert_eq!(config.timeouts.task_secs, 600);
    }

    #[test]
    fn partial_file_keeps_defaults_for_rest() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[conversion]\noutput_datastore = \"/mnt/pool-a\"\n"
        )
        .unwrap();

        let config = MigrateConfig::load(file.path()).unwrap();
        assert_eq!(config.conversion.output_datastore, "/mnt/pool-a");
        assert_eq!(config.conversion.vddk_libdir, "/opt/vmware-vix-disklib-distrib");
        assert_eq!(config.livesync.drive_letters, vec!["C", "D", "E"]);
    }
}
