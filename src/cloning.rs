use crate::hypervisor::{HypervisorClient, PowerState};
use crate::{log_info, MigrateError, Result};

/// Marker embedded in every clone name: `<base>-<marker>-<timestamp>`.
pub const CLONE_MARKER: &str = "migrate-clone";

const TIMESTAMP_LEN: usize = 14; // %Y%m%d%H%M%S

/// Build the clone name for `base` using the current time.
pub fn clone_name_for(base: &str) -> String {
    let timestamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
    format!("{}-{}-{}", base, CLONE_MARKER, timestamp)
}

/// Prefix every clone of `base` starts with.
fn clone_prefix(base: &str) -> String {
    format!("{}-{}-", base, CLONE_MARKER)
}

/// Recover the base entity name from a clone name.
///
/// Fails fast with a descriptive error when the name does not match the
/// `<base>-<marker>-<14-digit-timestamp>` convention, since every later
/// conversion step depends on the derived name.
pub fn base_name_of(clone_name: &str) -> Result<String> {
    let marker = format!("-{}-", CLONE_MARKER);
    if let Some(pos) = clone_name.rfind(&marker) {
        let suffix = &clone_name[pos + marker.len()..];
        if suffix.len() == TIMESTAMP_LEN && suffix.chars().all(|c| c.is_ascii_digit()) {
            let base = &clone_name[..pos];
            if !base.is_empty() {
                return Ok(base.to_string());
            }
        }
    }
    Err(MigrateError::Precondition(format!(
        "'{}' does not match the clone naming convention '<name>-{}-<timestamp>'",
        clone_name, CLONE_MARKER
    )))
}

/// Outcome of a clone launch.
#[derive(Debug, Clone)]
pub enum CloneLaunch {
    /// A clone of this VM already exists; no new task was submitted.
    AlreadyExists { clone_name: String },
    /// A clone task was submitted; poll it via the hypervisor task surface.
    Started { clone_name: String, task_id: String },
}

/// Launch a clone of `vm_name`, idempotently.
///
/// The idempotency check runs first: if any VM already carries this base
/// name's clone prefix, its identity is returned without submitting a second
/// task. The source must exist and be powered on. Cloning itself is tracked
/// by the hypervisor's task mechanism, not the status store.
pub async fn launch_clone(client: &dyn HypervisorClient, vm_name: &str) -> Result<CloneLaunch> {
    let prefix = clone_prefix(vm_name);
    let inventory = client.list_vms().await?;

    if let Some(existing) = inventory.iter().find(|vm| vm.name.starts_with(&prefix)) {
        log_info!(
            "Clone '{}' already exists for '{}', skipping",
            existing.name,
            vm_name
        );
        return Ok(CloneLaunch::AlreadyExists {
            clone_name: existing.name.clone(),
        });
    }

    let source = inventory
        .iter()
        .find(|vm| vm.name == vm_name)
        .ok_or_else(|| MigrateError::Precondition(format!("VM '{}' not found", vm_name)))?;

    if source.power_state != PowerState::PoweredOn {
        return Err(MigrateError::Precondition(format!(
            "VM '{}' is not powered on, skipping clone",
            vm_name
        )));
    }

    let clone_name = clone_name_for(vm_name);
    log_info!("Initiating clone of '{}' as '{}'", vm_name, clone_name);
    let task_id = client.clone_vm(source, &clone_name).await?;

    Ok(CloneLaunch::Started {
        clone_name,
        task_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_name_round_trips_to_base() {
        let clone = clone_name_for("web-01");
        assert_eq!(base_name_of(&clone).unwrap(), "web-01");
    }

    #[test]
    fn base_with_hyphens_survives() {
        let name = format!("my-app-vm-{}-20260829120000", CLONE_MARKER);
        assert_eq!(base_name_of(&name).unwrap(), "my-app-vm");
    }

    #[test]
    fn malformed_clone_names_are_rejected() {
        assert!(base_name_of("plain-vm").is_err());
        assert!(base_name_of(&format!("vm-{}-notdigits", CLONE_MARKER)).is_err());
        assert!(base_name_of(&format!("vm-{}-123", CLONE_MARKER)).is_err());
        assert!(base_name_of(&format!("-{}-20260829120000", CLONE_MARKER)).is_err());
    }
}
