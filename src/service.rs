use crate::checks::{self, PingStatus};
use crate::cloning::{self, CloneLaunch};
use crate::config::MigrateConfig;
use crate::conversion;
use crate::hypervisor::{GovcClient, HypervisorClient, VmSummary};
use crate::ipreassign::IpReassignment;
use crate::livesync::{self, LinuxSync, SyncAction, WindowsSync};
use crate::prepare;
use crate::request::{
    CloneRequest, ConversionRequest, GuestPairRequest, HostCredential, PrepareRequest,
};
use crate::shell::{RemoteShell, SshShell};
use crate::status::{sync_log_key, StatusStore, StatusWriter, SyncLogStore, WorkflowStatus};
use crate::{log_warn, MigrateError, OsFamily, Result};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type HypervisorFactory =
    Box<dyn Fn(HostCredential) -> Arc<dyn HypervisorClient> + Send + Sync>;

pub type ShellFactory = Arc<
    dyn Fn(HostCredential) -> Pin<Box<dyn Future<Output = Result<Arc<dyn RemoteShell>>> + Send>>
        + Send
        + Sync,
>;

/// Front door for every workflow.
///
/// Launch calls validate synchronously and return as soon as the background
/// work is dispatched; outcomes are only observable through the status and
/// log surfaces. Adapters are injected so tests can substitute fakes for
/// the hypervisor control plane and guest shells.
pub struct MigrationService {
    config: MigrateConfig,
    status: Arc<StatusStore>,
    sync_logs: Arc<SyncLogStore>,
    hypervisors: HypervisorFactory,
    shells: ShellFactory,
}

impl MigrationService {
    pub fn new(config: MigrateConfig) -> Self {
        Self::with_adapters(
            config,
            Box::new(|cred| Arc::new(GovcClient::new(cred))),
            Arc::new(|cred| {
                Box::pin(async move {
                    let shell = SshShell::connect(cred).await?;
                    Ok(Arc::new(shell) as Arc<dyn RemoteShell>)
                })
            }),
        )
    }

    pub fn with_adapters(
        config: MigrateConfig,
        hypervisors: HypervisorFactory,
        shells: ShellFactory,
    ) -> Self {
        Self {
            config,
            status: StatusStore::new(),
            sync_logs: SyncLogStore::new(),
            hypervisors,
            shells,
        }
    }

    pub fn status(&self, key: &str) -> Option<WorkflowStatus> {
        self.status.get(key)
    }

    /// Full ordered log for a key. Only the workflows that append entries
    /// (IP reassignment) populate this; the others carry a tail only.
    pub fn log_entries(&self, key: &str) -> Vec<String> {
        self.status
            .get(key)
            .map(|s| s.log_entries)
            .unwrap_or_default()
    }

    pub fn sync_log(&self, source_ip: &str, target_ip: &str, os_family: OsFamily) -> Option<String> {
        self.sync_logs
            .get(&sync_log_key(source_ip, target_ip, os_family))
    }

    pub async fn list_vms(&self, host: HostCredential) -> Result<Vec<VmSummary>> {
        host.validate()?;
        (self.hypervisors)(host).list_vms().await
    }

    /// Gracefully shut down one VM, blocking until the request is accepted
    /// by the control plane (not until the guest is actually off).
    pub async fn shutdown_vm(&self, host: HostCredential, vm_name: &str) -> Result<()> {
        host.validate()?;
        (self.hypervisors)(host).shutdown_guest(vm_name).await
    }

    /// Single-packet reachability probe for a set of hosts.
    pub async fn ping(&self, hostnames: &[String]) -> BTreeMap<String, PingStatus> {
        checks::ping_hosts(hostnames).await
    }

    /// File count on a Linux guest, for before/after sync comparison.
    pub async fn file_count(&self, guest: HostCredential) -> Result<u64> {
        guest.validate()?;
        let shell = (self.shells)(guest).await?;
        let count = checks::remote_file_count(shell.as_ref()).await;
        shell.close().await;
        count
    }

    /// Per-drive chkdsk file summaries on a Windows guest.
    pub async fn windows_file_report(
        &self,
        guest: HostCredential,
    ) -> Result<BTreeMap<String, String>> {
        guest.validate()?;
        let shell = (self.shells)(guest).await?;
        let report = checks::windows_file_report(shell.as_ref()).await;
        shell.close().await;
        report
    }

    /// Launch (or short-circuit) a clone of the named VM.
    pub async fn launch_clone(&self, request: CloneRequest) -> Result<CloneLaunch> {
        request.validate()?;
        let client = (self.hypervisors)(request.host.clone());
        cloning::launch_clone(client.as_ref(), &request.vm_name).await
    }

    /// Launch the clone-preparation workflow; poll `status(clone_name)`.
    pub fn launch_prepare(&self, request: PrepareRequest) -> Result<()> {
        request.validate()?;
        let client = (self.hypervisors)(request.host.clone());

        self.status.reset(&request.clone_name);
        let writer = StatusWriter::new(self.status.clone(), &request.clone_name);
        let (workflow, cx) = prepare::build(
            client,
            request.clone_name.clone(),
            writer,
            self.config.timeouts.clone(),
        );
        workflow.spawn(cx);
        Ok(())
    }

    /// Launch the conversion workflow; poll `status(clone_name)`.
    pub fn launch_conversion(&self, request: ConversionRequest) -> Result<()> {
        request.validate()?;

        self.status.reset(&request.clone_name);
        let writer = StatusWriter::new(self.status.clone(), &request.clone_name)
            .with_redactions(vec![
                request.source_host.password.clone(),
                request.target_host.password.clone(),
            ]);

        let shells = self.shells.clone();
        let target = request.target_host.clone();
        let connect: conversion::ShellConnector = Box::new(move || (shells)(target.clone()));

        let (workflow, cx) = conversion::build(
            connect,
            request.source_host,
            request.clone_name,
            self.config.conversion.clone(),
            writer,
        );
        workflow.spawn(cx);
        Ok(())
    }

    /// Run a live-sync action for a guest pair; read the transcript via
    /// `sync_log`. Stopping the Windows mirror is not supported: the copy
    /// tool runs to completion on its own.
    pub fn live_sync(&self, request: GuestPairRequest, action: SyncAction) -> Result<String> {
        request.validate()?;
        let key = sync_log_key(&request.source_ip, &request.target_ip, request.os_family);

        match request.os_family {
            OsFamily::Linux => {
                let shells = self.shells.clone();
                let logs = self.sync_logs.clone();
                let key_clone = key.clone();
                tokio::spawn(async move {
                    let source = match (shells)(request.source_credential()).await {
                        Ok(shell) => shell,
                        Err(err) => {
                            logs.replace(
                                &key_clone,
                                format!("--- Failed to reach source: {} ---\n", err),
                            );
                            return;
                        }
                    };
                    let target = match (shells)(request.target_credential()).await {
                        Ok(shell) => shell,
                        Err(err) => {
                            logs.replace(
                                &key_clone,
                                format!("--- Failed to reach target: {} ---\n", err),
                            );
                            source.close().await;
                            return;
                        }
                    };
                    LinuxSync::new(
                        source,
                        target,
                        &request.target_ip,
                        &request.username,
                        logs,
                        key_clone,
                    )
                    .run(action)
                    .await;
                });
            }
            OsFamily::Windows => match action {
                SyncAction::Start => {
                    let script = livesync::robocopy_script(
                        &request.source_ip,
                        &request.target_ip,
                        &request.username,
                        &request.password,
                        &self.config.livesync.drive_letters,
                    );
                    let sync = WindowsSync::new(
                        livesync::powershell_launcher(),
                        self.sync_logs.clone(),
                        key.clone(),
                    );
                    let source_ip = request.source_ip.clone();
                    let target_ip = request.target_ip.clone();
                    tokio::spawn(async move {
                        sync.run(script, &source_ip, &target_ip).await;
                    });
                }
                SyncAction::Logs => {
                    // The mirror writes its transcript as it runs; make
                    // sure a poller gets an answer even before the first run.
                    if self.sync_logs.get(&key).is_none() {
                        self.sync_logs
                            .replace(&key, "No sync has been run for this pair.\n");
                    }
                }
                SyncAction::Stop => {
                    return Err(MigrateError::InvalidRequest(
                        "stopping a Windows mirror is not supported".into(),
                    ));
                }
            },
        }
        Ok(key)
    }

    /// Launch IP reassignment for a guest; poll `log_entries(source_ip)`.
    pub fn launch_ip_reassignment(&self, request: GuestPairRequest) -> Result<()> {
        request.validate()?;

        self.status.reset(&request.source_ip);
        let writer = StatusWriter::new(self.status.clone(), &request.source_ip)
            .with_redactions(vec![request.password.clone()]);

        let shells = self.shells.clone();
        tokio::spawn(async move {
            writer.append(&format!(
                "[INFO] Connecting to {} via SSH...",
                request.source_ip
            ));
            let shell = match (shells)(request.source_credential()).await {
                Ok(shell) => shell,
                Err(err) => {
                    writer.append(&format!("[ERROR] {}", err));
                    writer.fail(&err.to_string());
                    log_warn!("IP reassignment connect failed for {}: {}", request.source_ip, err);
                    return;
                }
            };
            IpReassignment::new(
                shell,
                &request.source_ip,
                &request.target_ip,
                request.os_family,
                writer,
            )
            .run()
            .await;
        });
        Ok(())
    }
}
