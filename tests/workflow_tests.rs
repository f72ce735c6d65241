use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vmigrate::cloning::{launch_clone, CloneLaunch};
use vmigrate::config::{ConversionConfig, MigrateConfig, TimeoutConfig};
use vmigrate::conversion;
use vmigrate::hypervisor::{HypervisorClient, PowerState, TaskState, ToolsStatus, VmSummary};
use vmigrate::livesync::SyncAction;
use vmigrate::prepare;
use vmigrate::process::ProcessStream;
use vmigrate::request::{GuestPairRequest, HostCredential};
use vmigrate::service::{HypervisorFactory, ShellFactory};
use vmigrate::shell::{CommandOutput, RemoteShell};
use vmigrate::status::{StatusStore, StatusWriter};
use vmigrate::{MigrateError, MigrationService, OsFamily, Result, WorkflowState};

fn vm(name: &str, power: PowerState, tools: ToolsStatus) -> VmSummary {
    VmSummary {
        name: name.to_string(),
        power_state: power,
        tools,
        guest_os: None,
        ip_address: None,
        hostname: None,
        datastore: Some("datastore1".to_string()),
    }
}

/// In-memory control plane with just enough behavior for the workflows:
/// power transitions apply immediately and submitted tasks settle according
/// to `tasks_stick` (stuck tasks never leave `Running`).
struct FakeHypervisor {
    vms: Mutex<Vec<VmSummary>>,
    tasks: Mutex<HashMap<String, TaskState>>,
    clone_submissions: Mutex<u32>,
    shutdown_calls: Mutex<u32>,
    nic_calls: Mutex<u32>,
    tasks_stick: bool,
}

impl FakeHypervisor {
    fn with_vms(vms: Vec<VmSummary>) -> Self {
        Self {
            vms: Mutex::new(vms),
            tasks: Mutex::new(HashMap::new()),
            clone_submissions: Mutex::new(0),
            shutdown_calls: Mutex::new(0),
            nic_calls: Mutex::new(0),
            tasks_stick: false,
        }
    }

    fn with_stuck_tasks(mut self) -> Self {
        self.tasks_stick = true;
        self
    }

    fn submit(&self, state: TaskState) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.tasks.lock().unwrap().insert(id.clone(), state);
        id
    }
}

#[async_trait]
impl HypervisorClient for FakeHypervisor {
    async fn list_vms(&self) -> Result<Vec<VmSummary>> {
        Ok(self.vms.lock().unwrap().clone())
    }

    async fn find_vm(&self, name: &str) -> Result<Option<VmSummary>> {
        Ok(self
            .vms
            .lock()
            .unwrap()
            .iter()
            .find(|vm| vm.name == name)
            .cloned())
    }

    async fn clone_vm(&self, source: &VmSummary, clone_name: &str) -> Result<String> {
        *self.clone_submissions.lock().unwrap() += 1;
        let mut clone = source.clone();
        clone.name = clone_name.to_string();
        clone.power_state = PowerState::PoweredOff;
        clone.tools = ToolsStatus::NotRunning;
        self.vms.lock().unwrap().push(clone);
        Ok(self.submit(TaskState::Success))
    }

    async fn power_on(&self, name: &str) -> Result<String> {
        if self.tasks_stick {
            return Ok(self.submit(TaskState::Running));
        }
        let mut vms = self.vms.lock().unwrap();
        if let Some(vm) = vms.iter_mut().find(|vm| vm.name == name) {
            vm.power_state = PowerState::PoweredOn;
            vm.tools = ToolsStatus::Running;
        }
        Ok(self.submit(TaskState::Success))
    }

    async fn shutdown_guest(&self, name: &str) -> Result<()> {
        *self.shutdown_calls.lock().unwrap() += 1;
        let mut vms = self.vms.lock().unwrap();
        if let Some(vm) = vms.iter_mut().find(|vm| vm.name == name) {
            vm.power_state = PowerState::PoweredOff;
            vm.tools = ToolsStatus::NotRunning;
        }
        Ok(())
    }

    async fn disable_nic_start_connected(&self, _name: &str) -> Result<Vec<String>> {
        *self.nic_calls.lock().unwrap() += 1;
        Ok(vec!["ethernet-0".to_string()])
    }

    async fn task_state(&self, task_id: &str) -> Result<TaskState> {
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .get(task_id)
            .cloned()
            .unwrap_or(TaskState::Running))
    }
}

#[tokio::test]
async fn second_clone_launch_reports_already_exists() {
    let fake = FakeHypervisor::with_vms(vec![vm(
        "web-01",
        PowerState::PoweredOn,
        ToolsStatus::Running,
    )]);

    let first = launch_clone(&fake, "web-01").await.unwrap();
    let clone_name = match first {
        CloneLaunch::Started { clone_name, .. } => clone_name,
        other => panic!("expected a started clone, got {:?}", other),
    };
    assert!(clone_name.starts_with("web-01-migrate-clone-"));

    let second = launch_clone(&fake, "web-01").await.unwrap();
    match second {
        CloneLaunch::AlreadyExists { clone_name: existing } => {
            assert_eq!(existing, clone_name);
        }
        other => panic!("expected already-exists, got {:?}", other),
    }
    assert_eq!(*fake.clone_submissions.lock().unwrap(), 1);
}

#[tokio::test]
async fn clone_of_powered_off_vm_is_rejected() {
    let fake = FakeHypervisor::with_vms(vec![vm(
        "db-01",
        PowerState::PoweredOff,
        ToolsStatus::NotRunning,
    )]);
    assert!(launch_clone(&fake, "db-01").await.is_err());
}

#[tokio::test(start_paused = true)]
async fn preparation_skips_shutdown_for_powered_off_clone() {
    let clone_name = "db-01-migrate-clone-20260829120000";
    let fake = Arc::new(FakeHypervisor::with_vms(vec![vm(
        clone_name,
        PowerState::PoweredOff,
        ToolsStatus::NotRunning,
    )]));

    let store = StatusStore::new();
    let writer = StatusWriter::new(store.clone(), clone_name);
    let (workflow, cx) = prepare::build(
        fake.clone(),
        clone_name.to_string(),
        writer,
        TimeoutConfig::default(),
    );
    workflow.run(cx).await;

    let status = store.get(clone_name).unwrap();
    assert_eq!(status.state, WorkflowState::Success);
    assert_eq!(status.progress, 100);
    // The initial shutdown was skipped; only the final one ran.
    assert_eq!(*fake.shutdown_calls.lock().unwrap(), 1);
    assert_eq!(*fake.nic_calls.lock().unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn stuck_task_surfaces_as_timeout_not_a_hang() {
    let clone_name = "db-01-migrate-clone-20260829120000";
    let fake = Arc::new(
        FakeHypervisor::with_vms(vec![vm(
            clone_name,
            PowerState::PoweredOff,
            ToolsStatus::NotRunning,
        )])
        .with_stuck_tasks(),
    );

    let store = StatusStore::new();
    let writer = StatusWriter::new(store.clone(), clone_name);
    let timeouts = TimeoutConfig {
        task_secs: 3,
        tools_secs: 3,
        shutdown_secs: 3,
    };
    let (workflow, cx) = prepare::build(fake, clone_name.to_string(), writer, timeouts);
    workflow.run(cx).await;

    let status = store.get(clone_name).unwrap();
    assert_eq!(status.state, WorkflowState::Error);
    assert!(
        status.log_tail.contains("timed out"),
        "tail was: {}",
        status.log_tail
    );
}

#[tokio::test]
async fn windows_sync_logs_answer_before_any_mirror_has_run() {
    let hypervisors: HypervisorFactory =
        Box::new(|_| Arc::new(FakeHypervisor::with_vms(Vec::new())));
    let shells: ShellFactory = Arc::new(|_| {
        Box::pin(async { Err(MigrateError::Connection("no shell in this test".into())) })
    });
    let service = MigrationService::with_adapters(MigrateConfig::default(), hypervisors, shells);

    let request = GuestPairRequest {
        source_ip: "10.0.0.1".into(),
        target_ip: "10.0.0.2".into(),
        username: "admin".into(),
        password: "pw".into(),
        os_family: OsFamily::Windows,
    };
    let key = service.live_sync(request, SyncAction::Logs).unwrap();
    assert_eq!(key, "10.0.0.1-10.0.0.2-windows");

    let transcript = service
        .sync_log("10.0.0.1", "10.0.0.2", OsFamily::Windows)
        .expect("logs request must seed a transcript");
    assert!(transcript.contains("No sync has been run"));
}

/// Shell whose conversion tool fails partway through: the probe and staging
/// commands succeed, the streamed tool emits an error line and exits 1.
struct FailingToolShell {
    commands: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl RemoteShell for FailingToolShell {
    fn host(&self) -> &str {
        "10.0.0.100"
    }

    async fn exec(&self, cmd: &str) -> Result<CommandOutput> {
        self.commands.lock().unwrap().push(cmd.to_string());
        let stdout = if cmd.contains("openssl") {
            "SHA1 Fingerprint=AB:CD:EF:12:34:56:78:90:AB:CD:EF:12:34:56:78:90:AB:CD:EF:12"
                .to_string()
        } else {
            String::new()
        };
        Ok(CommandOutput {
            stdout,
            stderr: String::new(),
            exit_code: 0,
        })
    }

    async fn exec_timeout(&self, cmd: &str, _timeout: Duration) -> Result<CommandOutput> {
        self.exec(cmd).await
    }

    async fn exec_sudo(&self, cmd: &str) -> Result<CommandOutput> {
        self.exec(cmd).await
    }

    async fn exec_no_wait(&self, cmd: &str) -> Result<()> {
        self.commands.lock().unwrap().push(cmd.to_string());
        Ok(())
    }

    async fn upload(&self, remote_path: &str, _content: &str) -> Result<()> {
        self.commands
            .lock()
            .unwrap()
            .push(format!("upload {}", remote_path));
        Ok(())
    }

    async fn stream(&self, cmd: &str) -> Result<ProcessStream> {
        self.commands.lock().unwrap().push(cmd.to_string());
        let (line_tx, line_rx) = tokio::sync::mpsc::channel(8);
        let (exit_tx, exit_rx) = tokio::sync::oneshot::channel();
        line_tx
            .try_send("virt-v2v: error: disk read error".to_string())
            .unwrap();
        drop(line_tx);
        exit_tx.send(1).unwrap();
        Ok(ProcessStream::from_parts(line_rx, exit_rx))
    }

    async fn close(&self) {}
}

#[tokio::test]
async fn conversion_tool_failure_stops_before_domain_definition() {
    let clone_name = "web-01-migrate-clone-20260829120000";
    let commands = Arc::new(Mutex::new(Vec::new()));

    let recorded = commands.clone();
    let connect: conversion::ShellConnector = Box::new(move || {
        let recorded = recorded.clone();
        Box::pin(async move {
            Ok(Arc::new(FailingToolShell { commands: recorded }) as Arc<dyn RemoteShell>)
        })
    });

    let store = StatusStore::new();
    let writer = StatusWriter::new(store.clone(), clone_name);
    let (workflow, cx) = conversion::build(
        connect,
        HostCredential::new("10.0.0.1", "admin", "pw"),
        clone_name.to_string(),
        ConversionConfig::default(),
        writer,
    );
    workflow.run(cx).await;

    let status = store.get(clone_name).unwrap();
    assert_eq!(status.state, WorkflowState::Error);
    assert!(
        status.log_tail.contains("disk read error"),
        "tail was: {}",
        status.log_tail
    );

    let commands = commands.lock().unwrap();
    assert!(
        commands.iter().any(|c| c.contains("virt-v2v")),
        "conversion tool was never invoked"
    );
    assert!(
        !commands.iter().any(|c| c.contains("virsh define")),
        "domain definition must not run after a failed conversion"
    );
    assert!(
        !commands.iter().any(|c| c.contains("virsh start")),
        "domain start must not run after a failed conversion"
    );
}
