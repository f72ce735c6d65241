use crate::request::HostCredential;
use crate::status::StatusWriter;
use crate::{log_debug, log_error, log_info, MigrateError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tokio::time::{sleep, Duration, Instant};

const TASK_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

impl PowerState {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "poweredOn" => Ok(PowerState::PoweredOn),
            "poweredOff" => Ok(PowerState::PoweredOff),
            "suspended" => Ok(PowerState::Suspended),
            other => Err(MigrateError::Parse(format!(
                "unknown power state '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolsStatus {
    Running,
    NotRunning,
}

/// Inventory entry for one virtual machine.
#[derive(Debug, Clone)]
pub struct VmSummary {
    pub name: String,
    pub power_state: PowerState,
    pub tools: ToolsStatus,
    pub guest_os: Option<String>,
    pub ip_address: Option<String>,
    pub hostname: Option<String>,
    pub datastore: Option<String>,
}

/// State of a submitted long-running hypervisor operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Success,
    Error(String),
}

/// Control-plane operations the workflows need from the source hypervisor.
///
/// Uniform error semantics: a failure is always a `Connection`, `Auth`,
/// `Precondition` or `ToolExecution` error, never a silently empty result.
#[async_trait]
pub trait HypervisorClient: Send + Sync {
    async fn list_vms(&self) -> Result<Vec<VmSummary>>;

    async fn find_vm(&self, name: &str) -> Result<Option<VmSummary>>;

    /// Submit a clone of `source` named `clone_name`, placed on the source
    /// VM's datastore, left powered off. Returns a pollable task handle.
    async fn clone_vm(&self, source: &VmSummary, clone_name: &str) -> Result<String>;

    /// Submit a power-on and return a pollable task handle.
    async fn power_on(&self, name: &str) -> Result<String>;

    /// Ask guest tools for a graceful shutdown. Requires tools running.
    async fn shutdown_guest(&self, name: &str) -> Result<()>;

    /// Disconnect every virtual network adapter so the clone boots dark.
    /// Returns the adapter labels touched; an empty list is a no-op success.
    async fn disable_nic_start_connected(&self, name: &str) -> Result<Vec<String>>;

    async fn task_state(&self, task_id: &str) -> Result<TaskState>;
}

/// Poll `task_id` until it settles, with a hard elapsed-time bound.
///
/// Expiry surfaces as a `Timeout` error, which is distinct from a
/// task-reported error: the remote operation may still be running.
pub async fn wait_for_task(
    client: &dyn HypervisorClient,
    task_id: &str,
    what: &str,
    timeout_secs: u64,
    writer: Option<&StatusWriter>,
) -> Result<()> {
    let started = Instant::now();
    loop {
        match client.task_state(task_id).await? {
            TaskState::Success => return Ok(()),
            TaskState::Error(msg) => {
                return Err(MigrateError::tool(what.to_string(), -1, msg));
            }
            TaskState::Queued | TaskState::Running => {
                let elapsed = started.elapsed().as_secs();
                if elapsed > timeout_secs {
                    return Err(MigrateError::timeout(what.to_string(), timeout_secs));
                }
                if let Some(writer) = writer {
                    writer.note(&format!("{}: still running (elapsed: {}s)", what, elapsed));
                }
            }
        }
        sleep(TASK_POLL_INTERVAL).await;
    }
}

/// Poll until the VM reaches `desired` power state.
pub async fn wait_for_power_state(
    client: &dyn HypervisorClient,
    name: &str,
    desired: PowerState,
    timeout_secs: u64,
) -> Result<()> {
    let started = Instant::now();
    loop {
        let vm = client
            .find_vm(name)
            .await?
            .ok_or_else(|| MigrateError::Precondition(format!("VM '{}' disappeared", name)))?;
        if vm.power_state == desired {
            return Ok(());
        }
        if started.elapsed().as_secs() > timeout_secs {
            return Err(MigrateError::timeout(
                format!("waiting for '{}' to reach {:?}", name, desired),
                timeout_secs,
            ));
        }
        sleep(Duration::from_secs(5)).await;
    }
}

/// Poll until guest tools report running inside the VM.
pub async fn wait_for_tools(
    client: &dyn HypervisorClient,
    name: &str,
    timeout_secs: u64,
) -> Result<()> {
    let started = Instant::now();
    loop {
        let vm = client
            .find_vm(name)
            .await?
            .ok_or_else(|| MigrateError::Precondition(format!("VM '{}' disappeared", name)))?;
        if vm.tools == ToolsStatus::Running {
            return Ok(());
        }
        if started.elapsed().as_secs() > timeout_secs {
            return Err(MigrateError::timeout(
                format!("waiting for guest tools on '{}'", name),
                timeout_secs,
            ));
        }
        sleep(Duration::from_secs(5)).await;
    }
}

/// `govc`-backed client for a vCenter/ESXi endpoint.
///
/// Credentials travel through the environment, never argv. TLS verification
/// is off (`GOVC_INSECURE`): self-signed certificates are the norm for the
/// source endpoints this tool talks to.
///
/// Long-running operations (clone, power-on) run as background `govc`
/// processes tracked in an in-memory task table, which gives callers the
/// same submit-then-poll shape the control plane itself uses.
pub struct GovcClient {
    credential: HostCredential,
    tasks: Arc<Mutex<HashMap<String, TaskState>>>,
}

impl GovcClient {
    pub fn new(credential: HostCredential) -> Self {
        Self {
            credential,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("govc");
        cmd.args(args)
            .env("GOVC_URL", format!("https://{}", self.credential.address))
            .env("GOVC_USERNAME", &self.credential.username)
            .env("GOVC_PASSWORD", &self.credential.password)
            .env("GOVC_INSECURE", "1")
            .stdin(Stdio::null());
        cmd
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        log_debug!("govc {}", args.join(" "));
        let output = self
            .command(args)
            .output()
            .await
            .map_err(|e| MigrateError::Connection(format!("failed to spawn govc: {}", e)))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify_govc_failure(
            &self.credential.address,
            output.status.code().unwrap_or(-1),
            stderr,
        ))
    }

    /// Spawn a govc invocation as a tracked background task.
    fn submit_task(&self, what: &str, args: Vec<String>) -> Result<String> {
        let task_id = uuid::Uuid::new_v4().to_string();
        self.tasks
            .lock()
            .unwrap()
            .insert(task_id.clone(), TaskState::Queued);

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let child = self
            .command(&arg_refs)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| MigrateError::Connection(format!("failed to spawn govc: {}", e)))?;

        log_info!("Submitted {} as task {}", what, task_id);
        self.tasks
            .lock()
            .unwrap()
            .insert(task_id.clone(), TaskState::Running);

        let tasks = self.tasks.clone();
        let id = task_id.clone();
        let what = what.to_string();
        tokio::spawn(async move {
            let state = match child.wait_with_output().await {
                Ok(output) if output.status.success() => TaskState::Success,
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                    log_error!("{} failed: {}", what, stderr);
                    TaskState::Error(stderr)
                }
                Err(e) => TaskState::Error(format!("failed to wait for govc: {}", e)),
            };
            tasks.lock().unwrap().insert(id, state);
        });

        Ok(task_id)
    }
}

#[async_trait]
impl HypervisorClient for GovcClient {
    async fn list_vms(&self) -> Result<Vec<VmSummary>> {
        let raw = self.run(&["vm.info", "-json", "*"]).await?;
        parse_vm_info(&raw)
    }

    async fn find_vm(&self, name: &str) -> Result<Option<VmSummary>> {
        let raw = match self.run(&["vm.info", "-json", name]).await {
            Ok(raw) => raw,
            // govc reports a missing VM as a command failure.
            Err(MigrateError::ToolExecution { output, .. })
                if output.contains("not found") =>
            {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };
        let vms = parse_vm_info(&raw)?;
        Ok(select_vm(vms, name))
    }

    async fn clone_vm(&self, source: &VmSummary, clone_name: &str) -> Result<String> {
        let mut args = vec![
            "vm.clone".to_string(),
            "-vm".to_string(),
            source.name.clone(),
            "-on=false".to_string(),
        ];
        if let Some(datastore) = &source.datastore {
            args.push("-ds".to_string());
            args.push(datastore.clone());
        }
        args.push(clone_name.to_string());
        self.submit_task(&format!("clone of '{}'", source.name), args)
    }

    async fn power_on(&self, name: &str) -> Result<String> {
        self.submit_task(
            &format!("power-on of '{}'", name),
            vec!["vm.power".to_string(), "-on".to_string(), name.to_string()],
        )
    }

    async fn shutdown_guest(&self, name: &str) -> Result<()> {
        self.run(&["vm.power", "-s", name]).await.map(|_| ())
    }

    async fn disable_nic_start_connected(&self, name: &str) -> Result<Vec<String>> {
        let listing = self.run(&["device.ls", "-vm", name]).await?;
        let adapters: Vec<String> = listing
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .filter(|dev| dev.starts_with("ethernet-"))
            .map(|dev| dev.to_string())
            .collect();

        for adapter in &adapters {
            self.run(&["device.disconnect", "-vm", name, adapter]).await?;
        }
        Ok(adapters)
    }

    async fn task_state(&self, task_id: &str) -> Result<TaskState> {
        self.tasks
            .lock()
            .unwrap()
            .get(task_id)
            .cloned()
            .ok_or_else(|| MigrateError::Precondition(format!("unknown task '{}'", task_id)))
    }
}

/// Exact-name lookup over a parsed inventory; `vm.info <name>` can match
/// more than one entry when the name is a glob-ish prefix.
fn select_vm(vms: Vec<VmSummary>, name: &str) -> Option<VmSummary> {
    vms.into_iter().find(|vm| vm.name == name)
}

fn classify_govc_failure(host: &str, exit_code: i32, stderr: String) -> MigrateError {
    let lower = stderr.to_lowercase();
    if lower.contains("incorrect user name or password")
        || lower.contains("login failure")
        || lower.contains("401")
    {
        MigrateError::Auth(format!("{}: {}", host, stderr))
    } else if lower.contains("connection refused")
        || lower.contains("no route to host")
        || lower.contains("dial tcp")
        || lower.contains("i/o timeout")
    {
        MigrateError::Connection(format!("{}: {}", host, stderr))
    } else {
        MigrateError::tool("govc", exit_code, stderr)
    }
}

// govc changed its JSON key casing across releases; look both ways.
fn field<'a>(value: &'a Value, name: &str) -> Option<&'a Value> {
    let lower = {
        let mut chars = name.chars();
        match chars.next() {
            Some(first) => first.to_lowercase().collect::<String>() + chars.as_str(),
            None => String::new(),
        }
    };
    value.get(name).or_else(|| value.get(&lower))
}

fn parse_vm_info(raw: &str) -> Result<Vec<VmSummary>> {
    let root: Value = serde_json::from_str(raw)?;
    let machines = field(&root, "VirtualMachines")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    let mut summaries = Vec::with_capacity(machines.len());
    for machine in &machines {
        let config = field(machine, "Config");
        let runtime = field(machine, "Runtime");
        let guest = field(machine, "Guest");

        let name = config
            .and_then(|c| field(c, "Name"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| MigrateError::Parse("vm.info entry without a name".into()))?
            .to_string();

        let power_state = runtime
            .and_then(|r| field(r, "PowerState"))
            .and_then(|v| v.as_str())
            .map(PowerState::parse)
            .transpose()?
            .unwrap_or(PowerState::PoweredOff);

        let tools = match guest
            .and_then(|g| field(g, "ToolsRunningStatus"))
            .and_then(|v| v.as_str())
        {
            Some("guestToolsRunning") => ToolsStatus::Running,
            _ => ToolsStatus::NotRunning,
        };

        let guest_os = guest
            .and_then(|g| field(g, "GuestFullName"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let ip_address = guest
            .and_then(|g| field(g, "IpAddress"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());

        let hostname = guest
            .and_then(|g| field(g, "HostName"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());

        let datastore = config
            .and_then(|c| field(c, "DatastoreUrl"))
            .and_then(|v| v.as_array())
            .and_then(|entries| entries.first())
            .and_then(|entry| field(entry, "Name"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        summaries.push(VmSummary {
            name,
            power_state,
            tools,
            guest_os,
            ip_address,
            hostname,
            datastore,
        });
    }
    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "VirtualMachines": [
            {
                "Config": {
                    "Name": "web-01",
                    "DatastoreUrl": [{"Name": "datastore1", "Url": "/vmfs/volumes/abc"}]
                },
                "Runtime": {"PowerState": "poweredOn"},
                "Guest": {
                    "ToolsRunningStatus": "guestToolsRunning",
                    "GuestFullName": "Ubuntu Linux (64-bit)",
                    "IpAddress": "10.0.0.10",
                    "HostName": "web-01.local"
                }
            }
        ]
    }"#;

    #[test]
    fn parses_vm_info_json() {
        let vms = parse_vm_info(SAMPLE).unwrap();
        assert_eq!(vms.len(), 1);
        let vm = &vms[0];
        assert_eq!(vm.name, "web-01");
        assert_eq!(vm.power_state, PowerState::PoweredOn);
        assert_eq!(vm.tools, ToolsStatus::Running);
        assert_eq!(vm.datastore.as_deref(), Some("datastore1"));
        assert_eq!(vm.ip_address.as_deref(), Some("10.0.0.10"));
    }

    #[test]
    fn parses_lowercase_keys_from_newer_govc() {
        let raw = r#"{"virtualMachines":[{"config":{"name":"db-01"},"runtime":{"powerState":"poweredOff"},"guest":null}]}"#;
        let vms = parse_vm_info(raw).unwrap();
        assert_eq!(vms[0].name, "db-01");
        assert_eq!(vms[0].power_state, PowerState::PoweredOff);
        assert_eq!(vms[0].tools, ToolsStatus::NotRunning);
    }

    #[test]
    fn select_vm_matches_exact_name_only() {
        let vms = parse_vm_info(SAMPLE).unwrap();
        assert_eq!(select_vm(vms.clone(), "web-01").unwrap().name, "web-01");
        assert!(select_vm(vms, "web-01-clone").is_none());
    }

    #[test]
    fn auth_failures_classified() {
        let err = classify_govc_failure("vc01", 1, "ServerFaultCode: Login failure".into());
        assert!(matches!(err, MigrateError::Auth(_)));

        let err = classify_govc_failure("vc01", 1, "dial tcp 10.0.0.1:443: i/o timeout".into());
        assert!(matches!(err, MigrateError::Connection(_)));
    }
}
