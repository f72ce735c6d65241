use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use vmigrate::{
    config::MigrateConfig,
    livesync::SyncAction,
    logger,
    request::{CloneRequest, ConversionRequest, GuestPairRequest, PrepareRequest},
    CloneLaunch, HostCredential, MigrationService, OsFamily, WorkflowState,
};

#[derive(Parser)]
#[command(name = "vmigrate")]
#[command(about = "VM migration orchestrator: VMware source to KVM/libvirt target")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to Migratefile configuration
    #[arg(short, long, default_value = "Migratefile")]
    config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Credentials for the source hypervisor endpoint. The password can come
/// from `VMIGRATE_SOURCE_PASSWORD` instead of the command line.
#[derive(Args, Clone)]
struct SourceArgs {
    /// Source hypervisor address (vCenter or ESXi)
    #[arg(long)]
    source_host: String,
    /// Source hypervisor username
    #[arg(long)]
    source_user: String,
    /// Source hypervisor password (prefer the env variable)
    #[arg(long)]
    source_password: Option<String>,
}

impl SourceArgs {
    fn credential(&self) -> anyhow::Result<HostCredential> {
        let password = resolve_password(self.source_password.clone(), "VMIGRATE_SOURCE_PASSWORD")?;
        Ok(HostCredential::new(
            &self.source_host,
            &self.source_user,
            password,
        ))
    }
}

/// Credentials for the target KVM host, reachable over SSH. The password
/// can come from `VMIGRATE_TARGET_PASSWORD` instead of the command line.
#[derive(Args, Clone)]
struct TargetArgs {
    /// Target KVM host address
    #[arg(long)]
    target_host: String,
    /// Target KVM host username
    #[arg(long)]
    target_user: String,
    /// Target KVM host password (prefer the env variable)
    #[arg(long)]
    target_password: Option<String>,
}

impl TargetArgs {
    fn credential(&self) -> anyhow::Result<HostCredential> {
        let password = resolve_password(self.target_password.clone(), "VMIGRATE_TARGET_PASSWORD")?;
        Ok(HostCredential::new(
            &self.target_host,
            &self.target_user,
            password,
        ))
    }
}

/// A source/target guest pair sharing one SSH login. The password can come
/// from `VMIGRATE_GUEST_PASSWORD` instead of the command line.
#[derive(Args, Clone)]
struct GuestPairArgs {
    /// Current guest IP
    #[arg(long)]
    source_ip: String,
    /// Counterpart / desired IP
    #[arg(long)]
    target_ip: String,
    /// Guest username
    #[arg(long)]
    username: String,
    /// Guest password (prefer the env variable)
    #[arg(long)]
    password: Option<String>,
    /// Guest OS family
    #[arg(long, value_enum)]
    os: OsArg,
}

impl GuestPairArgs {
    fn request(&self) -> anyhow::Result<GuestPairRequest> {
        let password = resolve_password(self.password.clone(), "VMIGRATE_GUEST_PASSWORD")?;
        Ok(GuestPairRequest {
            source_ip: self.source_ip.clone(),
            target_ip: self.target_ip.clone(),
            username: self.username.clone(),
            password,
            os_family: self.os.into(),
        })
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum OsArg {
    Linux,
    Windows,
}

impl From<OsArg> for OsFamily {
    fn from(value: OsArg) -> Self {
        match value {
            OsArg::Linux => OsFamily::Linux,
            OsArg::Windows => OsFamily::Windows,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum SyncActionArg {
    Start,
    Stop,
    Logs,
}

impl From<SyncActionArg> for SyncAction {
    fn from(value: SyncActionArg) -> Self {
        match value {
            SyncActionArg::Start => SyncAction::Start,
            SyncActionArg::Stop => SyncAction::Stop,
            SyncActionArg::Logs => SyncAction::Logs,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List VMs on the source hypervisor
    #[command(alias = "ls")]
    List {
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Clone a powered-on VM (idempotent per source VM)
    Clone {
        #[command(flatten)]
        source: SourceArgs,
        /// VM to clone
        vm: String,
    },
    /// Prepare a clone for conversion and watch it to completion
    Prepare {
        #[command(flatten)]
        source: SourceArgs,
        /// Clone name (as reported by `clone`)
        clone_name: String,
    },
    /// Convert a prepared clone into a libvirt domain on the target host
    Convert {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        target: TargetArgs,
        /// Clone name (as reported by `clone`)
        clone_name: String,
    },
    /// Manage continuous file replication between a guest pair
    Sync {
        #[command(flatten)]
        pair: GuestPairArgs,
        /// Action to perform
        #[arg(value_enum)]
        action: SyncActionArg,
    },
    /// Reassign a guest's IP address to the target value
    Reassign {
        #[command(flatten)]
        pair: GuestPairArgs,
    },
    /// Gracefully shut down a VM on the source hypervisor
    Shutdown {
        #[command(flatten)]
        source: SourceArgs,
        /// VM to shut down
        vm: String,
    },
    /// Post-migration validation checks
    Check {
        #[command(subcommand)]
        check_command: CheckCommands,
    },
}

#[derive(Subcommand)]
enum CheckCommands {
    /// Single-packet reachability probe
    Ping {
        /// Hosts to probe
        hostnames: Vec<String>,
    },
    /// File count on a Linux guest (compare source against target)
    Files {
        #[command(flatten)]
        guest: GuestArgs,
    },
    /// Per-drive chkdsk file summaries on a Windows guest
    FilesWindows {
        #[command(flatten)]
        guest: GuestArgs,
    },
}

/// One guest reachable over SSH. The password can come from
/// `VMIGRATE_GUEST_PASSWORD` instead of the command line.
#[derive(Args, Clone)]
struct GuestArgs {
    /// Guest IP
    #[arg(long)]
    ip: String,
    /// Guest username
    #[arg(long)]
    username: String,
    /// Guest password (prefer the env variable)
    #[arg(long)]
    password: Option<String>,
}

impl GuestArgs {
    fn credential(&self) -> anyhow::Result<HostCredential> {
        let password = resolve_password(self.password.clone(), "VMIGRATE_GUEST_PASSWORD")?;
        Ok(HostCredential::new(&self.ip, &self.username, password))
    }
}

fn resolve_password(flag: Option<String>, env_var: &str) -> anyhow::Result<String> {
    match flag {
        Some(password) => Ok(password),
        None => std::env::var(env_var)
            .map_err(|_| anyhow::anyhow!("no password given and {} is not set", env_var)),
    }
}

/// Poll a workflow key until it reaches a terminal state, echoing each new
/// status line as it arrives.
async fn watch(service: &MigrationService, key: &str) -> anyhow::Result<()> {
    let mut last_line = String::new();
    loop {
        if let Some(status) = service.status(key) {
            if status.log_tail != last_line {
                println!("[{:>3}%] {}", status.progress, status.log_tail);
                last_line = status.log_tail.clone();
            }
            match status.state {
                WorkflowState::Success => return Ok(()),
                WorkflowState::Error => {
                    anyhow::bail!("workflow failed: {}", status.log_tail);
                }
                WorkflowState::Pending | WorkflowState::Running => {}
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logger::init(cli.verbose);

    let config = MigrateConfig::load(&cli.config)?;
    let service = MigrationService::new(config);

    match cli.command {
        Commands::List { source } => {
            let vms = service.list_vms(source.credential()?).await?;
            println!(
                "{:<30} {:<12} {:<16} {:<24}",
                "NAME", "POWER", "IP", "GUEST OS"
            );
            println!("{}", "=".repeat(84));
            for vm in &vms {
                println!(
                    "{:<30} {:<12} {:<16} {:<24}",
                    vm.name,
                    format!("{:?}", vm.power_state),
                    vm.ip_address.as_deref().unwrap_or("-"),
                    vm.guest_os.as_deref().unwrap_or("-"),
                );
            }
        }
        Commands::Clone { source, vm } => {
            let request = CloneRequest {
                host: source.credential()?,
                vm_name: vm,
            };
            match service.launch_clone(request).await? {
                CloneLaunch::AlreadyExists { clone_name } => {
                    println!("Clone '{}' already exists, nothing to do", clone_name);
                }
                CloneLaunch::Started {
                    clone_name,
                    task_id,
                } => {
                    println!("Clone '{}' started (task {})", clone_name, task_id);
                }
            }
        }
        Commands::Prepare { source, clone_name } => {
            let request = PrepareRequest {
                host: source.credential()?,
                clone_name: clone_name.clone(),
            };
            service.launch_prepare(request)?;
            watch(&service, &clone_name).await?;
            println!("Preparation of '{}' finished", clone_name);
        }
        Commands::Convert {
            source,
            target,
            clone_name,
        } => {
            let request = ConversionRequest {
                source_host: source.credential()?,
                target_host: target.credential()?,
                clone_name: clone_name.clone(),
            };
            service.launch_conversion(request)?;
            watch(&service, &clone_name).await?;
            println!("Conversion of '{}' finished", clone_name);
        }
        Commands::Sync { pair, action } => {
            let request = pair.request()?;
            let action: SyncAction = action.into();
            let source_ip = request.source_ip.clone();
            let target_ip = request.target_ip.clone();
            let os_family = request.os_family;
            service.live_sync(request, action)?;

            // Sync actions run to completion quickly except the mirror
            // itself; give the transcript a moment to materialize.
            tokio::time::sleep(Duration::from_secs(2)).await;
            loop {
                if let Some(transcript) = service.sync_log(&source_ip, &target_ip, os_family) {
                    println!("{}", transcript);
                    break;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        Commands::Reassign { pair } => {
            let request = pair.request()?;
            let source_ip = request.source_ip.clone();
            service.launch_ip_reassignment(request)?;
            watch(&service, &source_ip).await?;
            for line in service.log_entries(&source_ip) {
                println!("{}", line);
            }
        }
        Commands::Shutdown { source, vm } => {
            service.shutdown_vm(source.credential()?, &vm).await?;
            println!("Shutdown of '{}' requested", vm);
        }
        Commands::Check { check_command } => match check_command {
            CheckCommands::Ping { hostnames } => {
                for (host, status) in service.ping(&hostnames).await {
                    println!("{:<30} {}", host, status.as_str());
                }
            }
            CheckCommands::Files { guest } => {
                let count = service.file_count(guest.credential()?).await?;
                println!("{}: {} files", guest.ip, count);
            }
            CheckCommands::FilesWindows { guest } => {
                let report = service.windows_file_report(guest.credential()?).await?;
                for (drive, summary) in report {
                    println!("{}: {}", drive, summary);
                }
            }
        },
    }

    Ok(())
}
