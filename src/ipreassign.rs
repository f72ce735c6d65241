use crate::shell::RemoteShell;
use crate::status::StatusWriter;
use crate::{log_info, MigrateError, OsFamily, Result};
use std::sync::Arc;
use std::time::Duration;

/// Settle delay between firing a connectivity-severing command and closing
/// the session. The close is expected to race the remote change.
const FIRE_SETTLE: Duration = Duration::from_secs(2);

/// Closed set of Linux families with distinct network-reconfiguration paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distro {
    Ubuntu,
    Debian,
    RhelFamily,
    Suse,
}

impl Distro {
    pub fn as_str(&self) -> &'static str {
        match self {
            Distro::Ubuntu => "ubuntu",
            Distro::Debian => "debian",
            Distro::RhelFamily => "rhel",
            Distro::Suse => "suse",
        }
    }
}

/// Classify an `/etc/os-release` dump. Ubuntu is checked before Debian
/// because Ubuntu's descriptor mentions both. An unrecognized descriptor is
/// a terminal error, never a fallthrough to some default path.
pub fn detect_distro(os_release: &str) -> Result<Distro> {
    let data = os_release.to_lowercase();
    if data.contains("ubuntu") {
        Ok(Distro::Ubuntu)
    } else if data.contains("debian") {
        Ok(Distro::Debian)
    } else if data.contains("rhel") || data.contains("centos") || data.contains("oracle") {
        Ok(Distro::RhelFamily)
    } else if data.contains("suse") {
        Ok(Distro::Suse)
    } else {
        Err(MigrateError::UnsupportedConfiguration(
            "unsupported Linux distribution in os-release".into(),
        ))
    }
}

/// `(gateway, interface)` from an `ip route` default-route line, e.g.
/// `default via 10.0.0.1 dev eth0 proto dhcp`.
pub fn parse_default_route(output: &str) -> Option<(String, String)> {
    let line = output.lines().find(|l| l.trim_start().starts_with("default"))?;
    let parts: Vec<&str> = line.split_whitespace().collect();
    let via = parts.iter().position(|p| *p == "via")?;
    let dev = parts.iter().position(|p| *p == "dev")?;
    Some((parts.get(via + 1)?.to_string(), parts.get(dev + 1)?.to_string()))
}

/// Prefix length from `ip -o -f inet addr show dev <iface>` output
/// (`... inet 10.0.0.5/24 brd ...`).
pub fn parse_prefix_len(output: &str) -> Option<u8> {
    let inet = output.find("inet ")?;
    let rest = &output[inet + "inet ".len()..];
    let addr = rest.split_whitespace().next()?;
    let (ip, prefix) = addr.split_once('/')?;
    if ip.parse::<std::net::Ipv4Addr>().is_err() {
        return None;
    }
    prefix.parse::<u8>().ok().filter(|p| *p <= 32)
}

/// Dotted-quad netmask for a CIDR prefix length (`24` -> `255.255.255.0`).
pub fn prefix_to_netmask(prefix: u8) -> String {
    let mask: u32 = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    };
    format!(
        "{}.{}.{}.{}",
        (mask >> 24) & 0xff,
        (mask >> 16) & 0xff,
        (mask >> 8) & 0xff,
        mask & 0xff
    )
}

/// Interface facts extracted from a Windows `netsh interface ip show config`
/// listing for the block carrying a given address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowsInterface {
    pub name: String,
    pub netmask: String,
    pub gateway: String,
}

/// Find the interface block containing `source_ip` and pull out its name,
/// subnet mask (converted from the listed prefix length) and gateway.
pub fn parse_netsh_config(output: &str, source_ip: &str) -> Option<WindowsInterface> {
    for block in output.split("Configuration for interface") {
        if !block.contains(source_ip) {
            continue;
        }

        let name = block
            .split('"')
            .nth(1)
            .map(str::to_string)?;

        let netmask = block.lines().find_map(|line| {
            let rest = line.trim().strip_prefix("Subnet Prefix:")?;
            let token = rest.split_whitespace().next()?;
            let (ip, prefix) = token.split_once('/')?;
            ip.parse::<std::net::Ipv4Addr>().ok()?;
            let prefix: u8 = prefix.parse().ok()?;
            (prefix <= 32).then(|| prefix_to_netmask(prefix))
        })?;

        let gateway = block.lines().find_map(|line| {
            let rest = line.trim().strip_prefix("Default Gateway:")?;
            let token = rest.split_whitespace().next()?;
            token.parse::<std::net::Ipv4Addr>().ok()?;
            Some(token.to_string())
        })?;

        return Some(WindowsInterface { name, netmask, gateway });
    }
    None
}

/// Rewrite a netplan document so `iface` gets a static address. DHCP is
/// disabled, the address list replaced, and the gateway pinned; all other
/// interfaces and keys pass through untouched.
pub fn rewrite_netplan(
    content: &str,
    iface: &str,
    new_ip: &str,
    prefix: u8,
    gateway: &str,
) -> Result<String> {
    let mut doc: serde_yaml::Value = serde_yaml::from_str(content)?;

    let ethernets = doc
        .get_mut("network")
        .and_then(|n| n.get_mut("ethernets"))
        .and_then(|e| e.as_mapping_mut())
        .ok_or_else(|| {
            MigrateError::UnsupportedConfiguration(
                "netplan document has no network.ethernets section".into(),
            )
        })?;

    let key = serde_yaml::Value::String(iface.to_string());
    let entry = ethernets.get_mut(&key).ok_or_else(|| {
        MigrateError::UnsupportedConfiguration(format!(
            "interface '{}' not present in netplan document",
            iface
        ))
    })?;

    if let Some(map) = entry.as_mapping_mut() {
        map.insert("dhcp4".into(), serde_yaml::Value::Bool(false));
        map.insert(
            "addresses".into(),
            serde_yaml::Value::Sequence(vec![format!("{}/{}", new_ip, prefix).into()]),
        );
        map.insert("gateway4".into(), gateway.to_string().into());
    }

    Ok(serde_yaml::to_string(&doc)?)
}

/// Rewrite the static `address` and `gateway` lines of a Debian
/// `/etc/network/interfaces` file, preserving everything else verbatim.
pub fn rewrite_interfaces_file(content: &str, new_ip: &str, gateway: &str) -> String {
    content
        .lines()
        .map(|line| {
            if line.trim_start().starts_with("address") {
                format!("    address {}", new_ip)
            } else if line.trim_start().starts_with("gateway") {
                format!("    gateway {}", gateway)
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn nmcli_commands(iface: &str, new_ip: &str, prefix: u8, gateway: &str) -> Vec<String> {
    vec![
        format!("nmcli con mod {} ipv4.addresses {}/{}", iface, new_ip, prefix),
        format!("nmcli con mod {} ipv4.method manual", iface),
        format!("nmcli con mod {} ipv4.gateway {}", iface, gateway),
        format!("nmcli con up {}", iface),
    ]
}

/// One-shot IP reassignment for a guest, keyed by its current address.
///
/// Every sub-step appends to the key's full ordered log rather than just
/// the tail: a network change cannot be rolled back, so operators get the
/// whole causal trace.
pub struct IpReassignment {
    shell: Arc<dyn RemoteShell>,
    source_ip: String,
    target_ip: String,
    os_family: OsFamily,
    status: StatusWriter,
}

impl IpReassignment {
    pub fn new(
        shell: Arc<dyn RemoteShell>,
        source_ip: impl Into<String>,
        target_ip: impl Into<String>,
        os_family: OsFamily,
        status: StatusWriter,
    ) -> Self {
        Self {
            shell,
            source_ip: source_ip.into(),
            target_ip: target_ip.into(),
            os_family,
            status,
        }
    }

    pub async fn run(self) {
        self.status.append("[INFO] SSH connection established.");
        let outcome = match self.os_family {
            OsFamily::Windows => self.reassign_windows().await,
            OsFamily::Linux => self.reassign_linux().await,
        };

        match outcome {
            Ok(()) => {
                self.settle_and_close().await;
                self.status
                    .append("[INFO] Closing SSH session (IP change may disconnect this host).");
                self.status.succeed("IP reassignment command dispatched");
            }
            Err(err) => {
                self.status.append(&format!("[ERROR] {}", err));
                self.status.fail(&err.to_string());
                self.shell.close().await;
            }
        }
    }

    async fn reassign_windows(&self) -> Result<()> {
        let listing = self
            .shell
            .exec(r"C:\Windows\System32\netsh.exe interface ip show config")
            .await?;
        let details = parse_netsh_config(&listing.stdout, &self.source_ip).ok_or_else(|| {
            MigrateError::UnsupportedConfiguration(format!(
                "could not detect network configuration for source IP {}",
                self.source_ip
            ))
        })?;

        self.status.append(&format!("[INFO] Interface: {}", details.name));
        self.status.append(&format!("[INFO] Subnet   : {}", details.netmask));
        self.status.append(&format!("[INFO] Gateway  : {}", details.gateway));
        self.status.append(&format!("[INFO] Target IP: {}", self.target_ip));

        let command = format!(
            r#"C:\Windows\System32\netsh.exe interface ip set address name="{}" static {} {} {}"#,
            details.name, self.target_ip, details.netmask, details.gateway
        );
        self.status.append(&format!(
            "[INFO] Sending command (will disconnect after IP change): {}",
            command
        ));
        self.shell.exec_no_wait(&command).await
    }

    async fn reassign_linux(&self) -> Result<()> {
        let os_release = self.shell.exec("cat /etc/os-release").await?;
        let distro = detect_distro(&os_release.stdout)?;

        let route = self.shell.exec("ip route | grep default").await?;
        let (gateway, iface) = parse_default_route(&route.stdout).ok_or_else(|| {
            MigrateError::UnsupportedConfiguration(format!(
                "could not detect network configuration for source IP {}",
                self.source_ip
            ))
        })?;

        let addr = self
            .shell
            .exec(&format!("ip -o -f inet addr show dev {}", iface))
            .await?;
        let prefix = parse_prefix_len(&addr.stdout).ok_or_else(|| {
            MigrateError::UnsupportedConfiguration(format!(
                "could not detect prefix length on interface {}",
                iface
            ))
        })?;

        self.status.append("[INFO] Detected network details:");
        self.status.append(&format!("  Distro   : {}", distro.as_str()));
        self.status.append(&format!("  Interface: {}", iface));
        self.status.append(&format!("  Gateway  : {}", gateway));
        self.status.append(&format!("  Subnet   : /{}", prefix));

        match distro {
            Distro::RhelFamily | Distro::Suse => {
                for cmd in nmcli_commands(&iface, &self.target_ip, prefix, &gateway) {
                    self.status.append(&format!("[INFO] Sending: {}", cmd));
                    self.shell.exec_no_wait(&cmd).await?;
                }
                Ok(())
            }
            Distro::Ubuntu => self.reassign_netplan(&iface, prefix, &gateway).await,
            Distro::Debian => self.reassign_interfaces_file(&gateway).await,
        }
    }

    async fn reassign_netplan(&self, iface: &str, prefix: u8, gateway: &str) -> Result<()> {
        let listing = self
            .shell
            .exec("ls /etc/netplan/*.yaml /etc/netplan/*.yml 2>/dev/null")
            .await?;
        let yaml_path = listing
            .stdout
            .lines()
            .next()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .ok_or_else(|| {
                MigrateError::UnsupportedConfiguration("no netplan config found".into())
            })?
            .to_string();

        let content = self.shell.exec(&format!("cat {}", yaml_path)).await?;
        let rewritten = rewrite_netplan(&content.stdout, iface, &self.target_ip, prefix, gateway)?;

        self.shell.upload("/tmp/netplan_new.yaml", &rewritten).await?;
        let cmd = format!("mv /tmp/netplan_new.yaml {} && netplan apply", yaml_path);
        self.status.append(&format!("[INFO] Sending: {}", cmd));
        self.shell.exec_no_wait(&cmd).await
    }

    async fn reassign_interfaces_file(&self, gateway: &str) -> Result<()> {
        let content = self.shell.exec("cat /etc/network/interfaces").await?;
        let rewritten = rewrite_interfaces_file(&content.stdout, &self.target_ip, gateway);

        self.shell.upload("/tmp/interfaces_new", &rewritten).await?;
        let cmd = "mv /tmp/interfaces_new /etc/network/interfaces && ifdown -a && ifup -a";
        self.status.append(&format!("[INFO] Sending: {}", cmd));
        self.shell.exec_no_wait(cmd).await
    }

    async fn settle_and_close(&self) {
        // Let the fired command begin before tearing down the channel.
        tokio::time::sleep(FIRE_SETTLE).await;
        log_info!(
            "Closing session to {} (host is changing its address)",
            self.source_ip
        );
        self.shell.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ubuntu_descriptor_selects_netplan_path() {
        let os_release = "NAME=\"Ubuntu\"\nID=ubuntu\nID_LIKE=debian\n";
        assert_eq!(detect_distro(os_release).unwrap(), Distro::Ubuntu);
    }

    #[test]
    fn centos_descriptor_selects_rhel_family() {
        let os_release = "NAME=\"CentOS Linux\"\nID=\"centos\"\n";
        assert_eq!(detect_distro(os_release).unwrap(), Distro::RhelFamily);
    }

    #[test]
    fn unknown_descriptor_is_terminal() {
        assert!(matches!(
            detect_distro("NAME=\"Gentoo\"\nID=gentoo\n"),
            Err(MigrateError::UnsupportedConfiguration(_))
        ));
    }

    #[test]
    fn default_route_parsed() {
        let output = "default via 10.0.0.1 dev eth0 proto dhcp metric 100\n";
        let (gateway, iface) = parse_default_route(output).unwrap();
        assert_eq!(gateway, "10.0.0.1");
        assert_eq!(iface, "eth0");
        assert!(parse_default_route("10.0.0.0/24 dev eth0 scope link\n").is_none());
    }

    #[test]
    fn prefix_length_parsed_from_addr_listing() {
        let output = "2: eth0    inet 10.0.0.5/24 brd 10.0.0.255 scope global eth0\\n";
        assert_eq!(parse_prefix_len(output), Some(24));
        assert_eq!(parse_prefix_len("no inet here"), None);
    }

    #[test]
    fn netmask_conversion() {
        assert_eq!(prefix_to_netmask(24), "255.255.255.0");
        assert_eq!(prefix_to_netmask(16), "255.255.0.0");
        assert_eq!(prefix_to_netmask(22), "255.255.252.0");
        assert_eq!(prefix_to_netmask(32), "255.255.255.255");
        assert_eq!(prefix_to_netmask(0), "0.0.0.0");
    }

    #[test]
    fn netsh_block_matching_source_ip_is_parsed() {
        let output = r#"
Configuration for interface "Loopback Pseudo-Interface 1"
    DHCP enabled:                         No
    IP Address:                           127.0.0.1

Configuration for interface "Ethernet0"
    DHCP enabled:                         Yes
    IP Address:                           10.1.2.3
    Subnet Prefix:                        10.1.2.0/24 (mask 255.255.255.0)
    Default Gateway:                      10.1.2.1
    Gateway Metric:                       0
"#;
        let details = parse_netsh_config(output, "10.1.2.3").unwrap();
        assert_eq!(details.name, "Ethernet0");
        assert_eq!(details.netmask, "255.255.255.0");
        assert_eq!(details.gateway, "10.1.2.1");

        assert!(parse_netsh_config(output, "192.168.9.9").is_none());
    }

    #[test]
    fn netplan_rewrite_pins_static_address() {
        let doc = "network:\n  version: 2\n  ethernets:\n    eth0:\n      dhcp4: true\n    eth1:\n      dhcp4: true\n";
        let rewritten = rewrite_netplan(doc, "eth0", "10.9.9.9", 24, "10.9.9.1").unwrap();

        let parsed: serde_yaml::Value = serde_yaml::from_str(&rewritten).unwrap();
        let eth0 = &parsed["network"]["ethernets"]["eth0"];
        assert_eq!(eth0["dhcp4"], serde_yaml::Value::Bool(false));
        assert_eq!(eth0["addresses"][0], serde_yaml::Value::from("10.9.9.9/24"));
        assert_eq!(eth0["gateway4"], serde_yaml::Value::from("10.9.9.1"));
        // Untouched sibling interface keeps its config.
        assert_eq!(
            parsed["network"]["ethernets"]["eth1"]["dhcp4"],
            serde_yaml::Value::Bool(true)
        );
    }

    #[test]
    fn netplan_rewrite_requires_the_interface() {
        let doc = "network:\n  ethernets:\n    eth1: {}\n";
        assert!(rewrite_netplan(doc, "eth0", "10.0.0.2", 24, "10.0.0.1").is_err());
    }

    #[test]
    fn interfaces_file_lines_replaced_in_place() {
        let content = "auto eth0\niface eth0 inet static\n    address 10.0.0.5\n    netmask 255.255.255.0\n    gateway 10.0.0.1\n";
        let rewritten = rewrite_interfaces_file(content, "10.0.0.50", "10.0.0.1");
        assert!(rewritten.contains("    address 10.0.0.50"));
        assert!(rewritten.contains("    netmask 255.255.255.0"));
        assert!(!rewritten.contains("address 10.0.0.5\n"));
    }
}
