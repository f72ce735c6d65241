use crate::cloning::base_name_of;
use crate::config::ConversionConfig;
use crate::engine::{Step, StepContext, StepOutcome, Workflow};
use crate::request::HostCredential;
use crate::shell::RemoteShell;
use crate::status::StatusWriter;
use crate::{log_info, MigrateError, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// How many trailing tool-output lines are kept for error reporting.
const ERROR_TAIL_LINES: usize = 50;

pub type ShellConnector = Box<
    dyn Fn() -> Pin<Box<dyn Future<Output = Result<Arc<dyn RemoteShell>>> + Send>> + Send + Sync,
>;

/// State threaded through the conversion steps. The shell session to the
/// KVM host is opened by the first step and closed on every exit path.
pub struct ConversionContext {
    connect: ShellConnector,
    shell: Option<Arc<dyn RemoteShell>>,
    source: HostCredential,
    clone_name: String,
    base_name: Option<String>,
    thumbprint: Option<String>,
    output_dir: Option<String>,
    settings: ConversionConfig,
    status: StatusWriter,
}

#[async_trait]
impl StepContext for ConversionContext {
    async fn release(&mut self) {
        if let Some(shell) = self.shell.take() {
            shell.close().await;
        }
    }
}

impl ConversionContext {
    fn shell(&self) -> Result<&Arc<dyn RemoteShell>> {
        self.shell
            .as_ref()
            .ok_or_else(|| MigrateError::Precondition("target shell session not open".into()))
    }

    fn pass_file(&self) -> String {
        format!("/tmp/v2v-pass-{}", self.clone_name)
    }
}

/// Build the conversion workflow: run the external conversion tool against
/// the source hypervisor from the KVM host, then repair, define, rewire and
/// start the resulting domain. Keyed by the clone name.
pub fn build(
    connect: ShellConnector,
    source: HostCredential,
    clone_name: String,
    settings: ConversionConfig,
    writer: StatusWriter,
) -> (Workflow<ConversionContext>, ConversionContext) {
    let cx = ConversionContext {
        connect,
        shell: None,
        source,
        clone_name,
        base_name: None,
        thumbprint: None,
        output_dir: None,
        settings,
        status: writer.clone(),
    };

    let workflow = Workflow::new("conversion", writer)
        .step(Step::new("connect to target host", 5, |cx: &mut ConversionContext| {
            Box::pin(connect_target(cx))
        }))
        .step(Step::new("fetch source thumbprint", 10, |cx: &mut ConversionContext| {
            Box::pin(fetch_thumbprint(cx))
        }))
        .step(Step::new("stage credential file", 15, |cx: &mut ConversionContext| {
            Box::pin(stage_credentials(cx))
        }))
        .step(Step::new("derive output name", 20, |cx: &mut ConversionContext| {
            Box::pin(derive_output(cx))
        }))
        .step(Step::new("run conversion tool", 85, |cx: &mut ConversionContext| {
            Box::pin(run_conversion_tool(cx))
        }))
        .step(Step::new("repair domain XML", 90, |cx: &mut ConversionContext| {
            Box::pin(repair_domain_xml(cx))
        }))
        .step(Step::new("define domain", 92, |cx: &mut ConversionContext| {
            Box::pin(define_domain(cx))
        }))
        .step(Step::new("rewrite network attachment", 95, |cx: &mut ConversionContext| {
            Box::pin(rewrite_network(cx))
        }))
        .step(Step::new("start domain", 98, |cx: &mut ConversionContext| {
            Box::pin(start_domain(cx))
        }));

    (workflow, cx)
}

async fn connect_target(cx: &mut ConversionContext) -> Result<StepOutcome> {
    cx.status.running(2, "Connecting to KVM host...");
    let shell = (cx.connect)().await?;
    cx.shell = Some(shell);
    Ok(StepOutcome::Continue)
}

async fn fetch_thumbprint(cx: &mut ConversionContext) -> Result<StepOutcome> {
    cx.status.running(8, "Fetching source hypervisor thumbprint...");
    let cmd = format!(
        "openssl s_client -connect {}:443 </dev/null 2>/dev/null | openssl x509 -fingerprint -sha1 -noout",
        cx.source.address
    );
    let output = cx.shell()?.exec(&cmd).await?;
    let thumbprint = parse_thumbprint(&output.stdout).ok_or_else(|| {
        MigrateError::Precondition(format!(
            "failed to extract SHA1 fingerprint from {}",
            cx.source.address
        ))
    })?;
    log_info!("Source thumbprint: {}", thumbprint);
    cx.thumbprint = Some(thumbprint);
    Ok(StepOutcome::Continue)
}

async fn stage_credentials(cx: &mut ConversionContext) -> Result<StepOutcome> {
    let pass_file = cx.pass_file();
    let shell = cx.shell()?;
    shell.upload(&pass_file, &cx.source.password).await?;
    let output = shell.exec(&format!("chmod 600 {}", pass_file)).await?;
    if !output.success() {
        return Err(MigrateError::tool(
            "chmod on credential file",
            output.exit_code,
            output.stderr,
        ));
    }
    cx.status.running(15, "Staged transient credential file on target");
    Ok(StepOutcome::Continue)
}

async fn derive_output(cx: &mut ConversionContext) -> Result<StepOutcome> {
    let base = base_name_of(&cx.clone_name)?;
    let output_dir = format!("{}/{}", cx.settings.output_datastore, base);
    let result = cx.shell()?.exec(&format!("mkdir -p {}", output_dir)).await?;
    if !result.success() {
        return Err(MigrateError::tool("mkdir", result.exit_code, result.stderr));
    }
    cx.status
        .running(20, &format!("Converting '{}' as '{}'", cx.clone_name, base));
    cx.base_name = Some(base);
    cx.output_dir = Some(output_dir);
    Ok(StepOutcome::Continue)
}

async fn run_conversion_tool(cx: &mut ConversionContext) -> Result<StepOutcome> {
    let base = cx.base_name.clone().unwrap_or_default();
    let output_dir = cx.output_dir.clone().unwrap_or_default();
    let thumbprint = cx.thumbprint.clone().unwrap_or_default();
    let pass_file = cx.pass_file();

    let command = v2v_command(
        &cx.source,
        &cx.settings,
        &pass_file,
        &cx.clone_name,
        &base,
        &output_dir,
        &thumbprint,
    );

    cx.status.running(20, "Starting virt-v2v conversion...");
    let mut stream = cx.shell()?.stream(&command).await?;

    let mut tail: VecDeque<String> = VecDeque::with_capacity(ERROR_TAIL_LINES);
    while let Some(line) = stream.next_line().await {
        if tail.len() == ERROR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line.clone());
        cx.status.running(30, &format!("v2v: {}", line.trim()));
    }
    let exit_code = stream.wait().await?;

    // The credential artifact is removed no matter how the tool exited.
    let _ = cx.shell()?.exec(&format!("rm -f {}", pass_file)).await;

    if exit_code != 0 {
        let captured: Vec<String> = tail.into_iter().collect();
        return Err(MigrateError::tool("virt-v2v", exit_code, captured.join("\n")));
    }

    cx.status.running(85, "Conversion tool finished successfully");
    Ok(StepOutcome::Continue)
}

async fn repair_domain_xml(cx: &mut ConversionContext) -> Result<StepOutcome> {
    cx.status.running(88, "Fixing domain configuration...");
    let xml_path = cx.domain_xml_path()?;
    let shell = cx.shell()?;

    let output = shell.exec(&format!("cat {}", xml_path)).await?;
    if !output.success() || !output.stderr.is_empty() {
        return Err(MigrateError::tool(
            "read domain XML",
            output.exit_code,
            output.stderr,
        ));
    }

    let repaired = repair_disk_targets(&output.stdout)?;
    shell.upload(&xml_path, &repaired).await?;
    cx.status.running(90, "Domain XML repaired");
    Ok(StepOutcome::Continue)
}

async fn define_domain(cx: &mut ConversionContext) -> Result<StepOutcome> {
    let xml_path = cx.domain_xml_path()?;
    let output = cx.shell()?.exec(&format!("virsh define {}", xml_path)).await?;
    if !output.success() || !output.stderr.is_empty() {
        return Err(MigrateError::tool(
            "virsh define",
            output.exit_code,
            output.stderr,
        ));
    }
    Ok(StepOutcome::Continue)
}

async fn rewrite_network(cx: &mut ConversionContext) -> Result<StepOutcome> {
    let base = cx
        .base_name
        .clone()
        .ok_or_else(|| MigrateError::Precondition("base name not derived".into()))?;
    let shell = cx.shell()?;

    let dump = shell.exec(&format!("virsh dumpxml {}", base)).await?;
    if !dump.success() {
        return Err(MigrateError::tool("virsh dumpxml", dump.exit_code, dump.stderr));
    }

    let rewritten = rewrite_network_attachment(
        &dump.stdout,
        &cx.settings.source_bridge,
        &cx.settings.target_network,
    );
    let temp_path = format!("/tmp/{}.xml", base);
    shell.upload(&temp_path, &rewritten).await?;

    let redefine = shell.exec(&format!("virsh define {}", temp_path)).await?;
    if !redefine.success() || !redefine.stderr.is_empty() {
        return Err(MigrateError::tool(
            "virsh define (network rewrite)",
            redefine.exit_code,
            redefine.stderr,
        ));
    }
    cx.status.running(
        95,
        &format!("Network attachment moved to '{}'", cx.settings.target_network),
    );
    Ok(StepOutcome::Continue)
}

async fn start_domain(cx: &mut ConversionContext) -> Result<StepOutcome> {
    let base = cx
        .base_name
        .clone()
        .ok_or_else(|| MigrateError::Precondition("base name not derived".into()))?;
    cx.status.running(96, "Starting VM on target...");
    let output = cx.shell()?.exec(&format!("virsh start {}", base)).await?;
    if !output.success() || !output.stderr.is_empty() {
        return Err(MigrateError::tool(
            "virsh start",
            output.exit_code,
            output.stderr,
        ));
    }
    cx.status
        .running(98, "Migration successful. VM created and started on target");
    Ok(StepOutcome::Continue)
}

impl ConversionContext {
    fn domain_xml_path(&self) -> Result<String> {
        match (&self.output_dir, &self.base_name) {
            (Some(dir), Some(base)) => Ok(format!("{}/{}.xml", dir, base)),
            _ => Err(MigrateError::Precondition("output location not derived".into())),
        }
    }
}

/// Assemble the virt-v2v invocation against the source endpoint.
fn v2v_command(
    source: &HostCredential,
    settings: &ConversionConfig,
    pass_file: &str,
    clone_name: &str,
    base_name: &str,
    output_dir: &str,
    thumbprint: &str,
) -> String {
    format!(
        "virt-v2v -ic 'vpx://{}@{}{}?no_verify=1' -ip {} \"{}\" -on \"{}\" \
         -o local -os {} -of qcow2 -it vddk -io vddk-libdir={} -io vddk-thumbprint={}",
        percent_encode(&source.username),
        source.address,
        settings.vcenter_path,
        pass_file,
        clone_name,
        base_name,
        output_dir,
        settings.vddk_libdir,
        thumbprint,
    )
}

/// Percent-encode a URL component (usernames often carry `@domain`).
fn percent_encode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char)
            }
            other => encoded.push_str(&format!("%{:02X}", other)),
        }
    }
    encoded
}

/// Pull the `AB:CD:...` fingerprint out of `openssl x509 -fingerprint` output.
///
/// Accepts both `SHA1 Fingerprint=...` and bare `Fingerprint=...` header
/// variants; returns `None` when no plausible fingerprint is present.
pub fn parse_thumbprint(output: &str) -> Option<String> {
    for line in output.lines() {
        if let Some(pos) = line.find("Fingerprint=") {
            let candidate = line[pos + "Fingerprint=".len()..].trim();
            if !candidate.is_empty()
                && candidate
                    .chars()
                    .all(|c| c.is_ascii_hexdigit() || c == ':')
            {
                return Some(candidate.to_string());
            }
        }
    }
    None
}

/// Drop duplicate disk entries that claim the same target device.
///
/// The conversion tool sometimes emits two `<disk>` elements for one target
/// (e.g. `vda`): a real one with a backing file and a stub without. For each
/// target id, exactly one entry survives: the first one carrying a genuine
/// `<source file=...>` reference, or the first seen if none do.
pub fn repair_disk_targets(xml: &str) -> Result<String> {
    let blocks = find_element_blocks(xml, "disk");

    // target dev -> (block index, has backing source)
    let mut chosen: Vec<(String, usize, bool)> = Vec::new();
    let mut removed: Vec<usize> = Vec::new();

    for (idx, &(start, end)) in blocks.iter().enumerate() {
        let block = &xml[start..end];
        let dev = match attr_in_tag(block, "target", "dev") {
            Some(dev) => dev,
            None => continue,
        };
        let has_source = attr_in_tag(block, "source", "file").is_some();

        match chosen.iter_mut().find(|(d, _, _)| *d == dev) {
            None => chosen.push((dev, idx, has_source)),
            Some(entry) => {
                if !has_source {
                    removed.push(idx);
                } else if !entry.2 {
                    removed.push(entry.1);
                    entry.1 = idx;
                    entry.2 = true;
                } else {
                    // Both real: keep the first genuine one found.
                    removed.push(idx);
                }
            }
        }
    }

    if removed.is_empty() {
        return Ok(xml.to_string());
    }

    removed.sort_unstable();
    let mut result = String::with_capacity(xml.len());
    let mut cursor = 0;
    for &idx in &removed {
        let (start, end) = blocks[idx];
        result.push_str(&xml[cursor..start]);
        cursor = end;
    }
    result.push_str(&xml[cursor..]);
    Ok(result)
}

/// Byte ranges of every `<name ...>...</name>` element, top to bottom.
fn find_element_blocks(xml: &str, name: &str) -> Vec<(usize, usize)> {
    let open = format!("<{}", name);
    let close = format!("</{}>", name);
    let mut blocks = Vec::new();
    let mut cursor = 0;

    while let Some(rel_start) = xml[cursor..].find(&open) {
        let start = cursor + rel_start;
        // Guard against matching "<diskette" style prefixes.
        let after = xml[start + open.len()..].chars().next();
        if !matches!(after, Some(' ') | Some('>') | Some('\t') | Some('\n') | Some('/')) {
            cursor = start + open.len();
            continue;
        }
        match xml[start..].find(&close) {
            Some(rel_end) => {
                let end = start + rel_end + close.len();
                blocks.push((start, end));
                cursor = end;
            }
            None => break,
        }
    }
    blocks
}

/// Value of `attr` on the first `<tag ...>` inside `fragment`.
fn attr_in_tag(fragment: &str, tag: &str, attr: &str) -> Option<String> {
    let open = format!("<{}", tag);
    let start = fragment.find(&open)?;
    let tag_end = fragment[start..].find('>')? + start;
    let tag_text = &fragment[start..tag_end];

    for quote in ['\'', '"'] {
        let pattern = format!("{}={}", attr, quote);
        if let Some(attr_start) = tag_text.find(&pattern) {
            let value_start = attr_start + pattern.len();
            if let Some(len) = tag_text[value_start..].find(quote) {
                return Some(tag_text[value_start..value_start + len].to_string());
            }
        }
    }
    None
}

/// Move interface elements from the conversion tool's bridge-style
/// attachment to the target platform's named network, by the same textual
/// substitution the platform's own tooling applies.
pub fn rewrite_network_attachment(xml: &str, source_bridge: &str, target_network: &str) -> String {
    xml.replace("interface type='bridge'", "interface type='network'")
        .replace(
            &format!("source bridge='{}'", source_bridge),
            &format!("source network='{}'", target_network),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thumbprint_extracted_from_openssl_output() {
        let output = "SHA1 Fingerprint=AB:12:CD:34:EF:56:78:90:AB:CD:EF:12:34:56:78:90:AB:CD:EF:12";
        assert_eq!(
            parse_thumbprint(output).unwrap(),
            "AB:12:CD:34:EF:56:78:90:AB:CD:EF:12:34:56:78:90:AB:CD:EF:12"
        );
        assert!(parse_thumbprint("no fingerprint here").is_none());
    }

    #[test]
    fn duplicate_target_keeps_entry_with_backing_file() {
        let xml = r#"<domain><devices>
<disk type='file' device='disk'>
  <source file='/var/lib/images/web.qcow2'/>
  <target dev='vda' bus='virtio'/>
</disk>
<disk type='file' device='disk'>
  <target dev='vda' bus='virtio'/>
</disk>
<disk type='file' device='cdrom'>
  <target dev='sda' bus='sata'/>
</disk>
</devices></domain>"#;

        let repaired = repair_disk_targets(xml).unwrap();
        assert_eq!(repaired.matches("dev='vda'").count(), 1);
        assert!(repaired.contains("/var/lib/images/web.qcow2"));
        assert_eq!(repaired.matches("dev='sda'").count(), 1);
    }

    #[test]
    fn stub_first_real_second_keeps_real() {
        let xml = r#"<devices>
<disk><target dev='vda'/></disk>
<disk><source file='/img/a.qcow2'/><target dev='vda'/></disk>
</devices>"#;
        let repaired = repair_disk_targets(xml).unwrap();
        assert_eq!(repaired.matches("dev='vda'").count(), 1);
        assert!(repaired.contains("/img/a.qcow2"));
    }

    #[test]
    fn two_real_entries_keep_first() {
        let xml = r#"<devices>
<disk><source file='/img/first.qcow2'/><target dev='vda'/></disk>
<disk><source file='/img/second.qcow2'/><target dev='vda'/></disk>
</devices>"#;
        let repaired = repair_disk_targets(xml).unwrap();
        assert!(repaired.contains("first.qcow2"));
        assert!(!repaired.contains("second.qcow2"));
    }

    #[test]
    fn clean_xml_passes_through_unchanged() {
        let xml = "<devices><disk><source file='/a'/><target dev='vda'/></disk></devices>";
        assert_eq!(repair_disk_targets(xml).unwrap(), xml);
    }

    #[test]
    fn network_attachment_rewritten() {
        let xml = "<interface type='bridge'><source bridge='VM Network'/></interface>";
        let rewritten = rewrite_network_attachment(xml, "VM Network", "Compute");
        assert!(rewritten.contains("interface type='network'"));
        assert!(rewritten.contains("source network='Compute'"));
        assert!(!rewritten.contains("bridge"));
    }

    #[test]
    fn username_with_domain_is_encoded() {
        assert_eq!(percent_encode("admin@vsphere.local"), "admin%40vsphere.local");
    }

    #[test]
    fn v2v_command_contains_required_flags() {
        let source = HostCredential::new("10.1.1.1", "admin@vc", "pw");
        let settings = ConversionConfig::default();
        let cmd = v2v_command(
            &source,
            &settings,
            "/tmp/v2v-pass-x",
            "web-01-migrate-clone-20260829120000",
            "web-01",
            "/mnt/migration-datastore/web-01",
            "AB:CD",
        );
        assert!(cmd.contains("vpx://admin%40vc@10.1.1.1"));
        assert!(cmd.contains("no_verify=1"));
        assert!(cmd.contains("-of qcow2"));
        assert!(cmd.contains("vddk-thumbprint=AB:CD"));
        assert!(!cmd.contains("pw\n"));
    }
}
