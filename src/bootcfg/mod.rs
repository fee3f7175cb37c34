//! Boot-configuration generation.
//!
//! Produces menu entries for network-deployed installs, parameterized by
//! transport and installation mode. Generation is a pure function of its
//! inputs: no filesystem or clock access, identical inputs produce
//! byte-identical output, so the result can be diffed and regenerated at
//! will.
//!
//! Safety model: a destructive entry (anything that rewrites a target
//! disk) exists in the output only when the operator armed it with the
//! exact confirmation value. When unconfirmed the entry is absent, not
//! disabled. The entry's command line also names the disk-size guard
//! that must pass before the restore command runs.

use anyhow::Result;

use crate::config::{InstallMode, Transport};
use crate::error::PipelineError;
use crate::fetch::manifest::Manifest;
use crate::fetch::ASSET_PAYLOAD;

/// Network endpoint the generated entries point at.
#[derive(Debug, Clone)]
pub struct NetTarget {
    pub host: String,
    /// Export path for NFS, URL base path for HTTP/TFTP.
    pub base_path: String,
}

/// One boot-menu entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootConfigEntry {
    pub label: String,
    pub kernel: String,
    pub initrd: String,
    pub cmdline: String,
    pub destructive: bool,
    pub note: Option<String>,
}

/// Generate the entry list for one manifest.
pub fn generate(
    manifest: &Manifest,
    transport: Transport,
    mode: InstallMode,
    confirm: bool,
    dry_run: bool,
    target: &NetTarget,
    disk: &str,
) -> Result<Vec<BootConfigEntry>> {
    if target.host.trim().is_empty() {
        return Err(PipelineError::TransportMisconfiguration(
            "target host is not configured".into(),
        )
        .into());
    }

    let version = &manifest.version;
    let base = target.base_path.trim_end_matches('/');
    let kernel = format!("{base}/{version}/vmlinuz");
    let initrd = format!("{base}/{version}/initrd.img");

    let (payload_directive, note) = match transport {
        Transport::Http => (
            format!(
                "fetch=http://{}{base}/{version}/{ASSET_PAYLOAD}",
                target.host
            ),
            None,
        ),
        Transport::Nfs => (
            format!("netboot=nfs nfsroot={}:{base}/{version} ip=dhcp", target.host),
            None,
        ),
        Transport::Tftp => (
            format!(
                "fetch=tftp://{}{base}/{version}/{ASSET_PAYLOAD}",
                target.host
            ),
            Some(String::from(
                "tftp transfers large payloads slowly; prefer http or nfs for full images",
            )),
        ),
    };

    let mut entries = vec![BootConfigEntry {
        label: format!("Install {version} (manual)"),
        kernel: kernel.clone(),
        initrd: initrd.clone(),
        cmdline: format!("boot=live {payload_directive}"),
        destructive: false,
        note,
    }];

    if confirm && mode.is_destructive() {
        let restore = restore_command(mode, disk);
        let restore = if dry_run {
            format!("echo DRY-RUN: {restore}")
        } else {
            restore
        };
        entries.push(BootConfigEntry {
            label: format!("Install {version} ({})", mode.as_str()),
            kernel,
            initrd,
            cmdline: format!(
                "boot=live {payload_directive} guard=disk-size target_disk={disk} \
                 restore_cmd=\"{restore}\""
            ),
            destructive: true,
            note: None,
        });
    }

    Ok(entries)
}

fn restore_command(mode: InstallMode, disk: &str) -> String {
    match mode {
        InstallMode::AutoFull => format!("restore-disk --full {disk}"),
        InstallMode::AutoParts => format!("restore-disk --parts {disk}"),
        InstallMode::Capture => format!("capture-disk {disk}"),
        InstallMode::Manual => String::new(),
    }
}

/// Render entries as the final line-oriented menu file. The file is a
/// complete replacement unit; consumers never patch it in place.
pub fn render(entries: &[BootConfigEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        if let Some(note) = &entry.note {
            out.push_str(&format!("# note: {note}\n"));
        }
        out.push_str(&format!("menuentry \"{}\" {{\n", entry.label));
        out.push_str(&format!("    kernel {}\n", entry.kernel));
        out.push_str(&format!("    initrd {}\n", entry.initrd));
        out.push_str(&format!("    append {}\n", entry.cmdline));
        out.push_str("}\n\n");
    }
    out
}

/// Token the verification engine expects in a config generated for this
/// transport and target.
pub fn expected_token(transport: Transport, target: &NetTarget) -> String {
    match transport {
        Transport::Http => format!("fetch=http://{}", target.host),
        Transport::Nfs => format!("nfsroot={}:", target.host),
        Transport::Tftp => format!("fetch=tftp://{}", target.host),
    }
}
