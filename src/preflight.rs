//! Preflight checks for pipeline validation.
//!
//! Validates that the host has the required external tools before a phase
//! starts. This prevents cryptic mid-assembly failures after resources
//! have already been allocated.

use crate::error::PipelineError;
use anyhow::Result;

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Host tools required for disk-image assembly.
///
/// Each tuple is (command_name, package_name).
pub const ASSEMBLY_TOOLS: &[(&str, &str)] = &[
    ("sfdisk", "util-linux"),
    ("losetup", "util-linux"),
    ("blkid", "util-linux"),
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("mkfs.vfat", "dosfstools"),
    ("mkfs.ext4", "e2fsprogs"),
    ("mkswap", "util-linux"),
];

/// Host tools required for repository sync to a deploy target.
pub const SYNC_TOOLS: &[(&str, &str)] = &[("rsync", "rsync")];

/// Check that specific tools are available.
///
/// Returns `MissingPrerequisite` listing every absent tool and the
/// package providing it.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();

    for (tool, package) in tools {
        if !command_exists(tool) {
            missing.push(format!("  {} (install: {})", tool, package));
        }
    }

    if !missing.is_empty() {
        return Err(PipelineError::MissingPrerequisite(format!(
            "missing required host tools:\n{}",
            missing.join("\n")
        ))
        .into());
    }

    Ok(())
}
