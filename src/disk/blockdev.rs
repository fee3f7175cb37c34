//! Block-device and filesystem operations behind a trait.
//!
//! The assembler drives everything through [`BlockDev`] so its state
//! machine and cleanup logic can be exercised without root or real
//! loop devices. [`HostBlockDev`] shells out to the usual host tools;
//! [`MemBlockDev`] simulates the same surface in a temp directory.

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::path::Path;

use crate::error::PipelineError;
use crate::process::Cmd;

use super::plan::{FsKind, PartitionPlan};

/// Narrow interface over the privileged disk operations the assembler
/// needs. Partition devices are addressed by 1-based index on an
/// attached loop device.
pub trait BlockDev {
    /// Create the sparse backing file at its full planned size.
    fn allocate(&mut self, image: &Path, total_bytes: u64) -> Result<()>;

    /// Write the partition table described by the plan.
    fn write_table(&mut self, image: &Path, plan: &PartitionPlan) -> Result<()>;

    /// Attach the image to a loop device with partition scanning and
    /// return the device path.
    fn loop_attach(&mut self, image: &Path) -> Result<String>;

    fn loop_detach(&mut self, device: &str) -> Result<()>;

    /// Path of partition `index` on an attached loop device.
    fn partition_device(&self, device: &str, index: u32) -> String {
        format!("{device}p{index}")
    }

    fn format(&mut self, device: &str, fs: FsKind, label: &str) -> Result<()>;

    /// Filesystem UUID of a formatted partition.
    fn fs_uuid(&mut self, device: &str) -> Result<String>;

    fn mount(&mut self, device: &str, target: &Path) -> Result<()>;

    fn unmount(&mut self, target: &Path) -> Result<()>;

    fn is_mounted(&self, target: &Path) -> Result<bool>;
}

/// Real implementation backed by losetup/sfdisk/mkfs/blkid/mount.
/// Requires root.
#[derive(Debug, Default)]
pub struct HostBlockDev;

impl BlockDev for HostBlockDev {
    fn allocate(&mut self, image: &Path, total_bytes: u64) -> Result<()> {
        let f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(image)
            .with_context(|| format!("failed to create image file {}", image.display()))?;
        f.set_len(total_bytes)
            .with_context(|| format!("failed to size image file {}", image.display()))?;
        Ok(())
    }

    fn write_table(&mut self, image: &Path, plan: &PartitionPlan) -> Result<()> {
        Cmd::new("sfdisk")
            .arg_path(image)
            .stdin_bytes(plan.sfdisk_script().into_bytes())
            .error_msg("sfdisk failed to write the partition table")
            .run()?;
        Ok(())
    }

    fn loop_attach(&mut self, image: &Path) -> Result<String> {
        let device = Cmd::new("losetup")
            .args(["--find", "--show", "-P"])
            .arg_path(image)
            .run_capture()
            .map_err(|e| PipelineError::LoopDeviceFailure(format!("{e:#}")))?;
        if device.is_empty() {
            return Err(
                PipelineError::LoopDeviceFailure("losetup returned no device".into()).into(),
            );
        }
        Ok(device)
    }

    fn loop_detach(&mut self, device: &str) -> Result<()> {
        Cmd::new("losetup")
            .arg("-d")
            .arg(device)
            .run()
            .map_err(|e| PipelineError::LoopDeviceFailure(format!("{e:#}")))?;
        Ok(())
    }

    fn format(&mut self, device: &str, fs: FsKind, label: &str) -> Result<()> {
        let mut cmd = Cmd::new(fs.mkfs_program());
        match fs {
            FsKind::Vfat => cmd = cmd.args(["-F", "32", "-n", label]),
            FsKind::Ext4 => cmd = cmd.args(["-q", "-L", label]),
            FsKind::Swap => cmd = cmd.args(["-L", label]),
        }
        cmd.arg(device)
            .error_msg(&format!("failed to format {device} as {label}"))
            .run()?;
        Ok(())
    }

    fn fs_uuid(&mut self, device: &str) -> Result<String> {
        Cmd::new("blkid")
            .args(["-s", "UUID", "-o", "value"])
            .arg(device)
            .run_capture()
            .with_context(|| format!("failed to read UUID of {device}"))
    }

    fn mount(&mut self, device: &str, target: &Path) -> Result<()> {
        fs::create_dir_all(target)?;
        Cmd::new("mount")
            .arg(device)
            .arg_path(target)
            .run()
            .map_err(|e| PipelineError::MountFailure(format!("{e:#}")))?;
        Ok(())
    }

    fn unmount(&mut self, target: &Path) -> Result<()> {
        Cmd::new("umount")
            .arg_path(target)
            .run()
            .map_err(|e| PipelineError::MountFailure(format!("{e:#}")))?;
        Ok(())
    }

    fn is_mounted(&self, target: &Path) -> Result<bool> {
        let mounts = fs::read_to_string("/proc/mounts").context("failed to read /proc/mounts")?;
        let needle = target.to_string_lossy();
        Ok(mounts
            .lines()
            .filter_map(|l| l.split_whitespace().nth(1))
            .any(|mp| mp == needle))
    }
}

/// In-memory simulation for tests. "Mounting" a partition creates the
/// target directory, so population and boot-loader phases write real
/// files into the temp tree.
#[derive(Debug, Default)]
pub struct MemBlockDev {
    attached: Option<String>,
    mounted: Vec<std::path::PathBuf>,
    formatted: Vec<(String, String)>,
    /// Label whose format call should fail, for cleanup-path tests.
    pub fail_format_label: Option<String>,
}

impl MemBlockDev {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn loop_attached(&self) -> bool {
        self.attached.is_some()
    }

    pub fn mounted_targets(&self) -> &[std::path::PathBuf] {
        &self.mounted
    }

    pub fn formatted(&self) -> &[(String, String)] {
        &self.formatted
    }
}

impl BlockDev for MemBlockDev {
    fn allocate(&mut self, image: &Path, total_bytes: u64) -> Result<()> {
        if let Some(parent) = image.parent() {
            fs::create_dir_all(parent)?;
        }
        let f = fs::File::create(image)?;
        f.set_len(total_bytes)?;
        Ok(())
    }

    fn write_table(&mut self, _image: &Path, _plan: &PartitionPlan) -> Result<()> {
        Ok(())
    }

    fn loop_attach(&mut self, image: &Path) -> Result<String> {
        let device = format!("/dev/loop-sim-{}", image.display());
        self.attached = Some(device.clone());
        Ok(device)
    }

    fn loop_detach(&mut self, _device: &str) -> Result<()> {
        self.attached = None;
        Ok(())
    }

    fn format(&mut self, device: &str, _fs: FsKind, label: &str) -> Result<()> {
        if self.fail_format_label.as_deref() == Some(label) {
            anyhow::bail!("injected format failure for {label}");
        }
        self.formatted.push((device.to_string(), label.to_string()));
        Ok(())
    }

    fn fs_uuid(&mut self, device: &str) -> Result<String> {
        // Deterministic per device so rendered configs are stable.
        let n: u32 = device.bytes().map(u32::from).sum();
        Ok(format!("0000{n:04x}-sim"))
    }

    fn mount(&mut self, _device: &str, target: &Path) -> Result<()> {
        fs::create_dir_all(target)?;
        self.mounted.push(target.to_path_buf());
        Ok(())
    }

    fn unmount(&mut self, target: &Path) -> Result<()> {
        self.mounted.retain(|t| t != target);
        Ok(())
    }

    fn is_mounted(&self, target: &Path) -> Result<bool> {
        Ok(self.mounted.iter().any(|t| t == target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn partition_device_naming() {
        let dev = MemBlockDev::new();
        assert_eq!(dev.partition_device("/dev/loop3", 2), "/dev/loop3p2");
    }

    #[test]
    fn mem_dev_tracks_mounts_and_loop_state() {
        let tmp = TempDir::new().unwrap();
        let mut dev = MemBlockDev::new();
        let image = tmp.path().join("disk.img");
        dev.allocate(&image, 1024 * 1024).unwrap();
        assert_eq!(fs::metadata(&image).unwrap().len(), 1024 * 1024);

        let loopdev = dev.loop_attach(&image).unwrap();
        assert!(dev.loop_attached());

        let target = tmp.path().join("mnt");
        dev.mount(&dev.partition_device(&loopdev, 1), &target).unwrap();
        assert!(dev.is_mounted(&target).unwrap());
        assert!(target.is_dir());

        dev.unmount(&target).unwrap();
        assert!(!dev.is_mounted(&target).unwrap());
        dev.loop_detach(&loopdev).unwrap();
        assert!(!dev.loop_attached());
    }

    #[test]
    fn mem_dev_uuids_are_deterministic() {
        let mut dev = MemBlockDev::new();
        let a = dev.fs_uuid("/dev/loop0p1").unwrap();
        let b = dev.fs_uuid("/dev/loop0p1").unwrap();
        let c = dev.fs_uuid("/dev/loop0p2").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
