//! Disk-image assembly.
//!
//! Takes a validated [`PartitionPlan`] and a source root filesystem and
//! produces a bootable raw image, progressing through a fixed state
//! machine:
//!
//! ```text
//! Unallocated -> Partitioned -> Formatted -> Populated
//!             -> BootloaderInstalled -> Finalized
//! ```
//!
//! No state is skippable. Mounts and the loop mapping are tracked in a
//! cleanup guard that is released on every exit path, success, failure
//! or interrupt, so a failed build never strands host resources.

pub mod blockdev;
pub mod plan;
pub mod populate;
pub mod template;

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::interrupt;
use crate::logging;

use self::blockdev::BlockDev;
use self::plan::{FsKind, Partition, PartitionPlan, PartitionSpec, PlanLimits, SizeReq, MIB};

/// Where an image is in its build lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    Unallocated,
    Partitioned,
    Formatted,
    Populated,
    BootloaderInstalled,
    Finalized,
}

/// A backing file plus its layout and lifecycle state. Owned by the
/// assembler until finalized.
#[derive(Debug)]
pub struct DiskImage {
    pub path: PathBuf,
    pub plan: PartitionPlan,
    pub state: ImageState,
}

/// Boot-loader inputs: kernel and initrd to place on the ESP, an
/// optional EFI loader binary, and the templates rendered with the
/// freshly assigned filesystem UUIDs.
#[derive(Debug, Clone)]
pub struct BootAssets {
    pub kernel: PathBuf,
    pub initrd: PathBuf,
    pub loader_efi: Option<PathBuf>,
    pub boot_entry_template: String,
    pub fstab_template: String,
}

pub const DEFAULT_BOOT_ENTRY_TEMPLATE: &str = "\
set timeout=3
set default=0

menuentry \"Linux\" {
    search --no-floppy --fs-uuid --set=root __EFI_UUID__
    linux /vmlinuz root=UUID=__ROOT_UUID__ rw quiet
    initrd /initrd.img
}
";

pub const DEFAULT_FSTAB_TEMPLATE: &str = "\
UUID=__ROOT_UUID__ / ext4 defaults 0 1
UUID=__EFI_UUID__ /boot/efi vfat umask=0077 0 2
UUID=__SWAP_UUID__ none swap sw 0 0
";

impl BootAssets {
    pub fn with_defaults(kernel: PathBuf, initrd: PathBuf, loader_efi: Option<PathBuf>) -> Self {
        Self {
            kernel,
            initrd,
            loader_efi,
            boot_entry_template: DEFAULT_BOOT_ENTRY_TEMPLATE.to_string(),
            fstab_template: DEFAULT_FSTAB_TEMPLATE.to_string(),
        }
    }
}

/// Standard single-OS layout: ESP, content-sized root, swap, and a data
/// partition taking the remainder.
pub fn default_layout(content_bytes: u64, margin_mib: u64) -> Vec<PartitionSpec> {
    vec![
        PartitionSpec::new("efi", SizeReq::FixedMib(512), FsKind::Vfat, "EFI"),
        PartitionSpec::new(
            "root",
            SizeReq::Content {
                content_bytes,
                margin_mib,
            },
            FsKind::Ext4,
            "OS1-ROOT",
        ),
        PartitionSpec::new("swap", SizeReq::FixedMib(4096), FsKind::Swap, "SWAP"),
        PartitionSpec::new("data", SizeReq::Remainder, FsKind::Ext4, "DATA"),
    ]
}

/// Plan limits taken from the pipeline configuration.
pub fn limits_from_config(cfg: &PipelineConfig) -> PlanLimits {
    PlanLimits {
        max_image_mib: cfg.max_image_mib,
        min_content_mib: cfg.min_content_mib,
        // Root content can never exceed the image itself.
        max_content_mib: cfg.max_image_mib,
    }
}

/// Mounted paths and the loop mapping of an in-flight build. Released in
/// reverse mount order; on the error path failures are logged and do not
/// mask the original error.
#[derive(Debug, Default)]
struct Cleanup {
    mounts: Vec<PathBuf>,
    loop_device: Option<String>,
}

impl Cleanup {
    fn release(&mut self, dev: &mut dyn BlockDev) -> Result<()> {
        let mut first_err = None;

        while let Some(target) = self.mounts.pop() {
            match dev.is_mounted(&target) {
                Ok(false) => continue,
                Ok(true) | Err(_) => {}
            }
            if let Err(err) = dev.unmount(&target) {
                logging::warn(format!("failed to unmount {}: {err:#}", target.display()));
                first_err.get_or_insert(err);
            }
        }

        if let Some(device) = self.loop_device.take() {
            if let Err(err) = dev.loop_detach(&device) {
                logging::warn(format!("failed to detach {device}: {err:#}"));
                first_err.get_or_insert(err);
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Drives one image build over a [`BlockDev`].
pub struct Assembler<B: BlockDev> {
    dev: B,
    work_dir: PathBuf,
}

impl<B: BlockDev> Assembler<B> {
    pub fn new(dev: B, work_dir: &Path) -> Self {
        Self {
            dev,
            work_dir: work_dir.to_path_buf(),
        }
    }

    pub fn device(&self) -> &B {
        &self.dev
    }

    /// Build `image_path` according to `plan`, populating the root
    /// partition from `source_root` and installing boot assets.
    pub fn assemble(
        &mut self,
        image_path: &Path,
        plan: PartitionPlan,
        source_root: &Path,
        assets: &BootAssets,
    ) -> Result<DiskImage> {
        let mut cleanup = Cleanup::default();
        let result = self.run_phases(&mut cleanup, image_path, &plan, source_root, assets);

        match result {
            Ok(()) => {
                // Finalization: tear down mounts and the loop mapping.
                // A failure here is a real failure, the image is not done.
                cleanup.release(&mut self.dev)?;
                logging::info(format!("image finalized: {}", image_path.display()));
                Ok(DiskImage {
                    path: image_path.to_path_buf(),
                    plan,
                    state: ImageState::Finalized,
                })
            }
            Err(err) => {
                if cleanup.release(&mut self.dev).is_err() {
                    logging::warn("resource cleanup after failure was incomplete");
                }
                Err(err)
            }
        }
    }

    fn run_phases(
        &mut self,
        cleanup: &mut Cleanup,
        image_path: &Path,
        plan: &PartitionPlan,
        source_root: &Path,
        assets: &BootAssets,
    ) -> Result<()> {
        let root = plan
            .partition("root")
            .ok_or_else(|| PipelineError::MissingPrerequisite("plan has no root partition".into()))?
            .clone();
        let esp = plan
            .partitions
            .iter()
            .find(|p| p.bootable)
            .ok_or_else(|| PipelineError::MissingPrerequisite("plan has no boot partition".into()))?
            .clone();

        // Unallocated -> Partitioned
        interrupt::check()?;
        logging::info(format!(
            "allocating {} ({} MiB, {} partitions)",
            image_path.display(),
            plan.total_bytes / MIB,
            plan.partitions.len()
        ));
        self.dev.allocate(image_path, plan.total_bytes)?;
        self.dev.write_table(image_path, plan)?;

        let device = self.dev.loop_attach(image_path)?;
        cleanup.loop_device = Some(device.clone());

        // Partitioned -> Formatted
        interrupt::check()?;
        for p in &plan.partitions {
            let part_dev = self.dev.partition_device(&device, p.index);
            logging::info(format!("formatting {part_dev} as {} [{}]", fs_name(p.fs), p.label));
            self.dev.format(&part_dev, p.fs, &p.label)?;
        }

        let uuids = self.collect_uuids(&device, plan)?;

        // Formatted -> Populated
        interrupt::check()?;
        let root_mnt = self.mount_partition(cleanup, &device, &root, "root")?;
        populate::populate_root(source_root, &root_mnt)?;

        // Populated -> BootloaderInstalled
        interrupt::check()?;
        let esp_mnt = self.mount_partition(cleanup, &device, &esp, "efi")?;
        self.install_bootloader(&root_mnt, &esp_mnt, assets, &uuids)?;

        // BootloaderInstalled -> Finalized happens in assemble() via the
        // cleanup release.
        Ok(())
    }

    fn collect_uuids(
        &mut self,
        device: &str,
        plan: &PartitionPlan,
    ) -> Result<BTreeMap<String, String>> {
        let mut values = BTreeMap::new();
        for p in &plan.partitions {
            let part_dev = self.dev.partition_device(device, p.index);
            let uuid = self.dev.fs_uuid(&part_dev)?;
            values.insert(format!("{}_UUID", p.name.to_uppercase()), uuid);
        }
        Ok(values)
    }

    fn mount_partition(
        &mut self,
        cleanup: &mut Cleanup,
        device: &str,
        partition: &Partition,
        mount_name: &str,
    ) -> Result<PathBuf> {
        let target = self.work_dir.join("mnt").join(mount_name);
        if self.dev.is_mounted(&target)? {
            // Re-entrant build: already mounted, track it for release.
            cleanup.mounts.push(target.clone());
            return Ok(target);
        }
        let part_dev = self.dev.partition_device(device, partition.index);
        self.dev.mount(&part_dev, &target)?;
        cleanup.mounts.push(target.clone());
        Ok(target)
    }

    fn install_bootloader(
        &mut self,
        root_mnt: &Path,
        esp_mnt: &Path,
        assets: &BootAssets,
        uuids: &BTreeMap<String, String>,
    ) -> Result<()> {
        fs::copy(&assets.kernel, esp_mnt.join("vmlinuz"))
            .with_context(|| format!("failed to copy kernel {}", assets.kernel.display()))?;
        fs::copy(&assets.initrd, esp_mnt.join("initrd.img"))
            .with_context(|| format!("failed to copy initrd {}", assets.initrd.display()))?;

        let boot_dir = esp_mnt.join("EFI/BOOT");
        fs::create_dir_all(&boot_dir)?;
        match &assets.loader_efi {
            Some(loader) => {
                fs::copy(loader, boot_dir.join("BOOTX64.EFI"))
                    .with_context(|| format!("failed to copy loader {}", loader.display()))?;
            }
            // The image still works for direct-kernel boot; warn only.
            None => logging::warn("no EFI loader supplied; skipping BOOTX64.EFI"),
        }

        let menu = template::render(&assets.boot_entry_template, uuids)
            .context("boot menu template")?;
        fs::write(boot_dir.join("grub.cfg"), menu)?;

        let fstab = template::render(&assets.fstab_template, uuids).context("fstab template")?;
        let etc = root_mnt.join("etc");
        fs::create_dir_all(&etc)?;
        fs::write(etc.join("fstab"), fstab)?;

        logging::info("boot loader installed");
        Ok(())
    }
}

fn fs_name(fs: FsKind) -> &'static str {
    match fs {
        FsKind::Vfat => "vfat",
        FsKind::Ext4 => "ext4",
        FsKind::Swap => "swap",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::blockdev::MemBlockDev;
    use tempfile::TempDir;

    const TEST_LIMITS: PlanLimits = PlanLimits {
        max_image_mib: 20480,
        min_content_mib: 0,
        max_content_mib: 20480,
    };

    fn small_plan() -> PartitionPlan {
        let specs = vec![
            PartitionSpec::new("efi", SizeReq::FixedMib(16), FsKind::Vfat, "EFI"),
            PartitionSpec::new(
                "root",
                SizeReq::Content {
                    content_bytes: 4 * MIB,
                    margin_mib: 4,
                },
                FsKind::Ext4,
                "OS1-ROOT",
            ),
            PartitionSpec::new("swap", SizeReq::FixedMib(8), FsKind::Swap, "SWAP"),
            PartitionSpec::new("data", SizeReq::Remainder, FsKind::Ext4, "DATA"),
        ];
        plan::plan(64, &specs, &TEST_LIMITS).unwrap()
    }

    fn sample_inputs(base: &Path) -> (PathBuf, BootAssets) {
        let rootfs = base.join("rootfs");
        fs::create_dir_all(rootfs.join("usr/bin")).unwrap();
        fs::create_dir_all(rootfs.join("proc")).unwrap();
        fs::write(rootfs.join("usr/bin/init"), b"\x7fELF").unwrap();

        let kernel = base.join("vmlinuz");
        let initrd = base.join("initrd.img");
        fs::write(&kernel, b"kernel").unwrap();
        fs::write(&initrd, b"initrd").unwrap();

        (rootfs, BootAssets::with_defaults(kernel, initrd, None))
    }

    #[test]
    fn full_build_reaches_finalized_with_rendered_configs() {
        let tmp = TempDir::new().unwrap();
        let (rootfs, assets) = sample_inputs(tmp.path());
        let mut asm = Assembler::new(MemBlockDev::new(), tmp.path());

        let image = asm
            .assemble(&tmp.path().join("disk.img"), small_plan(), &rootfs, &assets)
            .unwrap();
        assert_eq!(image.state, ImageState::Finalized);

        // Everything released.
        assert!(asm.device().mounted_targets().is_empty());
        assert!(!asm.device().loop_attached());

        // Files written through the simulated mounts, all tokens resolved.
        let menu =
            fs::read_to_string(tmp.path().join("mnt/efi/EFI/BOOT/grub.cfg")).unwrap();
        assert!(menu.contains("root=UUID="));
        assert!(template::find_sentinels(&menu).is_empty());

        let fstab = fs::read_to_string(tmp.path().join("mnt/root/etc/fstab")).unwrap();
        assert!(template::find_sentinels(&fstab).is_empty());
        assert!(fstab.contains(" / ext4 "));

        assert!(tmp.path().join("mnt/root/usr/bin/init").exists());
        assert!(tmp.path().join("mnt/efi/vmlinuz").exists());
    }

    #[test]
    fn format_failure_releases_the_loop_device() {
        let tmp = TempDir::new().unwrap();
        let (rootfs, assets) = sample_inputs(tmp.path());
        let mut dev = MemBlockDev::new();
        dev.fail_format_label = Some("SWAP".into());
        let mut asm = Assembler::new(dev, tmp.path());

        let err = asm
            .assemble(&tmp.path().join("disk.img"), small_plan(), &rootfs, &assets)
            .unwrap_err();
        assert!(err.to_string().contains("injected format failure"));
        assert!(!asm.device().loop_attached());
        assert!(asm.device().mounted_targets().is_empty());
    }

    #[test]
    fn populate_failure_unmounts_everything() {
        let tmp = TempDir::new().unwrap();
        let (_rootfs, assets) = sample_inputs(tmp.path());
        let mut asm = Assembler::new(MemBlockDev::new(), tmp.path());

        // Source root does not exist, so the build fails after the root
        // partition was mounted.
        let err = asm
            .assemble(
                &tmp.path().join("disk.img"),
                small_plan(),
                &tmp.path().join("missing-rootfs"),
                &assets,
            )
            .unwrap_err();
        assert!(err.to_string().contains("source root filesystem not found"));
        assert!(asm.device().mounted_targets().is_empty());
        assert!(!asm.device().loop_attached());
    }

    #[test]
    fn default_layout_plans_cleanly() {
        let limits = PlanLimits {
            max_image_mib: 20480,
            min_content_mib: 500,
            max_content_mib: 20480,
        };
        let plan = plan::plan(20000, &default_layout(3000 * MIB, 512), &limits).unwrap();
        assert_eq!(plan.partitions.len(), 4);
        assert!(plan.partition("data").is_some());
    }
}
