//! Partition layout planning.
//!
//! A plan is computed fresh for every image build from declared size
//! requests and validated before any disk or loop-device resource is
//! touched. Partitions are laid out in declaration order, contiguous and
//! non-overlapping, and together with the table gap they cover the whole
//! image exactly.

use anyhow::Result;
use std::fmt::Write as _;

use crate::error::PipelineError;

pub const SECTOR_SIZE: u64 = 512;
pub const MIB: u64 = 1024 * 1024;

/// First partition starts at 1 MiB, leaving room for the GPT structures
/// and keeping everything MiB-aligned.
pub const FIRST_PARTITION_OFFSET_BYTES: u64 = MIB;

/// Filesystem kind for a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    Vfat,
    Ext4,
    Swap,
}

impl FsKind {
    pub fn mkfs_program(&self) -> &'static str {
        match self {
            FsKind::Vfat => "mkfs.vfat",
            FsKind::Ext4 => "mkfs.ext4",
            FsKind::Swap => "mkswap",
        }
    }

    /// sfdisk shorthand type letter.
    fn sfdisk_type(&self) -> &'static str {
        match self {
            FsKind::Vfat => "U",
            FsKind::Ext4 => "L",
            FsKind::Swap => "S",
        }
    }
}

/// Requested size of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeReq {
    /// Exact size in MiB.
    FixedMib(u64),
    /// Measured content size plus a safety margin for filesystem
    /// metadata and secondary payloads.
    Content { content_bytes: u64, margin_mib: u64 },
    /// Whatever is left of the image. Only valid for the last partition.
    Remainder,
}

/// Declared partition, before layout.
#[derive(Debug, Clone)]
pub struct PartitionSpec {
    pub name: String,
    pub size: SizeReq,
    pub fs: FsKind,
    pub label: String,
}

impl PartitionSpec {
    pub fn new(name: &str, size: SizeReq, fs: FsKind, label: &str) -> Self {
        Self {
            name: name.to_string(),
            size,
            fs,
            label: label.to_string(),
        }
    }
}

/// Resolved partition with its computed position.
#[derive(Debug, Clone)]
pub struct Partition {
    pub name: String,
    pub fs: FsKind,
    pub label: String,
    /// 1-based index matching the partition table and loop device naming.
    pub index: u32,
    pub offset_bytes: u64,
    pub len_bytes: u64,
    pub bootable: bool,
}

impl Partition {
    pub fn end_bytes(&self) -> u64 {
        self.offset_bytes + self.len_bytes
    }
}

/// Bounds applied during planning, taken from the pipeline configuration.
#[derive(Debug, Clone, Copy)]
pub struct PlanLimits {
    pub max_image_mib: u64,
    pub min_content_mib: u64,
    pub max_content_mib: u64,
}

/// Complete validated layout for one disk image.
#[derive(Debug, Clone)]
pub struct PartitionPlan {
    pub total_bytes: u64,
    pub partitions: Vec<Partition>,
}

impl PartitionPlan {
    pub fn partition(&self, name: &str) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.name == name)
    }

    /// Render the plan as an sfdisk script (GPT label, sector units).
    pub fn sfdisk_script(&self) -> String {
        let mut script = String::from("label: gpt\nunit: sectors\n\n");
        for p in &self.partitions {
            let start = p.offset_bytes / SECTOR_SIZE;
            let size = p.len_bytes / SECTOR_SIZE;
            let _ = write!(
                script,
                "start={start}, size={size}, type={}",
                p.fs.sfdisk_type()
            );
            if p.bootable {
                script.push_str(", bootable");
            }
            script.push('\n');
        }
        script
    }
}

fn violation(msg: String) -> anyhow::Error {
    PipelineError::SizeConstraintViolation(msg).into()
}

/// Lay out `specs` in order on an image of `total_mib`.
///
/// Partitions are contiguous and non-overlapping and together cover
/// `[1 MiB, total)`; the first MiB is partition-table headroom, not
/// assignable space.
///
/// Validation happens here, before any resource is allocated: content
/// sizes must fall inside the sane bounds, the layout must fit the image,
/// the image must fit the configured maximum, and a `Remainder` request
/// may only be the last partition and must come out at least 1 MiB.
pub fn plan(total_mib: u64, specs: &[PartitionSpec], limits: &PlanLimits) -> Result<PartitionPlan> {
    if specs.is_empty() {
        return Err(violation("no partitions declared".into()));
    }
    if total_mib > limits.max_image_mib {
        return Err(violation(format!(
            "image size {total_mib} MiB exceeds maximum {} MiB",
            limits.max_image_mib
        )));
    }

    let total_bytes = total_mib * MIB;
    let mut partitions = Vec::with_capacity(specs.len());
    let mut offset = FIRST_PARTITION_OFFSET_BYTES;

    for (i, spec) in specs.iter().enumerate() {
        let last = i + 1 == specs.len();
        let len_bytes = match spec.size {
            SizeReq::FixedMib(mib) => {
                if mib == 0 {
                    return Err(violation(format!("partition '{}' has zero size", spec.name)));
                }
                mib * MIB
            }
            SizeReq::Content {
                content_bytes,
                margin_mib,
            } => {
                let content_mib = content_bytes.div_ceil(MIB);
                if content_mib < limits.min_content_mib || content_mib > limits.max_content_mib {
                    return Err(violation(format!(
                        "content size {content_mib} MiB for '{}' is outside sane bounds \
                         [{}, {}] MiB; source tree may be corrupt or incomplete",
                        spec.name, limits.min_content_mib, limits.max_content_mib
                    )));
                }
                (content_mib + margin_mib) * MIB
            }
            SizeReq::Remainder => {
                if !last {
                    return Err(violation(format!(
                        "remainder partition '{}' must be declared last",
                        spec.name
                    )));
                }
                if total_bytes < offset + MIB {
                    return Err(violation(format!(
                        "no space left for remainder partition '{}': \
                         fixed partitions use {} MiB of {} MiB",
                        spec.name,
                        offset / MIB,
                        total_mib
                    )));
                }
                total_bytes - offset
            }
        };

        if offset + len_bytes > total_bytes {
            return Err(violation(format!(
                "partition '{}' ends at {} MiB, beyond the {} MiB image",
                spec.name,
                (offset + len_bytes) / MIB,
                total_mib
            )));
        }

        // First FAT partition is the ESP.
        let bootable = spec.fs == FsKind::Vfat && !partitions.iter().any(|p: &Partition| p.bootable);

        partitions.push(Partition {
            name: spec.name.clone(),
            fs: spec.fs,
            label: spec.label.clone(),
            index: (i + 1) as u32,
            offset_bytes: offset,
            len_bytes,
            bootable,
        });
        offset += len_bytes;
    }

    Ok(PartitionPlan {
        total_bytes,
        partitions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: PlanLimits = PlanLimits {
        max_image_mib: 20480,
        min_content_mib: 500,
        max_content_mib: 16384,
    };

    fn workstation_specs(content_mib: u64) -> Vec<PartitionSpec> {
        vec![
            PartitionSpec::new("efi", SizeReq::FixedMib(512), FsKind::Vfat, "EFI"),
            PartitionSpec::new(
                "root",
                SizeReq::Content {
                    content_bytes: content_mib * MIB,
                    margin_mib: 512,
                },
                FsKind::Ext4,
                "OS1-ROOT",
            ),
            PartitionSpec::new("swap", SizeReq::FixedMib(4096), FsKind::Swap, "SWAP"),
            PartitionSpec::new("os1", SizeReq::FixedMib(3788), FsKind::Ext4, "OS1-IMG"),
            PartitionSpec::new("os2", SizeReq::FixedMib(3788), FsKind::Ext4, "OS2-IMG"),
            PartitionSpec::new("data", SizeReq::Remainder, FsKind::Ext4, "DATA"),
        ]
    }

    #[test]
    fn layout_is_contiguous_and_covers_the_image() {
        let plan = plan(20000, &workstation_specs(3000), &LIMITS).unwrap();
        assert_eq!(plan.partitions[0].offset_bytes, FIRST_PARTITION_OFFSET_BYTES);
        for pair in plan.partitions.windows(2) {
            assert_eq!(pair[0].end_bytes(), pair[1].offset_bytes);
        }
        assert_eq!(plan.partitions.last().unwrap().end_bytes(), plan.total_bytes);
    }

    #[test]
    fn remainder_size_is_what_is_left() {
        let plan = plan(20000, &workstation_specs(3000), &LIMITS).unwrap();
        let data = plan.partition("data").unwrap();
        // 20000 minus the 1 MiB gap, 512 EFI, 3000+512 root, 4096 swap,
        // and two 3788 MiB image slots.
        let expected = 20000 - 1 - 512 - 3512 - 4096 - 3788 - 3788;
        assert_eq!(data.len_bytes, expected * MIB);
    }

    #[test]
    fn overflow_is_a_size_constraint_violation() {
        let err = plan(12000, &workstation_specs(3000), &LIMITS).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::SizeConstraintViolation(_))
        ));
    }

    #[test]
    fn content_outside_sane_bounds_is_rejected() {
        for content in [100u64, 17000] {
            let err = plan(20000, &workstation_specs(content), &LIMITS).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<PipelineError>(),
                Some(PipelineError::SizeConstraintViolation(_))
            ));
        }
    }

    #[test]
    fn image_above_configured_maximum_is_rejected() {
        let err = plan(30000, &workstation_specs(3000), &LIMITS).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn remainder_must_be_last() {
        let specs = vec![
            PartitionSpec::new("data", SizeReq::Remainder, FsKind::Ext4, "DATA"),
            PartitionSpec::new("efi", SizeReq::FixedMib(512), FsKind::Vfat, "EFI"),
        ];
        assert!(plan(20000, &specs, &LIMITS).is_err());
    }

    #[test]
    fn first_vfat_partition_is_bootable() {
        let plan = plan(20000, &workstation_specs(3000), &LIMITS).unwrap();
        let bootable: Vec<_> = plan.partitions.iter().filter(|p| p.bootable).collect();
        assert_eq!(bootable.len(), 1);
        assert_eq!(bootable[0].name, "efi");
        assert_eq!(bootable[0].index, 1);
    }

    #[test]
    fn sfdisk_script_shape() {
        let plan = plan(20000, &workstation_specs(3000), &LIMITS).unwrap();
        let script = plan.sfdisk_script();
        assert!(script.starts_with("label: gpt\n"));
        assert!(script.contains("start=2048, size=1048576, type=U, bootable"));
        assert_eq!(script.matches("start=").count(), 6);
    }
}
