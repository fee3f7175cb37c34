//! Target-disk guard.
//!
//! Sanity check that runs before any restore command may touch a disk:
//! the device must exist and its size must fall inside the expected
//! window. Catches the classic mistake of pointing a full-disk restore
//! at the wrong device.

use anyhow::Result;

use crate::config::PipelineConfig;
use crate::disk::plan::MIB;
use crate::error::PipelineError;
use crate::logging;
use crate::process::Cmd;

/// Acceptable size window for the target disk, in bytes.
#[derive(Debug, Clone, Copy)]
pub struct GuardBounds {
    pub min_bytes: u64,
    pub max_bytes: u64,
}

impl GuardBounds {
    /// The disk must at least hold the configured maximum image; the
    /// upper bound rejects obviously wrong devices (a SAN volume, a
    /// backup array).
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        let min_bytes = cfg.max_image_mib * MIB;
        Self {
            min_bytes,
            max_bytes: min_bytes.saturating_mul(64),
        }
    }
}

/// Read a block device's size in bytes.
fn device_size(disk: &str) -> Result<u64> {
    let out = Cmd::new("blockdev")
        .arg("--getsize64")
        .arg(disk)
        .run_capture()?;
    out.parse::<u64>()
        .map_err(|_| anyhow::anyhow!("unexpected blockdev output for {disk}: '{out}'"))
}

/// Fail with `SizeConstraintViolation` unless `disk` exists and its size
/// is inside `bounds`.
pub fn check_target_disk(disk: &str, bounds: GuardBounds) -> Result<()> {
    if !std::path::Path::new(disk).exists() {
        return Err(PipelineError::MissingPrerequisite(format!(
            "target disk {disk} does not exist"
        ))
        .into());
    }

    let size = device_size(disk)?;
    check_size(disk, size, bounds)
}

/// Size comparison split out so it is testable without a real device.
pub fn check_size(disk: &str, size_bytes: u64, bounds: GuardBounds) -> Result<()> {
    if size_bytes < bounds.min_bytes {
        return Err(PipelineError::SizeConstraintViolation(format!(
            "target disk {disk} is {} MiB, below the required {} MiB",
            size_bytes / MIB,
            bounds.min_bytes / MIB
        ))
        .into());
    }
    if size_bytes > bounds.max_bytes {
        return Err(PipelineError::SizeConstraintViolation(format!(
            "target disk {disk} is {} MiB, above the allowed {} MiB; refusing",
            size_bytes / MIB,
            bounds.max_bytes / MIB
        ))
        .into());
    }
    logging::info(format!(
        "guard passed: {disk} is {} MiB, within [{}, {}] MiB",
        size_bytes / MIB,
        bounds.min_bytes / MIB,
        bounds.max_bytes / MIB
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDS: GuardBounds = GuardBounds {
        min_bytes: 100 * MIB,
        max_bytes: 1000 * MIB,
    };

    #[test]
    fn size_inside_bounds_passes() {
        assert!(check_size("/dev/sda", 500 * MIB, BOUNDS).is_ok());
        assert!(check_size("/dev/sda", 100 * MIB, BOUNDS).is_ok());
        assert!(check_size("/dev/sda", 1000 * MIB, BOUNDS).is_ok());
    }

    #[test]
    fn size_outside_bounds_is_a_violation() {
        for size in [0, 99 * MIB, 1001 * MIB] {
            let err = check_size("/dev/sda", size, BOUNDS).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<PipelineError>(),
                Some(PipelineError::SizeConstraintViolation(_))
            ));
        }
    }

    #[test]
    fn missing_device_is_a_missing_prerequisite() {
        let err = check_target_disk("/dev/does-not-exist-9999", BOUNDS).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MissingPrerequisite(_))
        ));
    }
}
