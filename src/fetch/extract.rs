//! Entry extraction from optical-image containers.
//!
//! Opens a read-only view of an ISO-style container via xorriso's osirrox
//! mode and copies only the named entries out. The container is never
//! mutated; xorriso holds it only for the duration of the invocation, so
//! it is released on every exit path including abnormal termination. A
//! failed entry leaves no partial output behind.

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::fsutil;
use crate::logging;
use crate::process::{ensure_exists, Cmd};

/// Result of one extraction operation.
#[derive(Debug)]
pub struct ExtractedSet {
    pub target_dir: PathBuf,
    pub entries: Vec<PathBuf>,
    /// True when every target already existed and nothing was copied.
    pub skipped: bool,
}

/// Copy the named entries out of `container` into `target_dir`.
///
/// Idempotent: when all targets already exist the container is not even
/// opened. Entry names are paths inside the container, without a leading
/// slash.
pub fn extract(container: &Path, target_dir: &Path, entry_names: &[&str]) -> Result<ExtractedSet> {
    ensure_exists(container, "container image")?;

    let targets: Vec<PathBuf> = entry_names
        .iter()
        .map(|name| target_dir.join(name))
        .collect();

    if !targets.is_empty() && targets.iter().all(|t| t.exists()) {
        logging::info(format!(
            "extraction skipped: all {} entries already present in {}",
            targets.len(),
            target_dir.display()
        ));
        return Ok(ExtractedSet {
            target_dir: target_dir.to_path_buf(),
            entries: targets,
            skipped: true,
        });
    }

    fs::create_dir_all(target_dir)?;

    for (name, target) in entry_names.iter().zip(&targets) {
        if target.exists() {
            continue;
        }
        extract_one(container, name, target)?;
        logging::info(format!("extracted {} -> {}", name, target.display()));
    }

    Ok(ExtractedSet {
        target_dir: target_dir.to_path_buf(),
        entries: targets,
        skipped: false,
    })
}

fn extract_one(container: &Path, name: &str, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    // Extract to a temp name, then move into place, so an aborted xorriso
    // run never leaves a half-written target.
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    let tmp = parent.join(fsutil::tmp_name(".extract"));

    let result = Cmd::new("xorriso")
        .args(["-osirrox", "on", "-indev"])
        .arg_path(container)
        .arg("-extract")
        .arg(format!("/{name}"))
        .arg_path(&tmp)
        .error_msg(&format!("xorriso extraction of '{name}' failed"))
        .run();

    match result {
        Ok(_) => fsutil::atomic_move(&tmp, target),
        Err(err) => {
            let _ = fs::remove_file(&tmp);
            Err(PipelineError::ExtractionFailure {
                container: container.to_path_buf(),
                entry: name.to_string(),
                detail: format!("{err:#}"),
            }
            .into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_container_fails() {
        let tmp = TempDir::new().unwrap();
        let err = extract(
            &tmp.path().join("no-such.iso"),
            &tmp.path().join("out"),
            &["boot/vmlinuz"],
        )
        .unwrap_err();
        assert!(err.to_string().contains("container image"));
    }

    #[test]
    fn all_entries_present_skips_without_opening_container() {
        let tmp = TempDir::new().unwrap();
        // The "container" is a plain file; it would fail if opened.
        let container = tmp.path().join("image.iso");
        fs::write(&container, b"not an iso").unwrap();

        let out = tmp.path().join("out");
        fs::create_dir_all(out.join("boot")).unwrap();
        fs::write(out.join("boot/vmlinuz"), b"kernel").unwrap();

        let set = extract(&container, &out, &["boot/vmlinuz"]).unwrap();
        assert!(set.skipped);
        assert_eq!(set.entries, vec![out.join("boot/vmlinuz")]);
    }

    #[test]
    fn failed_extraction_is_extraction_failure_without_partial_output() {
        let tmp = TempDir::new().unwrap();
        let container = tmp.path().join("image.iso");
        fs::write(&container, b"not an iso").unwrap();
        let out = tmp.path().join("out");

        let err = extract(&container, &out, &["boot/vmlinuz"]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::ExtractionFailure { .. })
        ));
        assert!(!out.join("boot/vmlinuz").exists());
    }
}
