//! Root filesystem population.

use anyhow::{bail, Result};
use std::fs;
use std::path::Path;

use crate::fsutil;
use crate::logging;

/// Virtual and transient subtrees that are never copied into the image.
/// They are recreated empty so the booted system can mount over them.
pub const EXCLUDED_TOP_LEVEL: &[&str] = &[
    "proc",
    "sys",
    "dev",
    "tmp",
    "run",
    "mnt",
    "media",
    "lost+found",
];

/// Copy `source` into `target`, skipping the excluded subtrees.
pub fn populate_root(source: &Path, target: &Path) -> Result<()> {
    if !source.is_dir() {
        bail!("source root filesystem not found: {}", source.display());
    }

    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let name = entry.file_name();
        let name_str = name.to_string_lossy();

        if EXCLUDED_TOP_LEVEL.contains(&name_str.as_ref()) {
            fs::create_dir_all(target.join(&name))?;
            continue;
        }

        let src_path = entry.path();
        let dst_path = target.join(&name);
        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            let link = fs::read_link(&src_path)?;
            if dst_path.exists() || dst_path.is_symlink() {
                fs::remove_file(&dst_path)?;
            }
            std::os::unix::fs::symlink(&link, &dst_path)?;
        } else if file_type.is_dir() {
            fsutil::copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)?;
        }
    }

    logging::info(format!(
        "populated root from {} ({} bytes)",
        source.display(),
        fsutil::dir_size(target)?
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn copies_content_but_recreates_virtual_trees_empty() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("etc")).unwrap();
        fs::create_dir_all(src.join("proc/self")).unwrap();
        fs::create_dir_all(src.join("dev")).unwrap();
        fs::write(src.join("etc/hostname"), "node1\n").unwrap();
        fs::write(src.join("proc/self/status"), "junk").unwrap();
        std::os::unix::fs::symlink("usr/bin", src.join("bin")).unwrap();

        let dst = tmp.path().join("dst");
        fs::create_dir_all(&dst).unwrap();
        populate_root(&src, &dst).unwrap();

        assert_eq!(fs::read_to_string(dst.join("etc/hostname")).unwrap(), "node1\n");
        assert!(dst.join("proc").is_dir());
        assert!(!dst.join("proc/self").exists());
        assert!(dst.join("dev").is_dir());
        assert!(dst.join("bin").is_symlink());
    }

    #[test]
    fn missing_source_fails() {
        let tmp = TempDir::new().unwrap();
        assert!(populate_root(&tmp.path().join("nope"), tmp.path()).is_err());
    }
}
