//! Local image repository.
//!
//! Versioned asset sets and captured/imported disk-image directories live
//! under a single repository root:
//!
//! ```text
//! <repo>/images/<name>/...        payload files
//! <repo>/images/<name>/manifest.json
//! <repo>/tmp/                     staging for atomic replacement
//! <repo>/locks/                   per-image fs2 locks
//! ```
//!
//! Every image set carries a manifest with per-file sha256 digests, so
//! the verification engine can re-check integrity at any time. Imports
//! stage into `tmp/` and rename into place, and take an exclusive lock so
//! two processes cannot race on the same image name.

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::PipelineError;
use crate::fetch::manifest::{Manifest, MANIFEST_FILENAME};
use crate::fsutil;
use crate::logging;
use crate::preflight;
use crate::process::Cmd;
use crate::verify::VerificationResult;

/// Summary of one stored image set.
#[derive(Debug, Clone)]
pub struct RepoEntry {
    pub name: String,
    pub version: String,
    pub timestamp: String,
    pub files: usize,
    pub bytes: u64,
}

/// Repository rooted at a directory, created on open.
#[derive(Debug, Clone)]
pub struct ImageRepo {
    root: PathBuf,
}

impl ImageRepo {
    /// Open (and create if needed) the repository at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        let repo = Self {
            root: root.to_path_buf(),
        };
        fs::create_dir_all(repo.images_dir())?;
        fs::create_dir_all(repo.tmp_dir())?;
        fs::create_dir_all(repo.locks_dir())?;
        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn image_dir(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.images_dir().join(name))
    }

    pub fn manifest_path(&self, name: &str) -> Result<PathBuf> {
        Ok(self.image_dir(name)?.join(MANIFEST_FILENAME))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.manifest_path(name).map(|p| p.exists()).unwrap_or(false)
    }

    /// Import a directory or a `.tar.zst` archive as image set `name`.
    ///
    /// The source is staged, hashed file by file, a manifest is written,
    /// and the whole set replaces any previous image of the same name in
    /// one rename.
    pub fn import(&self, source: &Path, name: &str) -> Result<Manifest> {
        validate_name(name)?;
        if !source.exists() {
            return Err(PipelineError::MissingPrerequisite(format!(
                "import source not found: {}",
                source.display()
            ))
            .into());
        }

        let _lock = self.acquire_lock(name)?;

        let staging = self.tmp_dir().join(fsutil::tmp_name("import"));
        let result = self.import_into_staging(source, name, &staging);
        if result.is_err() {
            let _ = fs::remove_dir_all(&staging);
        }
        result
    }

    fn import_into_staging(&self, source: &Path, name: &str, staging: &Path) -> Result<Manifest> {
        fs::create_dir_all(staging)?;

        if source.is_dir() {
            fsutil::copy_dir_recursive(source, staging)?;
        } else if source
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(".tar.zst"))
        {
            unpack_tar_zst(source, staging)?;
        } else {
            bail!(
                "unsupported import source {} (expected a directory or .tar.zst)",
                source.display()
            );
        }

        let manifest = hash_tree(name, staging)?;
        manifest.write(&staging.join(MANIFEST_FILENAME))?;

        let dest = self.image_dir(name)?;
        if dest.exists() {
            fs::remove_dir_all(&dest)
                .with_context(|| format!("failed to remove previous image {}", dest.display()))?;
        }
        fs::rename(staging, &dest).with_context(|| {
            format!("failed to move staged import into {}", dest.display())
        })?;

        logging::info(format!(
            "imported '{}': {} files",
            name,
            manifest.files.len()
        ));
        Ok(manifest)
    }

    /// List stored image sets, sorted by name.
    pub fn list(&self) -> Result<Vec<RepoEntry>> {
        let dir = self.images_dir();
        let mut out = Vec::new();
        if !dir.exists() {
            return Ok(out);
        }

        for ent in fs::read_dir(&dir).with_context(|| format!("failed to read {}", dir.display()))? {
            let ent = ent?;
            if !ent.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = ent.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let manifest_path = ent.path().join(MANIFEST_FILENAME);
            if !manifest_path.exists() {
                logging::warn(format!("image '{}' has no manifest; skipping", name));
                continue;
            }
            let manifest = match Manifest::load(&manifest_path) {
                Ok(m) => m,
                Err(err) => {
                    logging::warn(format!("image '{}' has an unreadable manifest; skipping: {err:#}", name));
                    continue;
                }
            };
            out.push(RepoEntry {
                name,
                version: manifest.version.clone(),
                timestamp: manifest.timestamp.clone(),
                files: manifest.files.len(),
                bytes: manifest.files.iter().map(|f| f.size).sum(),
            });
        }

        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Re-check every file of an image set against its manifest.
    /// Read-only; never mutates the repository.
    pub fn verify(&self, name: &str) -> Result<Vec<VerificationResult>> {
        let manifest_path = self.manifest_path(name)?;
        if !manifest_path.exists() {
            return Err(PipelineError::MissingPrerequisite(format!(
                "no manifest for image '{name}' (expected {})",
                manifest_path.display()
            ))
            .into());
        }
        let manifest = Manifest::load(&manifest_path)?;
        Ok(crate::verify::verify_manifest_files(
            &manifest,
            &self.image_dir(name)?,
        ))
    }

    /// Mirror the images tree to a deploy target via rsync.
    pub fn sync(&self, dest: &str) -> Result<()> {
        preflight::check_required_tools(preflight::SYNC_TOOLS)?;
        let mut src = self.images_dir().into_os_string();
        src.push("/");

        logging::info(format!("syncing repository to {dest}"));
        Cmd::new("rsync")
            .args(["-az", "--delete"])
            .arg(src)
            .arg(dest)
            .error_msg(&format!("rsync to '{dest}' failed"))
            .run()?;
        Ok(())
    }

    fn acquire_lock(&self, name: &str) -> Result<RepoLock> {
        let lock_path = self.locks_dir().join(format!("{name}.lock"));

        // Do not unlink "stale" lock files. Unlinking a still-locked file
        // can let a second process create a new lock at the same path and
        // acquire a separate exclusive lock.
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("failed to create lock file {}", lock_path.display()))?;

        if lock_file.try_lock_exclusive().is_err() {
            drop(lock_file);
            bail!(
                "image '{}' is locked by another process: {}",
                name,
                lock_path.display()
            );
        }

        Ok(RepoLock {
            _file: lock_file,
            path: lock_path,
        })
    }
}

/// Hash every file under `dir` into a fresh manifest named `version`.
fn hash_tree(version: &str, dir: &Path) -> Result<Manifest> {
    let mut manifest = Manifest::new(version);

    let mut paths: Vec<PathBuf> = Vec::new();
    for ent in WalkDir::new(dir).follow_links(false) {
        let ent = ent?;
        if ent.file_type().is_file() {
            paths.push(ent.path().to_path_buf());
        }
    }
    paths.sort();

    for path in paths {
        let rel = path
            .strip_prefix(dir)
            .unwrap_or(&path)
            .to_string_lossy()
            .into_owned();
        if rel == MANIFEST_FILENAME {
            continue;
        }
        let (sha256, size) = fsutil::sha256_file(&path)?;
        manifest.record(&rel, size, &sha256)?;
    }

    Ok(manifest)
}

fn unpack_tar_zst(archive: &Path, dest: &Path) -> Result<()> {
    let f = File::open(archive)
        .with_context(|| format!("failed to open archive {}", archive.display()))?;
    let decoder = zstd::stream::Decoder::new(f)?;
    let mut tar = tar::Archive::new(decoder);
    tar.unpack(dest)
        .with_context(|| format!("failed to unpack {}", archive.display()))?;
    Ok(())
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("image name must not be empty");
    }
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        bail!("image name must be a safe filename segment: {name}");
    }
    Ok(())
}

/// RAII guard: unlocks and removes the lock file on drop.
#[derive(Debug)]
struct RepoLock {
    _file: File,
    path: PathBuf,
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::all_passed;
    use tempfile::TempDir;

    fn sample_tree(base: &Path) -> PathBuf {
        let src = base.join("src-image");
        fs::create_dir_all(src.join("boot")).unwrap();
        fs::write(src.join("boot/vmlinuz"), b"kernel").unwrap();
        fs::write(src.join("payload.squashfs"), b"payload-bytes").unwrap();
        src
    }

    #[test]
    fn import_dir_then_verify_passes() {
        let tmp = TempDir::new().unwrap();
        let repo = ImageRepo::open(&tmp.path().join("repo")).unwrap();
        let src = sample_tree(tmp.path());

        let manifest = repo.import(&src, "2024.1").unwrap();
        assert_eq!(manifest.files.len(), 2);
        assert!(repo.contains("2024.1"));

        let results = repo.verify("2024.1").unwrap();
        assert!(all_passed(&results));
    }

    #[test]
    fn tampering_fails_verification() {
        let tmp = TempDir::new().unwrap();
        let repo = ImageRepo::open(&tmp.path().join("repo")).unwrap();
        let src = sample_tree(tmp.path());
        repo.import(&src, "2024.1").unwrap();

        let stored = repo.image_dir("2024.1").unwrap().join("payload.squashfs");
        fs::write(&stored, b"payload-bytez").unwrap();

        let results = repo.verify("2024.1").unwrap();
        assert!(!all_passed(&results));
        let failed: Vec<_> = results.iter().filter(|r| !r.passed).collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].name.contains("payload.squashfs"));
    }

    #[test]
    fn reimport_replaces_previous_set() {
        let tmp = TempDir::new().unwrap();
        let repo = ImageRepo::open(&tmp.path().join("repo")).unwrap();
        let src = sample_tree(tmp.path());
        repo.import(&src, "2024.1").unwrap();

        let src2 = tmp.path().join("src2");
        fs::create_dir_all(&src2).unwrap();
        fs::write(src2.join("only-file"), b"x").unwrap();
        repo.import(&src2, "2024.1").unwrap();

        let dir = repo.image_dir("2024.1").unwrap();
        assert!(dir.join("only-file").exists());
        assert!(!dir.join("payload.squashfs").exists());
    }

    #[test]
    fn list_reports_sizes() {
        let tmp = TempDir::new().unwrap();
        let repo = ImageRepo::open(&tmp.path().join("repo")).unwrap();
        let src = sample_tree(tmp.path());
        repo.import(&src, "a").unwrap();
        repo.import(&src, "b").unwrap();

        let entries = repo.list().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a");
        assert_eq!(entries[0].files, 2);
        assert_eq!(entries[0].bytes, 6 + 13);
    }

    #[test]
    fn corrupt_manifest_does_not_hide_other_images() {
        let tmp = TempDir::new().unwrap();
        let repo = ImageRepo::open(&tmp.path().join("repo")).unwrap();
        let src = sample_tree(tmp.path());
        repo.import(&src, "good").unwrap();
        repo.import(&src, "damaged").unwrap();

        let manifest = repo.manifest_path("damaged").unwrap();
        fs::write(&manifest, b"{ not json").unwrap();

        let entries = repo.list().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "good");
    }

    #[test]
    fn import_of_missing_source_is_missing_prerequisite() {
        let tmp = TempDir::new().unwrap();
        let repo = ImageRepo::open(&tmp.path().join("repo")).unwrap();
        let err = repo.import(&tmp.path().join("nope"), "x").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MissingPrerequisite(_))
        ));
    }

    #[test]
    fn bad_names_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let repo = ImageRepo::open(&tmp.path().join("repo")).unwrap();
        for name in ["", "../escape", "a/b"] {
            assert!(repo.image_dir(name).is_err(), "name '{name}' must fail");
        }
    }
}
