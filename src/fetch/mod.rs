//! Artifact fetcher and cache.
//!
//! Downloads versioned external assets (kernel, initrd, root filesystem
//! payload), verifies them by sha256, and records a [`Manifest`] next to
//! them. Fetches are idempotent: a file whose recomputed digest matches
//! the expected digest (or the digest a prior fetch recorded) is never
//! downloaded again.

pub mod extract;
pub mod manifest;

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::fsutil::{self, sha256_file};
use crate::interrupt;
use crate::logging;
use self::manifest::{Manifest, MANIFEST_FILENAME};

/// Kernel image file name within an asset set.
pub const ASSET_KERNEL: &str = "vmlinuz";
/// Initrd file name within an asset set.
pub const ASSET_INITRD: &str = "initrd.img";
/// Root filesystem payload file name within an asset set.
pub const ASSET_PAYLOAD: &str = "payload.squashfs";

/// One externally sourced, versioned, checksum-tracked file.
///
/// Immutable once verified; owned by the fetcher until handed to the
/// caller.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub source: String,
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
    /// True when the digest was checked against a known-good value
    /// (expected digest or a prior manifest record).
    pub verified: bool,
}

/// Downloader with bounded synchronous retry.
pub struct Fetcher {
    attempts: u32,
    timeout: Duration,
}

impl Fetcher {
    pub fn new(attempts: u32, timeout_secs: u64) -> Self {
        Self {
            attempts: attempts.max(1),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self::new(cfg.retry_attempts, cfg.net_timeout_secs)
    }

    /// Fetch `url` into `dest`, verifying against `expected` when given.
    ///
    /// Skips the network entirely when `dest` already holds bytes whose
    /// recomputed digest matches `expected`, or — when no digest was
    /// supplied — matches the digest a prior successful fetch recorded in
    /// the sibling manifest. A supplied digest that does not match the
    /// downloaded bytes is `ChecksumMismatch`: fatal, the partial artifact
    /// is left on disk for inspection but never treated as usable.
    pub fn fetch(&self, url: &str, dest: &Path, expected: Option<&str>) -> Result<Artifact> {
        if dest.exists() {
            if let Some(artifact) = cached_artifact(url, dest, expected)? {
                logging::info(format!(
                    "cached: {} ({} bytes, verified)",
                    dest.display(),
                    artifact.size
                ));
                return Ok(artifact);
            }
        }

        self.download(url, dest)?;

        let (sha256, size) = sha256_file(dest)?;
        if let Some(want) = expected {
            if sha256 != want {
                return Err(PipelineError::ChecksumMismatch {
                    path: dest.to_path_buf(),
                    expected: want.to_string(),
                    actual: sha256,
                }
                .into());
            }
        }

        Ok(Artifact {
            source: url.to_string(),
            path: dest.to_path_buf(),
            size,
            sha256,
            verified: expected.is_some(),
        })
    }

    /// Download with retry and backoff, streaming to a temp file that is
    /// renamed into place only after the body completed.
    fn download(&self, url: &str, dest: &Path) -> Result<()> {
        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let part = parent.join(fsutil::tmp_name(".download"));

        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(self.timeout))
            .build()
            .into();

        let mut last_err = None;
        for attempt in 1..=self.attempts {
            interrupt::check()?;
            logging::info(format!(
                "downloading {url} (attempt {attempt}/{})",
                self.attempts
            ));
            match stream_to_file(&agent, url, &part) {
                Ok(bytes) => {
                    fsutil::atomic_move(&part, dest)?;
                    logging::info(format!("downloaded {} bytes to {}", bytes, dest.display()));
                    return Ok(());
                }
                Err(err) => {
                    logging::warn(format!("attempt {attempt} failed: {err:#}"));
                    let _ = fs::remove_file(&part);
                    last_err = Some(err);
                    if attempt < self.attempts {
                        std::thread::sleep(Duration::from_secs(2u64 << (attempt - 1).min(4)));
                    }
                }
            }
        }

        let failure = PipelineError::DownloadFailure {
            url: url.to_string(),
            attempts: self.attempts,
        };
        match last_err {
            Some(err) => Err(anyhow::Error::from(failure).context(format!("{err:#}"))),
            None => Err(failure.into()),
        }
    }
}

fn stream_to_file(agent: &ureq::Agent, url: &str, dest: &Path) -> Result<u64> {
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("request for {url} failed"))?;

    let mut reader = response.into_body().into_reader();
    let mut file =
        File::create(dest).with_context(|| format!("failed to create {}", dest.display()))?;

    let mut buf = [0u8; 65536];
    let mut total = 0u64;
    loop {
        interrupt::check()?;
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("failed to read body of {url}"))?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])
            .with_context(|| format!("failed to write to {}", dest.display()))?;
        total += n as u64;
    }
    Ok(total)
}

/// Decide whether an existing file satisfies the fetch without network
/// I/O. Digests are always recomputed; a stale manifest never vouches for
/// changed bytes.
fn cached_artifact(url: &str, dest: &Path, expected: Option<&str>) -> Result<Option<Artifact>> {
    let (sha256, size) = sha256_file(dest)?;

    let known_good = match expected {
        Some(want) => sha256 == want,
        None => recorded_digest(dest)?.is_some_and(|recorded| recorded == sha256),
    };

    if !known_good {
        logging::warn(format!(
            "existing {} does not match a known digest; re-fetching",
            dest.display()
        ));
        return Ok(None);
    }

    Ok(Some(Artifact {
        source: url.to_string(),
        path: dest.to_path_buf(),
        size,
        sha256,
        verified: true,
    }))
}

/// Digest a prior fetch recorded for this file, if any.
fn recorded_digest(dest: &Path) -> Result<Option<String>> {
    let Some(parent) = dest.parent() else {
        return Ok(None);
    };
    let manifest_path = parent.join(MANIFEST_FILENAME);
    if !manifest_path.exists() {
        return Ok(None);
    }
    let manifest = Manifest::load(&manifest_path)?;
    let Some(name) = dest.file_name().and_then(|n| n.to_str()) else {
        return Ok(None);
    };
    Ok(manifest.entry(name).map(|e| e.sha256.clone()))
}

/// Fetch the full asset set for the configured version into `dest_dir`
/// and write the manifest.
///
/// The configured expected digest, when present, applies to the root
/// filesystem payload; kernel and initrd are recorded and re-verified via
/// the manifest on later runs.
pub fn fetch_asset_set(cfg: &PipelineConfig, dest_dir: &Path) -> Result<Manifest> {
    if cfg.source_url.trim().is_empty() {
        return Err(PipelineError::MissingPrerequisite(
            "source_url is not configured (set BOOTFORGE_SOURCE_URL)".into(),
        )
        .into());
    }

    let base = cfg.source_url.trim_end_matches('/');
    let fetcher = Fetcher::from_config(cfg);
    let mut manifest = Manifest::new(&cfg.asset_version);

    for name in [ASSET_KERNEL, ASSET_INITRD, ASSET_PAYLOAD] {
        let url = format!("{base}/{}/{name}", cfg.asset_version);
        let expected = match name {
            ASSET_PAYLOAD => cfg.expected_sha256.as_deref(),
            _ => None,
        };
        let artifact = fetcher.fetch(&url, &dest_dir.join(name), expected)?;
        manifest.record(name, artifact.size, &artifact.sha256)?;
    }

    manifest.write(&dest_dir.join(MANIFEST_FILENAME))?;
    logging::info(format!(
        "asset set {} complete: {} files",
        cfg.asset_version,
        manifest.files.len()
    ));
    Ok(manifest)
}
