//! Verification engine.
//!
//! Re-checks the outputs of the other components without mutating any
//! state, so it is safe to run any number of times. Digests are always
//! recomputed from the bytes on disk; a manifest's presence never vouches
//! for file integrity by itself.

use anyhow::Result;
use std::fs;
use std::path::Path;

use crate::bootcfg::{self, NetTarget};
use crate::config::{InstallMode, PipelineConfig, Transport};
use crate::fetch::manifest::Manifest;
use crate::fsutil::sha256_file;
use crate::logging;
use crate::repo::ImageRepo;

/// One named check.
#[derive(Debug, Clone)]
pub struct VerificationResult {
    pub name: String,
    pub passed: bool,
    pub detail: Option<String>,
}

impl VerificationResult {
    pub fn pass(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            detail: None,
        }
    }

    pub fn fail(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            detail: Some(detail.into()),
        }
    }
}

pub fn all_passed(results: &[VerificationResult]) -> bool {
    results.iter().all(|r| r.passed)
}

/// Check every manifest entry: the file exists and its recomputed digest
/// matches the recorded one. One result per file.
pub fn verify_manifest_files(manifest: &Manifest, dir: &Path) -> Vec<VerificationResult> {
    let mut results = Vec::with_capacity(manifest.files.len());
    for entry in &manifest.files {
        let path = dir.join(&entry.name);
        let check = format!("file:{}", entry.name);

        if !path.exists() {
            results.push(VerificationResult::fail(check, "missing on disk"));
            continue;
        }
        match sha256_file(&path) {
            Ok((sha, size)) => {
                if sha != entry.sha256 {
                    results.push(VerificationResult::fail(
                        check,
                        format!("digest mismatch: recorded {} got {sha}", entry.sha256),
                    ));
                } else if size != entry.size {
                    results.push(VerificationResult::fail(
                        check,
                        format!("size mismatch: recorded {} got {size}", entry.size),
                    ));
                } else {
                    results.push(VerificationResult::pass(check));
                }
            }
            Err(err) => results.push(VerificationResult::fail(check, format!("{err:#}"))),
        }
    }
    results
}

/// Check that the generated boot configuration carries the directive the
/// configured transport requires.
pub fn verify_boot_config(
    config_path: &Path,
    transport: Transport,
    target: &NetTarget,
) -> VerificationResult {
    let check = "boot-config:transport";
    let content = match fs::read_to_string(config_path) {
        Ok(c) => c,
        Err(err) => {
            return VerificationResult::fail(
                check,
                format!("cannot read {}: {err}", config_path.display()),
            )
        }
    };

    let token = bootcfg::expected_token(transport, target);
    if content.contains(&token) {
        VerificationResult::pass(check)
    } else {
        VerificationResult::fail(
            check,
            format!("expected '{token}' for transport {transport}"),
        )
    }
}

/// For automated full installs, the referenced image set must exist in
/// the repository.
pub fn verify_image_present(repo: &ImageRepo, cfg: &PipelineConfig) -> Option<VerificationResult> {
    if cfg.install_mode != InstallMode::AutoFull {
        return None;
    }
    let check = "repo:image-present";
    Some(if repo.contains(&cfg.asset_version) {
        VerificationResult::pass(check)
    } else {
        VerificationResult::fail(
            check,
            format!("image set '{}' not found in repository", cfg.asset_version),
        )
    })
}

/// Run the full check suite over the current pipeline outputs.
pub fn run(
    cfg: &PipelineConfig,
    repo: &ImageRepo,
    asset_dir: &Path,
    bootcfg_path: &Path,
) -> Result<Vec<VerificationResult>> {
    let mut results = Vec::new();

    let manifest_path = asset_dir.join(crate::fetch::manifest::MANIFEST_FILENAME);
    if manifest_path.exists() {
        let manifest = Manifest::load(&manifest_path)?;
        results.extend(verify_manifest_files(&manifest, asset_dir));
    } else {
        results.push(VerificationResult::fail(
            "manifest:present",
            format!("no manifest at {}", manifest_path.display()),
        ));
    }

    if bootcfg_path.exists() {
        let target = NetTarget {
            host: cfg.server_host.clone(),
            base_path: cfg.export_path.clone(),
        };
        results.push(verify_boot_config(bootcfg_path, cfg.transport, &target));
    } else {
        results.push(VerificationResult::fail(
            "boot-config:present",
            format!("no boot configuration at {}", bootcfg_path.display()),
        ));
    }

    if let Some(r) = verify_image_present(repo, cfg) {
        results.push(r);
    }

    Ok(results)
}

/// Log each result and return the aggregate.
pub fn report(results: &[VerificationResult]) -> bool {
    for r in results {
        if r.passed {
            logging::info(format!("PASS {}", r.name));
        } else {
            let detail = r.detail.as_deref().unwrap_or("");
            logging::error(format!("FAIL {}: {detail}", r.name));
        }
    }
    let ok = all_passed(results);
    if ok {
        logging::info(format!("all {} checks passed", results.len()));
    } else {
        logging::error("verification failed");
    }
    ok
}
