//! Immutable pipeline configuration.
//!
//! One [`PipelineConfig`] is constructed at process start from an optional
//! TOML file plus `BOOTFORGE_*` environment overrides, validated once, and
//! passed by reference to every component. No phase reads configuration
//! from anywhere else.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::PipelineError;

/// Network mechanism used to deliver the boot payload to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Http,
    Nfs,
    Tftp,
}

impl Transport {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Transport::Http),
            "nfs" => Ok(Transport::Nfs),
            "tftp" => Ok(Transport::Tftp),
            other => Err(PipelineError::TransportMisconfiguration(format!(
                "unsupported transport '{other}' (expected http, nfs or tftp)"
            ))
            .into()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Http => "http",
            Transport::Nfs => "nfs",
            Transport::Tftp => "tftp",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Installation mode requested for generated boot entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallMode {
    /// Interactive installation; never destructive.
    Manual,
    /// Unattended full-disk restore.
    AutoFull,
    /// Unattended restore of selected partitions.
    AutoParts,
    /// Capture the target disk into the repository.
    Capture,
}

impl InstallMode {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(InstallMode::Manual),
            "auto_full" => Ok(InstallMode::AutoFull),
            "auto_parts" => Ok(InstallMode::AutoParts),
            "capture" => Ok(InstallMode::Capture),
            other => bail!(
                "unsupported install mode '{}' (expected manual, auto_full, auto_parts or capture)",
                other
            ),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstallMode::Manual => "manual",
            InstallMode::AutoFull => "auto_full",
            InstallMode::AutoParts => "auto_parts",
            InstallMode::Capture => "capture",
        }
    }

    /// Whether entries for this mode perform irreversible disk writes.
    pub fn is_destructive(&self) -> bool {
        !matches!(self, InstallMode::Manual)
    }
}

impl fmt::Display for InstallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The confirmation value that arms destructive boot entries.
pub const CONFIRM_ARMED: &str = "YES";

/// Fully resolved, immutable pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Version string of the asset set to fetch/serve.
    pub asset_version: String,
    /// Base URL the asset set is fetched from.
    pub source_url: String,
    /// Expected sha256 of the root filesystem payload, when known upfront.
    pub expected_sha256: Option<String>,
    pub transport: Transport,
    /// Host serving the payload (HTTP/TFTP server or NFS server).
    pub server_host: String,
    /// NFS export or HTTP/TFTP base path on the server.
    pub export_path: String,
    /// Block device destructive entries operate on.
    pub target_disk: String,
    pub install_mode: InstallMode,
    /// Armed only when the confirmation value was exactly `YES`.
    pub confirm: bool,
    pub dry_run: bool,
    /// Root of the local image repository.
    pub repo_root: PathBuf,
    /// Hard ceiling for assembled disk images.
    pub max_image_mib: u64,
    /// Safety margin added on top of the measured root content size.
    pub root_margin_mib: u64,
    /// Content size below this is treated as a corrupt source tree.
    pub min_content_mib: u64,
    pub net_timeout_secs: u64,
    pub retry_attempts: u32,
    pub smoke_timeout_secs: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    asset_version: Option<String>,
    source_url: Option<String>,
    expected_sha256: Option<String>,
    transport: Option<String>,
    server_host: Option<String>,
    export_path: Option<String>,
    target_disk: Option<String>,
    install_mode: Option<String>,
    confirm: Option<String>,
    dry_run: Option<bool>,
    repo_root: Option<String>,
    max_image_mib: Option<u64>,
    root_margin_mib: Option<u64>,
    min_content_mib: Option<u64>,
    net_timeout_secs: Option<u64>,
    retry_attempts: Option<u32>,
    smoke_timeout_secs: Option<u64>,
}

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILENAME: &str = "bootforge.toml";

impl PipelineConfig {
    /// Load configuration from `explicit_path`, `$BOOTFORGE_CONFIG`, or
    /// `./bootforge.toml` when present, then apply `BOOTFORGE_*`
    /// environment overrides.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("BOOTFORGE_CONFIG").ok().map(PathBuf::from);
        let default_path = PathBuf::from(CONFIG_FILENAME);

        let path = explicit_path
            .map(Path::to_path_buf)
            .or(env_path)
            .or_else(|| default_path.exists().then(|| default_path.clone()));

        let toml_cfg = match path {
            Some(p) => {
                let raw = fs::read_to_string(&p)
                    .with_context(|| format!("reading config '{}'", p.display()))?;
                toml::from_str(&raw).with_context(|| format!("parsing config '{}'", p.display()))?
            }
            None => ConfigToml::default(),
        };

        Self::from_sources(toml_cfg, |key| std::env::var(key).ok())
    }

    fn from_sources(
        toml_cfg: ConfigToml,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let pick = |env_key: &str, toml_val: Option<String>| -> Option<String> {
            env(env_key).or(toml_val)
        };

        let transport = match pick("BOOTFORGE_TRANSPORT", toml_cfg.transport) {
            Some(raw) => Transport::parse(&raw)?,
            None => Transport::Http,
        };
        let install_mode = match pick("BOOTFORGE_MODE", toml_cfg.install_mode) {
            Some(raw) => InstallMode::parse(&raw)?,
            None => InstallMode::Manual,
        };

        // Destructive entries require the literal value YES; anything else
        // (including unset) leaves them disarmed. Not an error.
        let confirm = pick("BOOTFORGE_CONFIRM", toml_cfg.confirm)
            .map(|v| v == CONFIRM_ARMED)
            .unwrap_or(false);

        let dry_run = match env("BOOTFORGE_DRY_RUN") {
            Some(v) => matches!(v.as_str(), "1" | "true" | "yes"),
            None => toml_cfg.dry_run.unwrap_or(false),
        };

        let repo_root = pick("BOOTFORGE_REPO", toml_cfg.repo_root)
            .map(PathBuf::from)
            .unwrap_or_else(default_repo_root);

        let parse_u64 = |env_key: &str, toml_val: Option<u64>, default: u64| -> Result<u64> {
            match env(env_key) {
                Some(raw) => raw
                    .parse::<u64>()
                    .with_context(|| format!("invalid {env_key} '{raw}'")),
                None => Ok(toml_val.unwrap_or(default)),
            }
        };

        let retry_attempts = match env("BOOTFORGE_RETRY_ATTEMPTS") {
            Some(raw) => raw
                .parse::<u32>()
                .with_context(|| format!("invalid BOOTFORGE_RETRY_ATTEMPTS '{raw}'"))?,
            None => toml_cfg.retry_attempts.unwrap_or(3),
        };
        if retry_attempts == 0 {
            bail!("retry_attempts must be >= 1");
        }

        let cfg = Self {
            asset_version: pick("BOOTFORGE_VERSION", toml_cfg.asset_version)
                .unwrap_or_else(|| String::from("latest")),
            source_url: pick("BOOTFORGE_SOURCE_URL", toml_cfg.source_url).unwrap_or_default(),
            expected_sha256: pick("BOOTFORGE_SHA256", toml_cfg.expected_sha256)
                .filter(|s| !s.trim().is_empty()),
            transport,
            server_host: pick("BOOTFORGE_HOST", toml_cfg.server_host).unwrap_or_default(),
            export_path: pick("BOOTFORGE_EXPORT", toml_cfg.export_path)
                .unwrap_or_else(|| String::from("/srv/images")),
            target_disk: pick("BOOTFORGE_TARGET_DISK", toml_cfg.target_disk)
                .unwrap_or_else(|| String::from("/dev/sda")),
            install_mode,
            confirm,
            dry_run,
            repo_root,
            max_image_mib: parse_u64("BOOTFORGE_MAX_IMAGE_MIB", toml_cfg.max_image_mib, 20480)?,
            root_margin_mib: parse_u64("BOOTFORGE_ROOT_MARGIN_MIB", toml_cfg.root_margin_mib, 512)?,
            min_content_mib: parse_u64("BOOTFORGE_MIN_CONTENT_MIB", toml_cfg.min_content_mib, 500)?,
            net_timeout_secs: parse_u64("BOOTFORGE_NET_TIMEOUT", toml_cfg.net_timeout_secs, 30)?,
            retry_attempts,
            smoke_timeout_secs: parse_u64(
                "BOOTFORGE_SMOKE_TIMEOUT",
                toml_cfg.smoke_timeout_secs,
                180,
            )?,
        };

        if let Some(digest) = &cfg.expected_sha256 {
            if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                bail!("expected_sha256 must be 64 hex characters, got '{digest}'");
            }
        }

        Ok(cfg)
    }
}

fn default_repo_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("bootforge")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn defaults_are_safe() {
        let cfg = PipelineConfig::from_sources(ConfigToml::default(), no_env).unwrap();
        assert_eq!(cfg.transport, Transport::Http);
        assert_eq!(cfg.install_mode, InstallMode::Manual);
        assert!(!cfg.confirm);
        assert!(!cfg.dry_run);
        assert_eq!(cfg.max_image_mib, 20480);
    }

    #[test]
    fn toml_values_are_applied() {
        let toml_cfg: ConfigToml = toml::from_str(
            r#"
            asset_version = "2024.1"
            transport = "nfs"
            server_host = "deploy.example"
            export_path = "/export/images"
            install_mode = "auto_full"
            confirm = "YES"
            "#,
        )
        .unwrap();
        let cfg = PipelineConfig::from_sources(toml_cfg, no_env).unwrap();
        assert_eq!(cfg.asset_version, "2024.1");
        assert_eq!(cfg.transport, Transport::Nfs);
        assert_eq!(cfg.install_mode, InstallMode::AutoFull);
        assert!(cfg.confirm);
    }

    #[test]
    fn env_overrides_toml() {
        let toml_cfg: ConfigToml = toml::from_str(r#"transport = "nfs""#).unwrap();
        let env: BTreeMap<&str, &str> = [("BOOTFORGE_TRANSPORT", "tftp")].into();
        let cfg =
            PipelineConfig::from_sources(toml_cfg, |k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.transport, Transport::Tftp);
    }

    #[test]
    fn confirm_requires_exact_yes() {
        for raw in ["yes", "y", "true", "Yes", ""] {
            let env: BTreeMap<&str, String> = [("BOOTFORGE_CONFIRM", raw.to_string())].into();
            let cfg = PipelineConfig::from_sources(ConfigToml::default(), |k| {
                env.get(k).cloned()
            })
            .unwrap();
            assert!(!cfg.confirm, "'{raw}' must not arm destructive entries");
        }

        let env: BTreeMap<&str, String> = [("BOOTFORGE_CONFIRM", "YES".to_string())].into();
        let cfg =
            PipelineConfig::from_sources(ConfigToml::default(), |k| env.get(k).cloned()).unwrap();
        assert!(cfg.confirm);
    }

    #[test]
    fn invalid_transport_is_misconfiguration() {
        let toml_cfg: ConfigToml = toml::from_str(r#"transport = "carrier-pigeon""#).unwrap();
        let err = PipelineConfig::from_sources(toml_cfg, no_env).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::TransportMisconfiguration(_))
        ));
    }

    #[test]
    fn invalid_digest_is_rejected() {
        let toml_cfg: ConfigToml = toml::from_str(r#"expected_sha256 = "abc""#).unwrap();
        assert!(PipelineConfig::from_sources(toml_cfg, no_env).is_err());
    }

    #[test]
    fn unknown_toml_keys_are_rejected() {
        let parsed: Result<ConfigToml, _> = toml::from_str(r#"no_such_key = 1"#);
        assert!(parsed.is_err());
    }
}
