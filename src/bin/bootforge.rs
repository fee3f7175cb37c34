//! bootforge CLI.
//!
//! Thin dispatch layer over the library. Every command exits 0 on
//! success and non-zero on failure, with timestamped diagnostics on
//! standard error.

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};
use std::process::exit;

use bootforge::bootcfg::{self, NetTarget};
use bootforge::config::PipelineConfig;
use bootforge::disk::blockdev::HostBlockDev;
use bootforge::disk::plan;
use bootforge::disk::{self, Assembler, BootAssets};
use bootforge::error::PipelineError;
use bootforge::fetch::{self, manifest::Manifest, manifest::MANIFEST_FILENAME};
use bootforge::guard::{self, GuardBounds};
use bootforge::repo::ImageRepo;
use bootforge::{fsutil, interrupt, logging, preflight, qemu, verify};

const BOOT_CONFIG_FILENAME: &str = "boot.cfg";

fn usage() -> &'static str {
    "bootforge - provisioning pipeline for network-deployable disk images

USAGE:
    bootforge <command> [args]

COMMANDS:
    fetch                          Download the configured asset set into the repository
    import <path> [name]           Import a directory or .tar.zst archive as an image set
    list                           List stored image sets
    verify <name>                  Re-check one image set against its manifest
    sync <dest>                    Mirror the repository to a deploy target (rsync)
    generate-config                Write the boot menu for the configured transport/mode
    guard                          Run the target-disk size guard
    test <image>                   Boot a disk image in QEMU and watch for a login prompt
    verify-all                     Run the full verification suite
    build-image <rootfs> <output>  Assemble a bootable disk image from a root tree

CONFIGURATION:
    Read from ./bootforge.toml (or $BOOTFORGE_CONFIG), overridden by
    BOOTFORGE_* environment variables. Destructive boot entries require
    BOOTFORGE_CONFIRM=YES."
}

fn main() {
    interrupt::install_handler();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let code = match run(&args) {
        Ok(code) => code,
        Err(err) => {
            logging::error(format!("{err:#}"));
            1
        }
    };
    exit(code);
}

fn run(args: &[String]) -> Result<i32> {
    let Some(command) = args.first() else {
        println!("{}", usage());
        return Ok(2);
    };

    match command.as_str() {
        "fetch" => cmd_fetch(),
        "import" => cmd_import(args.get(1), args.get(2)),
        "list" => cmd_list(),
        "verify" => cmd_verify(args.get(1)),
        "sync" => cmd_sync(args.get(1)),
        "generate-config" => cmd_generate_config(),
        "guard" => cmd_guard(),
        "test" => cmd_test(args.get(1)),
        "verify-all" => cmd_verify_all(),
        "build-image" => cmd_build_image(args.get(1), args.get(2)),
        "help" | "--help" | "-h" => {
            println!("{}", usage());
            Ok(0)
        }
        other => {
            logging::error(format!("unknown command '{other}'"));
            println!("{}", usage());
            Ok(2)
        }
    }
}

fn open_repo(cfg: &PipelineConfig) -> Result<ImageRepo> {
    ImageRepo::open(&cfg.repo_root)
}

fn asset_dir(cfg: &PipelineConfig, repo: &ImageRepo) -> PathBuf {
    repo.images_dir().join(&cfg.asset_version)
}

fn cmd_fetch() -> Result<i32> {
    let cfg = PipelineConfig::load(None)?;
    let repo = open_repo(&cfg)?;
    let dest = asset_dir(&cfg, &repo);
    let manifest = fetch::fetch_asset_set(&cfg, &dest)?;
    println!(
        "fetched {} ({} files) into {}",
        manifest.version,
        manifest.files.len(),
        dest.display()
    );
    Ok(0)
}

fn cmd_import(path: Option<&String>, name: Option<&String>) -> Result<i32> {
    let Some(path) = path else {
        bail!("usage: bootforge import <path> [name]");
    };
    let source = Path::new(path);

    let name = match name {
        Some(n) => n.clone(),
        None => source
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.trim_end_matches(".tar.zst").to_string())
            .unwrap_or_default(),
    };
    if name.is_empty() {
        bail!("cannot derive an image name from '{path}'; pass one explicitly");
    }

    let cfg = PipelineConfig::load(None)?;
    let repo = open_repo(&cfg)?;
    let manifest = repo.import(source, &name)?;
    println!("imported '{name}' ({} files)", manifest.files.len());
    Ok(0)
}

fn cmd_list() -> Result<i32> {
    let cfg = PipelineConfig::load(None)?;
    let repo = open_repo(&cfg)?;
    let entries = repo.list()?;
    if entries.is_empty() {
        println!("repository is empty ({})", repo.root().display());
        return Ok(0);
    }

    println!("{:<24} {:<16} {:>6} {:>10}  {}", "NAME", "VERSION", "FILES", "SIZE", "CREATED");
    for e in entries {
        println!(
            "{:<24} {:<16} {:>6} {:>7} MiB  {}",
            e.name,
            e.version,
            e.files,
            e.bytes / (1024 * 1024),
            e.timestamp
        );
    }
    Ok(0)
}

fn cmd_verify(name: Option<&String>) -> Result<i32> {
    let Some(name) = name else {
        bail!("usage: bootforge verify <name>");
    };
    let cfg = PipelineConfig::load(None)?;
    let repo = open_repo(&cfg)?;
    let results = repo.verify(name)?;
    Ok(if verify::report(&results) { 0 } else { 1 })
}

fn cmd_sync(dest: Option<&String>) -> Result<i32> {
    let Some(dest) = dest else {
        bail!("usage: bootforge sync <dest>");
    };
    let cfg = PipelineConfig::load(None)?;
    let repo = open_repo(&cfg)?;
    repo.sync(dest)?;
    Ok(0)
}

fn cmd_generate_config() -> Result<i32> {
    let cfg = PipelineConfig::load(None)?;
    let repo = open_repo(&cfg)?;

    let manifest_path = asset_dir(&cfg, &repo).join(MANIFEST_FILENAME);
    if !manifest_path.exists() {
        return Err(PipelineError::MissingPrerequisite(format!(
            "no manifest for version '{}'; run 'bootforge fetch' or 'bootforge import' first",
            cfg.asset_version
        ))
        .into());
    }
    let manifest = Manifest::load(&manifest_path)?;

    let target = NetTarget {
        host: cfg.server_host.clone(),
        base_path: cfg.export_path.clone(),
    };
    let entries = bootcfg::generate(
        &manifest,
        cfg.transport,
        cfg.install_mode,
        cfg.confirm,
        cfg.dry_run,
        &target,
        &cfg.target_disk,
    )?;

    let out_path = repo.root().join(BOOT_CONFIG_FILENAME);
    std::fs::write(&out_path, bootcfg::render(&entries))?;
    logging::info(format!(
        "wrote {} entries ({} destructive) to {}",
        entries.len(),
        entries.iter().filter(|e| e.destructive).count(),
        out_path.display()
    ));
    Ok(0)
}

fn cmd_guard() -> Result<i32> {
    let cfg = PipelineConfig::load(None)?;
    guard::check_target_disk(&cfg.target_disk, GuardBounds::from_config(&cfg))?;
    println!("guard passed for {}", cfg.target_disk);
    Ok(0)
}

fn cmd_test(image: Option<&String>) -> Result<i32> {
    let Some(image) = image else {
        bail!("usage: bootforge test <image>");
    };
    let cfg = PipelineConfig::load(None)?;
    qemu::boot_smoke_test(Path::new(image), cfg.smoke_timeout_secs)?;
    Ok(0)
}

fn cmd_verify_all() -> Result<i32> {
    let cfg = PipelineConfig::load(None)?;
    let repo = open_repo(&cfg)?;
    let assets = asset_dir(&cfg, &repo);
    let bootcfg_path = repo.root().join(BOOT_CONFIG_FILENAME);
    let results = verify::run(&cfg, &repo, &assets, &bootcfg_path)?;
    Ok(if verify::report(&results) { 0 } else { 1 })
}

fn cmd_build_image(rootfs: Option<&String>, output: Option<&String>) -> Result<i32> {
    let (Some(rootfs), Some(output)) = (rootfs, output) else {
        bail!("usage: bootforge build-image <rootfs> <output>");
    };
    let rootfs = Path::new(rootfs);
    let output = Path::new(output);

    let cfg = PipelineConfig::load(None)?;
    preflight::check_required_tools(preflight::ASSEMBLY_TOOLS)?;
    if unsafe { libc::geteuid() } != 0 {
        return Err(PipelineError::MissingPrerequisite(
            "build-image needs root for loop devices and mounts".into(),
        )
        .into());
    }

    let repo = open_repo(&cfg)?;
    let assets_dir = asset_dir(&cfg, &repo);
    let kernel = assets_dir.join(fetch::ASSET_KERNEL);
    let initrd = assets_dir.join(fetch::ASSET_INITRD);
    for (path, what) in [(&kernel, "kernel"), (&initrd, "initrd")] {
        if !path.exists() {
            return Err(PipelineError::MissingPrerequisite(format!(
                "{what} not found at {}; run 'bootforge fetch' first",
                path.display()
            ))
            .into());
        }
    }

    let content_bytes = fsutil::dir_size(rootfs)?;
    let specs = disk::default_layout(content_bytes, cfg.root_margin_mib);
    let layout = plan::plan(cfg.max_image_mib, &specs, &disk::limits_from_config(&cfg))?;

    let work_dir = std::env::temp_dir().join(fsutil::tmp_name("bootforge-build"));
    let mut assembler = Assembler::new(HostBlockDev, &work_dir);
    let assets = BootAssets::with_defaults(kernel, initrd, None);
    let image = assembler.assemble(output, layout, rootfs, &assets)?;

    println!("built {} ({} partitions)", image.path.display(), image.plan.partitions.len());
    Ok(0)
}
