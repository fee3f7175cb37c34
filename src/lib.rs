//! Provisioning pipeline for bootable, network-deployable disk images.
//!
//! bootforge takes externally sourced OS assets (kernel, initrd, root
//! filesystem payload), verifies and caches them in a local image
//! repository, assembles multi-partition bootable disk images, and emits
//! transport-aware netboot configurations for bare-metal deployment.
//!
//! # Architecture
//!
//! ```text
//! fetch ──────> image repository ──────> bootcfg ──────> verify
//!   │    (content-tracked assets +          │      (integrity and
//!   │     manifest per version)             │       cross-consistency)
//!   │                                       │
//!   └──> disk (partition plan + GPT         └──> boot menu entries,
//!        image assembly, independent             gated destructive
//!        of the repository)                      restore actions
//! ```
//!
//! Each phase consumes the previous phase's typed output; there is no
//! shared mutable state between components. Block-device operations go
//! through the [`disk::blockdev::BlockDev`] trait so assembly logic is
//! testable without privileged access to real disks.

pub mod bootcfg;
pub mod config;
pub mod disk;
pub mod error;
pub mod fetch;
pub mod fsutil;
pub mod guard;
pub mod interrupt;
pub mod logging;
pub mod preflight;
pub mod process;
pub mod qemu;
pub mod repo;
pub mod verify;

pub use config::{InstallMode, PipelineConfig, Transport};
pub use error::PipelineError;
