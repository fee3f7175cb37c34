//! Pipeline error taxonomy.
//!
//! Every fatal condition the pipeline can hit maps to one variant here.
//! Errors travel inside `anyhow::Error` so call sites keep the usual
//! `Result` + context flow; tests and the CLI downcast when the exact
//! variant matters (e.g. retryable vs. fatal).

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Downloaded or cached bytes do not hash to the expected digest.
    /// Always fatal; a mismatched artifact is never usable.
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// Network fetch exhausted its retry budget.
    #[error("download of {url} failed after {attempts} attempts")]
    DownloadFailure { url: String, attempts: u32 },

    /// Copying an entry out of an archive-like container failed.
    #[error("extraction of '{entry}' from {container} failed: {detail}")]
    ExtractionFailure {
        container: PathBuf,
        entry: String,
        detail: String,
    },

    /// mount/umount of a partition failed. Triggers resource cleanup.
    #[error("mount operation failed: {0}")]
    MountFailure(String),

    /// losetup attach/detach failed. Triggers resource cleanup.
    #[error("loop device operation failed: {0}")]
    LoopDeviceFailure(String),

    /// A partition layout cannot fit, or a size estimate is implausible.
    /// Evaluated before any disk or loop resource is allocated.
    #[error("size constraint violated: {0}")]
    SizeConstraintViolation(String),

    /// A phase's required predecessor output is absent.
    #[error("missing prerequisite: {0}")]
    MissingPrerequisite(String),

    /// The transport/mode/target combination cannot produce a valid
    /// boot configuration.
    #[error("transport misconfiguration: {0}")]
    TransportMisconfiguration(String),
}
