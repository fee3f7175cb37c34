//! Timestamped, leveled diagnostics on standard error.
//!
//! Every pipeline phase reports through these helpers so operators get a
//! uniform `[timestamp] LEVEL message` stream they can correlate with
//! external tool output. Fatal errors are logged by the CLI right before
//! the non-zero exit.

use std::fmt::Display;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

fn timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::from("unknown-time"))
}

/// Progress and state-change messages.
pub fn info(msg: impl Display) {
    eprintln!("[{}] INFO  {}", timestamp(), msg);
}

/// Non-critical failures that do not abort the run.
pub fn warn(msg: impl Display) {
    eprintln!("[{}] WARN  {}", timestamp(), msg);
}

/// Fatal failures, logged once before the process exits non-zero.
pub fn error(msg: impl Display) {
    eprintln!("[{}] ERROR {}", timestamp(), msg);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_is_rfc3339() {
        let ts = timestamp();
        // 2026-08-25T12:34:56.789Z — at minimum date, 'T', and a timezone.
        assert!(ts.contains('T'));
        assert!(ts.ends_with('Z') || ts.contains('+'));
    }
}
