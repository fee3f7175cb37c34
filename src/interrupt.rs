//! Interrupt flag for cooperative cancellation.
//!
//! Assembly phases and the downloader poll [`check`] between steps so a
//! SIGINT/SIGTERM unwinds through normal error propagation, which in turn
//! runs the mount/loop cleanup path before the process exits.

use anyhow::{bail, Result};
use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_sig: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Install SIGINT/SIGTERM handlers. Call once at process start.
pub fn install_handler() {
    let handler = handle_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Error out if an interrupt was delivered.
pub fn check() -> Result<()> {
    if interrupted() {
        bail!("interrupted");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_starts_clear() {
        // No signal delivered in the test process; check() passes.
        assert!(check().is_ok());
    }
}
