//! QEMU boot smoke test.
//!
//! Boots a finished disk image headless with a serial console and watches
//! the output for known success/failure markers. A pass means the image
//! reached a login prompt; it is deliberately a smoke test, not a full
//! installation test.

use anyhow::{bail, Context, Result};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use crate::logging;

/// Any of these means boot succeeded.
pub const SUCCESS_PATTERNS: &[&str] = &["login:", "Welcome to"];

/// Any of these means boot failed.
pub const FAILURE_PATTERNS: &[&str] = &[
    "Kernel panic",
    "not syncing",
    "VFS: Cannot open root device",
    "No init found",
    "can't find /init",
    "failed to mount",
    "emergency shell",
    "No bootable device",
    "Boot Failed",
];

/// Find OVMF firmware for UEFI boot.
pub fn find_ovmf() -> Option<PathBuf> {
    let candidates = [
        // Fedora/RHEL
        "/usr/share/edk2/ovmf/OVMF_CODE.fd",
        "/usr/share/OVMF/OVMF_CODE.fd",
        // Debian/Ubuntu
        "/usr/share/OVMF/OVMF_CODE_4M.fd",
        "/usr/share/qemu/OVMF.fd",
        // Arch
        "/usr/share/edk2-ovmf/x64/OVMF_CODE.fd",
    ];

    candidates
        .into_iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

/// Boot `image` headless and watch serial output until a success or
/// failure marker, an overall timeout, or a 30s output stall.
pub fn boot_smoke_test(image: &Path, timeout_secs: u64) -> Result<()> {
    if !image.exists() {
        bail!("disk image not found at {}", image.display());
    }
    let ovmf = find_ovmf().context("OVMF firmware not found; UEFI boot required")?;

    let mut cmd = Command::new("qemu-system-x86_64");
    if Path::new("/dev/kvm").exists() {
        cmd.args(["-enable-kvm", "-cpu", "host"]);
    } else {
        cmd.args(["-cpu", "max"]);
    }
    cmd.args(["-smp", "2", "-m", "2G"]);
    cmd.args([
        "-drive",
        &format!("file={},format=raw,if=virtio", image.display()),
    ]);
    cmd.args([
        "-drive",
        &format!("if=pflash,format=raw,readonly=on,file={}", ovmf.display()),
    ]);
    cmd.args(["-nographic", "-serial", "mon:stdio", "-no-reboot"]);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    logging::info(format!(
        "smoke test: booting {} (timeout {timeout_secs}s)",
        image.display()
    ));

    let mut child = cmd.spawn().context("failed to spawn qemu-system-x86_64")?;
    let stdout = child.stdout.take().context("failed to capture stdout")?;

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let reader = BufReader::new(stdout);
        for line in reader.lines().map_while(Result::ok) {
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    let start = Instant::now();
    let timeout = Duration::from_secs(timeout_secs);
    let stall_timeout = Duration::from_secs(30);
    let mut last_output = Instant::now();
    let mut tail: Vec<String> = Vec::new();

    loop {
        if start.elapsed() > timeout {
            let _ = child.kill();
            bail!(
                "smoke test timed out after {timeout_secs}s\n\nlast output:\n{}",
                last_lines(&tail, 20)
            );
        }
        if last_output.elapsed() > stall_timeout {
            let _ = child.kill();
            bail!(
                "smoke test stalled: no serial output for {}s",
                stall_timeout.as_secs()
            );
        }

        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(line) => {
                last_output = Instant::now();
                tail.push(line.clone());

                for pattern in FAILURE_PATTERNS {
                    if line.contains(pattern) {
                        let _ = child.kill();
                        bail!(
                            "boot failed: matched '{pattern}'\n\ncontext:\n{}",
                            last_lines(&tail, 30)
                        );
                    }
                }
                for pattern in SUCCESS_PATTERNS {
                    if line.contains(pattern) {
                        let _ = child.kill();
                        let _ = child.wait();
                        logging::info(format!(
                            "smoke test passed in {:.1}s (matched '{pattern}')",
                            start.elapsed().as_secs_f64()
                        ));
                        return Ok(());
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                bail!(
                    "qemu exited before boot completed\n\nlast output:\n{}",
                    last_lines(&tail, 20)
                );
            }
        }
    }
}

fn last_lines(lines: &[String], n: usize) -> String {
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_image_fails_before_spawning_qemu() {
        let err = boot_smoke_test(Path::new("/no/such/disk.img"), 5).unwrap_err();
        assert!(err.to_string().contains("disk image not found"));
    }

    #[test]
    fn last_lines_keeps_the_tail() {
        let lines: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        assert_eq!(last_lines(&lines, 3), "7\n8\n9");
        assert_eq!(last_lines(&lines, 100), lines.join("\n"));
    }
}
