//! Host tool invocation.
//!
//! The pipeline drives external tools (sfdisk, losetup, mkfs.*, mount,
//! xorriso, rsync, qemu) through a small command builder so call sites
//! stay declarative and failures carry the tool's stderr.

use anyhow::{bail, Context, Result};
use std::ffi::{OsStr, OsString};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

/// Builder for an external command invocation.
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    current_dir: Option<PathBuf>,
    stdin_data: Option<Vec<u8>>,
    error_msg: Option<String>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            current_dir: None,
            stdin_data: None,
            error_msg: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for a in args {
            self.args.push(a.as_ref().to_os_string());
        }
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.as_os_str().to_os_string());
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    /// Feed bytes to the child's stdin (e.g. an sfdisk script).
    pub fn stdin_bytes(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin_data = Some(data.into());
        self
    }

    /// Message prepended to the failure report.
    pub fn error_msg(mut self, msg: &str) -> Self {
        self.error_msg = Some(msg.to_string());
        self
    }

    /// Return the exit status instead of failing on non-zero exit.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Run with captured output. Fails on non-zero exit unless
    /// `allow_fail` was set.
    pub fn run(self) -> Result<ExitStatus> {
        let (status, _stdout, stderr) = self.spawn_captured()?;
        if status.success() || self.allow_fail {
            return Ok(status);
        }
        bail_with(&self.program, &self.error_msg, status, &stderr)
    }

    /// Run with captured output and return trimmed stdout.
    pub fn run_capture(self) -> Result<String> {
        let (status, stdout, stderr) = self.spawn_captured()?;
        if !status.success() && !self.allow_fail {
            return bail_with(&self.program, &self.error_msg, status, &stderr);
        }
        Ok(stdout.trim().to_string())
    }

    /// Run with inherited stdio, for long-running tools whose progress
    /// output belongs on the operator's terminal.
    pub fn run_interactive(self) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        let status = cmd
            .status()
            .with_context(|| format!("failed to run '{}'", self.program))?;
        if !status.success() && !self.allow_fail {
            let msg = self
                .error_msg
                .unwrap_or_else(|| format!("'{}' failed", self.program));
            bail!("{} (exit: {})", msg, status);
        }
        Ok(())
    }

    fn spawn_captured(&self) -> Result<(ExitStatus, String, String)> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        if self.stdin_data.is_some() {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to run '{}'", self.program))?;

        if let Some(data) = &self.stdin_data {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(data)
                    .with_context(|| format!("failed to write stdin to '{}'", self.program))?;
            }
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("failed to wait for '{}'", self.program))?;
        Ok((
            output.status,
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }
}

fn bail_with<T>(
    program: &str,
    error_msg: &Option<String>,
    status: ExitStatus,
    stderr: &str,
) -> Result<T> {
    let msg = error_msg
        .clone()
        .unwrap_or_else(|| format!("'{program}' failed"));
    let stderr = stderr.trim();
    if stderr.is_empty() {
        bail!("{} (exit: {})", msg, status);
    }
    bail!("{} (exit: {})\n{}", msg, status, stderr)
}

/// Fail with a descriptive message when a required path is absent.
pub fn ensure_exists(path: &Path, what: &str) -> Result<()> {
    if !path.exists() {
        bail!("{} not found: {}", what, path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_capture_returns_stdout() {
        let out = Cmd::new("echo").arg("hello").run_capture().unwrap();
        assert_eq!(out, "hello");
    }

    #[test]
    fn failing_command_reports_error_msg() {
        let err = Cmd::new("false")
            .error_msg("deliberate failure")
            .run()
            .unwrap_err();
        assert!(err.to_string().contains("deliberate failure"));
    }

    #[test]
    fn allow_fail_returns_status() {
        let status = Cmd::new("false").allow_fail().run().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn stdin_bytes_are_piped() {
        let out = Cmd::new("cat").stdin_bytes(b"piped".to_vec()).run_capture().unwrap();
        assert_eq!(out, "piped");
    }
}
