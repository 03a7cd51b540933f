//! Subprocess execution against the target host.
//!
//! Every side effect that is not a plain file write (user management,
//! systemctl, nginx, apt, certbot, openssl, ufw) goes through
//! [`CommandRunner`], so the orchestration logic can be exercised against a
//! fake host in tests.

use crate::error::{HostforgeError, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

/// Output cap per stream; verbose installers keep only the tail.
const MAX_OUTPUT: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl HostCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        let s = path.to_string_lossy().into_owned();
        self.arg(s)
    }

    pub fn cwd(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Shell-like rendering for logs.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().map(|a| {
            if a.contains(' ') {
                format!("'{a}'")
            } else {
                a.clone()
            }
        }));
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0) && !self.timed_out
    }

    /// stdout and stderr joined, trimmed.
    pub fn combined(&self) -> String {
        let out = self.stdout.trim();
        let err = self.stderr.trim();
        match (out.is_empty(), err.is_empty()) {
            (true, _) => err.to_string(),
            (_, true) => out.to_string(),
            _ => format!("{out}\n{err}"),
        }
    }

    /// The last `n` lines of combined output.
    pub fn tail(&self, n: usize) -> String {
        let combined = self.combined();
        let lines: Vec<&str> = combined.lines().collect();
        let start = lines.len().saturating_sub(n);
        lines[start..].join("\n")
    }
}

pub trait CommandRunner: Send + Sync {
    /// Run `cmd` to completion. A spawn failure (missing binary) is an `Err`;
    /// a non-zero exit is an `Ok` with `code != Some(0)`.
    fn run(&self, cmd: &HostCommand) -> Result<CommandOutput>;

    /// Whether `program` is available on the host.
    fn has_program(&self, program: &str) -> bool;

    /// Run and turn any non-success into [`HostforgeError::Command`].
    fn run_checked(&self, cmd: &HostCommand) -> Result<CommandOutput> {
        let output = self.run(cmd)?;
        if output.success() {
            Ok(output)
        } else if output.timed_out {
            Err(HostforgeError::Command {
                command: cmd.display(),
                detail: "timed out".to_string(),
            })
        } else {
            Err(HostforgeError::Command {
                command: cmd.display(),
                detail: format!(
                    "exit {}: {}",
                    output
                        .code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "signal".to_string()),
                    output.tail(20)
                ),
            })
        }
    }

    /// True when the command ran and exited 0; spawn failures count as false.
    fn probe(&self, cmd: &HostCommand) -> bool {
        self.run(cmd).map(|o| o.success()).unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// SystemRunner
// ---------------------------------------------------------------------------

/// Runs commands on the local machine with `std::process`.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    default_timeout: Duration,
}

impl SystemRunner {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, cmd: &HostCommand) -> Result<CommandOutput> {
        let timeout = cmd.timeout.unwrap_or(self.default_timeout);
        tracing::debug!(command = %cmd.display(), "exec");

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &cmd.cwd {
            command.current_dir(dir);
        }
        for (k, v) in &cmd.env {
            command.env(k, v);
        }

        let mut child = command.spawn().map_err(|e| HostforgeError::Command {
            command: cmd.display(),
            detail: format!("failed to spawn: {e}"),
        })?;
        let child_pid = child.id();

        // Read pipes in dedicated threads so a chatty child cannot fill the
        // pipe buffer and deadlock the wait below.
        let stdout_handle = child.stdout.take();
        let stderr_handle = child.stderr.take();
        let stdout_thread = std::thread::spawn(move || read_capped(stdout_handle));
        let stderr_thread = std::thread::spawn(move || read_capped(stderr_handle));

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(child.wait());
        });

        let status = match rx.recv_timeout(timeout) {
            Ok(result) => Some(result?),
            Err(_) => {
                kill_process(child_pid);
                None
            }
        };

        let stdout = stdout_thread.join().unwrap_or_default();
        let stderr = stderr_thread.join().unwrap_or_default();

        Ok(match status {
            Some(status) => CommandOutput {
                code: status.code(),
                stdout,
                stderr,
                timed_out: false,
            },
            None => CommandOutput {
                code: None,
                stdout,
                stderr: format!("{stderr}\ntimed out after {}s", timeout.as_secs()),
                timed_out: true,
            },
        })
    }

    fn has_program(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

fn read_capped<R: Read>(reader: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut r) = reader {
        let _ = r.read_to_end(&mut buf);
    }
    let start = buf.len().saturating_sub(MAX_OUTPUT);
    String::from_utf8_lossy(&buf[start..]).into_owned()
}

/// Terminate a process by PID with SIGKILL. Best-effort.
fn kill_process(pid: u32) {
    let _ = Command::new("kill")
        .args(["-9", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}
