//! Append-only run log shared by every component of one invocation.
//!
//! Each line is `RFC3339 LEVEL [scope] message`. Writes are mirrored to
//! `tracing`, so console verbosity follows `RUST_LOG` while the file keeps
//! everything for post-mortem.

use crate::error::Result;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

pub struct RunLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl RunLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self, scope: &str, message: impl AsRef<str>) {
        self.write(LogLevel::Info, scope, message.as_ref());
    }

    pub fn warn(&self, scope: &str, message: impl AsRef<str>) {
        self.write(LogLevel::Warn, scope, message.as_ref());
    }

    pub fn error(&self, scope: &str, message: impl AsRef<str>) {
        self.write(LogLevel::Error, scope, message.as_ref());
    }

    /// Record multi-line command output, each line indented under `scope`.
    pub fn output(&self, scope: &str, output: &str) {
        for line in output.lines().filter(|l| !l.trim().is_empty()) {
            self.write(LogLevel::Info, scope, &format!("  | {line}"));
        }
    }

    pub fn write(&self, level: LogLevel, scope: &str, message: &str) {
        match level {
            LogLevel::Info => tracing::info!(scope, "{message}"),
            LogLevel::Warn => tracing::warn!(scope, "{message}"),
            LogLevel::Error => tracing::error!(scope, "{message}"),
        }
        let line = format!(
            "{} {:<5} [{scope}] {message}\n",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            level.as_str()
        );
        // A failed log write must not abort provisioning.
        if let Ok(mut f) = self.file.lock() {
            let _ = f.write_all(line.as_bytes());
        }
    }

    /// Current end-of-log offset, for [`RunLog::since`].
    pub fn position(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    /// Everything appended after `position`.
    pub fn since(&self, position: u64) -> String {
        let Ok(bytes) = std::fs::read(&self.path) else {
            return String::new();
        };
        let start = (position as usize).min(bytes.len());
        String::from_utf8_lossy(&bytes[start..]).into_owned()
    }

    /// Read the full log back.
    pub fn contents(&self) -> Result<String> {
        Ok(std::fs::read_to_string(&self.path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn appends_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state/run.log");
        {
            let log = RunLog::open(&path).unwrap();
            log.info("packages", "first");
        }
        let log = RunLog::open(&path).unwrap();
        log.warn("packages", "second");
        let content = log.contents().unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("INFO  [packages] first"));
        assert!(lines[1].contains("WARN  [packages] second"));
    }

    #[test]
    fn output_indents_and_skips_blank_lines() {
        let dir = TempDir::new().unwrap();
        let log = RunLog::open(&dir.path().join("run.log")).unwrap();
        log.output("apt", "Reading lists\n\nDone\n");
        let content = log.contents().unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("  | Done"));
    }

    #[test]
    fn since_returns_only_new_lines() {
        let dir = TempDir::new().unwrap();
        let log = RunLog::open(&dir.path().join("run.log")).unwrap();
        log.info("a", "before");
        let mark = log.position();
        log.info("b", "after");
        let tail = log.since(mark);
        assert!(tail.contains("[b] after"));
        assert!(!tail.contains("before"));
    }
}
