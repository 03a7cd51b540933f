//! `RunContext`: everything one invocation needs, passed explicitly.

use crate::error::Result;
use crate::host::{CommandRunner, HostCommand};
use crate::lock::RunLock;
use crate::paths;
use crate::runlog::RunLog;
use crate::settings::Settings;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which machine we operate on. `root` is `/` in production; tests point it
/// at a temp directory so every file the orchestrator touches lands there.
#[derive(Debug, Clone)]
pub struct Target {
    pub root: PathBuf,
}

impl Target {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Strip the root prefix to get the path as the host itself sees it.
    /// Used in rendered files (unit, nginx site, cron) that the host reads.
    pub fn host_path(&self, path: &Path) -> PathBuf {
        match path.strip_prefix(&self.root) {
            Ok(rel) => Path::new("/").join(rel),
            Err(_) => path.to_path_buf(),
        }
    }

    /// Inverse of [`Target::host_path`]: where a host-absolute path lives
    /// under this target's root.
    pub fn on_target(&self, host_path: &Path) -> PathBuf {
        self.root
            .join(host_path.strip_prefix("/").unwrap_or(host_path))
    }
}

pub struct RunContext {
    pub target: Target,
    pub settings: Settings,
    pub log: RunLog,
    pub runner: Box<dyn CommandRunner>,
    /// Held for the whole invocation; `None` for read-only commands.
    pub lock: Option<RunLock>,
}

impl RunContext {
    /// Open the run log and load settings for `target`. Does not lock.
    pub fn open(target: Target, runner: Box<dyn CommandRunner>) -> Result<Self> {
        let settings = Settings::load(target.root())?;
        Self::with_settings(target, settings, runner)
    }

    pub fn with_settings(
        target: Target,
        settings: Settings,
        runner: Box<dyn CommandRunner>,
    ) -> Result<Self> {
        let log = RunLog::open(&paths::log_path(target.root()))?;
        Ok(Self {
            target,
            settings,
            log,
            runner,
            lock: None,
        })
    }

    /// Take the run lock for the rest of this context's lifetime.
    pub fn lock(&mut self) -> Result<()> {
        if self.lock.is_none() {
            self.lock = Some(RunLock::acquire(&paths::lock_path(self.target.root()))?);
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        self.target.root()
    }

    pub fn app_name(&self) -> &str {
        &self.settings.app.name
    }

    pub fn app_user(&self) -> &str {
        self.settings.app.user()
    }

    pub fn app_dir(&self) -> PathBuf {
        paths::app_dir(self.root(), self.app_name())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.retry.timeout_secs)
    }

    /// Convenience: run with the configured timeout, failing on non-zero exit,
    /// and copy the output into the run log under `scope`.
    pub fn exec(&self, scope: &str, cmd: HostCommand) -> Result<String> {
        let cmd = if cmd.timeout.is_none() {
            cmd.timeout(self.command_timeout())
        } else {
            cmd
        };
        self.log.info(scope, format!("$ {}", cmd.display()));
        match self.runner.run_checked(&cmd) {
            Ok(out) => {
                let combined = out.combined();
                self.log.output(scope, &combined);
                Ok(combined)
            }
            Err(e) => {
                self.log.error(scope, e.to_string());
                Err(e)
            }
        }
    }
}
