//! In-memory fake host for exercising the orchestrator without root.
//!
//! `FakeHost` interprets the handful of commands the orchestrator issues
//! (`id`, `useradd`, `systemctl`, `apt-get`, `git clone`, `openssl`,
//! `certbot`, ...) against shared in-memory state, and performs the file
//! effects those commands would have under the temp target root.

use crate::context::{RunContext, Target};
use crate::error::{HostforgeError, Result};
use crate::host::{CommandOutput, CommandRunner, HostCommand};
use crate::settings::Settings;
use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const FIXTURE_CERT: &str = include_str!("../tests/fixtures/selfsigned-cert.pem");
pub const FIXTURE_KEY: &str = include_str!("../tests/fixtures/selfsigned-key.pem");

#[derive(Default)]
pub struct FakeState {
    pub users: BTreeSet<String>,
    pub active: BTreeSet<String>,
    pub enabled: BTreeSet<String>,
    pub installed_packages: BTreeSet<String>,
    pub programs: BTreeSet<String>,
    /// Services that never become active, whatever is run.
    pub broken_services: BTreeSet<String>,
    /// Remaining `apt-get install` invocations that fail.
    pub apt_failures: u32,
    /// Scripted certbot results, consumed front to back; empty means success.
    pub certbot_results: VecDeque<std::result::Result<(), String>>,
    pub nginx_config_ok: bool,
    pub journal: Vec<String>,
    pub calls: Vec<String>,
}

#[derive(Clone)]
pub struct FakeHost {
    root: PathBuf,
    state: Arc<Mutex<FakeState>>,
}

impl FakeHost {
    pub fn new(root: &Path) -> Self {
        let state = FakeState {
            nginx_config_ok: true,
            programs: ["nginx", "certbot", "openssl", "ufw", "git", "apt-get"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            journal: vec!["Traceback (most recent call last):".to_string()],
            ..FakeState::default()
        };
        Self {
            root: root.to_path_buf(),
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn calls(&self) -> Vec<String> {
        self.with_state(|s| s.calls.clone())
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn unit_exists(&self, name: &str) -> bool {
        crate::paths::unit_path(&self.root, name).exists()
    }

    fn ok(stdout: &str) -> Result<CommandOutput> {
        Ok(CommandOutput {
            code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
            timed_out: false,
        })
    }

    fn fail(stderr: &str) -> Result<CommandOutput> {
        Ok(CommandOutput {
            code: Some(1),
            stdout: String::new(),
            stderr: stderr.to_string(),
            timed_out: false,
        })
    }

    fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    fn systemctl(&self, args: &[String]) -> Result<CommandOutput> {
        let verb = args.first().map(String::as_str).unwrap_or("");
        let name = args.last().cloned().unwrap_or_default();
        let mut s = self.state.lock().unwrap();
        match verb {
            "is-active" => {
                if s.active.contains(&name) {
                    Self::ok("active")
                } else {
                    Self::fail("inactive")
                }
            }
            "daemon-reload" => Self::ok(""),
            "enable" => {
                s.enabled.insert(name);
                Self::ok("")
            }
            "disable" => {
                s.enabled.remove(&name);
                Self::ok("")
            }
            "start" | "restart" | "reload" => {
                let startable = name == "nginx" || self.unit_exists(&name);
                if !startable {
                    return Self::fail(&format!("Unit {name}.service not found."));
                }
                if verb == "reload" && !s.active.contains(&name) {
                    return Self::fail(&format!("{name}.service is not active, cannot reload."));
                }
                if !s.broken_services.contains(&name) {
                    s.active.insert(name);
                }
                Self::ok("")
            }
            "stop" => {
                s.active.remove(&name);
                Self::ok("")
            }
            other => Self::fail(&format!("unsupported systemctl verb {other}")),
        }
    }

    fn apt_get(&self, args: &[String]) -> Result<CommandOutput> {
        let mut s = self.state.lock().unwrap();
        if args.iter().any(|a| a == "update") {
            return Self::ok("Reading package lists... Done");
        }
        if s.apt_failures > 0 {
            s.apt_failures -= 1;
            return Self::fail("E: Failed to fetch http://archive.ubuntu.com/ubuntu/pool/main/n/nginx.deb  Temporary failure resolving 'archive.ubuntu.com'");
        }
        for pkg in args.iter().filter(|a| !a.starts_with('-') && *a != "install") {
            s.installed_packages.insert(pkg.clone());
        }
        Self::ok("Setting up packages ... done")
    }

    fn git_clone(&self, args: &[String]) -> Result<CommandOutput> {
        let dest = PathBuf::from(args.last().cloned().unwrap_or_default());
        std::fs::create_dir_all(dest.join(".git"))?;
        std::fs::create_dir_all(dest.join("static"))?;
        std::fs::write(dest.join("static/index.html"), "<html></html>")?;
        std::fs::write(dest.join("README.md"), "app")?;
        Self::ok("Cloning into ... done.")
    }

    fn openssl(&self, args: &[String]) -> Result<CommandOutput> {
        let key = Self::flag_value(args, "-keyout").map(PathBuf::from);
        let out = Self::flag_value(args, "-out").map(PathBuf::from);
        match (key, out) {
            (Some(key), Some(out)) => {
                for p in [&key, &out] {
                    if let Some(parent) = p.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                std::fs::write(&key, FIXTURE_KEY)?;
                std::fs::write(&out, FIXTURE_CERT)?;
                Self::ok("")
            }
            _ => Self::fail("usage"),
        }
    }

    fn certbot(&self, args: &[String]) -> Result<CommandOutput> {
        let scripted = self.state.lock().unwrap().certbot_results.pop_front();
        if let Some(Err(stderr)) = scripted {
            return Self::fail(&stderr);
        }
        let name = Self::flag_value(args, "--cert-name").unwrap_or("default");
        let live = crate::paths::acme_live_dir(&self.root, name);
        std::fs::create_dir_all(&live)?;
        std::fs::write(live.join(crate::paths::FULLCHAIN_PEM), FIXTURE_CERT)?;
        std::fs::write(live.join(crate::paths::PRIVKEY_PEM), FIXTURE_KEY)?;
        Self::ok("Successfully received certificate.")
    }
}

impl CommandRunner for FakeHost {
    fn run(&self, cmd: &HostCommand) -> Result<CommandOutput> {
        self.state.lock().unwrap().calls.push(cmd.display());
        let args = &cmd.args;
        let last = args.last().cloned().unwrap_or_default();
        match cmd.program.as_str() {
            "id" => {
                if self.state.lock().unwrap().users.contains(&last) {
                    Self::ok("999")
                } else {
                    Self::fail(&format!("id: '{last}': no such user"))
                }
            }
            "useradd" => {
                let mut s = self.state.lock().unwrap();
                if !s.users.insert(last.clone()) {
                    return Self::fail(&format!("useradd: user '{last}' already exists"));
                }
                Self::ok("")
            }
            "userdel" => {
                let mut s = self.state.lock().unwrap();
                if !s.users.remove(&last) {
                    return Self::fail(&format!("userdel: user '{last}' does not exist"));
                }
                Self::ok("")
            }
            "systemctl" => self.systemctl(args),
            "journalctl" => {
                let journal = self.state.lock().unwrap().journal.join("\n");
                Self::ok(&journal)
            }
            "nginx" => {
                if self.state.lock().unwrap().nginx_config_ok {
                    Self::ok("nginx: configuration file /etc/nginx/nginx.conf test is successful")
                } else {
                    Self::fail("nginx: [emerg] unexpected \"}\" in /etc/nginx/sites-enabled/app:12")
                }
            }
            "dpkg-query" => {
                if self.state.lock().unwrap().installed_packages.contains(&last) {
                    Self::ok("install ok installed")
                } else {
                    Self::fail(&format!("dpkg-query: no packages found matching {last}"))
                }
            }
            "apt-get" => self.apt_get(args),
            "git" if args.first().map(String::as_str) == Some("clone") => self.git_clone(args),
            "openssl" => self.openssl(args),
            "certbot" => self.certbot(args),
            "chown" | "chmod" | "runuser" | "crontab" | "ufw" | "pkill" => Self::ok(""),
            other if self.state.lock().unwrap().programs.contains(other) => Self::ok(""),
            other => Err(HostforgeError::Command {
                command: cmd.display(),
                detail: format!("failed to spawn: {other}: not found"),
            }),
        }
    }

    fn has_program(&self, program: &str) -> bool {
        self.state.lock().unwrap().programs.contains(program)
    }
}

/// Settings tuned for tests: no real sleeps, metadata disabled, one
/// required artifact and one optional artifact.
pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.retry.initial_backoff_ms = 1;
    settings.health.interval_ms = 1;
    settings.health.attempts = 3;
    settings.inspect.active_interval_ms = 1;
    settings.inspect.active_attempts = 2;
    settings.metadata.enabled = false;
    settings.packages = vec!["nginx".to_string(), "git".to_string()];
    settings.artifacts = vec![
        crate::settings::ArtifactSpec {
            name: "stt-model".to_string(),
            url: "https://models.example.com/stt.bin".to_string(),
            destination: "models/stt.bin".to_string(),
            sha256: None,
            version_probe: None,
            version: Some("1".to_string()),
            required: true,
            mode: Some(0o644),
        },
        crate::settings::ArtifactSpec {
            name: "tts-voice".to_string(),
            url: "https://models.example.com/tts.onnx".to_string(),
            destination: "models/tts.onnx".to_string(),
            sha256: None,
            version_probe: None,
            version: None,
            required: false,
            mode: None,
        },
    ];
    settings
}

pub struct Harness {
    pub dir: TempDir,
    pub host: FakeHost,
    pub ctx: RunContext,
}

pub fn harness() -> Harness {
    harness_with(test_settings())
}

pub fn harness_with(settings: Settings) -> Harness {
    let dir = TempDir::new().unwrap();
    let host = FakeHost::new(dir.path());
    let ctx = RunContext::with_settings(
        Target::new(dir.path()),
        settings,
        Box::new(host.clone()),
    )
    .unwrap();
    Harness { dir, host, ctx }
}
