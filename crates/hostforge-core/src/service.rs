//! Supervised-service lifecycle through systemd.
//!
//! [`ServiceController`] registers units, drives start/stop/restart/reload,
//! and waits for health after any start. The reverse proxy is managed with
//! the same controller; its unit belongs to the distribution package, so it
//! carries no `unit_definition`.

use crate::context::RunContext;
use crate::error::{HostforgeError, Result};
use crate::host::HostCommand;
use crate::io;
use crate::paths;
use crate::probe::{is_healthy_status, HttpProbe};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const PROXY_SERVICE: &str = "nginx";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    EnabledRunning,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthCheck {
    /// `systemctl is-active` reports active.
    Active,
    /// Active, and `url` answers with a 2xx/3xx status.
    Http { url: String },
}

#[derive(Debug, Clone)]
pub struct ManagedService {
    pub name: String,
    /// Rendered unit file; `None` for units owned by a distribution package.
    pub unit_definition: Option<String>,
    pub desired_state: DesiredState,
    pub health_check: HealthCheck,
}

impl ManagedService {
    pub fn proxy() -> Self {
        Self {
            name: PROXY_SERVICE.to_string(),
            unit_definition: None,
            desired_state: DesiredState::EnabledRunning,
            health_check: HealthCheck::Active,
        }
    }
}

pub struct ServiceController<'c> {
    ctx: &'c RunContext,
    probe: &'c dyn HttpProbe,
}

impl<'c> ServiceController<'c> {
    pub fn new(ctx: &'c RunContext, probe: &'c dyn HttpProbe) -> Self {
        Self { ctx, probe }
    }

    fn systemctl(&self, verb: &str, name: &str) -> Result<String> {
        self.ctx.exec(
            name,
            HostCommand::new("systemctl").args([verb, name]),
        )
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.ctx.runner.probe(
            &HostCommand::new("systemctl")
                .args(["is-active", "--quiet", name])
                .timeout(Duration::from_secs(10)),
        )
    }

    /// Write the unit (if changed), reload systemd and enable it.
    /// Returns whether the unit file changed.
    pub fn register(&self, service: &ManagedService) -> Result<bool> {
        let mut changed = false;
        if let Some(unit) = &service.unit_definition {
            let path = paths::unit_path(self.ctx.root(), &service.name);
            changed = io::write_if_changed(&path, unit.as_bytes(), Some(0o644))?;
            if changed {
                self.ctx
                    .log
                    .info(&service.name, format!("wrote {}", path.display()));
                self.ctx
                    .exec(&service.name, HostCommand::new("systemctl").arg("daemon-reload"))?;
            }
        }
        self.systemctl("enable", &service.name)?;
        Ok(changed)
    }

    pub fn start(&self, service: &ManagedService) -> Result<()> {
        self.systemctl("start", &service.name)?;
        self.wait_healthy(service)
    }

    pub fn restart(&self, service: &ManagedService) -> Result<()> {
        self.systemctl("restart", &service.name)?;
        self.wait_healthy(service)
    }

    pub fn stop(&self, service: &ManagedService) -> Result<()> {
        self.systemctl("stop", &service.name).map(|_| ())
    }

    /// Reload configuration without a restart. Fails if the service is down.
    pub fn reload(&self, service: &ManagedService) -> Result<()> {
        self.systemctl("reload", &service.name).map(|_| ())
    }

    /// Stop, disable and remove the unit. Safe when already gone.
    pub fn unregister(&self, service: &ManagedService) -> Result<()> {
        let unit = paths::unit_path(self.ctx.root(), &service.name);
        if self.is_active(&service.name) {
            self.stop(service)?;
        }
        if unit.exists() {
            self.systemctl("disable", &service.name)?;
        }
        if service.unit_definition.is_some() && io::remove_file_if_exists(&unit)? {
            self.ctx
                .log
                .info(&service.name, format!("removed {}", unit.display()));
            self.ctx
                .exec(&service.name, HostCommand::new("systemctl").arg("daemon-reload"))?;
        }
        Ok(())
    }

    /// Converge `service` to its desired state. With `changed`, a running
    /// service is restarted so it picks up new configuration.
    pub fn ensure(&self, service: &ManagedService, changed: bool) -> Result<()> {
        match service.desired_state {
            DesiredState::Disabled => self.unregister(service),
            DesiredState::EnabledRunning => {
                let unit_changed = self.register(service)?;
                if !self.is_active(&service.name) {
                    self.start(service)
                } else if changed || unit_changed {
                    self.restart(service)
                } else {
                    self.ctx
                        .log
                        .info(&service.name, "running and unchanged; leaving alone");
                    Ok(())
                }
            }
        }
    }

    pub fn healthy(&self, service: &ManagedService) -> bool {
        if !self.is_active(&service.name) {
            return false;
        }
        match &service.health_check {
            HealthCheck::Active => true,
            HealthCheck::Http { url } => self
                .probe
                .status(url)
                .map(is_healthy_status)
                .unwrap_or(false),
        }
    }

    /// Poll [`ServiceController::healthy`] up to the configured attempts.
    /// Exhaustion yields [`HostforgeError::ServiceStart`] with the tail of
    /// the service journal.
    pub fn wait_healthy(&self, service: &ManagedService) -> Result<()> {
        let health = &self.ctx.settings.health;
        let interval = Duration::from_millis(health.interval_ms);
        for attempt in 1..=health.attempts {
            if self.healthy(service) {
                self.ctx.log.info(
                    &service.name,
                    format!("healthy after {attempt} check(s)"),
                );
                return Ok(());
            }
            if attempt < health.attempts {
                std::thread::sleep(interval);
            }
        }
        let diagnostics = self.diagnostics(&service.name);
        self.ctx.log.error(
            &service.name,
            format!("not healthy after {} check(s)", health.attempts),
        );
        self.ctx.log.output(&service.name, &diagnostics);
        Err(HostforgeError::ServiceStart {
            service: service.name.clone(),
            attempts: health.attempts,
            diagnostics,
        })
    }

    fn diagnostics(&self, name: &str) -> String {
        let lines = self.ctx.settings.health.diagnostic_lines;
        let cmd = HostCommand::new("journalctl")
            .args(["-u", name, "--no-pager", "-n"])
            .arg(lines.to_string())
            .timeout(Duration::from_secs(15));
        match self.ctx.runner.run(&cmd) {
            Ok(out) => out.tail(lines),
            Err(e) => format!("(journal unavailable: {e})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::harness;

    struct FixedProbe(u16);

    impl HttpProbe for FixedProbe {
        fn status(&self, _url: &str) -> Result<u16> {
            Ok(self.0)
        }
    }

    fn app(name: &str) -> ManagedService {
        ManagedService {
            name: name.to_string(),
            unit_definition: Some("[Service]\nExecStart=/bin/true\n".to_string()),
            desired_state: DesiredState::EnabledRunning,
            health_check: HealthCheck::Active,
        }
    }

    #[test]
    fn ensure_registers_and_starts_once() {
        let h = harness();
        let probe = FixedProbe(200);
        let ctl = ServiceController::new(&h.ctx, &probe);
        let svc = app("assistant");

        ctl.ensure(&svc, false).unwrap();
        assert!(paths::unit_path(h.dir.path(), "assistant").exists());
        assert!(h.host.with_state(|s| s.active.contains("assistant")));
        assert_eq!(h.host.count_calls("systemctl daemon-reload"), 1);

        ctl.ensure(&svc, false).unwrap();
        assert_eq!(h.host.count_calls("systemctl daemon-reload"), 1);
        assert_eq!(h.host.count_calls("systemctl start assistant"), 1);
        assert_eq!(h.host.count_calls("systemctl restart assistant"), 0);
    }

    #[test]
    fn ensure_restarts_running_service_on_change() {
        let h = harness();
        let probe = FixedProbe(200);
        let ctl = ServiceController::new(&h.ctx, &probe);
        let svc = app("assistant");
        ctl.ensure(&svc, false).unwrap();
        ctl.ensure(&svc, true).unwrap();
        assert_eq!(h.host.count_calls("systemctl restart assistant"), 1);
    }

    #[test]
    fn health_exhaustion_carries_journal_tail() {
        let h = harness();
        h.host.with_state(|s| {
            s.broken_services.insert("assistant".to_string());
            s.journal = vec!["starting".into(), "ImportError: no module named app".into()];
        });
        let probe = FixedProbe(200);
        let ctl = ServiceController::new(&h.ctx, &probe);
        let err = ctl.ensure(&app("assistant"), false).unwrap_err();
        match err {
            HostforgeError::ServiceStart {
                attempts,
                diagnostics,
                ..
            } => {
                assert_eq!(attempts, h.ctx.settings.health.attempts);
                assert!(diagnostics.contains("ImportError"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn http_health_check_requires_good_status() {
        let h = harness();
        let probe = FixedProbe(502);
        let ctl = ServiceController::new(&h.ctx, &probe);
        let mut svc = app("assistant");
        svc.health_check = HealthCheck::Http {
            url: "http://127.0.0.1:8000/health".to_string(),
        };
        assert!(ctl.ensure(&svc, false).is_err());
    }

    #[test]
    fn unregister_is_safe_when_absent() {
        let h = harness();
        let probe = FixedProbe(200);
        let ctl = ServiceController::new(&h.ctx, &probe);
        let svc = app("assistant");
        ctl.unregister(&svc).unwrap();
        assert_eq!(h.host.count_calls("systemctl disable"), 0);

        ctl.ensure(&svc, false).unwrap();
        ctl.unregister(&svc).unwrap();
        assert!(!paths::unit_path(h.dir.path(), "assistant").exists());
        assert!(!h.host.with_state(|s| s.active.contains("assistant")));
    }
}
