//! Derive the deployment state of a target from live evidence.
//!
//! Nothing is persisted: every call re-reads the host. Inspection has no side
//! effects and runs before any mutating step.

use crate::context::RunContext;
use crate::host::HostCommand;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    Absent,
    Partial,
    Installed,
    Broken,
}

impl std::fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeploymentState::Absent => "absent",
            DeploymentState::Partial => "partial",
            DeploymentState::Installed => "installed",
            DeploymentState::Broken => "broken",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    pub name: String,
    pub present: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inspection {
    pub state: DeploymentState,
    pub evidence: Vec<Evidence>,
}

impl Inspection {
    pub fn present(&self, name: &str) -> bool {
        self.evidence.iter().any(|e| e.name == name && e.present)
    }
}

/// Evidence names, in check order.
pub const EVIDENCE_USER: &str = "runtime-user";
pub const EVIDENCE_APP_DIR: &str = "app-dir";
pub const EVIDENCE_UNIT: &str = "service-unit";
pub const EVIDENCE_SITE: &str = "proxy-site";
pub const EVIDENCE_ACTIVE: &str = "service-active";

pub fn user_exists(ctx: &RunContext, user: &str) -> bool {
    ctx.runner.probe(
        &HostCommand::new("id")
            .args(["-u", user])
            .timeout(Duration::from_secs(10)),
    )
}

pub fn inspect(ctx: &RunContext) -> Inspection {
    let root = ctx.root();
    let app = ctx.app_name();
    let user = ctx.app_user();
    let app_dir = ctx.app_dir();
    let unit = paths::unit_path(root, app);
    let site = paths::site_available_path(root, ctx.settings.site_name());

    let mut evidence = vec![
        Evidence {
            name: EVIDENCE_USER.to_string(),
            present: user_exists(ctx, user),
            detail: format!("user {user}"),
        },
        Evidence {
            name: EVIDENCE_APP_DIR.to_string(),
            present: app_dir.is_dir(),
            detail: ctx.target.host_path(&app_dir).display().to_string(),
        },
        Evidence {
            name: EVIDENCE_UNIT.to_string(),
            present: unit.is_file(),
            detail: ctx.target.host_path(&unit).display().to_string(),
        },
        Evidence {
            name: EVIDENCE_SITE.to_string(),
            present: site.is_file(),
            detail: ctx.target.host_path(&site).display().to_string(),
        },
    ];
    let structural = evidence.iter().filter(|e| e.present).count();
    let complete = structural == evidence.len();

    // Only a complete install earns the bounded wait; a fresh start may
    // still be coming up.
    let attempts = if complete {
        ctx.settings.inspect.active_attempts.max(1)
    } else {
        1
    };
    let active = poll_active(ctx, app, attempts);
    evidence.push(Evidence {
        name: EVIDENCE_ACTIVE.to_string(),
        present: active,
        detail: format!("systemctl is-active {app}"),
    });

    let state = classify(structural, complete, active);
    ctx.log
        .info("inspect", format!("deployment state: {state} ({structural}/4 present, active={active})"));
    Inspection { state, evidence }
}

fn poll_active(ctx: &RunContext, service: &str, attempts: u32) -> bool {
    let interval = Duration::from_millis(ctx.settings.inspect.active_interval_ms);
    for attempt in 1..=attempts {
        if ctx.runner.probe(
            &HostCommand::new("systemctl")
                .args(["is-active", "--quiet", service])
                .timeout(Duration::from_secs(10)),
        ) {
            return true;
        }
        if attempt < attempts {
            std::thread::sleep(interval);
        }
    }
    false
}

fn classify(structural: usize, complete: bool, active: bool) -> DeploymentState {
    match (structural, complete, active) {
        (0, _, false) => DeploymentState::Absent,
        (_, true, true) => DeploymentState::Installed,
        (_, true, false) => DeploymentState::Broken,
        _ => DeploymentState::Partial,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::harness;

    fn touch(path: &std::path::Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "x").unwrap();
    }

    #[test]
    fn empty_host_is_absent() {
        let h = harness();
        let inspection = inspect(&h.ctx);
        assert_eq!(inspection.state, DeploymentState::Absent);
        assert_eq!(inspection.evidence.len(), 5);
        assert!(inspection.evidence.iter().all(|e| !e.present));
    }

    #[test]
    fn unit_without_app_dir_is_partial() {
        let h = harness();
        touch(&paths::unit_path(h.dir.path(), "assistant"));
        let inspection = inspect(&h.ctx);
        assert_eq!(inspection.state, DeploymentState::Partial);
        assert!(inspection.present(EVIDENCE_UNIT));
        assert!(!inspection.present(EVIDENCE_APP_DIR));
    }

    fn full_layout(h: &crate::testing::Harness) {
        let root = h.dir.path();
        h.host.with_state(|s| {
            s.users.insert("assistant".to_string());
        });
        std::fs::create_dir_all(paths::app_dir(root, "assistant")).unwrap();
        touch(&paths::unit_path(root, "assistant"));
        touch(&paths::site_available_path(root, "assistant"));
    }

    #[test]
    fn complete_and_active_is_installed() {
        let h = harness();
        full_layout(&h);
        h.host.with_state(|s| {
            s.active.insert("assistant".to_string());
        });
        assert_eq!(inspect(&h.ctx).state, DeploymentState::Installed);
    }

    #[test]
    fn complete_but_inactive_is_broken_after_bounded_wait() {
        let h = harness();
        full_layout(&h);
        assert_eq!(inspect(&h.ctx).state, DeploymentState::Broken);
        assert_eq!(
            h.host.count_calls("systemctl is-active"),
            h.ctx.settings.inspect.active_attempts as usize
        );
    }

    #[test]
    fn inspection_has_no_side_effects() {
        let h = harness();
        inspect(&h.ctx);
        let calls = h.host.calls();
        assert!(calls
            .iter()
            .all(|c| c.starts_with("id ") || c.starts_with("systemctl is-active")));
    }

    #[test]
    fn classify_table() {
        assert_eq!(classify(0, false, false), DeploymentState::Absent);
        assert_eq!(classify(0, false, true), DeploymentState::Partial);
        assert_eq!(classify(2, false, true), DeploymentState::Partial);
        assert_eq!(classify(4, true, true), DeploymentState::Installed);
        assert_eq!(classify(4, true, false), DeploymentState::Broken);
    }
}
