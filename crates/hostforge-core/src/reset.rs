//! Teardown back to `Absent`, in inverse dependency order.
//!
//! Each removal is a pipeline step whose precondition is "the thing still
//! exists", so reset is safe to repeat and a no-op on an absent target.

use crate::context::RunContext;
use crate::error::{HostforgeError, Result};
use crate::host::HostCommand;
use crate::inspect::{self, DeploymentState, Inspection};
use crate::io;
use crate::paths;
use crate::pipeline::{Pipeline, PipelineRun, Progress, Step};
use crate::probe::HttpProbe;
use crate::service::{DesiredState, HealthCheck, ManagedService, ServiceController};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default)]
pub struct ResetOptions {
    /// Also remove the ConfigArtifact and its sidecar.
    pub purge_config: bool,
}

#[derive(Debug)]
pub struct ResetOutcome {
    pub initial: Inspection,
    /// `None` when the target was already absent.
    pub run: Option<PipelineRun>,
    pub final_state: DeploymentState,
}

/// Teardown never waits for health, so its controller never probes.
struct NoProbe;

impl HttpProbe for NoProbe {
    fn status(&self, url: &str) -> Result<u16> {
        Err(HostforgeError::Http(format!("{url}: not probed during teardown")))
    }
}

fn letsencrypt_paths(ctx: &RunContext) -> Vec<PathBuf> {
    let name = ctx.app_name();
    let le = ctx.root().join("etc/letsencrypt");
    vec![
        paths::acme_live_dir(ctx.root(), name),
        le.join("archive").join(name),
        le.join("renewal").join(format!("{name}.conf")),
        paths::acme_webroot(ctx.root(), name),
    ]
}

fn certificate_paths(ctx: &RunContext) -> Vec<PathBuf> {
    let mut all = vec![
        paths::tls_dir(ctx.root()),
        paths::cert_record_path(ctx.root()),
        paths::cron_path(ctx.root(), ctx.app_name()),
    ];
    all.extend(letsencrypt_paths(ctx));
    all
}

fn remove_path(ctx: &RunContext, scope: &str, path: &std::path::Path) -> Result<()> {
    let removed = if path.is_dir() {
        io::remove_dir_if_exists(path)?
    } else {
        io::remove_file_if_exists(path)?
    };
    if removed {
        ctx.log
            .info(scope, format!("removed {}", ctx.target.host_path(path).display()));
    }
    Ok(())
}

/// Run a cleanup command whose failure is only worth a warning.
fn best_effort(ctx: &RunContext, scope: &str, cmd: HostCommand) {
    let cmd = cmd.timeout(Duration::from_secs(30));
    ctx.log.info(scope, format!("$ {}", cmd.display()));
    match ctx.runner.run(&cmd) {
        Ok(out) if out.success() => {}
        Ok(out) => ctx.log.warn(scope, format!("ignored: {}", out.tail(2))),
        Err(e) => ctx.log.warn(scope, format!("ignored: {e}")),
    }
}

fn teardown_pipeline<'a>(
    controller: &'a ServiceController<'a>,
    opts: ResetOptions,
) -> Pipeline<'a> {
    let mut pipeline = Pipeline::new();

    pipeline.push(
        Step::new("app-service", move |ctx: &RunContext| {
            let unit = paths::unit_path(ctx.root(), ctx.app_name());
            let service = ManagedService {
                name: ctx.app_name().to_string(),
                unit_definition: Some(std::fs::read_to_string(&unit).unwrap_or_default()),
                desired_state: DesiredState::Disabled,
                health_check: HealthCheck::Active,
            };
            controller.ensure(&service, false)
        })
        .when(move |ctx: &RunContext| {
            paths::unit_path(ctx.root(), ctx.app_name()).exists()
                || controller.is_active(ctx.app_name())
        })
        .verify(|ctx: &RunContext| !paths::unit_path(ctx.root(), ctx.app_name()).exists()),
    );

    pipeline.push(
        Step::new("proxy-site", move |ctx: &RunContext| {
            let site = ctx.settings.site_name();
            remove_path(ctx, "proxy-site", &paths::site_enabled_path(ctx.root(), site))?;
            remove_path(ctx, "proxy-site", &paths::site_available_path(ctx.root(), site))?;

            restore_default_site(ctx)?;

            let proxy = ManagedService::proxy();
            if controller.is_active(&proxy.name) {
                ctx.exec("proxy-site", HostCommand::new("nginx").arg("-t"))?;
                controller.reload(&proxy)?;
            }
            Ok(())
        })
        .when(|ctx: &RunContext| {
            let site = ctx.settings.site_name();
            paths::site_available_path(ctx.root(), site).exists()
                || paths::site_enabled_path(ctx.root(), site).exists()
                || paths::default_site_backup_path(ctx.root()).exists()
                || paths::default_site_link_backup_path(ctx.root()).exists()
        })
        .verify(|ctx: &RunContext| {
            let site = ctx.settings.site_name();
            !paths::site_available_path(ctx.root(), site).exists()
                && !paths::site_enabled_path(ctx.root(), site).exists()
        }),
    );

    pipeline.push(
        Step::new("certificate", |ctx: &RunContext| {
            for path in certificate_paths(ctx) {
                remove_path(ctx, "certificate", &path)?;
            }
            Ok(())
        })
        .when(|ctx: &RunContext| certificate_paths(ctx).iter().any(|p| p.exists()))
        .verify(|ctx: &RunContext| certificate_paths(ctx).iter().all(|p| !p.exists())),
    );

    pipeline.push(
        Step::new("app-dir", |ctx: &RunContext| {
            remove_path(ctx, "app-dir", &ctx.app_dir())?;
            remove_path(ctx, "app-dir", &paths::versions_path(ctx.root()))
        })
        .when(|ctx: &RunContext| ctx.app_dir().exists() || paths::versions_path(ctx.root()).exists())
        .verify(|ctx: &RunContext| !ctx.app_dir().exists()),
    );

    pipeline.push(
        Step::new("runtime-user", |ctx: &RunContext| {
            let user = ctx.app_user();
            best_effort(ctx, "runtime-user", HostCommand::new("crontab").args(["-r", "-u", user]));
            best_effort(ctx, "runtime-user", HostCommand::new("pkill").args(["-u", user]));
            ctx.exec("runtime-user", HostCommand::new("userdel").args(["-r", user]))?;
            Ok(())
        })
        .when(|ctx: &RunContext| inspect::user_exists(ctx, ctx.app_user()))
        .verify(|ctx: &RunContext| !inspect::user_exists(ctx, ctx.app_user())),
    );

    pipeline.push(
        Step::new("firewall", |ctx: &RunContext| {
            let ufw = |args: &[&str]| {
                ctx.exec("firewall", HostCommand::new("ufw").args(args.iter().copied()))
            };
            ufw(&["--force", "reset"])?;
            ufw(&["default", "deny", "incoming"])?;
            ufw(&["default", "allow", "outgoing"])?;
            for rule in &ctx.settings.firewall.allow {
                ufw(&["allow", rule.as_str()])?;
            }
            ufw(&["--force", "enable"])?;
            Ok(())
        })
        .when(|ctx: &RunContext| {
            ctx.settings.firewall.manage && ctx.runner.has_program("ufw")
        }),
    );

    pipeline.push(
        Step::new("transient-files", |ctx: &RunContext| {
            remove_path(ctx, "transient-files", &paths::tmp_dir(ctx.root()))
        })
        .when(|ctx: &RunContext| paths::tmp_dir(ctx.root()).exists())
        .verify(|ctx: &RunContext| !paths::tmp_dir(ctx.root()).exists()),
    );

    if opts.purge_config {
        pipeline.push(
            Step::new("config", |ctx: &RunContext| {
                let app = ctx.app_name();
                remove_path(ctx, "config", &paths::config_artifact_path(ctx.root(), app))?;
                remove_path(ctx, "config", &paths::config_meta_path(ctx.root(), app))
            })
            .when(|ctx: &RunContext| {
                paths::config_artifact_path(ctx.root(), ctx.app_name()).exists()
                    || paths::config_meta_path(ctx.root(), ctx.app_name()).exists()
            }),
        );
    }

    pipeline
}

/// Put the stock default site back as it was found: the original symlink
/// when one was saved, the saved file content otherwise.
fn restore_default_site(ctx: &RunContext) -> Result<()> {
    let root = ctx.root();
    let default_site = paths::default_site_path(root);
    let backup = paths::default_site_backup_path(root);
    let link_backup = paths::default_site_link_backup_path(root);

    if std::fs::symlink_metadata(&default_site).is_err() {
        let link_target = std::fs::read_to_string(&link_backup).ok();
        match link_target.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            Some(target) => {
                if let Some(parent) = default_site.parent() {
                    io::ensure_dir(parent)?;
                }
                std::os::unix::fs::symlink(target, &default_site)?;
                ctx.log
                    .info("proxy-site", format!("restored the default site link to {target}"));
            }
            None if backup.is_file() => {
                io::atomic_write(&default_site, &std::fs::read(&backup)?)?;
                ctx.log.info("proxy-site", "restored the default site");
            }
            None => {}
        }
    }
    io::remove_file_if_exists(&link_backup)?;
    io::remove_file_if_exists(&backup)?;
    Ok(())
}

/// Tear the target down and return the re-inspected state.
pub fn reset(ctx: &RunContext, opts: ResetOptions, progress: &dyn Progress) -> Result<ResetOutcome> {
    let initial = inspect::inspect(ctx);
    if initial.state == DeploymentState::Absent {
        ctx.log.info("reset", "target is absent; nothing to tear down");
        return Ok(ResetOutcome {
            initial,
            run: None,
            final_state: DeploymentState::Absent,
        });
    }

    ctx.log.info("reset", format!("tearing down a {} installation", initial.state));
    let probe = NoProbe;
    let controller = ServiceController::new(ctx, &probe);
    let run = teardown_pipeline(&controller, opts).run_into(ctx, progress, PipelineRun::new());
    let run = match run.into_result() {
        Ok(run) => run,
        Err((_, e)) => return Err(e),
    };

    let final_state = inspect::inspect(ctx).state;
    if final_state == DeploymentState::Absent {
        ctx.log.info("reset", "target is absent");
    } else {
        ctx.log
            .warn("reset", format!("target is {final_state} after teardown"));
    }
    Ok(ResetOutcome {
        initial,
        run: Some(run),
        final_state,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{NoProgress, StepStatus};
    use crate::testing::{harness, Harness, FIXTURE_CERT};

    fn touch(path: &std::path::Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn installed(h: &Harness) {
        let root = h.dir.path();
        h.host.with_state(|s| {
            s.users.insert("assistant".to_string());
            s.active.insert("assistant".to_string());
            s.active.insert("nginx".to_string());
        });
        touch(&h.ctx.app_dir().join("static/index.html"), "<html></html>");
        touch(&paths::unit_path(root, "assistant"), "[Unit]\n");
        touch(&paths::site_available_path(root, "assistant"), "server {}\n");
        touch(&paths::site_enabled_path(root, "assistant"), "server {}\n");
        touch(&paths::default_site_backup_path(root), "# stock default\n");
        touch(&paths::tls_dir(root).join(paths::FULLCHAIN_PEM), FIXTURE_CERT);
        touch(&paths::cron_path(root, "assistant"), "0 3 * * * root hostforge cert renew\n");
        touch(&paths::tmp_dir(root).join(".download-x"), "partial");
        touch(&paths::config_artifact_path(root, "assistant"), "AI_API_KEY=sk-1\n");
    }

    #[test]
    fn absent_target_is_a_noop() {
        let h = harness();
        let outcome = reset(&h.ctx, ResetOptions::default(), &NoProgress).unwrap();
        assert_eq!(outcome.final_state, DeploymentState::Absent);
        assert!(outcome.run.is_none());
        assert!(h
            .host
            .calls()
            .iter()
            .all(|c| c.starts_with("id ") || c.starts_with("systemctl is-active")));
    }

    #[test]
    fn installed_target_converges_to_absent() {
        let h = harness();
        installed(&h);
        let root = h.dir.path();
        let outcome = reset(&h.ctx, ResetOptions::default(), &NoProgress).unwrap();
        assert_eq!(outcome.initial.state, DeploymentState::Installed);
        assert_eq!(outcome.final_state, DeploymentState::Absent);

        assert!(!h.ctx.app_dir().exists());
        assert!(!paths::site_enabled_path(root, "assistant").exists());
        assert!(!paths::tls_dir(root).exists());
        assert!(!paths::cron_path(root, "assistant").exists());
        assert!(!paths::tmp_dir(root).exists());
        assert_eq!(
            std::fs::read_to_string(paths::default_site_path(root)).unwrap(),
            "# stock default\n"
        );
        // Kept by default so a reinstall preserves operator secrets.
        assert!(paths::config_artifact_path(root, "assistant").exists());

        assert_eq!(h.host.count_calls("systemctl stop assistant"), 1);
        assert_eq!(h.host.count_calls("systemctl reload nginx"), 1);
        assert_eq!(h.host.count_calls("userdel -r assistant"), 1);
        assert_eq!(h.host.count_calls("ufw default deny incoming"), 1);
        assert_eq!(h.host.count_calls("ufw allow OpenSSH"), 1);
    }

    #[test]
    fn stock_default_site_link_is_restored_as_a_link() {
        let h = harness();
        let root = h.dir.path();
        let stock = root.join("etc/nginx/sites-available/default");
        touch(&stock, "# stock default\n");
        let default_site = paths::default_site_path(root);
        std::fs::create_dir_all(default_site.parent().unwrap()).unwrap();
        std::os::unix::fs::symlink("../sites-available/default", &default_site).unwrap();

        crate::provision::install_proxy_site(&h.ctx, "server {}\n").unwrap();
        assert!(std::fs::symlink_metadata(&default_site).is_err());
        assert!(paths::default_site_link_backup_path(root).is_file());

        installed(&h);
        let outcome = reset(&h.ctx, ResetOptions::default(), &NoProgress).unwrap();
        assert_eq!(outcome.final_state, DeploymentState::Absent);

        let meta = std::fs::symlink_metadata(&default_site).unwrap();
        assert!(meta.file_type().is_symlink());
        assert_eq!(
            std::fs::read_link(&default_site).unwrap(),
            std::path::PathBuf::from("../sites-available/default")
        );
        assert_eq!(std::fs::read_to_string(&default_site).unwrap(), "# stock default\n");
        assert!(!paths::default_site_link_backup_path(root).exists());
        assert!(!paths::default_site_backup_path(root).exists());
    }

    #[test]
    fn second_reset_is_a_noop() {
        let h = harness();
        installed(&h);
        reset(&h.ctx, ResetOptions::default(), &NoProgress).unwrap();
        let before = h.host.calls().len();
        let outcome = reset(&h.ctx, ResetOptions::default(), &NoProgress).unwrap();
        assert!(outcome.run.is_none());
        assert!(h.host.calls()[before..]
            .iter()
            .all(|c| !c.starts_with("userdel") && !c.starts_with("ufw")));
    }

    #[test]
    fn purge_config_removes_artifact() {
        let h = harness();
        installed(&h);
        let outcome = reset(
            &h.ctx,
            ResetOptions { purge_config: true },
            &NoProgress,
        )
        .unwrap();
        let run = outcome.run.unwrap();
        assert_eq!(run.status_of("config"), Some(StepStatus::Success));
        assert!(!paths::config_artifact_path(h.dir.path(), "assistant").exists());
    }

    #[test]
    fn partial_target_only_removes_what_exists() {
        let h = harness();
        touch(&paths::unit_path(h.dir.path(), "assistant"), "[Unit]\n");
        h.host.with_state(|s| {
            s.programs.remove("ufw");
        });
        let outcome = reset(&h.ctx, ResetOptions::default(), &NoProgress).unwrap();
        assert_eq!(outcome.initial.state, DeploymentState::Partial);
        assert_eq!(outcome.final_state, DeploymentState::Absent);
        let run = outcome.run.unwrap();
        assert_eq!(run.status_of("app-service"), Some(StepStatus::Success));
        assert_eq!(run.status_of("runtime-user"), Some(StepStatus::Skipped));
        assert_eq!(run.status_of("firewall"), Some(StepStatus::Skipped));
        assert_eq!(h.host.count_calls("systemctl disable assistant"), 1);
    }
}
