//! One provisioning run, end to end.
//!
//! Environment → inspection → existing-install branch → configuration →
//! step pipeline → validation → report. The pipeline halts at the first
//! failure; validation and the report happen regardless.

use crate::acquire::{self, Fetcher, PackageManager, VersionRegistry};
use crate::cert::{
    self, AcmeClient, CertManager, CertificateRecord, DnsResolver, IssuanceMethod,
};
use crate::config::{self, ConfigArtifact, ConfigurationProvider, OnExisting, SuppliedArgs};
use crate::context::RunContext;
use crate::env::{self, HostIdentity, MetadataProvider};
use crate::error::{HostforgeError, Result};
use crate::host::HostCommand;
use crate::inspect::{self, DeploymentState, Inspection};
use crate::io;
use crate::paths;
use crate::pipeline::{Pipeline, PipelineRun, PlannedStep, Progress, Step};
use crate::probe::HttpProbe;
use crate::reset::{self, ResetOptions};
use crate::service::{DesiredState, HealthCheck, ManagedService, ServiceController};
use crate::settings::{ArtifactSpec, WarnLevel};
use crate::template::{self, Vars};
use crate::validate::{self, Report};
use chrono::Utc;
use std::cell::{Cell, RefCell};
use std::path::Path;

/// Records the install command that last ran successfully.
const INSTALL_MARKER: &str = ".hostforge-install";

#[derive(Debug, Clone, Copy, Default)]
pub struct ProvisionOptions {
    /// Inspect and plan only; nothing on the host changes.
    pub check_only: bool,
    /// Restart the app service even when nothing it reads changed.
    pub force_restart: bool,
    /// Reset non-secret keys that have a default back to that default.
    pub force_defaults: bool,
}

/// Everything the run talks to outside of the host's command line.
pub struct Collaborators<'a> {
    pub metadata: Option<&'a dyn MetadataProvider>,
    pub fetcher: &'a dyn Fetcher,
    pub packages: &'a dyn PackageManager,
    pub acme: &'a dyn AcmeClient,
    pub dns: &'a dyn DnsResolver,
    pub probe: &'a dyn HttpProbe,
    pub provider: &'a ConfigurationProvider,
    pub progress: &'a dyn Progress,
}

#[derive(Debug)]
pub struct ProvisionOutcome {
    pub identity: HostIdentity,
    pub inspection: Inspection,
    pub decision: Option<OnExisting>,
    /// Filled by `check_only` runs.
    pub plan: Vec<PlannedStep>,
    /// `None` for `check_only` runs.
    pub run: Option<PipelineRun>,
    pub report: Report,
    pub warnings: Vec<String>,
}

impl ProvisionOutcome {
    /// The error that halted the pipeline, if any.
    pub fn error(&self) -> Option<&HostforgeError> {
        self.run.as_ref().and_then(|r| r.fatal.as_ref())
    }
}

// ---------------------------------------------------------------------------
// Rendering helpers (shared with the `cert` commands)
// ---------------------------------------------------------------------------

/// Variables schema defaults may reference.
pub fn identity_vars(ctx: &RunContext, identity: &HostIdentity) -> Vars {
    let mut vars = Vars::new();
    vars.insert(
        "app_dir".to_string(),
        ctx.target.host_path(&ctx.app_dir()).display().to_string(),
    );
    vars.insert("public_address".to_string(), identity.public_address.clone());
    vars.insert("instance_id".to_string(), identity.instance_id.clone());
    vars
}

pub fn synthesize_config(
    ctx: &RunContext,
    provider: &ConfigurationProvider,
    identity: &HostIdentity,
    force_defaults: bool,
) -> Result<ConfigArtifact> {
    let schema = &ctx.settings.config_keys;
    let defaults = config::build_defaults(schema, &identity_vars(ctx, identity));
    let existing = config::read_existing(ctx.root(), ctx.app_name())?;
    config::synthesize(schema, &defaults, &existing, provider, force_defaults)
}

fn app_service(ctx: &RunContext, artifact: &ConfigArtifact) -> Result<ManagedService> {
    let app_dir = ctx.target.host_path(&ctx.app_dir()).display().to_string();
    let mut known = artifact.vars();
    known.insert("app_dir".to_string(), app_dir.clone());

    let mut vars = Vars::new();
    vars.insert("app".to_string(), ctx.app_name().to_string());
    vars.insert("user".to_string(), ctx.app_user().to_string());
    vars.insert("app_dir".to_string(), app_dir);
    vars.insert(
        "env_file".to_string(),
        ctx.target
            .host_path(&paths::config_artifact_path(ctx.root(), ctx.app_name()))
            .display()
            .to_string(),
    );
    vars.insert(
        "start_command".to_string(),
        template::expand_known(&ctx.settings.app.start_command, &known),
    );

    Ok(ManagedService {
        name: ctx.app_name().to_string(),
        unit_definition: Some(template::render_unit(&vars)?),
        desired_state: DesiredState::EnabledRunning,
        health_check: HealthCheck::Http {
            url: validate::loopback_url(ctx, artifact),
        },
    })
}

/// The proxy site for `artifact`, with TLS when `record` is given.
pub fn render_proxy_site(
    ctx: &RunContext,
    artifact: &ConfigArtifact,
    record: Option<&CertificateRecord>,
) -> Result<String> {
    let mut vars = artifact.vars();
    let proxy = &ctx.settings.proxy;
    let domains = cert::domains_from(artifact);
    vars.insert("listen_port".to_string(), proxy.listen_port.to_string());
    vars.insert("tls_port".to_string(), proxy.tls_port.to_string());
    vars.insert(
        "server_name".to_string(),
        if domains.is_empty() {
            "_".to_string()
        } else {
            domains.join(" ")
        },
    );
    vars.insert(
        "acme_webroot".to_string(),
        ctx.target
            .host_path(&paths::acme_webroot(ctx.root(), ctx.app_name()))
            .display()
            .to_string(),
    );
    if let Some(r) = record {
        vars.insert("cert_path".to_string(), r.cert_path.clone());
        vars.insert("key_path".to_string(), r.key_path.clone());
    }
    template::render_site(&vars)
}

/// The certificate record, if its material is actually on disk.
fn active_certificate(ctx: &RunContext) -> Option<CertificateRecord> {
    CertificateRecord::load(ctx.root())
        .ok()
        .flatten()
        .filter(|r| {
            ctx.target.on_target(Path::new(&r.cert_path)).is_file()
                && ctx.target.on_target(Path::new(&r.key_path)).is_file()
        })
}

fn proxy_site_pending(ctx: &RunContext, content: &str) -> bool {
    let site = ctx.settings.site_name();
    let available = std::fs::read_to_string(paths::site_available_path(ctx.root(), site));
    available.map(|c| c != content).unwrap_or(true)
        || std::fs::symlink_metadata(paths::site_enabled_path(ctx.root(), site)).is_err()
        || std::fs::symlink_metadata(paths::default_site_path(ctx.root())).is_ok()
}

/// Install `content` as the proxy site, disabling (and saving) the stock
/// default site. The new configuration is checked with `nginx -t`; on failure
/// the previous site is put back. Returns whether anything changed.
pub fn install_proxy_site(ctx: &RunContext, content: &str) -> Result<bool> {
    let root = ctx.root();
    let site = ctx.settings.site_name();

    let default_site = paths::default_site_path(root);
    if std::fs::symlink_metadata(&default_site).is_ok() {
        let backup = paths::default_site_backup_path(root);
        let link_backup = paths::default_site_link_backup_path(root);
        if !backup.exists() && !link_backup.exists() {
            if let Ok(target) = std::fs::read_link(&default_site) {
                io::atomic_write(&link_backup, target.to_string_lossy().as_bytes())?;
            }
            match std::fs::read(&default_site) {
                Ok(data) => io::atomic_write(&backup, &data)?,
                Err(e) => ctx
                    .log
                    .warn("proxy-site", format!("default site not saved: {e}")),
            }
        }
        io::remove_file_if_exists(&default_site)?;
        ctx.log.info("proxy-site", "disabled the default site");
    }

    io::ensure_dir(&paths::acme_webroot(root, ctx.app_name()))?;
    let available = paths::site_available_path(root, site);
    let previous = std::fs::read(&available).ok();
    let changed = io::write_if_changed(&available, content.as_bytes(), Some(0o644))?;

    let enabled = paths::site_enabled_path(root, site);
    let linked = if std::fs::symlink_metadata(&enabled).is_err() {
        if let Some(parent) = enabled.parent() {
            io::ensure_dir(parent)?;
        }
        std::os::unix::fs::symlink(format!("../sites-available/{site}"), &enabled)?;
        true
    } else {
        false
    };

    if changed || linked {
        if let Err(e) = ctx.exec("proxy-site", HostCommand::new("nginx").arg("-t")) {
            match previous {
                Some(data) => io::atomic_write(&available, &data)?,
                None => {
                    io::remove_file_if_exists(&enabled)?;
                    io::remove_file_if_exists(&available)?;
                }
            }
            ctx.log
                .error("proxy-site", "configuration test failed; previous site restored");
            return Err(e);
        }
        ctx.log.info(
            "proxy-site",
            format!("installed {}", ctx.target.host_path(&available).display()),
        );
    }
    Ok(changed || linked)
}

/// Reload the proxy when it runs, start it otherwise.
fn reload_proxy(ctx: &RunContext, probe: &dyn HttpProbe) -> Result<()> {
    let controller = ServiceController::new(ctx, probe);
    let proxy = ManagedService::proxy();
    if controller.is_active(&proxy.name) {
        controller.reload(&proxy)
    } else {
        controller.start(&proxy)
    }
}

/// Re-render the proxy site from the persisted configuration and the current
/// certificate, reloading the proxy when it changed.
pub fn refresh_proxy(ctx: &RunContext, probe: &dyn HttpProbe) -> Result<bool> {
    let artifact = ConfigArtifact::load(ctx.root(), ctx.app_name(), &ctx.settings.config_keys)?
        .ok_or_else(|| {
            HostforgeError::Precondition("no configuration found; run `hostforge provision` first".to_string())
        })?;
    let record = active_certificate(ctx);
    let content = render_proxy_site(ctx, &artifact, record.as_ref())?;
    let changed = install_proxy_site(ctx, &content)?;
    if changed {
        reload_proxy(ctx, probe)?;
    }
    Ok(changed)
}

fn make_traversable(dir: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = io::mode_of(dir) {
        if mode & 0o005 != 0o005 {
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(mode | 0o005))?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

struct Provisioner<'a> {
    collab: &'a Collaborators<'a>,
    opts: ProvisionOptions,
    identity: &'a HostIdentity,
    artifact: &'a ConfigArtifact,
    env_changed: Cell<bool>,
    unit_changed: Cell<bool>,
    site_changed: Cell<bool>,
    warnings: RefCell<Vec<String>>,
}

impl<'a> Provisioner<'a> {
    fn new(
        collab: &'a Collaborators<'a>,
        opts: ProvisionOptions,
        identity: &'a HostIdentity,
        artifact: &'a ConfigArtifact,
    ) -> Self {
        Self {
            collab,
            opts,
            identity,
            artifact,
            env_changed: Cell::new(false),
            unit_changed: Cell::new(false),
            site_changed: Cell::new(false),
            warnings: RefCell::new(Vec::new()),
        }
    }

    fn warn(&self, ctx: &RunContext, scope: &str, message: String) {
        ctx.log.warn(scope, &message);
        self.warnings.borrow_mut().push(message);
    }

    fn pipeline(&self) -> Pipeline<'_> {
        let mut p = Pipeline::new();
        p.push(
            Step::new("packages", move |ctx: &RunContext| {
                acquire::install_packages(ctx, self.collab.packages).map(|_| ())
            })
            .when(move |ctx: &RunContext| {
                !acquire::missing_packages(ctx, self.collab.packages).is_empty()
            })
            .verify(move |ctx: &RunContext| {
                acquire::missing_packages(ctx, self.collab.packages).is_empty()
            }),
        )
        .push(
            Step::new("runtime-user", move |ctx: &RunContext| self.create_user(ctx))
                .when(|ctx: &RunContext| !inspect::user_exists(ctx, ctx.app_user()))
                .verify(|ctx: &RunContext| inspect::user_exists(ctx, ctx.app_user())),
        )
        .push(
            Step::new("app-fetch", move |ctx: &RunContext| self.fetch_app(ctx))
                .when(|ctx: &RunContext| !ctx.app_dir().join(".git").exists())
                .verify(|ctx: &RunContext| ctx.app_dir().join(".git").exists()),
        )
        .push(
            Step::new("app-install", move |ctx: &RunContext| self.install_app(ctx))
                .when(|ctx: &RunContext| install_pending(ctx))
                .verify(|ctx: &RunContext| !install_pending(ctx)),
        )
        .push(
            Step::new("artifacts", move |ctx: &RunContext| {
                for a in ctx.settings.artifacts.iter().filter(|a| a.required) {
                    acquire::acquire(ctx, self.collab.fetcher, a)?;
                }
                Ok(())
            })
            .when(|ctx: &RunContext| artifacts_pending(ctx, true))
            .verify(|ctx: &RunContext| !artifacts_pending(ctx, true)),
        )
        .push(
            Step::new("optional-artifacts", move |ctx: &RunContext| {
                self.fetch_optional(ctx)
            })
            .when(|ctx: &RunContext| artifacts_pending(ctx, false)),
        )
        .push(
            Step::new("env-file", move |ctx: &RunContext| {
                let wrote = config::persist(ctx.root(), ctx.app_name(), self.artifact)?;
                self.env_changed.set(wrote);
                Ok(())
            })
            .when(move |ctx: &RunContext| self.env_file_pending(ctx))
            .verify(move |ctx: &RunContext| !self.env_file_pending(ctx)),
        )
        .push(
            Step::new("service-unit", move |ctx: &RunContext| {
                let service = app_service(ctx, self.artifact)?;
                let controller = ServiceController::new(ctx, self.collab.probe);
                self.unit_changed.set(controller.register(&service)?);
                Ok(())
            })
            .when(move |ctx: &RunContext| self.unit_pending(ctx))
            .verify(move |ctx: &RunContext| !self.unit_pending(ctx)),
        )
        .push(
            Step::new("proxy-site", move |ctx: &RunContext| {
                let content = render_proxy_site(ctx, self.artifact, active_certificate(ctx).as_ref())?;
                self.site_changed.set(install_proxy_site(ctx, &content)?);
                Ok(())
            })
            .when(move |ctx: &RunContext| self.site_pending(ctx))
            .verify(move |ctx: &RunContext| !self.site_pending(ctx)),
        )
        .push(
            Step::new("proxy", move |ctx: &RunContext| reload_proxy(ctx, self.collab.probe))
                .when(move |ctx: &RunContext| {
                    self.site_changed.get() || !self.is_active(ctx, &ManagedService::proxy().name)
                })
                .verify(move |ctx: &RunContext| self.is_active(ctx, &ManagedService::proxy().name)),
        )
        .push(
            Step::new("app-service", move |ctx: &RunContext| {
                let service = app_service(ctx, self.artifact)?;
                let controller = ServiceController::new(ctx, self.collab.probe);
                if controller.is_active(&service.name) {
                    controller.restart(&service)
                } else {
                    controller.start(&service)
                }
            })
            .when(move |ctx: &RunContext| {
                self.opts.force_restart
                    || self.env_changed.get()
                    || self.unit_changed.get()
                    || !self.is_active(ctx, ctx.app_name())
            })
            .verify(move |ctx: &RunContext| self.is_active(ctx, ctx.app_name())),
        )
        .push(
            Step::new("certificate", move |ctx: &RunContext| self.certificate(ctx))
                .when(move |ctx: &RunContext| !self.certificate_current(ctx))
                .verify(move |ctx: &RunContext| self.certificate_in_place(ctx)),
        );
        p
    }

    fn is_active(&self, ctx: &RunContext, name: &str) -> bool {
        ServiceController::new(ctx, self.collab.probe).is_active(name)
    }

    fn create_user(&self, ctx: &RunContext) -> Result<()> {
        let home = ctx.target.host_path(&ctx.app_dir());
        ctx.exec(
            "runtime-user",
            HostCommand::new("useradd")
                .args(["--system", "--user-group", "--no-create-home", "--home-dir"])
                .path_arg(&home)
                .args(["--shell", "/usr/sbin/nologin", ctx.app_user()]),
        )?;
        Ok(())
    }

    fn fetch_app(&self, ctx: &RunContext) -> Result<()> {
        let app_dir = ctx.app_dir();
        let occupied = std::fs::read_dir(&app_dir)
            .map(|mut d| d.next().is_some())
            .unwrap_or(false);
        if occupied {
            return Err(HostforgeError::Precondition(format!(
                "{} exists but is not a git checkout; run `hostforge reset` first",
                ctx.target.host_path(&app_dir).display()
            )));
        }
        let app = &ctx.settings.app;
        acquire::with_retry(ctx, "app-fetch", |attempt| {
            if attempt > 1 {
                io::remove_dir_if_exists(&app_dir)?;
            }
            ctx.exec(
                "app-fetch",
                HostCommand::new("git")
                    .args(["clone", "--depth", "1", "--branch"])
                    .args([app.branch.as_str(), app.repo.as_str()])
                    .path_arg(&app_dir),
            )
            .map(|_| ())
        })?;

        // The proxy reads static assets as its own user.
        make_traversable(&app_dir)?;
        if let Some(static_dir) = self.artifact.non_empty("STATIC_DIR") {
            make_traversable(&ctx.target.on_target(Path::new(static_dir)))?;
        }
        let owner = format!("{0}:{0}", ctx.app_user());
        ctx.exec(
            "app-fetch",
            HostCommand::new("chown")
                .args(["-R", owner.as_str()])
                .path_arg(&ctx.target.host_path(&app_dir)),
        )?;
        Ok(())
    }

    fn install_app(&self, ctx: &RunContext) -> Result<()> {
        let Some(command) = &ctx.settings.app.install_command else {
            return Ok(());
        };
        let tmp = paths::tmp_dir(ctx.root());
        io::ensure_dir(&tmp)?;
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o1777))?;
        }
        ctx.exec(
            "app-install",
            HostCommand::new("runuser")
                .args(["-u", ctx.app_user(), "--", "sh", "-c", command.as_str()])
                .cwd(&ctx.target.host_path(&ctx.app_dir()))
                .env("TMPDIR", ctx.target.host_path(&tmp).display().to_string()),
        )?;
        io::atomic_write(&ctx.app_dir().join(INSTALL_MARKER), command.as_bytes())
    }

    fn fetch_optional(&self, ctx: &RunContext) -> Result<()> {
        let optional: Vec<ArtifactSpec> = ctx
            .settings
            .artifacts
            .iter()
            .filter(|a| !a.required)
            .cloned()
            .collect();
        for (name, result) in acquire::acquire_all(ctx, self.collab.fetcher, &optional)? {
            if let Err(e) = result {
                self.warn(ctx, &name, format!("optional artifact '{name}' unavailable: {e}"));
            }
        }
        Ok(())
    }

    fn env_file_pending(&self, ctx: &RunContext) -> bool {
        let (root, app) = (ctx.root(), ctx.app_name());
        let path = paths::config_artifact_path(root, app);
        !path.exists()
            || io::mode_of(&path) != Some(0o600)
            || !paths::config_meta_path(root, app).exists()
            || config::changed_keys(root, app, self.artifact)
                .map(|k| !k.is_empty())
                .unwrap_or(true)
    }

    fn unit_pending(&self, ctx: &RunContext) -> bool {
        let Ok(ManagedService {
            unit_definition: Some(unit),
            ..
        }) = app_service(ctx, self.artifact)
        else {
            return true;
        };
        std::fs::read_to_string(paths::unit_path(ctx.root(), ctx.app_name()))
            .map(|current| current != unit)
            .unwrap_or(true)
    }

    fn site_pending(&self, ctx: &RunContext) -> bool {
        match render_proxy_site(ctx, self.artifact, active_certificate(ctx).as_ref()) {
            Ok(content) => proxy_site_pending(ctx, &content),
            Err(_) => true,
        }
    }

    /// A certificate for the configured domains is in place, not due for
    /// renewal, and wired into the proxy site.
    fn certificate_in_place(&self, ctx: &RunContext) -> bool {
        let Some(record) = active_certificate(ctx) else {
            return false;
        };
        let threshold = ctx.settings.tls.renewal_threshold_days;
        if record.domains != cert::domains_from(self.artifact)
            || record.renewal_due(Utc::now(), threshold)
        {
            return false;
        }
        match render_proxy_site(ctx, self.artifact, Some(&record)) {
            Ok(content) => !proxy_site_pending(ctx, &content),
            Err(_) => false,
        }
    }

    /// In place, and not a self-signed stand-in for names a public CA would
    /// sign. Those are retried for ACME on every run.
    fn certificate_current(&self, ctx: &RunContext) -> bool {
        let awaiting_acme = active_certificate(ctx).is_some_and(|r| {
            r.issuance_method == IssuanceMethod::SelfSigned
                && cert::acme_candidate(&ctx.settings.tls, &cert::domains_from(self.artifact))
        });
        !awaiting_acme && self.certificate_in_place(ctx)
    }

    fn certificate(&self, ctx: &RunContext) -> Result<()> {
        let domains = cert::domains_from(self.artifact);
        let manager = CertManager::new(
            ctx,
            self.collab.acme,
            self.collab.dns,
            self.collab.provider,
            &self.identity.public_address,
            self.artifact.non_empty("CERT_EMAIL"),
        );
        let outcome = manager.issue(&domains)?;
        self.warnings.borrow_mut().extend(outcome.warnings.iter().cloned());

        let content = render_proxy_site(ctx, self.artifact, Some(&outcome.record))?;
        if install_proxy_site(ctx, &content)? || outcome.changed {
            reload_proxy(ctx, self.collab.probe)?;
        }
        Ok(())
    }
}

fn install_pending(ctx: &RunContext) -> bool {
    match &ctx.settings.app.install_command {
        None => false,
        Some(command) => std::fs::read_to_string(ctx.app_dir().join(INSTALL_MARKER))
            .map(|done| done != *command)
            .unwrap_or(true),
    }
}

fn artifacts_pending(ctx: &RunContext, required: bool) -> bool {
    let Ok(registry) = VersionRegistry::load(ctx.root()) else {
        return true;
    };
    ctx.settings
        .artifacts
        .iter()
        .filter(|a| a.required == required)
        .any(|a| !acquire::verify_installed(ctx, &registry, a).unwrap_or(false))
}

// ---------------------------------------------------------------------------
// provision
// ---------------------------------------------------------------------------

pub fn provision(
    ctx: &RunContext,
    collab: &Collaborators<'_>,
    opts: ProvisionOptions,
) -> Result<ProvisionOutcome> {
    let invalid: Vec<String> = ctx
        .settings
        .validate()
        .into_iter()
        .filter(|w| w.level == WarnLevel::Error)
        .map(|w| w.message)
        .collect();
    if !invalid.is_empty() {
        return Err(HostforgeError::Precondition(format!(
            "invalid settings: {}",
            invalid.join("; ")
        )));
    }

    let identity = env::resolve(collab.metadata, &ctx.log);
    let inspection = inspect::inspect(ctx);

    if opts.check_only {
        return check_only(ctx, collab, opts, identity, inspection);
    }

    let decision = match inspection.state {
        DeploymentState::Absent => None,
        state => {
            let decision = collab.provider.decide_existing(state)?;
            match decision {
                OnExisting::Abort => {
                    ctx.log.info("provision", "aborted by operator");
                    return Err(HostforgeError::Aborted(format!(
                        "existing {state} installation left untouched"
                    )));
                }
                OnExisting::Reset => {
                    ctx.log
                        .info("provision", format!("resetting the {state} installation first"));
                    reset::reset(ctx, ResetOptions::default(), collab.progress)?;
                }
                OnExisting::Continue => ctx.log.warn(
                    "provision",
                    format!("continuing over an existing {state} installation (risky)"),
                ),
            }
            Some(decision)
        }
    };

    let artifact = synthesize_config(ctx, collab.provider, &identity, opts.force_defaults)?;
    config::log_summary(&ctx.log, &artifact);

    let provisioner = Provisioner::new(collab, opts, &identity, &artifact);
    let run = provisioner
        .pipeline()
        .run_into(ctx, collab.progress, PipelineRun::new());
    match &run.fatal {
        Some(e) => ctx.log.error("provision", format!("halted: {e}")),
        None => ctx.log.info("provision", "all steps complete"),
    }
    let warnings = provisioner.warnings.into_inner();

    let report = validate::validate(ctx, collab.probe, &identity.public_address);
    validate::write_report(ctx, &report, Some(&inspection), Some(&run))?;

    Ok(ProvisionOutcome {
        identity,
        inspection,
        decision,
        plan: Vec::new(),
        run: Some(run),
        report,
        warnings,
    })
}

/// Plan against what synthesis would produce, without prompting or writing.
fn check_only(
    ctx: &RunContext,
    collab: &Collaborators<'_>,
    opts: ProvisionOptions,
    identity: HostIdentity,
    inspection: Inspection,
) -> Result<ProvisionOutcome> {
    let supplied = match collab.provider {
        ConfigurationProvider::NonInteractive(args) => args.clone(),
        ConfigurationProvider::Interactive(_) => SuppliedArgs::default(),
    };
    let quiet = ConfigurationProvider::NonInteractive(supplied);
    let mut warnings = Vec::new();
    let artifact = match synthesize_config(ctx, &quiet, &identity, opts.force_defaults) {
        Ok(a) => a,
        Err(e) => {
            warnings.push(e.to_string());
            ConfigArtifact::load(ctx.root(), ctx.app_name(), &ctx.settings.config_keys)?
                .unwrap_or_default()
        }
    };

    let provisioner = Provisioner::new(collab, opts, &identity, &artifact);
    let plan = provisioner.pipeline().plan(ctx);
    for step in &plan {
        let verdict = if step.pending { "would run" } else { "satisfied" };
        ctx.log.info("plan", format!("{}: {verdict}", step.name));
    }
    let report = validate::validate(ctx, collab.probe, &identity.public_address);

    Ok(ProvisionOutcome {
        identity,
        inspection,
        decision: None,
        plan,
        run: None,
        report,
        warnings,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
