//! Post-run validation and the consolidated report.
//!
//! Every check runs regardless of earlier failures; a failing check never
//! short-circuits the rest.

use crate::acquire;
use crate::cert::{self, CertState, IssuanceMethod};
use crate::config::ConfigArtifact;
use crate::context::RunContext;
use crate::error::Result;
use crate::host::HostCommand;
use crate::inspect::Inspection;
use crate::io;
use crate::paths;
use crate::pipeline::{PipelineRun, StepStatus};
use crate::probe::{is_healthy_status, HttpProbe};
use crate::service::PROXY_SERVICE;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Fail,
    Warn,
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CheckStatus::Pass => "pass",
            CheckStatus::Fail => "FAIL",
            CheckStatus::Warn => "warn",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Check {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub generated_at: DateTime<Utc>,
    pub checks: Vec<Check>,
}

impl Report {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.status != CheckStatus::Fail)
    }

    pub fn count(&self, status: CheckStatus) -> usize {
        self.checks.iter().filter(|c| c.status == status).count()
    }

    pub fn check(&self, name: &str) -> Option<&Check> {
        self.checks.iter().find(|c| c.name == name)
    }
}

fn check(name: &str, status: CheckStatus, detail: impl Into<String>) -> Check {
    Check {
        name: name.to_string(),
        status,
        detail: detail.into(),
    }
}

fn pass_fail(name: &str, ok: bool, detail: impl Into<String>) -> Check {
    check(
        name,
        if ok { CheckStatus::Pass } else { CheckStatus::Fail },
        detail,
    )
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

fn service_active(ctx: &RunContext, name: &str) -> bool {
    ctx.runner.probe(
        &HostCommand::new("systemctl")
            .args(["is-active", "--quiet", name])
            .timeout(Duration::from_secs(10)),
    )
}

fn http_check(probe: &dyn HttpProbe, name: &str, url: &str) -> Check {
    match probe.status(url) {
        Ok(code) if is_healthy_status(code) => check(name, CheckStatus::Pass, format!("{url} -> {code}")),
        Ok(code) => check(name, CheckStatus::Fail, format!("{url} -> {code}")),
        Err(e) => check(name, CheckStatus::Fail, format!("{url}: {e}")),
    }
}

fn certificate_check(ctx: &RunContext) -> Check {
    let status = match cert::status(ctx) {
        Ok(s) => s,
        Err(e) => return check("certificate", CheckStatus::Fail, format!("unreadable record: {e}")),
    };
    let Some(record) = status.record.as_ref().filter(|_| status.material_present) else {
        return check("certificate", CheckStatus::Fail, "no certificate installed");
    };
    let days = status.days_remaining.unwrap_or(0);
    let detail = format!(
        "{:?} issued by {}, expires {} ({days} day(s))",
        record.issuance_method,
        record.issuer,
        record.not_after.format("%Y-%m-%d")
    );
    if days < 0 {
        return check("certificate", CheckStatus::Fail, format!("expired: {detail}"));
    }
    if status.renewal_due {
        return check("certificate", CheckStatus::Warn, format!("renewal due: {detail}"));
    }
    match (record.issuance_method, record.domains.is_empty()) {
        (IssuanceMethod::SelfSigned, false) => check(
            "certificate",
            CheckStatus::Warn,
            format!("self-signed fallback for {}: {detail}", record.domains.join(", ")),
        ),
        (IssuanceMethod::Acme, _) if status.state != CertState::AcmeIssued => {
            check("certificate", CheckStatus::Warn, format!("{:?}: {detail}", status.state))
        }
        _ => check("certificate", CheckStatus::Pass, detail),
    }
}

/// The proxy runs as another user: every directory from the app directory
/// down to the static assets must be world-traversable and readable.
fn static_permissions_check(ctx: &RunContext, static_dir: &Path) -> Check {
    let app_dir = ctx.app_dir();
    let mut dirs: Vec<PathBuf> = vec![app_dir.clone()];
    if let Ok(rel) = static_dir.strip_prefix(&app_dir) {
        let mut cur = app_dir.clone();
        for part in rel.components() {
            cur = cur.join(part);
            dirs.push(cur.clone());
        }
    } else {
        dirs.push(static_dir.to_path_buf());
    }
    let mut problems = Vec::new();
    for dir in &dirs {
        match io::mode_of(dir) {
            Some(mode) if mode & 0o005 == 0o005 => {}
            Some(mode) => problems.push(format!(
                "{} is {:o}",
                ctx.target.host_path(dir).display(),
                mode
            )),
            None => problems.push(format!("{} missing", ctx.target.host_path(dir).display())),
        }
    }
    if problems.is_empty() {
        check(
            "static-permissions",
            CheckStatus::Pass,
            format!("{} readable by the proxy", ctx.target.host_path(static_dir).display()),
        )
    } else {
        check("static-permissions", CheckStatus::Fail, problems.join("; "))
    }
}

fn artifact_checks(ctx: &RunContext) -> Vec<Check> {
    ctx.settings
        .artifacts
        .iter()
        .map(|a| {
            let dest = acquire::destination(ctx, a);
            let present = dest.is_file();
            let name = format!("artifact:{}", a.name);
            let where_ = ctx.target.host_path(&dest).display().to_string();
            match (present, a.required) {
                (true, _) => check(&name, CheckStatus::Pass, where_),
                (false, true) => check(&name, CheckStatus::Fail, format!("{where_} missing")),
                (false, false) => check(
                    &name,
                    CheckStatus::Warn,
                    format!("optional artifact missing: {where_}"),
                ),
            }
        })
        .collect()
}

/// The app's health endpoint as reached from the host itself.
pub fn loopback_url(ctx: &RunContext, config: &ConfigArtifact) -> String {
    let host = config.non_empty("HOST").unwrap_or("127.0.0.1");
    let port = config.non_empty("PORT").unwrap_or("8000");
    format!("http://{host}:{port}{}", ctx.settings.app.health_path)
}

/// Run every check and return the report. Never fails part-way.
pub fn validate(ctx: &RunContext, probe: &dyn HttpProbe, public_address: &str) -> Report {
    let config = ConfigArtifact::load(ctx.root(), ctx.app_name(), &ctx.settings.config_keys)
        .ok()
        .flatten()
        .unwrap_or_default();
    let static_dir = config
        .non_empty("STATIC_DIR")
        .map(|d| ctx.target.on_target(Path::new(d)))
        .unwrap_or_else(|| ctx.app_dir().join("static"));
    let public_name = cert::domains_from(&config)
        .into_iter()
        .next()
        .unwrap_or_else(|| public_address.to_string());

    let app = ctx.app_name();
    let mut checks = vec![
        pass_fail("service-active", service_active(ctx, app), format!("systemctl is-active {app}")),
        pass_fail(
            "proxy-active",
            service_active(ctx, PROXY_SERVICE),
            format!("systemctl is-active {PROXY_SERVICE}"),
        ),
        http_check(probe, "loopback-http", &loopback_url(ctx, &config)),
        http_check(probe, "public-https", &format!("https://{public_name}/")),
        certificate_check(ctx),
        static_permissions_check(ctx, &static_dir),
    ];
    checks.extend(artifact_checks(ctx));

    for c in &checks {
        let line = format!("{} {}: {}", c.status, c.name, c.detail);
        match c.status {
            CheckStatus::Pass => ctx.log.info("validate", line),
            CheckStatus::Warn => ctx.log.warn("validate", line),
            CheckStatus::Fail => ctx.log.error("validate", line),
        }
    }
    Report {
        generated_at: Utc::now(),
        checks,
    }
}

// ---------------------------------------------------------------------------
// Report files
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ReportDocument<'a> {
    generated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inspection: Option<&'a Inspection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    run: Option<&'a PipelineRun>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    validation: &'a Report,
    log_path: String,
}

pub fn render_markdown(
    report: &Report,
    inspection: Option<&Inspection>,
    run: Option<&PipelineRun>,
    log_path: &str,
) -> String {
    let mut md = String::new();
    let _ = writeln!(md, "# hostforge report\n");
    let _ = writeln!(md, "Generated: {}\n", report.generated_at.to_rfc3339());
    if let Some(i) = inspection {
        let _ = writeln!(md, "Initial state: **{}**\n", i.state);
    }
    if let Some(run) = run {
        let _ = writeln!(md, "## Steps (run {})\n", run.id);
        let _ = writeln!(md, "| Step | Status | Detail |");
        let _ = writeln!(md, "|------|--------|--------|");
        for r in &run.results {
            let detail = r.error.as_deref().unwrap_or("");
            let _ = writeln!(md, "| {} | {} | {} |", r.name, r.status, detail.replace('\n', " "));
        }
        if let Some(failed) = run.results.iter().find(|r| r.status == StepStatus::Failed) {
            let _ = writeln!(md, "\nHalted at `{}`. Last log lines:\n", failed.name);
            let _ = writeln!(md, "```\n{}\n```", failed.log_excerpt);
        }
        md.push('\n');
    }
    let _ = writeln!(md, "## Validation\n");
    let _ = writeln!(md, "| Check | Status | Detail |");
    let _ = writeln!(md, "|-------|--------|--------|");
    for c in &report.checks {
        let _ = writeln!(md, "| {} | {} | {} |", c.name, c.status, c.detail.replace('\n', " "));
    }
    let _ = writeln!(
        md,
        "\n{} passed, {} warning(s), {} failed.\n\nFull log: `{log_path}`",
        report.count(CheckStatus::Pass),
        report.count(CheckStatus::Warn),
        report.count(CheckStatus::Fail)
    );
    md
}

/// Persist the report as Markdown and JSON under the state directory.
pub fn write_report(
    ctx: &RunContext,
    report: &Report,
    inspection: Option<&Inspection>,
    run: Option<&PipelineRun>,
) -> Result<()> {
    let root = ctx.root();
    let log_path = ctx.target.host_path(ctx.log.path()).display().to_string();
    let md = render_markdown(report, inspection, run, &log_path);
    io::atomic_write(&paths::report_md_path(root), md.as_bytes())?;
    let doc = ReportDocument {
        generated_at: report.generated_at,
        inspection,
        run,
        error: run.and_then(|r| r.fatal.as_ref()).map(|e| e.to_string()),
        validation: report,
        log_path,
    };
    let json = serde_json::to_string_pretty(&doc)?;
    io::atomic_write(&paths::report_json_path(root), json.as_bytes())?;
    ctx.log.info(
        "report",
        format!("report written to {}", ctx.target.host_path(&paths::report_md_path(root)).display()),
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
