//! Certificate lifecycle: self-signed bring-up, ACME issuance through
//! certbot, and threshold-gated renewal.
//!
//! States move `NoCertificate → SelfSigned → AcmePending → AcmeIssued`, and
//! `AcmeIssued → AcmeRenewing → AcmeIssued` when renewal is due. Any ACME
//! failure that cannot be recovered by retrying lands back on `SelfSigned`,
//! and every such fallback is logged as a warning.

use crate::acquire::with_retry;
use crate::config::{ConfigArtifact, ConfigurationProvider};
use crate::context::RunContext;
use crate::error::{HostforgeError, IssuanceErrorKind, Result};
use crate::host::HostCommand;
use crate::io;
use crate::paths;
use crate::settings::TlsSettings;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use x509_cert::der::Decode;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What to do when a domain does not resolve to this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchDecision {
    #[default]
    SelfSigned,
    ProceedAnyway,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssuanceMethod {
    SelfSigned,
    Acme,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertState {
    NoCertificate,
    SelfSigned,
    AcmePending,
    AcmeIssued,
    AcmeRenewing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub domains: Vec<String>,
    pub issuance_method: IssuanceMethod,
    pub state: CertState,
    pub not_after: DateTime<Utc>,
    #[serde(default)]
    pub issuer: String,
    pub renewal_armed: bool,
    /// Host-absolute paths, as the proxy reads them.
    pub cert_path: String,
    pub key_path: String,
    pub issued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl CertificateRecord {
    pub fn load(root: &Path) -> Result<Option<Self>> {
        let path = paths::cert_record_path(root);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_yaml::from_str(&std::fs::read_to_string(&path)?)?))
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        io::atomic_write(&paths::cert_record_path(root), data.as_bytes())
    }

    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.not_after - now).num_days()
    }

    pub fn renewal_due(&self, now: DateTime<Utc>, threshold_days: i64) -> bool {
        self.not_after - now < ChronoDuration::days(threshold_days)
    }
}

#[derive(Debug, Clone)]
pub struct CertOutcome {
    pub record: CertificateRecord,
    /// New material was put in place; the proxy needs a reload.
    pub changed: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewOutcome {
    NoCertificate,
    NotDue { days_remaining: i64 },
    Renewed(CertificateRecord),
}

#[derive(Debug, Clone, Serialize)]
pub struct CertStatus {
    pub state: CertState,
    pub record: Option<CertificateRecord>,
    pub days_remaining: Option<i64>,
    pub renewal_due: bool,
    pub material_present: bool,
}

/// Parsed facts from a PEM certificate (first block of a chain).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertFacts {
    pub not_after: DateTime<Utc>,
    pub issuer: String,
    pub subject: String,
}

pub fn read_cert_facts(pem_bytes: &[u8]) -> Result<CertFacts> {
    let blocks = pem::parse_many(pem_bytes)
        .map_err(|e| HostforgeError::Configuration(format!("invalid PEM: {e}")))?;
    let block = blocks
        .iter()
        .find(|b| b.tag() == "CERTIFICATE")
        .ok_or_else(|| HostforgeError::Configuration("no CERTIFICATE block in PEM".to_string()))?;
    let cert = x509_cert::Certificate::from_der(block.contents())
        .map_err(|e| HostforgeError::Configuration(format!("invalid certificate: {e}")))?;
    let tbs = &cert.tbs_certificate;
    let secs = tbs.validity.not_after.to_unix_duration().as_secs();
    let not_after = DateTime::from_timestamp(secs as i64, 0).ok_or_else(|| {
        HostforgeError::Configuration(format!("certificate expiry out of range: {secs}"))
    })?;
    Ok(CertFacts {
        not_after,
        issuer: tbs.issuer.to_string(),
        subject: tbs.subject.to_string(),
    })
}

/// Domains from the `DOMAIN` key: comma or whitespace separated.
pub fn domains_from(artifact: &ConfigArtifact) -> Vec<String> {
    artifact
        .non_empty("DOMAIN")
        .map(|d| {
            d.split(|c: char| c == ',' || c.is_whitespace())
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// A public CA can be asked for `domain`: not an address, not localhost, and
/// not under a provider-assigned suffix.
pub fn issuable(tls: &TlsSettings, domain: &str) -> bool {
    domain.parse::<IpAddr>().is_err()
        && domain != "localhost"
        && !tls
            .unissuable_suffixes
            .iter()
            .any(|s| domain.ends_with(s.as_str()))
}

/// ACME is worth attempting for this domain set.
pub fn acme_candidate(tls: &TlsSettings, domains: &[String]) -> bool {
    !domains.is_empty() && domains.iter().all(|d| issuable(tls, d))
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

pub trait AcmeClient: Send + Sync {
    /// Obtain a certificate for `domains`. Returns the directory holding
    /// `fullchain.pem` and `privkey.pem`.
    fn issue(&self, ctx: &RunContext, domains: &[String], contact: Option<&str>) -> Result<PathBuf>;
}

pub trait DnsResolver: Send + Sync {
    fn resolve(&self, host: &str) -> Result<Vec<IpAddr>>;
}

pub struct SystemResolver;

impl DnsResolver for SystemResolver {
    fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        let addrs = (host, 443u16).to_socket_addrs()?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

const FATAL_MARKERS: &[&str] = &[
    "unauthorized",
    "invalid response from",
    "nxdomain",
    "dns problem",
    "no valid ip addresses",
    "rejectedidentifier",
    "caa record",
    "policy forbids",
];

const RETRYABLE_MARKERS: &[&str] = &[
    "too many",
    "ratelimited",
    "rate limit",
    "timeout",
    "timed out",
    "connection",
    "temporar",
    "serverinternal",
    "badnonce",
];

/// Classify certbot output. Unknown failures count as retryable, bounded by
/// the retry budget.
pub fn classify_acme_failure(output: &str) -> IssuanceErrorKind {
    let lower = output.to_lowercase();
    if RETRYABLE_MARKERS.iter().any(|m| lower.contains(m))
        && !FATAL_MARKERS.iter().any(|m| lower.contains(m))
    {
        return IssuanceErrorKind::Retryable;
    }
    if FATAL_MARKERS.iter().any(|m| lower.contains(m)) {
        IssuanceErrorKind::Fatal
    } else {
        IssuanceErrorKind::Retryable
    }
}

/// certbot in webroot mode against the proxy's challenge directory.
pub struct CertbotClient {
    pub cert_name: String,
    pub webroot: PathBuf,
    pub staging: bool,
}

impl CertbotClient {
    pub fn for_context(ctx: &RunContext) -> Self {
        Self {
            cert_name: ctx.app_name().to_string(),
            webroot: paths::acme_webroot(ctx.root(), ctx.app_name()),
            staging: ctx.settings.tls.staging,
        }
    }
}

impl AcmeClient for CertbotClient {
    fn issue(&self, ctx: &RunContext, domains: &[String], contact: Option<&str>) -> Result<PathBuf> {
        io::ensure_dir(&self.webroot)?;
        let mut cmd = HostCommand::new("certbot")
            .args(["certonly", "--webroot", "-w"])
            .path_arg(&ctx.target.host_path(&self.webroot))
            .args([
                "--non-interactive",
                "--agree-tos",
                "--keep-until-expiring",
                "--expand",
                "--cert-name",
            ])
            .arg(self.cert_name.clone());
        cmd = match contact {
            Some(email) => cmd.args(["--email", email]),
            None => cmd.arg("--register-unsafely-without-email"),
        };
        if self.staging {
            cmd = cmd.arg("--staging");
        }
        for d in domains {
            cmd = cmd.args(["-d", d.as_str()]);
        }
        let cmd = cmd.timeout(ctx.command_timeout());

        ctx.log.info("certificate", format!("$ {}", cmd.display()));
        let out = ctx.runner.run(&cmd).map_err(|e| HostforgeError::CertificateIssuance {
            kind: IssuanceErrorKind::Fatal,
            message: e.to_string(),
        })?;
        ctx.log.output("certificate", &out.combined());
        if !out.success() {
            let text = out.combined();
            return Err(HostforgeError::CertificateIssuance {
                kind: classify_acme_failure(&text),
                message: out.tail(5),
            });
        }
        let live = paths::acme_live_dir(ctx.root(), &self.cert_name);
        if !live.join(paths::FULLCHAIN_PEM).is_file() {
            return Err(HostforgeError::CertificateIssuance {
                kind: IssuanceErrorKind::Fatal,
                message: format!("certbot reported success but {} is missing", live.display()),
            });
        }
        Ok(live)
    }
}

// ---------------------------------------------------------------------------
// CertManager
// ---------------------------------------------------------------------------

pub struct CertManager<'c> {
    ctx: &'c RunContext,
    acme: &'c dyn AcmeClient,
    dns: &'c dyn DnsResolver,
    provider: &'c ConfigurationProvider,
    public_address: String,
    contact: Option<String>,
}

impl<'c> CertManager<'c> {
    pub fn new(
        ctx: &'c RunContext,
        acme: &'c dyn AcmeClient,
        dns: &'c dyn DnsResolver,
        provider: &'c ConfigurationProvider,
        public_address: &str,
        contact: Option<&str>,
    ) -> Self {
        Self {
            ctx,
            acme,
            dns,
            provider,
            public_address: public_address.to_string(),
            contact: contact.map(str::to_string),
        }
    }

    fn threshold(&self) -> i64 {
        self.ctx.settings.tls.renewal_threshold_days
    }

    /// Bring the certificate for `domains` to the best state reachable.
    pub fn issue(&self, domains: &[String]) -> Result<CertOutcome> {
        let previous = CertificateRecord::load(self.ctx.root())?;
        let now = Utc::now();

        if let Some(prev) = &previous {
            let same_domains = prev.domains == domains;
            let material = self.material_present(prev);
            let acme_current = prev.issuance_method == IssuanceMethod::Acme
                && prev.state == CertState::AcmeIssued;
            let wanted_self_signed = domains.is_empty();
            let self_signed_current =
                prev.issuance_method == IssuanceMethod::SelfSigned && wanted_self_signed;
            if same_domains
                && material
                && (acme_current || self_signed_current)
                && !prev.renewal_due(now, self.threshold())
            {
                self.ctx.log.info(
                    "certificate",
                    format!(
                        "{:?} certificate valid for {} more day(s); nothing to do",
                        prev.issuance_method,
                        prev.days_remaining(now)
                    ),
                );
                if acme_current {
                    self.arm_renewal()?;
                }
                return Ok(CertOutcome {
                    record: prev.clone(),
                    changed: false,
                    warnings: Vec::new(),
                });
            }
        }

        if domains.is_empty() {
            return self.self_signed(domains, previous.as_ref(), None);
        }

        if let Some(d) = domains
            .iter()
            .find(|d| !issuable(&self.ctx.settings.tls, d)) {
            let msg = format!(
                "{d} is not a name a public CA will issue for; using a self-signed certificate"
            );
            return self.self_signed(domains, previous.as_ref(), Some(msg));
        }

        if let Some(detail) = self.dns_mismatch(domains) {
            let policy = self.ctx.settings.tls.mismatch_policy;
            let decision = self.provider.decide_mismatch(&domains[0], &detail, policy)?;
            match decision {
                MismatchDecision::Abort => {
                    return Err(HostforgeError::Aborted(format!(
                        "DNS mismatch for {}: {detail}",
                        domains.join(", ")
                    )))
                }
                MismatchDecision::SelfSigned => {
                    let msg = format!(
                        "DNS mismatch ({detail}); falling back to a self-signed certificate"
                    );
                    return self.self_signed(domains, previous.as_ref(), Some(msg));
                }
                MismatchDecision::ProceedAnyway => {
                    self.ctx.log.warn(
                        "certificate",
                        format!("DNS mismatch ({detail}); requesting a certificate anyway"),
                    );
                }
            }
        }

        self.acme(domains, previous.as_ref(), CertState::AcmePending)
    }

    fn dns_mismatch(&self, domains: &[String]) -> Option<String> {
        let public: IpAddr = match self.public_address.parse() {
            Ok(ip) => ip,
            Err(_) => return Some(format!("public address '{}' is unknown", self.public_address)),
        };
        for d in domains {
            match self.dns.resolve(d) {
                Ok(addrs) if addrs.contains(&public) => {}
                Ok(addrs) if addrs.is_empty() => {
                    return Some(format!("{d} does not resolve"));
                }
                Ok(addrs) => {
                    let list: Vec<String> = addrs.iter().map(|a| a.to_string()).collect();
                    return Some(format!(
                        "{d} resolves to {} but this host is {public}",
                        list.join(", ")
                    ));
                }
                Err(e) => return Some(format!("{d} did not resolve: {e}")),
            }
        }
        None
    }

    fn log_switch(&self, previous: Option<&CertificateRecord>, method: IssuanceMethod) {
        if let Some(prev) = previous {
            if prev.issuance_method != method {
                self.ctx.log.warn(
                    "certificate",
                    format!(
                        "switching issuance method from {:?} to {method:?}",
                        prev.issuance_method
                    ),
                );
            }
        }
    }

    fn acme(
        &self,
        domains: &[String],
        previous: Option<&CertificateRecord>,
        pending: CertState,
    ) -> Result<CertOutcome> {
        self.ctx.log.info(
            "certificate",
            format!("{pending:?}: requesting certificate for {}", domains.join(", ")),
        );
        if let Some(prev) = previous {
            let mut marked = prev.clone();
            marked.state = pending;
            marked.save(self.ctx.root())?;
        }

        let issued = with_retry(self.ctx, "certificate", |_| {
            self.acme.issue(self.ctx, domains, self.contact.as_deref())
        });

        let live = match issued {
            Ok(live) => live,
            Err(e) => {
                let kind = match &e {
                    HostforgeError::CertificateIssuance { kind, .. } => *kind,
                    _ => IssuanceErrorKind::Retryable,
                };
                let msg = match kind {
                    IssuanceErrorKind::Fatal => {
                        format!("certificate issuance failed and will not succeed on retry ({e}); falling back to self-signed")
                    }
                    IssuanceErrorKind::Retryable => {
                        format!("certificate issuance kept failing ({e}); falling back to self-signed")
                    }
                };
                // A valid ACME certificate beats a fresh self-signed one.
                if let Some(prev) = previous.filter(|p| {
                    p.issuance_method == IssuanceMethod::Acme
                        && p.not_after > Utc::now()
                        && self.material_present(p)
                }) {
                    let mut kept = prev.clone();
                    kept.state = CertState::AcmeIssued;
                    kept.last_error = Some(e.to_string());
                    kept.save(self.ctx.root())?;
                    let warn = format!("renewal failed ({e}); keeping the current certificate");
                    self.ctx.log.warn("certificate", &warn);
                    return Ok(CertOutcome {
                        record: kept,
                        changed: false,
                        warnings: vec![warn],
                    });
                }
                let mut outcome = self.self_signed(domains, previous, Some(msg))?;
                outcome.record.last_error = Some(e.to_string());
                outcome.record.save(self.ctx.root())?;
                return Ok(outcome);
            }
        };

        let cert = live.join(paths::FULLCHAIN_PEM);
        let key = live.join(paths::PRIVKEY_PEM);
        let facts = read_cert_facts(&std::fs::read(&cert)?)?;
        self.log_switch(previous, IssuanceMethod::Acme);

        let armed = self.arm_renewal().is_ok();
        let record = CertificateRecord {
            domains: domains.to_vec(),
            issuance_method: IssuanceMethod::Acme,
            state: CertState::AcmeIssued,
            not_after: facts.not_after,
            issuer: facts.issuer,
            renewal_armed: armed,
            cert_path: self.ctx.target.host_path(&cert).display().to_string(),
            key_path: self.ctx.target.host_path(&key).display().to_string(),
            issued_at: Utc::now(),
            last_error: None,
        };
        record.save(self.ctx.root())?;
        self.ctx.log.info(
            "certificate",
            format!("issued by {}; expires {}", record.issuer, record.not_after.to_rfc3339()),
        );
        Ok(CertOutcome {
            record,
            changed: true,
            warnings: Vec::new(),
        })
    }

    /// Generate (or keep) self-signed material in `etc/hostforge/tls`.
    /// `warning` is logged and returned when this is a fallback.
    fn self_signed(
        &self,
        domains: &[String],
        previous: Option<&CertificateRecord>,
        warning: Option<String>,
    ) -> Result<CertOutcome> {
        let warnings: Vec<String> = warning.into_iter().collect();
        for w in &warnings {
            self.ctx.log.warn("certificate", w);
        }
        self.log_switch(previous, IssuanceMethod::SelfSigned);

        let tls = paths::tls_dir(self.ctx.root());
        let cert = tls.join(paths::FULLCHAIN_PEM);
        let key = tls.join(paths::PRIVKEY_PEM);
        let now = Utc::now();

        let reusable = previous.is_some_and(|p| {
            p.issuance_method == IssuanceMethod::SelfSigned
                && p.domains == domains
                && self.material_present(p)
                && !p.renewal_due(now, self.threshold())
        });
        if reusable {
            if let Some(prev) = previous {
                return Ok(CertOutcome {
                    record: prev.clone(),
                    changed: false,
                    warnings,
                });
            }
        }

        let common_name = domains
            .first()
            .cloned()
            .unwrap_or_else(|| self.public_address.clone());
        let mut san: Vec<String> = domains.iter().map(|d| format!("DNS:{d}")).collect();
        if self.public_address.parse::<IpAddr>().is_ok() {
            san.push(format!("IP:{}", self.public_address));
        } else {
            san.push(format!("DNS:{}", self.public_address));
        }

        io::ensure_dir(&tls)?;
        self.ctx.exec(
            "certificate",
            HostCommand::new("openssl")
                .args(["req", "-x509", "-nodes", "-newkey", "rsa:2048", "-days"])
                .arg(self.ctx.settings.tls.self_signed_days.to_string())
                .arg("-subj")
                .arg(format!("/CN={common_name}"))
                .arg("-addext")
                .arg(format!("subjectAltName={}", san.join(",")))
                .arg("-keyout")
                .path_arg(&key)
                .arg("-out")
                .path_arg(&cert)
                .timeout(Duration::from_secs(60)),
        )?;
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&key, std::fs::Permissions::from_mode(0o600))?;
        }

        let facts = std::fs::read(&cert)
            .map_err(HostforgeError::from)
            .and_then(|b| read_cert_facts(&b));
        let (not_after, issuer) = match facts {
            Ok(facts) => (facts.not_after, facts.issuer),
            Err(e) => {
                self.ctx
                    .log
                    .warn("certificate", format!("could not read generated certificate: {e}"));
                (
                    now + ChronoDuration::days(self.ctx.settings.tls.self_signed_days),
                    format!("CN={common_name}"),
                )
            }
        };

        let record = CertificateRecord {
            domains: domains.to_vec(),
            issuance_method: IssuanceMethod::SelfSigned,
            state: CertState::SelfSigned,
            not_after,
            issuer,
            renewal_armed: false,
            cert_path: self.ctx.target.host_path(&cert).display().to_string(),
            key_path: self.ctx.target.host_path(&key).display().to_string(),
            issued_at: now,
            last_error: None,
        };
        record.save(self.ctx.root())?;
        self.disarm_renewal()?;
        self.ctx.log.info(
            "certificate",
            format!("self-signed certificate for {common_name} valid until {}", not_after.to_rfc3339()),
        );
        Ok(CertOutcome {
            record,
            changed: true,
            warnings,
        })
    }

    fn material_present(&self, record: &CertificateRecord) -> bool {
        self.ctx.target.on_target(Path::new(&record.cert_path)).is_file()
            && self.ctx.target.on_target(Path::new(&record.key_path)).is_file()
    }

    /// Install the renewal cron job. Re-running never duplicates it.
    pub fn arm_renewal(&self) -> Result<bool> {
        let path = paths::cron_path(self.ctx.root(), self.ctx.app_name());
        let mut added = io::ensure_line(
            &path,
            "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
        )?;
        added |= io::ensure_line(
            &path,
            &format!(
                "{} root hostforge cert renew >/dev/null 2>&1",
                self.ctx.settings.tls.renew_schedule
            ),
        )?;
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644))?;
        }
        if added {
            self.ctx.log.info(
                "certificate",
                format!("renewal armed in {}", self.ctx.target.host_path(&path).display()),
            );
        }
        Ok(added)
    }

    fn disarm_renewal(&self) -> Result<()> {
        let path = paths::cron_path(self.ctx.root(), self.ctx.app_name());
        if io::remove_file_if_exists(&path)? {
            self.ctx.log.info("certificate", "renewal job removed");
        }
        Ok(())
    }

    /// Re-issue through the normal issuance path when the certificate is
    /// within the renewal threshold; a no-op otherwise.
    pub fn renew_if_due(&self, now: DateTime<Utc>) -> Result<RenewOutcome> {
        let Some(record) = CertificateRecord::load(self.ctx.root())? else {
            self.ctx.log.info("certificate", "no certificate to renew");
            return Ok(RenewOutcome::NoCertificate);
        };
        if !record.renewal_due(now, self.threshold()) {
            let days = record.days_remaining(now);
            self.ctx.log.info(
                "certificate",
                format!("renewal not due ({days} day(s) remaining, threshold {})", self.threshold()),
            );
            return Ok(RenewOutcome::NotDue {
                days_remaining: days,
            });
        }

        let outcome = if record.issuance_method == IssuanceMethod::Acme {
            self.acme(&record.domains, Some(&record), CertState::AcmeRenewing)?
        } else {
            // Expiring self-signed material is regenerated, not reused.
            io::remove_file_if_exists(&self.ctx.target.on_target(Path::new(&record.cert_path)))?;
            self.issue(&record.domains)?
        };
        Ok(RenewOutcome::Renewed(outcome.record))
    }

    pub fn status(&self) -> Result<CertStatus> {
        status(self.ctx)
    }
}

/// Certificate status without any collaborators; used by read-only commands.
pub fn status(ctx: &RunContext) -> Result<CertStatus> {
    let record = CertificateRecord::load(ctx.root())?;
    let now = Utc::now();
    let threshold = ctx.settings.tls.renewal_threshold_days;
    Ok(match record {
        None => CertStatus {
            state: CertState::NoCertificate,
            record: None,
            days_remaining: None,
            renewal_due: false,
            material_present: false,
        },
        Some(r) => {
            let material_present = ctx.target.on_target(Path::new(&r.cert_path)).is_file()
                && ctx.target.on_target(Path::new(&r.key_path)).is_file();
            CertStatus {
                state: if material_present { r.state } else { CertState::NoCertificate },
                days_remaining: Some(r.days_remaining(now)),
                renewal_due: r.renewal_due(now, threshold),
                material_present,
                record: Some(r),
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SuppliedArgs;
    use crate::testing::{harness, FIXTURE_CERT};
    use std::sync::Mutex;

    struct StaticResolver(Vec<IpAddr>);

    impl DnsResolver for StaticResolver {
        fn resolve(&self, _host: &str) -> Result<Vec<IpAddr>> {
            Ok(self.0.clone())
        }
    }

    /// Scripted ACME client writing the fixture certificate on success.
    struct ScriptedAcme {
        results: Mutex<Vec<std::result::Result<(), IssuanceErrorKind>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedAcme {
        fn new(results: Vec<std::result::Result<(), IssuanceErrorKind>>) -> Self {
            Self {
                results: Mutex::new(results),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    impl AcmeClient for ScriptedAcme {
        fn issue(&self, ctx: &RunContext, _domains: &[String], _contact: Option<&str>) -> Result<PathBuf> {
            *self.calls.lock().unwrap() += 1;
            let next = {
                let mut r = self.results.lock().unwrap();
                if r.is_empty() { Ok(()) } else { r.remove(0) }
            };
            if let Err(kind) = next {
                return Err(HostforgeError::CertificateIssuance {
                    kind,
                    message: "scripted failure".to_string(),
                });
            }
            let live = paths::acme_live_dir(ctx.root(), ctx.app_name());
            std::fs::create_dir_all(&live)?;
            std::fs::write(live.join(paths::FULLCHAIN_PEM), FIXTURE_CERT)?;
            std::fs::write(live.join(paths::PRIVKEY_PEM), "key")?;
            Ok(live)
        }
    }

    const PUBLIC: &str = "203.0.113.7";

    fn here() -> StaticResolver {
        StaticResolver(vec![PUBLIC.parse().unwrap()])
    }

    fn provider() -> ConfigurationProvider {
        ConfigurationProvider::NonInteractive(SuppliedArgs::default())
    }

    fn domains() -> Vec<String> {
        vec!["bot.example.com".to_string()]
    }

    #[test]
    fn fixture_facts_parse() {
        let facts = read_cert_facts(FIXTURE_CERT.as_bytes()).unwrap();
        assert!(facts.issuer.contains("hostforge-test"));
        assert!(facts.not_after > Utc::now());
    }

    #[test]
    fn no_domain_gives_self_signed() {
        let h = harness();
        let acme = ScriptedAcme::new(vec![]);
        let p = provider();
        let resolver = here();
        let mgr = CertManager::new(&h.ctx, &acme, &resolver, &p, PUBLIC, None);
        let outcome = mgr.issue(&[]).unwrap();
        assert_eq!(outcome.record.issuance_method, IssuanceMethod::SelfSigned);
        assert!(outcome.changed);
        assert_eq!(acme.calls(), 0);
        let key = paths::tls_dir(h.dir.path()).join(paths::PRIVKEY_PEM);
        assert_eq!(io::mode_of(&key), Some(0o600));

        let again = mgr.issue(&[]).unwrap();
        assert!(!again.changed);
        assert_eq!(h.host.count_calls("openssl"), 1);
    }

    #[test]
    fn provider_hostname_is_not_sent_to_acme() {
        let h = harness();
        let acme = ScriptedAcme::new(vec![]);
        let p = provider();
        let resolver = here();
        let mgr = CertManager::new(&h.ctx, &acme, &resolver, &p, PUBLIC, None);
        let outcome = mgr
            .issue(&["ec2-203-0-113-7.compute-1.amazonaws.com".to_string()])
            .unwrap();
        assert_eq!(outcome.record.issuance_method, IssuanceMethod::SelfSigned);
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(acme.calls(), 0);
    }

    #[test]
    fn provider_hostnames_and_addresses_are_not_acme_candidates() {
        let tls = TlsSettings::default();
        for name in [
            "ec2-203-0-113-7.compute-1.amazonaws.com",
            "ec2-3-8-1-2.eu-west-2.compute.amazonaws.com",
            "ip-10-0-0-5.ec2.internal",
            "203.0.113.7",
            "localhost",
        ] {
            assert!(!issuable(&tls, name), "{name}");
        }
        assert!(issuable(&tls, "bot.example.com"));
        assert!(acme_candidate(&tls, &domains()));
        assert!(!acme_candidate(&tls, &[]));
        assert!(!acme_candidate(
            &tls,
            &["bot.example.com".to_string(), "localhost".to_string()]
        ));
    }

    #[test]
    fn dns_mismatch_falls_back_to_self_signed_with_warning() {
        let h = harness();
        let acme = ScriptedAcme::new(vec![]);
        let p = provider();
        let elsewhere = StaticResolver(vec!["198.51.100.1".parse().unwrap()]);
        let mgr = CertManager::new(&h.ctx, &acme, &elsewhere, &p, PUBLIC, None);
        let outcome = mgr.issue(&domains()).unwrap();
        assert_eq!(outcome.record.state, CertState::SelfSigned);
        assert!(outcome.warnings[0].contains("DNS mismatch"));
        assert_eq!(acme.calls(), 0);
        assert!(h.ctx.log.contents().unwrap().contains("WARN  [certificate] DNS mismatch"));
    }

    #[test]
    fn dns_mismatch_abort_is_an_error() {
        let h = harness();
        let acme = ScriptedAcme::new(vec![]);
        let p = ConfigurationProvider::NonInteractive(SuppliedArgs {
            on_mismatch: Some(MismatchDecision::Abort),
            ..SuppliedArgs::default()
        });
        let elsewhere = StaticResolver(vec![]);
        let mgr = CertManager::new(&h.ctx, &acme, &elsewhere, &p, PUBLIC, None);
        assert!(matches!(mgr.issue(&domains()), Err(HostforgeError::Aborted(_))));
    }

    #[test]
    fn acme_issue_records_and_arms_renewal_once() {
        let h = harness();
        let acme = ScriptedAcme::new(vec![]);
        let p = provider();
        let resolver = here();
        let mgr = CertManager::new(&h.ctx, &acme, &resolver, &p, PUBLIC, Some("ops@example.com"));
        let outcome = mgr.issue(&domains()).unwrap();
        assert_eq!(outcome.record.state, CertState::AcmeIssued);
        assert!(outcome.record.renewal_armed);
        assert!(outcome.record.cert_path.starts_with("/etc/letsencrypt/live/"));

        let again = mgr.issue(&domains()).unwrap();
        assert!(!again.changed);
        assert_eq!(acme.calls(), 1);
        let cron = std::fs::read_to_string(paths::cron_path(h.dir.path(), "assistant")).unwrap();
        assert_eq!(cron.matches("cert renew").count(), 1);
    }

    #[test]
    fn switching_method_is_logged() {
        let h = harness();
        let acme = ScriptedAcme::new(vec![]);
        let p = provider();
        let resolver = here();
        let mgr = CertManager::new(&h.ctx, &acme, &resolver, &p, PUBLIC, None);
        mgr.issue(&[]).unwrap();
        mgr.issue(&domains()).unwrap();
        assert!(h
            .ctx
            .log
            .contents()
            .unwrap()
            .contains("switching issuance method from SelfSigned to Acme"));
    }

    #[test]
    fn fatal_failure_falls_back_without_retry() {
        let h = harness();
        let acme = ScriptedAcme::new(vec![Err(IssuanceErrorKind::Fatal)]);
        let p = provider();
        let resolver = here();
        let mgr = CertManager::new(&h.ctx, &acme, &resolver, &p, PUBLIC, None);
        let outcome = mgr.issue(&domains()).unwrap();
        assert_eq!(acme.calls(), 1);
        assert_eq!(outcome.record.issuance_method, IssuanceMethod::SelfSigned);
        assert!(outcome.warnings[0].contains("will not succeed on retry"));
        assert!(outcome.record.last_error.is_some());
    }

    #[test]
    fn repeated_retryable_failure_falls_back_after_budget() {
        let h = harness();
        let acme = ScriptedAcme::new(vec![
            Err(IssuanceErrorKind::Retryable),
            Err(IssuanceErrorKind::Retryable),
            Err(IssuanceErrorKind::Retryable),
        ]);
        let p = provider();
        let resolver = here();
        let mgr = CertManager::new(&h.ctx, &acme, &resolver, &p, PUBLIC, None);
        let outcome = mgr.issue(&domains()).unwrap();
        assert_eq!(acme.calls(), 3);
        assert_eq!(outcome.record.state, CertState::SelfSigned);
        assert!(outcome.warnings[0].contains("kept failing"));
    }

    #[test]
    fn renewal_is_gated_by_threshold() {
        let h = harness();
        let acme = ScriptedAcme::new(vec![]);
        let p = provider();
        let resolver = here();
        let mgr = CertManager::new(&h.ctx, &acme, &resolver, &p, PUBLIC, None);
        let issued = mgr.issue(&domains()).unwrap().record;

        let far = issued.not_after - ChronoDuration::days(31);
        assert!(matches!(
            mgr.renew_if_due(far).unwrap(),
            RenewOutcome::NotDue { days_remaining: 31 }
        ));
        assert_eq!(acme.calls(), 1);

        let near = issued.not_after - ChronoDuration::days(29);
        let renewed = mgr.renew_if_due(near).unwrap();
        assert!(matches!(renewed, RenewOutcome::Renewed(_)));
        assert_eq!(acme.calls(), 2);
    }

    #[test]
    fn failed_renewal_keeps_valid_certificate() {
        let h = harness();
        let acme = ScriptedAcme::new(vec![
            Ok(()),
            Err(IssuanceErrorKind::Fatal),
        ]);
        let p = provider();
        let resolver = here();
        let mgr = CertManager::new(&h.ctx, &acme, &resolver, &p, PUBLIC, None);
        let issued = mgr.issue(&domains()).unwrap().record;
        let near = issued.not_after - ChronoDuration::days(5);
        let RenewOutcome::Renewed(record) = mgr.renew_if_due(near).unwrap() else {
            panic!("expected a renewal attempt");
        };
        assert_eq!(record.issuance_method, IssuanceMethod::Acme);
        assert!(record.last_error.is_some());
    }

    #[test]
    fn renew_without_record_is_noop() {
        let h = harness();
        let acme = ScriptedAcme::new(vec![]);
        let p = provider();
        let resolver = here();
        let mgr = CertManager::new(&h.ctx, &acme, &resolver, &p, PUBLIC, None);
        assert_eq!(mgr.renew_if_due(Utc::now()).unwrap(), RenewOutcome::NoCertificate);
    }

    #[test]
    fn classify_certbot_output() {
        assert_eq!(
            classify_acme_failure("Error: urn:ietf:params:acme:error:rateLimited: too many certificates"),
            IssuanceErrorKind::Retryable
        );
        assert_eq!(
            classify_acme_failure("Type: unauthorized\nDetail: Invalid response from http://x/.well-known"),
            IssuanceErrorKind::Fatal
        );
        assert_eq!(
            classify_acme_failure("DNS problem: NXDOMAIN looking up A for bot.example.com"),
            IssuanceErrorKind::Fatal
        );
        assert_eq!(classify_acme_failure("something odd"), IssuanceErrorKind::Retryable);
    }

    #[test]
    fn certbot_client_uses_webroot_and_classifies_failure() {
        let h = harness();
        h.host.with_state(|s| {
            s.certbot_results
                .push_back(Err("Detail: DNS problem: NXDOMAIN looking up A".to_string()))
        });
        let client = CertbotClient::for_context(&h.ctx);
        let err = client
            .issue(&h.ctx, &domains(), Some("ops@example.com"))
            .unwrap_err();
        assert!(matches!(
            err,
            HostforgeError::CertificateIssuance {
                kind: IssuanceErrorKind::Fatal,
                ..
            }
        ));
        let live = client.issue(&h.ctx, &domains(), None).unwrap();
        assert!(live.join(paths::FULLCHAIN_PEM).is_file());
        let calls = h.host.calls();
        let certbot = calls.iter().find(|c| c.starts_with("certbot")).unwrap();
        assert!(certbot.contains("--webroot -w /var/www/assistant-acme"));
        assert!(certbot.contains("-d bot.example.com"));
    }

    #[test]
    fn status_reports_days_and_due() {
        let h = harness();
        assert_eq!(status(&h.ctx).unwrap().state, CertState::NoCertificate);
        let acme = ScriptedAcme::new(vec![]);
        let p = provider();
        let resolver = here();
        let mgr = CertManager::new(&h.ctx, &acme, &resolver, &p, PUBLIC, None);
        mgr.issue(&domains()).unwrap();
        let st = mgr.status().unwrap();
        assert_eq!(st.state, CertState::AcmeIssued);
        assert!(st.material_present);
        assert!(!st.renewal_due);
        assert!(st.days_remaining.unwrap() > 30);
    }
}
