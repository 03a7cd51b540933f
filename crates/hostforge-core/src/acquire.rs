//! Acquisition of external resources: downloaded artifacts (models, voices,
//! binaries) and system packages.
//!
//! Every acquisition goes through [`with_retry`], which retries transient
//! failures with exponential backoff and turns exhaustion into
//! [`HostforgeError::ResourceAcquisition`].

use crate::context::RunContext;
use crate::error::{HostforgeError, Result};
use crate::host::HostCommand;
use crate::io;
use crate::paths;
use crate::settings::ArtifactSpec;
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Backoff before retry number `attempt` (1-based): `initial × multiplier^(attempt-1)`.
pub fn backoff_ms(initial_ms: u64, multiplier: u32, attempt: u32) -> u64 {
    let factor = (multiplier as u64).saturating_pow(attempt.saturating_sub(1));
    initial_ms.saturating_mul(factor)
}

/// Run `op` up to `settings.retry.attempts` times. Non-retryable errors are
/// returned immediately; retryable ones are logged with the upcoming backoff.
pub fn with_retry<T>(
    ctx: &RunContext,
    what: &str,
    mut op: impl FnMut(u32) -> Result<T>,
) -> Result<T> {
    let retry = &ctx.settings.retry;
    let attempts = retry.attempts.max(1);
    let mut last = String::new();
    for attempt in 1..=attempts {
        ctx.log.info(what, format!("attempt {attempt}/{attempts}"));
        match op(attempt) {
            Ok(v) => return Ok(v),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                last = e.to_string();
                if attempt < attempts {
                    let wait = backoff_ms(retry.initial_backoff_ms, retry.multiplier, attempt);
                    ctx.log.warn(
                        what,
                        format!("attempt {attempt}/{attempts} failed: {e}; retrying in {wait}ms"),
                    );
                    std::thread::sleep(Duration::from_millis(wait));
                } else {
                    ctx.log
                        .error(what, format!("attempt {attempt}/{attempts} failed: {e}"));
                }
            }
        }
    }
    Err(HostforgeError::ResourceAcquisition {
        artifact: what.to_string(),
        attempts,
        reason: last,
    })
}

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

pub trait Fetcher: Send + Sync {
    /// Download `url` into `dest` (created or truncated). Returns bytes written.
    fn fetch(&self, url: &str, dest: &Path) -> Result<u64>;
}

pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("hostforge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HostforgeError::Http(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<u64> {
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|e| HostforgeError::Http(format!("{url}: {e}")))?;
        if !response.status().is_success() {
            return Err(HostforgeError::Http(format!(
                "HTTP {} from {url}",
                response.status()
            )));
        }
        let mut file = std::fs::File::create(dest)?;
        let bytes = response
            .copy_to(&mut file)
            .map_err(|e| HostforgeError::Http(format!("{url}: {e}")))?;
        Ok(bytes)
    }
}

// ---------------------------------------------------------------------------
// Version registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledArtifact {
    pub path: String,
    #[serde(default)]
    pub version: Option<String>,
    pub sha256: String,
    pub installed_at: DateTime<Utc>,
}

/// `var/lib/hostforge/versions.yaml`: what was installed, and when.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionRegistry {
    #[serde(default)]
    pub artifacts: BTreeMap<String, InstalledArtifact>,
}

impl VersionRegistry {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::versions_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        Ok(serde_yaml::from_str(&data)?)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        io::atomic_write(&paths::versions_path(root), data.as_bytes())
    }

    pub fn installed_version(&self, name: &str) -> Option<&str> {
        self.artifacts.get(name).and_then(|a| a.version.as_deref())
    }
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Destination already present and verified.
    Skipped,
    Installed { bytes: u64, sha256: String },
}

/// Resolve an artifact destination: relative paths live under the app
/// directory, absolute ones under the target root.
pub fn destination(ctx: &RunContext, artifact: &ArtifactSpec) -> PathBuf {
    let dest = Path::new(&artifact.destination);
    if dest.is_absolute() {
        ctx.root().join(dest.strip_prefix("/").unwrap_or(dest))
    } else {
        ctx.app_dir().join(dest)
    }
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

fn checksum_matches(artifact: &ArtifactSpec, path: &Path) -> Result<bool> {
    match &artifact.sha256 {
        Some(expected) => Ok(sha256_file(path)?.eq_ignore_ascii_case(expected.trim())),
        None => Ok(true),
    }
}

fn probe_matches(ctx: &RunContext, artifact: &ArtifactSpec) -> bool {
    let Some(probe) = &artifact.version_probe else {
        return true;
    };
    let Some((program, args)) = probe.command.split_first() else {
        return false;
    };
    let cmd = HostCommand::new(program.clone())
        .args(args.iter().cloned())
        .timeout(Duration::from_secs(30));
    match ctx.runner.run(&cmd) {
        Ok(out) if out.success() => out.combined().contains(&probe.expect),
        _ => false,
    }
}

/// Whether the installed artifact exists, passes its checksum and version
/// probe, and matches the version the settings ask for.
pub fn verify_installed(
    ctx: &RunContext,
    registry: &VersionRegistry,
    artifact: &ArtifactSpec,
) -> Result<bool> {
    let path = destination(ctx, artifact);
    if !path.is_file() {
        return Ok(false);
    }
    if let Some(wanted) = &artifact.version {
        if registry.installed_version(&artifact.name) != Some(wanted.as_str()) {
            return Ok(false);
        }
    }
    Ok(checksum_matches(artifact, &path)? && probe_matches(ctx, artifact))
}

/// Download, verify and move one artifact into place. Does not touch the
/// version registry, so it may run on a worker thread.
fn fetch_verified(
    ctx: &RunContext,
    fetcher: &dyn Fetcher,
    registry: &VersionRegistry,
    artifact: &ArtifactSpec,
) -> Result<AcquireOutcome> {
    if verify_installed(ctx, registry, artifact)? {
        ctx.log
            .info(&artifact.name, "present and verified; skipping download");
        return Ok(AcquireOutcome::Skipped);
    }

    let dest = destination(ctx, artifact);
    let dir = dest
        .parent()
        .ok_or_else(|| HostforgeError::Configuration(format!(
            "artifact '{}' has no destination directory",
            artifact.name
        )))?
        .to_path_buf();
    io::ensure_dir(&dir)?;

    with_retry(ctx, &artifact.name, |_| {
        let tmp = tempfile::Builder::new()
            .prefix(".download-")
            .tempfile_in(&dir)?;
        ctx.log
            .info(&artifact.name, format!("GET {}", artifact.url));
        let bytes = fetcher.fetch(&artifact.url, tmp.path())?;
        let sha256 = sha256_file(tmp.path())?;
        if let Some(expected) = &artifact.sha256 {
            if !sha256.eq_ignore_ascii_case(expected.trim()) {
                // A corrupted transfer is worth another attempt.
                return Err(HostforgeError::Http(format!(
                    "checksum mismatch: expected {expected}, got {sha256}"
                )));
            }
        }
        tmp.persist(&dest).map_err(|e| HostforgeError::Io(e.error))?;
        if let Some(mode) = artifact.mode {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(mode))?;
        }
        if let Some(probe) = &artifact.version_probe {
            if !probe_matches(ctx, artifact) {
                // Probed in place; a failing file is removed so it never verifies.
                io::remove_file_if_exists(&dest)?;
                return Err(HostforgeError::Command {
                    command: probe.command.join(" "),
                    detail: format!("version probe did not report '{}'", probe.expect),
                });
            }
        }
        ctx.log.info(
            &artifact.name,
            format!("installed {} ({bytes} bytes)", ctx.target.host_path(&dest).display()),
        );
        Ok(AcquireOutcome::Installed { bytes, sha256 })
    })
}

fn record(ctx: &RunContext, registry: &mut VersionRegistry, artifact: &ArtifactSpec, sha256: String) {
    registry.artifacts.insert(
        artifact.name.clone(),
        InstalledArtifact {
            path: ctx
                .target
                .host_path(&destination(ctx, artifact))
                .display()
                .to_string(),
            version: artifact.version.clone(),
            sha256,
            installed_at: Utc::now(),
        },
    );
}

/// Acquire a single artifact and register its version.
pub fn acquire(
    ctx: &RunContext,
    fetcher: &dyn Fetcher,
    artifact: &ArtifactSpec,
) -> Result<AcquireOutcome> {
    let mut registry = VersionRegistry::load(ctx.root())?;
    let outcome = fetch_verified(ctx, fetcher, &registry, artifact)?;
    if let AcquireOutcome::Installed { sha256, .. } = &outcome {
        record(ctx, &mut registry, artifact, sha256.clone());
        registry.save(ctx.root())?;
    }
    Ok(outcome)
}

/// Acquire several artifacts on a pool of `settings.concurrency.artifact_workers`
/// threads. Results come back in input order; the registry is updated once.
pub fn acquire_all(
    ctx: &RunContext,
    fetcher: &dyn Fetcher,
    artifacts: &[ArtifactSpec],
) -> Result<Vec<(String, Result<AcquireOutcome>)>> {
    let mut registry = VersionRegistry::load(ctx.root())?;
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(ctx.settings.concurrency.artifact_workers.max(1))
        .build()
        .map_err(|e| HostforgeError::Configuration(format!("worker pool: {e}")))?;

    let snapshot = registry.clone();
    let results: Vec<(String, Result<AcquireOutcome>)> = pool.install(|| {
        artifacts
            .par_iter()
            .map(|a| (a.name.clone(), fetch_verified(ctx, fetcher, &snapshot, a)))
            .collect()
    });

    let mut dirty = false;
    for (artifact, (_, result)) in artifacts.iter().zip(&results) {
        if let Ok(AcquireOutcome::Installed { sha256, .. }) = result {
            record(ctx, &mut registry, artifact, sha256.clone());
            dirty = true;
        }
    }
    if dirty {
        registry.save(ctx.root())?;
    }
    Ok(results)
}

// ---------------------------------------------------------------------------
// Packages
// ---------------------------------------------------------------------------

pub trait PackageManager: Send + Sync {
    fn is_installed(&self, ctx: &RunContext, name: &str) -> bool;
    fn install(&self, ctx: &RunContext, names: &[String]) -> Result<()>;
}

/// Debian/Ubuntu packages through `dpkg-query` and `apt-get`.
pub struct Apt;

impl PackageManager for Apt {
    fn is_installed(&self, ctx: &RunContext, name: &str) -> bool {
        let cmd = HostCommand::new("dpkg-query")
            .args(["-W", "-f=${Status}", name])
            .timeout(Duration::from_secs(30));
        match ctx.runner.run(&cmd) {
            Ok(out) => out.success() && out.stdout.contains("install ok installed"),
            Err(_) => false,
        }
    }

    fn install(&self, ctx: &RunContext, names: &[String]) -> Result<()> {
        ctx.exec(
            "packages",
            HostCommand::new("apt-get")
                .args(["update", "-q"])
                .env("DEBIAN_FRONTEND", "noninteractive"),
        )?;
        ctx.exec(
            "packages",
            HostCommand::new("apt-get")
                .args(["install", "-y", "-q", "--no-install-recommends"])
                .args(names.iter().cloned())
                .env("DEBIAN_FRONTEND", "noninteractive"),
        )?;
        Ok(())
    }
}

pub fn missing_packages(ctx: &RunContext, pm: &dyn PackageManager) -> Vec<String> {
    ctx.settings
        .packages
        .iter()
        .filter(|p| !pm.is_installed(ctx, p))
        .cloned()
        .collect()
}

/// Install whatever of `settings.packages` is missing, with retry.
/// Returns the packages that were installed.
pub fn install_packages(ctx: &RunContext, pm: &dyn PackageManager) -> Result<Vec<String>> {
    let missing = missing_packages(ctx, pm);
    if missing.is_empty() {
        ctx.log.info("packages", "all packages present");
        return Ok(missing);
    }
    ctx.log
        .info("packages", format!("installing: {}", missing.join(", ")));
    with_retry(ctx, "packages", |_| pm.install(ctx, &missing))?;
    Ok(missing)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
