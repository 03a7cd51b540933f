pub mod cert;
pub mod config;
pub mod provision;
pub mod reset;
pub mod status;
pub mod validate;

use anyhow::Context;
use hostforge_core::context::{RunContext, Target};
use hostforge_core::env::{self, Ec2Metadata, HostIdentity, MetadataProvider};
use hostforge_core::host::SystemRunner;
use hostforge_core::paths;
use hostforge_core::probe::ReqwestProbe;
use hostforge_core::settings::Settings;
use std::path::Path;
use std::time::Duration;

/// Load settings and open the run log for `root`. Mutating commands pass
/// `lock` so two runs never touch the same target at once.
pub fn open_context(root: &Path, lock: bool) -> anyhow::Result<RunContext> {
    let settings = Settings::load(root).with_context(|| {
        format!(
            "failed to load settings from {}",
            paths::settings_path(root).display()
        )
    })?;
    let runner = SystemRunner::new(Duration::from_secs(settings.retry.timeout_secs));
    let mut ctx = RunContext::with_settings(Target::new(root), settings, Box::new(runner))
        .context("failed to open the run log")?;
    if lock {
        ctx.lock()?;
    }
    tracing::debug!(root = %root.display(), lock, "context opened");
    Ok(ctx)
}

/// HTTP probe for health and validation checks. Self-signed certificates are
/// accepted so the public check can reach a host before ACME succeeds.
pub fn http_probe(ctx: &RunContext) -> anyhow::Result<ReqwestProbe> {
    let timeout = Duration::from_millis(ctx.settings.health.probe_timeout_ms);
    Ok(ReqwestProbe::new(timeout, true)?)
}

/// The instance metadata service, when enabled and constructible.
pub fn metadata_provider(ctx: &RunContext) -> Option<Ec2Metadata> {
    if !ctx.settings.metadata.enabled {
        return None;
    }
    match Ec2Metadata::new(&ctx.settings.metadata) {
        Ok(m) => Some(m),
        Err(e) => {
            ctx.log
                .warn("environment", format!("metadata client unavailable: {e}"));
            None
        }
    }
}

pub fn host_identity(ctx: &RunContext) -> HostIdentity {
    let metadata = metadata_provider(ctx);
    env::resolve(
        metadata.as_ref().map(|m| m as &dyn MetadataProvider),
        &ctx.log,
    )
}
