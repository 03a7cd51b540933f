use crate::cmd::status::print_certificate;
use crate::cmd::{host_identity, http_probe, open_context};
use crate::output::{print_json, print_warnings};
use anyhow::Context;
use chrono::Utc;
use clap::Subcommand;
use hostforge_core::cert::{self, CertManager, CertbotClient, RenewOutcome, SystemResolver};
use hostforge_core::config::{ConfigArtifact, ConfigurationProvider, SuppliedArgs};
use hostforge_core::context::RunContext;
use hostforge_core::provision;
use std::path::Path;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum CertSubcommand {
    /// Obtain a certificate now (ACME when possible, self-signed otherwise)
    Issue {
        /// Domain to certify (repeatable); defaults to the configured DOMAIN
        #[arg(long = "domain")]
        domains: Vec<String>,
    },

    /// Renew the certificate if it is within the renewal threshold
    Renew,

    /// Show the current certificate
    Status,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(root: &Path, subcmd: CertSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        CertSubcommand::Issue { domains } => issue(root, domains, json),
        CertSubcommand::Renew => renew(root, json),
        CertSubcommand::Status => status(root, json),
    }
}

fn load_config(ctx: &RunContext) -> anyhow::Result<ConfigArtifact> {
    ConfigArtifact::load(ctx.root(), ctx.app_name(), &ctx.settings.config_keys)?
        .context("no configuration found; run `hostforge provision` first")
}

// ---------------------------------------------------------------------------
// issue
// ---------------------------------------------------------------------------

fn issue(root: &Path, domains: Vec<String>, json: bool) -> anyhow::Result<()> {
    let ctx = open_context(root, true)?;
    let config = load_config(&ctx)?;
    let domains = if domains.is_empty() {
        cert::domains_from(&config)
    } else {
        domains.iter().map(|d| d.trim().to_lowercase()).collect()
    };

    let identity = host_identity(&ctx);
    let acme = CertbotClient::for_context(&ctx);
    let provider = ConfigurationProvider::NonInteractive(SuppliedArgs::default());
    let manager = CertManager::new(
        &ctx,
        &acme,
        &SystemResolver,
        &provider,
        &identity.public_address,
        config.non_empty("CERT_EMAIL"),
    );
    let outcome = manager.issue(&domains)?;
    provision::refresh_proxy(&ctx, &http_probe(&ctx)?)
        .context("certificate issued but the proxy could not be updated")?;

    if json {
        print_json(&outcome.record)?;
    } else {
        print_warnings(&outcome.warnings);
        let verb = if outcome.changed { "installed" } else { "unchanged" };
        println!("certificate {verb}");
        print_certificate(&cert::status(&ctx)?);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// renew
// ---------------------------------------------------------------------------

fn renew(root: &Path, json: bool) -> anyhow::Result<()> {
    let ctx = open_context(root, true)?;
    let contact = ConfigArtifact::load(ctx.root(), ctx.app_name(), &ctx.settings.config_keys)?
        .and_then(|c| c.non_empty("CERT_EMAIL").map(str::to_string));

    let identity = host_identity(&ctx);
    let acme = CertbotClient::for_context(&ctx);
    let provider = ConfigurationProvider::NonInteractive(SuppliedArgs::default());
    let manager = CertManager::new(
        &ctx,
        &acme,
        &SystemResolver,
        &provider,
        &identity.public_address,
        contact.as_deref(),
    );

    let outcome = manager.renew_if_due(Utc::now())?;
    if let RenewOutcome::Renewed(_) = &outcome {
        provision::refresh_proxy(&ctx, &http_probe(&ctx)?)?;
    }

    if json {
        let value = match &outcome {
            RenewOutcome::NoCertificate => serde_json::json!({ "result": "no_certificate" }),
            RenewOutcome::NotDue { days_remaining } => {
                serde_json::json!({ "result": "not_due", "days_remaining": days_remaining })
            }
            RenewOutcome::Renewed(record) => {
                serde_json::json!({ "result": "renewed", "record": record })
            }
        };
        print_json(&value)?;
    } else {
        match &outcome {
            RenewOutcome::NoCertificate => println!("No certificate to renew."),
            RenewOutcome::NotDue { days_remaining } => {
                println!("Not due: {days_remaining} day(s) remaining.")
            }
            RenewOutcome::Renewed(record) => {
                println!("Renewed; valid until {}.", record.not_after.to_rfc3339())
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

fn status(root: &Path, json: bool) -> anyhow::Result<()> {
    let ctx = open_context(root, false)?;
    let status = cert::status(&ctx)?;
    if json {
        print_json(&status)
    } else {
        print_certificate(&status);
        Ok(())
    }
}
