use crate::cmd::{http_probe, metadata_provider, open_context};
use crate::output::{print_json, print_report, print_table, print_warnings, ConsoleProgress};
use crate::prompt::{interactive_terminal, TerminalPrompter};
use clap::Args;
use hostforge_core::acquire::{Apt, HttpFetcher};
use hostforge_core::cert::{CertbotClient, SystemResolver};
use hostforge_core::config::{ConfigurationProvider, OnExisting, SuppliedArgs};
use hostforge_core::env::MetadataProvider;
use hostforge_core::inspect::DeploymentState;
use hostforge_core::pipeline::{PipelineRun, PlannedStep};
use hostforge_core::provision::{self, Collaborators, ProvisionOptions, ProvisionOutcome};
use hostforge_core::validate::{CheckStatus, Report};
use serde::Serialize;
use std::path::Path;

#[derive(Args)]
pub struct ProvisionArgs {
    /// Inspect and print the plan without changing anything
    #[arg(long)]
    pub check_only: bool,

    /// Restart the app service even if nothing it reads changed
    #[arg(long)]
    pub force_restart: bool,

    /// Reset non-secret keys to their defaults
    #[arg(long)]
    pub force_defaults: bool,

    /// What to do when an installation already exists
    #[arg(long, value_parser = ["reset", "continue", "abort"])]
    pub on_existing: Option<String>,

    /// Supply a configuration value (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE", requires = "non_interactive")]
    pub set: Vec<String>,

    /// Never prompt; take values from --set, the existing file and defaults
    #[arg(long)]
    pub non_interactive: bool,
}

fn on_existing(value: Option<&str>) -> Option<OnExisting> {
    match value? {
        "reset" => Some(OnExisting::Reset),
        "abort" => Some(OnExisting::Abort),
        _ => Some(OnExisting::Continue),
    }
}

fn provider(args: &ProvisionArgs) -> anyhow::Result<ConfigurationProvider> {
    if args.non_interactive || !interactive_terminal() {
        Ok(ConfigurationProvider::NonInteractive(SuppliedArgs {
            values: SuppliedArgs::parse_values(&args.set)?,
            on_existing: on_existing(args.on_existing.as_deref()),
            on_mismatch: None,
        }))
    } else {
        if args.on_existing.is_some() {
            tracing::warn!("--on-existing only applies with --non-interactive; you will be asked");
        }
        Ok(ConfigurationProvider::Interactive(Box::new(TerminalPrompter)))
    }
}

#[derive(Serialize)]
struct ProvisionSummary<'a> {
    initial_state: DeploymentState,
    public_address: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    decision: Option<OnExisting>,
    #[serde(skip_serializing_if = "Option::is_none")]
    plan: Option<&'a [PlannedStep]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    run: Option<&'a PipelineRun>,
    validation: &'a Report,
    warnings: &'a [String],
    log_path: String,
}

pub fn run(root: &Path, args: ProvisionArgs, json: bool) -> anyhow::Result<()> {
    let ctx = open_context(root, !args.check_only)?;
    let provider = provider(&args)?;

    let metadata = metadata_provider(&ctx);
    let fetcher = HttpFetcher::new(ctx.command_timeout())?;
    let acme = CertbotClient::for_context(&ctx);
    let probe = http_probe(&ctx)?;
    let collab = Collaborators {
        metadata: metadata.as_ref().map(|m| m as &dyn MetadataProvider),
        fetcher: &fetcher,
        packages: &Apt,
        acme: &acme,
        dns: &SystemResolver,
        probe: &probe,
        provider: &provider,
        progress: &ConsoleProgress,
    };
    let opts = ProvisionOptions {
        check_only: args.check_only,
        force_restart: args.force_restart,
        force_defaults: args.force_defaults,
    };

    let outcome = provision::provision(&ctx, &collab, opts)?;
    let log_path = ctx.target.host_path(ctx.log.path()).display().to_string();

    if json {
        print_json(&ProvisionSummary {
            initial_state: outcome.inspection.state,
            public_address: &outcome.identity.public_address,
            decision: outcome.decision,
            plan: Some(outcome.plan.as_slice()).filter(|p| !p.is_empty()),
            run: outcome.run.as_ref(),
            validation: &outcome.report,
            warnings: &outcome.warnings,
            log_path,
        })?;
    } else {
        print_human(&outcome, &log_path);
    }

    if let Some(e) = outcome.error() {
        anyhow::bail!("provisioning halted: {e}");
    }
    Ok(())
}

fn print_human(outcome: &ProvisionOutcome, log_path: &str) {
    println!(
        "Host {} was {}.",
        outcome.identity.public_address, outcome.inspection.state
    );
    if !outcome.plan.is_empty() {
        let rows = outcome
            .plan
            .iter()
            .map(|s| {
                let verdict = if s.pending { "would run" } else { "satisfied" };
                vec![s.name.clone(), verdict.to_string()]
            })
            .collect();
        print_table(&["STEP", "PLAN"], rows);
        println!();
    }
    print_warnings(&outcome.warnings);
    print_report(&outcome.report);
    println!(
        "\n{} passed, {} warning(s), {} failed. Full log: {log_path}",
        outcome.report.count(CheckStatus::Pass),
        outcome.report.count(CheckStatus::Warn),
        outcome.report.count(CheckStatus::Fail)
    );
}
