use crate::cmd::open_context;
use crate::output::{print_json, ConsoleProgress};
use crate::prompt::{interactive_terminal, TerminalPrompter};
use clap::Args;
use hostforge_core::config::Prompter;
use hostforge_core::inspect::DeploymentState;
use hostforge_core::reset::{self, ResetOptions};
use serde::Serialize;
use std::path::Path;

#[derive(Args)]
pub struct ResetArgs {
    /// Do not ask for confirmation
    #[arg(long, short = 'y')]
    pub yes: bool,

    /// Also remove the persisted configuration (secrets included)
    #[arg(long)]
    pub purge_config: bool,
}

#[derive(Serialize)]
struct ResetSummary {
    initial_state: DeploymentState,
    final_state: DeploymentState,
    removed: Vec<String>,
}

pub fn run(root: &Path, args: ResetArgs, json: bool) -> anyhow::Result<()> {
    if !args.yes {
        if !interactive_terminal() {
            anyhow::bail!("refusing to reset without --yes when not attached to a terminal");
        }
        let question = if args.purge_config {
            "Remove the installation AND its configuration from this host?"
        } else {
            "Remove the installation from this host? (configuration is kept)"
        };
        if !TerminalPrompter.confirm(question, false)? {
            anyhow::bail!("reset cancelled");
        }
    }

    let ctx = open_context(root, true)?;
    let opts = ResetOptions {
        purge_config: args.purge_config,
    };
    let outcome = reset::reset(&ctx, opts, &ConsoleProgress)?;

    let removed: Vec<String> = outcome
        .run
        .as_ref()
        .map(|r| r.performed().into_iter().map(str::to_string).collect())
        .unwrap_or_default();

    if json {
        print_json(&ResetSummary {
            initial_state: outcome.initial.state,
            final_state: outcome.final_state,
            removed,
        })?;
    } else if outcome.run.is_none() {
        println!("Nothing to reset: the host is already {}.", outcome.final_state);
    } else {
        println!(
            "Reset complete ({} → {}). Removed: {}.",
            outcome.initial.state,
            outcome.final_state,
            if removed.is_empty() {
                "nothing".to_string()
            } else {
                removed.join(", ")
            }
        );
    }

    if outcome.final_state != DeploymentState::Absent {
        anyhow::bail!(
            "host still inspects as {} after reset",
            outcome.final_state
        );
    }
    Ok(())
}
