use crate::cmd::open_context;
use crate::output::{label, print_json, print_table};
use clap::Subcommand;
use hostforge_core::config::{ConfigArtifact, ValueSource};
use hostforge_core::paths;
use hostforge_core::settings::{SettingsWarning, WarnLevel};
use serde::Serialize;
use std::path::Path;

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Print the persisted configuration with secrets masked
    Show,
}

pub fn run(root: &Path, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Show => show(root, json),
    }
}

#[derive(Serialize)]
struct ShownEntry<'a> {
    key: &'a str,
    value: &'a str,
    source: ValueSource,
    secret: bool,
}

#[derive(Serialize)]
struct Shown<'a> {
    path: String,
    entries: Option<Vec<ShownEntry<'a>>>,
    warnings: &'a [SettingsWarning],
}

fn show(root: &Path, json: bool) -> anyhow::Result<()> {
    let ctx = open_context(root, false)?;
    let path = ctx
        .target
        .host_path(&paths::config_artifact_path(root, ctx.app_name()))
        .display()
        .to_string();
    let artifact = ConfigArtifact::load(root, ctx.app_name(), &ctx.settings.config_keys)?;
    let warnings = ctx.settings.validate();

    if json {
        let entries = artifact.as_ref().map(|a| {
            a.entries
                .iter()
                .map(|e| ShownEntry {
                    key: &e.key,
                    value: e.display_value(),
                    source: e.source,
                    secret: e.secret,
                })
                .collect()
        });
        return print_json(&Shown {
            path,
            entries,
            warnings: &warnings,
        });
    }

    match &artifact {
        None => println!("No configuration at {path}."),
        Some(a) => {
            println!("{path}\n");
            let rows = a
                .entries
                .iter()
                .map(|e| {
                    vec![
                        e.key.clone(),
                        e.display_value().to_string(),
                        label(&e.source),
                    ]
                })
                .collect();
            print_table(&["KEY", "VALUE", "SOURCE"], rows);
        }
    }
    if !warnings.is_empty() {
        println!();
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }
    Ok(())
}
