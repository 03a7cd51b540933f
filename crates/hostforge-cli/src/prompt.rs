//! Terminal prompts for interactive provisioning.

use dialoguer::{Confirm, Input, Password, Select};
use hostforge_core::config::Prompter;
use hostforge_core::settings::KeySpec;
use hostforge_core::{HostforgeError, Result};
use std::io::IsTerminal;

pub struct TerminalPrompter;

/// Whether prompts can be shown at all.
pub fn interactive_terminal() -> bool {
    std::io::stdin().is_terminal() && std::io::stderr().is_terminal()
}

fn closed(e: dialoguer::Error) -> HostforgeError {
    HostforgeError::Aborted(format!("input closed: {e}"))
}

impl Prompter for TerminalPrompter {
    fn input(&self, spec: &KeySpec, current: Option<&str>) -> Result<Option<String>> {
        let mut input = Input::<String>::new()
            .with_prompt(spec.prompt_text())
            .allow_empty(true);
        if let Some(current) = current {
            input = input.default(current.to_string());
        }
        let value = input.interact_text().map_err(closed)?;
        Ok(Some(value).filter(|v| !v.trim().is_empty()))
    }

    fn secret(&self, spec: &KeySpec, has_current: bool) -> Result<Option<String>> {
        let prompt = if has_current {
            format!("{} (empty keeps the current value)", spec.prompt_text())
        } else {
            spec.prompt_text().to_string()
        };
        let value = Password::new()
            .with_prompt(prompt)
            .allow_empty_password(has_current || !spec.required)
            .interact()
            .map_err(closed)?;
        Ok(Some(value).filter(|v| !v.is_empty()))
    }

    fn confirm(&self, question: &str, default: bool) -> Result<bool> {
        Confirm::new()
            .with_prompt(question)
            .default(default)
            .interact()
            .map_err(closed)
    }

    fn choose(&self, question: &str, options: &[&str], default: usize) -> Result<usize> {
        Select::new()
            .with_prompt(question)
            .items(options)
            .default(default)
            .interact()
            .map_err(closed)
    }
}
