use hostforge_core::pipeline::{Progress, StepResult, StepStatus};
use hostforge_core::validate::Report;
use serde::Serialize;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{}", json);
    Ok(())
}

pub fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let header_row: Vec<String> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| format!("{:width$}", h, width = widths[i]))
        .collect();
    println!("{}", header_row.join("  ").trim_end());

    let sep: Vec<String> = widths.iter().map(|&w| "-".repeat(w)).collect();
    println!("{}", sep.join("  "));

    for row in &rows {
        let cells: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                let w = widths.get(i).copied().unwrap_or(0);
                format!("{:width$}", cell, width = w)
            })
            .collect();
        println!("{}", cells.join("  ").trim_end());
    }
}

/// The serde name of a unit-like enum value (`AcmeIssued` → `acme_issued`).
pub fn label<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => "unknown".to_string(),
    }
}

/// Per-step progress on stderr, so stdout stays clean for `--json`.
pub struct ConsoleProgress;

impl Progress for ConsoleProgress {
    fn started(&self, name: &str) {
        eprintln!("[start] {name}");
    }

    fn finished(&self, result: &StepResult) {
        match result.status {
            StepStatus::Success => eprintln!("[ok]    {}", result.name),
            StepStatus::Skipped => eprintln!("[skip]  {} (already satisfied)", result.name),
            StepStatus::Failed => eprintln!(
                "[fail]  {}: {}",
                result.name,
                result.error.as_deref().unwrap_or("failed")
            ),
        }
    }
}

pub fn print_warnings(warnings: &[String]) {
    for w in warnings {
        eprintln!("[warn]  {w}");
    }
}

pub fn print_report(report: &Report) {
    let rows = report
        .checks
        .iter()
        .map(|c| vec![c.name.clone(), c.status.to_string(), c.detail.clone()])
        .collect();
    print_table(&["CHECK", "STATUS", "DETAIL"], rows);
}
