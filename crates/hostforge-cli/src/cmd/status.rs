use crate::cmd::open_context;
use crate::output::{label, print_json, print_table};
use hostforge_core::cert::{self, CertStatus};
use hostforge_core::inspect::{self, Inspection};
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct Status<'a> {
    app: &'a str,
    inspection: &'a Inspection,
    certificate: &'a CertStatus,
}

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let ctx = open_context(root, false)?;
    let inspection = inspect::inspect(&ctx);
    let certificate = cert::status(&ctx)?;

    if json {
        return print_json(&Status {
            app: ctx.app_name(),
            inspection: &inspection,
            certificate: &certificate,
        });
    }

    println!("{}: {}", ctx.app_name(), inspection.state);
    println!();
    let rows = inspection
        .evidence
        .iter()
        .map(|e| {
            let present = if e.present { "yes" } else { "no" };
            vec![e.name.clone(), present.to_string(), e.detail.clone()]
        })
        .collect();
    print_table(&["EVIDENCE", "PRESENT", "DETAIL"], rows);
    println!();
    print_certificate(&certificate);
    Ok(())
}

pub fn print_certificate(status: &CertStatus) {
    print!("certificate: {}", label(&status.state));
    if let Some(record) = &status.record {
        print!(
            " via {} for {}",
            label(&record.issuance_method),
            if record.domains.is_empty() {
                "(no domain)".to_string()
            } else {
                record.domains.join(", ")
            }
        );
    }
    println!();
    if let Some(days) = status.days_remaining {
        let due = if status.renewal_due { " (renewal due)" } else { "" };
        println!("expires in {days} day(s){due}");
    }
}
