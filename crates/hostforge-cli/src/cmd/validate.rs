use crate::cmd::{host_identity, http_probe, open_context};
use crate::output::{print_json, print_report};
use hostforge_core::inspect;
use hostforge_core::paths;
use hostforge_core::validate::{self, CheckStatus};
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let ctx = open_context(root, true)?;
    let identity = host_identity(&ctx);
    let probe = http_probe(&ctx)?;

    let inspection = inspect::inspect(&ctx);
    let report = validate::validate(&ctx, &probe, &identity.public_address);
    validate::write_report(&ctx, &report, Some(&inspection), None)?;

    if json {
        print_json(&report)?;
    } else {
        print_report(&report);
        println!(
            "\nReport: {}",
            ctx.target.host_path(&paths::report_md_path(root)).display()
        );
    }

    let failed = report.count(CheckStatus::Fail);
    if failed > 0 {
        anyhow::bail!("{failed} check(s) failed");
    }
    Ok(())
}
