use std::process::ExitCode;

use anyhow::Result;

use crate::config::AppConfig;

/// List accepted and rejected sites. Exits non-zero if any were rejected.
pub fn run(config: &AppConfig) -> Result<ExitCode> {
    let set = super::site_set(config);

    for site in &set.accepted {
        let stages = if site.is_two_stage() { "two-stage" } else { "single-stage" };
        println!(
            "ok       {:<20} {:<10} {:<13} {} -> {}",
            site.id.as_str(),
            site.kind.label(),
            stages,
            site.upstream_url(),
            site.dest.display()
        );
    }
    for rejected in &set.rejected {
        println!("rejected {:<20} {}", rejected.label, rejected.reason);
    }

    println!(
        "\n{} sites accepted, {} rejected",
        set.accepted.len(),
        set.rejected.len()
    );

    if set.rejected.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
