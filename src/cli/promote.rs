//! Promotion gate commands

use anyhow::{Context, Result};

use super::helpers::{open_services, print_json, GlobalOpts};

/// Handle `evolver record-trial`
pub fn handle_record_trial(candidate: &str, score: f64, baseline: f64, opts: &GlobalOpts) -> Result<()> {
    let services = open_services(opts)?;
    let stats = services
        .gate
        .record_trial(candidate, score, baseline)
        .with_context(|| format!("Failed to record trial for {}", candidate))?;
    println!(
        "{}: {} trials, {} wins ({:.1}%), avg delta {:+.4}",
        candidate,
        stats.trials,
        stats.wins,
        stats.win_rate * 100.0,
        stats.average_delta
    );
    Ok(())
}

/// Handle `evolver promote`
pub fn handle_promote(candidate: &str, json: bool, opts: &GlobalOpts) -> Result<()> {
    let services = open_services(opts)?;
    let decision = services
        .gate
        .evaluate(candidate)
        .with_context(|| format!("Promotion check for {} failed", candidate))?;
    if json {
        return print_json(&decision);
    }

    println!("{}: {}", candidate, decision.outcome);
    if let Some(detail) = &decision.detail {
        println!("  {}", detail);
    }
    if let Some(path) = &decision.evidence_path {
        println!("  Evidence: {}", path.display());
    }
    Ok(())
}
