//! Read-only scheduler views: status, weights, fused fitness

use anyhow::{Context, Result};
use chrono::Utc;

use super::helpers::{open_services, print_json, GlobalOpts};

/// Handle `evolver status`
pub fn handle_status(json: bool, opts: &GlobalOpts) -> Result<()> {
    let services = open_services(opts)?;
    let status = services.executor.status_report();
    if json {
        return print_json(&status);
    }

    println!("Circuit:    {}", if status.circuit_open { "OPEN" } else { "closed" });
    if let Some(until) = status.circuit_open_until {
        println!("  Open until {}", until.to_rfc3339());
    }
    println!("  Recent failures: {}", status.recent_failures);
    match status.last_start {
        Some(at) => println!(
            "Last start: {} ({}s until next allowed)",
            at.to_rfc3339(),
            status.rate_limit_remaining_secs
        ),
        None => println!("Last start: never"),
    }
    println!("Regime:     {}", status.regime);
    println!("Queue:      {}/{}", status.queue.len(), status.queue_capacity);
    for (i, question) in status.queue.iter().enumerate() {
        println!("  {}. {}", i + 1, question);
    }

    if status.questions.is_empty() {
        println!("No questions yet");
        return Ok(());
    }
    println!();
    println!("{:<32} {:<10} {:>5} {:>10}", "QUESTION", "STATUS", "RUNS", "VARIANCE");
    for (id, q) in &status.questions {
        let variance = q
            .variance
            .map(|v| format!("{:.5}", v))
            .unwrap_or_else(|| "-".to_string());
        println!("{:<32} {:<10} {:>5} {:>10}", id, q.status, q.history.len(), variance);
    }
    Ok(())
}

/// Handle `evolver weights`
pub fn handle_weights(json: bool, opts: &GlobalOpts) -> Result<()> {
    let services = open_services(opts)?;
    let weights = services.executor.bandit_weights();
    let regime = services.executor.regime();
    if json {
        return print_json(&serde_json::json!({ "regime": regime, "weights": weights }));
    }

    println!("Regime: {}", regime);
    if weights.is_empty() {
        println!("No categories recorded yet");
        return Ok(());
    }
    println!("{:<24} {:>10} {:>8}", "CATEGORY", "SCORE", "WEIGHT");
    for w in &weights {
        let score = if w.score.is_infinite() {
            "untried".to_string()
        } else {
            format!("{:.4}", w.score)
        };
        println!("{:<24} {:>10} {:>8.3}", w.category, score, w.weight);
    }
    Ok(())
}

/// Handle `evolver fuse <candidate>`; accepts a candidate name or genome hash
pub fn handle_fuse(candidate: &str, json: bool, opts: &GlobalOpts) -> Result<()> {
    let services = open_services(opts)?;
    let hash = {
        let registry = services
            .registry
            .lock()
            .map_err(|_| anyhow::anyhow!("registry lock poisoned"))?;
        registry
            .get(candidate)
            .map(|g| g.hash().to_string())
            .unwrap_or_else(|| candidate.to_string())
    };
    let fused = services
        .fusion
        .fuse(&hash, Utc::now())
        .with_context(|| format!("Failed to fuse fitness for {}", candidate))?;
    if json {
        return print_json(&fused);
    }

    let component = |c: Option<f64>| c.map(|v| format!("{:.4}", v)).unwrap_or_else(|| "-".to_string());
    println!("Candidate:  {}", candidate);
    println!("Score:      {:.4} ({})", fused.score, fused.confidence_reason);
    println!(
        "Production: {} (weight {:.2}, {} samples)",
        component(fused.production_component),
        fused.weight_production,
        fused.sample_count_production
    );
    println!(
        "Synthetic:  {} (weight {:.2}, {} samples)",
        component(fused.synthetic_component),
        fused.weight_synthetic,
        fused.sample_count_synthetic
    );
    Ok(())
}
