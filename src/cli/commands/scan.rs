//! Scan command handler

use crate::domain::AttributeKind;
use crate::state::{AppState, RunOverrides};
use anyhow::Context;

pub async fn cmd_scan(
    state: &AppState,
    attribute: AttributeKind,
    limit: Option<usize>,
) -> anyhow::Result<()> {
    let overrides = RunOverrides {
        limit: Some(limit.unwrap_or(usize::MAX)),
        dry_run: true,
        ..RunOverrides::default()
    };

    let job = state.job(attribute, overrides)?;
    let plan = job
        .plan()
        .await
        .with_context(|| format!("Failed to scan companions for {attribute}"))?;

    if plan.queue.is_empty() {
        println!("No companions need a {attribute}.");
        println!("Scanned {} records.", plan.scanned);
        return Ok(());
    }

    println!(
        "Companions needing a {} ({} of {} scanned)",
        attribute,
        plan.queue.len(),
        plan.scanned
    );
    println!("{:-<70}", "");

    for candidate in &plan.queue {
        let entity = &candidate.entity;
        println!("• {} [{}]", entity.name, candidate.eligibility);
        let current = entity.attribute(attribute).unwrap_or("(empty)");
        println!("  ID: {} | Current: {}", entity.id, current);
    }

    if plan.interrupted {
        println!();
        println!("Scan interrupted; list may be incomplete.");
    }

    Ok(())
}
