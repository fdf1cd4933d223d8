//! Run enrichment command handler

use crate::cli::RunArgs;
use crate::services::{OutcomeState, RunSummary};
use crate::state::{AppState, RunOverrides};
use anyhow::Context;

pub async fn cmd_run(state: &AppState, args: &RunArgs) -> anyhow::Result<RunSummary> {
    let limit = if args.test {
        Some(state.config.job.test_subset)
    } else {
        args.limit
    };

    let overrides = RunOverrides {
        limit,
        batch_size: args.batch_size,
        dry_run: args.dry_run,
    };

    let job = state.job(args.attribute, overrides)?;
    let summary = job
        .run()
        .await
        .with_context(|| format!("{} enrichment run aborted", args.attribute))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    Ok(summary)
}

pub fn print_summary(summary: &RunSummary) {
    let mode = if summary.dry_run { " (dry run)" } else { "" };
    println!();
    println!("Enrichment summary: {}{}", summary.attribute, mode);
    println!("{:-<70}", "");

    for outcome in &summary.outcomes {
        let marker = match outcome.state {
            OutcomeState::Done => "✓",
            OutcomeState::Failed => "✗",
            OutcomeState::Skipped => "-",
            OutcomeState::Planned => "~",
            OutcomeState::Interrupted => "!",
        };
        let detail = outcome
            .reason
            .as_deref()
            .or(outcome.value.as_deref())
            .unwrap_or_default();
        println!(
            "{} {:<28} {:<12} {}",
            marker,
            truncate(&outcome.name, 28),
            outcome.state.as_str(),
            detail
        );
    }

    println!("{:-<70}", "");
    println!("  Scanned:     {}", summary.scanned);
    println!("  Succeeded:   {}", summary.succeeded);
    println!("  Failed:      {}", summary.failed);
    println!("  Skipped:     {}", summary.skipped);
    if summary.dry_run {
        println!("  Planned:     {}", summary.planned);
    }
    println!(
        "  Duration:    {}s",
        (summary.finished_at - summary.started_at).num_seconds()
    );
    if summary.interrupted {
        println!("  Run was interrupted before finishing the queue.");
    }

    if !summary.failures.is_empty() {
        println!();
        println!("Failures:");
        for failure in &summary.failures {
            println!(
                "  {} ({}): {}",
                failure.name, failure.entity_id, failure.reason
            );
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}
