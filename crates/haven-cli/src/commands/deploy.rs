use anyhow::{Context, Result};
use chrono::Utc;
use comfy_table::Cell;
use console::style;
use futures::StreamExt;
use haven_core::deploy::{
    BatchOutcome, BatchSummary, DeployOptions, DeploymentOrchestrator, DeploymentPayload,
    DeploymentResult,
};
use haven_core::selector::TargetSelector;
use haven_core::shutdown::GracefulShutdown;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::client::AppContext;
use crate::ui::{
    create_progress_bar, log_detail, new_table, print_error, print_header, print_success,
    print_warning, state_cell, truncate_string,
};

/// Push a payload manifest to the selected servers
///
/// The manifest is a TOML file naming the files to copy and the setup
/// commands to run. Targets whose deployment marker already matches the
/// payload checksum are skipped as no-ops.
#[derive(clap::Parser, Debug)]
#[command(
    after_help = r#"Examples:
  haven deploy --target all --manifest ./keepawake.toml
  haven deploy --target tag:lab,arm --manifest ./keepawake.toml --concurrency 2
  haven deploy --target mini,air --manifest ./keepawake.toml --timeout 120 --overall-timeout 600

Manifest format:
  name = "keepawake"
  setup_commands = ["bash ~/.haven/keepawake.sh install"]

  [[files]]
  local = "scripts/keepawake.sh"
  remote = ".haven/keepawake.sh"
  mode = 0o755"#
)]
pub struct DeployArgs {
    /// Target selector: `all`, `tag:a,b` or a comma-separated list of names
    #[arg(short, long, value_name = "SELECTOR")]
    pub target: String,

    /// Payload manifest (TOML)
    #[arg(short, long, value_name = "FILE")]
    pub manifest: PathBuf,

    /// Maximum number of servers deployed in parallel
    #[arg(long, value_name = "N")]
    pub concurrency: Option<usize>,

    /// Per-server timeout in seconds
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Whole-batch timeout in seconds (0 disables)
    #[arg(long, value_name = "SECONDS")]
    pub overall_timeout: Option<u64>,
}

pub async fn run_deploy(ctx: &AppContext, args: DeployArgs) -> Result<i32> {
    let selector = TargetSelector::parse(&args.target)?;
    let payload = Arc::new(
        DeploymentPayload::load(&args.manifest)
            .with_context(|| format!("无法加载部署清单 {}", args.manifest.display()))?,
    );

    let mut options = DeployOptions::from_config(&ctx.config.deploy);
    if let Some(n) = args.concurrency {
        options.concurrency_limit = n;
    }
    if let Some(secs) = args.timeout {
        options.per_target_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = args.overall_timeout {
        options.overall_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }

    let total = selector.resolve(&ctx.registry)?.len();

    print_header(&format!("Deploying {}", payload.name()));
    log_detail("targets", &format!("{} ({})", selector, total));
    log_detail("checksum", &payload.checksum()[..12.min(payload.checksum().len())]);
    log_detail("concurrency", &options.concurrency_limit.to_string());
    println!();

    let shutdown = GracefulShutdown::new();
    let token = shutdown.listen();

    let orchestrator = DeploymentOrchestrator::new(ctx.registry.clone(), ctx.executor.clone());
    let mut stream = orchestrator.deploy(&selector, payload, options, token)?;

    let pb = create_progress_bar(total as u64, "deploying");
    let mut results: Vec<DeploymentResult> = Vec::with_capacity(total);
    while let Some(result) = stream.next().await {
        pb.inc(1);
        pb.println(format_progress_line(&result));
        if result.is_success() {
            if let Err(e) = ctx.registry.touch(result.target.as_str(), Utc::now()) {
                tracing::warn!(server = %result.target, error = %e, "Failed to record last_seen");
            }
        }
        results.push(result);
    }
    pb.finish_and_clear();

    if shutdown.is_cancelled() {
        print_warning("Deployment interrupted; remaining servers were cancelled");
    }

    print_results_table(&results);
    let summary = BatchSummary::collect(&results);
    print_summary(&summary);
    Ok(summary.exit_code())
}

fn format_progress_line(result: &DeploymentResult) -> String {
    let secs = result.duration.as_secs_f64();
    if result.is_success() {
        let note = if result.no_op { " (up to date)" } else { "" };
        format!(
            "  {} {}{} in {:.1}s",
            style("✔").green(),
            style(&result.target).bold(),
            note,
            secs
        )
    } else {
        let reason = result
            .error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| result.final_state.to_string());
        format!(
            "  {} {} {} after {:.1}s: {}",
            style("✖").red(),
            style(&result.target).bold(),
            result.final_state,
            secs,
            reason
        )
    }
}

fn print_results_table(results: &[DeploymentResult]) {
    let mut table = new_table(&["SERVER", "STATE", "DURATION", "DETAIL"]);
    for r in results {
        let detail = match &r.error {
            Some(e) => e.to_string(),
            None => r.output.lines().last().unwrap_or("").to_string(),
        };
        table.add_row(vec![
            Cell::new(r.target.as_str()),
            state_cell(r.final_state, r.no_op),
            Cell::new(format!("{:.1}s", r.duration.as_secs_f64())),
            Cell::new(truncate_string(&detail, 60)),
        ]);
    }
    println!("{}", table);
}

fn print_summary(summary: &BatchSummary) {
    println!();
    println!(
        "Summary: {} total, {} succeeded ({} unchanged), {} failed, {} timed out, {} cancelled",
        summary.total,
        summary.succeeded,
        summary.no_op,
        summary.failed,
        summary.timed_out,
        summary.cancelled
    );
    match summary.outcome() {
        BatchOutcome::AllSucceeded => print_success("All servers are up to date"),
        BatchOutcome::PartialFailure => print_warning("Some servers did not complete"),
        BatchOutcome::TotalFailure => print_error("No server completed the deployment"),
    }
}
