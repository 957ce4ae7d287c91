use anyhow::Result;
use chrono::Local;
use console::style;
use haven_core::diagnostics::{Severity, standard_rules};
use haven_core::error::exit_code;
use haven_core::probe::{ProbeTarget, RemoteProbe};
use haven_core::selector::TargetSelector;
use haven_core::shutdown::GracefulShutdown;
use haven_core::watch::{WatchSample, WatchScheduler};
use std::sync::Arc;
use std::time::Duration;

use crate::client::AppContext;
use crate::ui::{print_header, print_info, print_success};

/// Re-run diagnostics on a fixed interval until Ctrl+C
///
/// A sample that takes longer than the interval delays the next one instead
/// of overlapping it.
#[derive(clap::Parser, Debug)]
pub struct WatchArgs {
    /// Target selector (`all`, `tag:a,b`, names); local machine when omitted
    #[arg(short, long, value_name = "SELECTOR")]
    pub target: Option<String>,

    /// Seconds between samples (defaults to watch.interval_sec)
    #[arg(short, long, value_name = "SECONDS")]
    pub interval: Option<u64>,
}

pub async fn run_watch(ctx: &AppContext, args: WatchArgs) -> Result<i32> {
    let targets = match &args.target {
        Some(raw) => TargetSelector::parse(raw)?
            .resolve(&ctx.registry)?
            .into_iter()
            .map(ProbeTarget::Remote)
            .collect(),
        None => vec![ProbeTarget::Local],
    };
    let interval = Duration::from_secs(args.interval.unwrap_or(ctx.config.watch.interval_sec));
    let grace = Duration::from_secs(ctx.config.watch.grace_period_sec);

    print_header("Watching power settings");
    print_info(&format!(
        "{} target(s) every {}s; press Ctrl+C to stop",
        targets.len(),
        interval.as_secs()
    ));

    let scheduler = WatchScheduler::new(
        Arc::new(RemoteProbe::new(ctx.executor.clone())),
        standard_rules(),
        ctx.config.diagnostics.clone(),
    );
    let handle = scheduler.start(interval, targets, print_sample)?;

    let shutdown = GracefulShutdown::new();
    shutdown.wait_for_signal().await;

    let samples = handle.stats().samples();
    let skipped = handle.stats().skipped_ticks();
    handle.stop(grace).await;

    println!();
    print_success(&format!(
        "Stopped after {} sample(s), {} tick(s) skipped",
        samples, skipped
    ));
    Ok(exit_code::SUCCESS)
}

fn print_sample(sample: WatchSample) {
    let at = sample.taken_at.with_timezone(&Local).format("%H:%M:%S");
    for host in &sample.hosts {
        let prefix = format!("[{}] #{} {}", at, sample.sequence, style(&host.target).bold());
        match &host.result {
            Ok(report) if report.is_clean() => {
                println!("{} {}", prefix, style("ok").green());
            }
            Ok(report) => {
                println!(
                    "{} {} critical, {} warning, {} info",
                    prefix,
                    style(report.count(Severity::Critical)).red().bold(),
                    style(report.count(Severity::Warning)).yellow(),
                    report.count(Severity::Info)
                );
                for f in report
                    .findings
                    .iter()
                    .filter(|f| f.severity >= Severity::Warning)
                {
                    println!("    {:<8} {}", f.severity.as_str(), f.message);
                }
            }
            Err(e) => {
                println!("{} {} {}", prefix, style("error").red(), e);
            }
        }
    }
}
