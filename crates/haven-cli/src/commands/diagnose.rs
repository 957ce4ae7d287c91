use anyhow::Result;
use comfy_table::Cell;
use console::style;
use haven_core::CoreError;
use haven_core::diagnostics::{DiagnosticReport, Severity, evaluate, render_pmset, standard_rules};
use haven_core::error::ValidationError;
use haven_core::probe::{ProbeTarget, RemoteProbe, SnapshotSource};
use haven_core::snapshot::PowerSnapshot;
use serde::Serialize;

use crate::client::AppContext;
use crate::ui::{
    create_spinner, log_detail, new_table, print_header, print_info, print_next_step,
    print_success, severity_cell,
};

/// Evaluate a host's power settings
///
/// Without --host the local machine is inspected. Fix commands are only
/// printed, never executed.
#[derive(clap::Parser, Debug)]
pub struct DiagnoseArgs {
    /// Registered server name or host (local machine when omitted)
    #[arg(long, value_name = "NAME")]
    pub host: Option<String>,

    /// Print the pmset commands that resolve each finding
    #[arg(long)]
    pub fixes: bool,

    /// Print the snapshot and findings as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct DiagnoseOutput<'a> {
    snapshot: &'a PowerSnapshot,
    #[serde(flatten)]
    report: &'a DiagnosticReport,
}

pub async fn run_diagnose(ctx: &AppContext, args: DiagnoseArgs) -> Result<i32> {
    let target = match &args.host {
        Some(name) => {
            let record = ctx
                .registry
                .resolve(name)
                .ok_or_else(|| CoreError::from(ValidationError::UnknownTarget(name.clone())))?;
            ProbeTarget::Remote(record)
        }
        None => ProbeTarget::Local,
    };

    let probe = RemoteProbe::new(ctx.executor.clone());
    let spinner = create_spinner(&format!("Collecting power settings from {}...", target.name()));
    let snapshot = probe.snapshot(&target).await;
    spinner.finish_and_clear();
    let snapshot = snapshot?;

    let thresholds = ctx.config.diagnostics.for_host(target.name());
    let findings = evaluate(&snapshot, standard_rules(), &thresholds);
    let report = DiagnosticReport::new(target.name(), findings);

    if args.json {
        let out = DiagnoseOutput {
            snapshot: &snapshot,
            report: &report,
        };
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(report.exit_code());
    }

    print_header(&format!("Power diagnostics for {}", report.host));
    print_snapshot(&snapshot);
    println!();

    if report.is_clean() {
        print_success("No issues found; this host is ready to run as a server");
        return Ok(report.exit_code());
    }

    let mut headers = vec!["SEVERITY", "RULE", "FINDING"];
    if args.fixes {
        headers.push("FIX");
    }
    let mut table = new_table(&headers);
    for f in &report.findings {
        let mut row = vec![
            severity_cell(f.severity),
            Cell::new(&f.rule_id),
            Cell::new(&f.message),
        ];
        if args.fixes {
            row.push(Cell::new(
                f.fix_command.as_deref().map(render_pmset).unwrap_or_default(),
            ));
        }
        table.add_row(row);
    }
    println!("{}", table);

    println!();
    println!(
        "Summary: {} critical, {} warning, {} info",
        style(report.count(Severity::Critical)).red().bold(),
        style(report.count(Severity::Warning)).yellow(),
        report.count(Severity::Info)
    );
    if !args.fixes && report.findings.iter().any(|f| f.fix_command.is_some()) {
        print_next_step("Re-run with --fixes to see the commands that resolve these findings");
    }
    Ok(report.exit_code())
}

fn print_snapshot(s: &PowerSnapshot) {
    let minutes = |v: Option<u32>| match v {
        Some(0) => "never".to_string(),
        Some(m) => format!("{} min", m),
        None => "n/a".to_string(),
    };
    let flag = |v: Option<bool>| match v {
        Some(true) => "on",
        Some(false) => "off",
        None => "n/a",
    };

    log_detail("power source", s.power_source.as_str());
    match s.battery_pct {
        Some(pct) => log_detail("battery", &format!("{}%", pct)),
        None => print_info("No battery reported"),
    }
    log_detail("sleep", &minutes(s.sleep));
    log_detail("disk sleep", &minutes(s.disk_sleep));
    log_detail(
        "hibernate mode",
        &s.hibernate_mode.map_or("n/a".to_string(), |m| m.to_string()),
    );
    log_detail("standby", flag(s.standby));
    log_detail("power nap", flag(s.power_nap));
    log_detail("auto power off", flag(s.auto_power_off));
    log_detail(
        "caffeinate",
        &s.caffeinate_pid
            .map_or("not running".to_string(), |pid| format!("pid {}", pid)),
    );
}
