use anyhow::Result;
use chrono::{Local, Utc};
use comfy_table::{Cell, Color};
use console::style;
use haven_core::CoreError;
use haven_core::error::{ValidationError, exit_code};
use haven_core::registry::ServerRecord;
use std::path::PathBuf;

use crate::client::AppContext;
use crate::ui::{
    confirm_action, create_spinner, log_detail, new_table, print_error, print_header, print_info,
    print_next_step, print_success, print_warning,
};

/// Server registry management
///
/// Records live in `servers.toml` under the platform config dir
/// (override with HAVEN_REGISTRY or `registry.path`).
#[derive(clap::Subcommand, Debug)]
pub enum ServerCommands {
    /// Register a new server
    Add {
        /// Unique server name
        name: String,
        /// Host name or IP address (falls back to HAVEN_HOST)
        #[arg(long)]
        host: Option<String>,
        /// SSH user (falls back to HAVEN_USER, then $USER)
        #[arg(long)]
        user: Option<String>,
        /// SSH port (falls back to HAVEN_PORT, then 22)
        #[arg(long)]
        port: Option<u16>,
        /// Private key used for this server
        #[arg(long, value_name = "PATH")]
        key: Option<PathBuf>,
        /// Tag to attach; repeat or separate with commas
        #[arg(long = "tag", value_name = "TAG", value_delimiter = ',', action = clap::ArgAction::Append)]
        tags: Vec<String>,
        /// Register the server as disabled (excluded from `all` and tag selections)
        #[arg(long)]
        disabled: bool,
    },
    /// Remove a server from the registry
    #[command(alias = "rm")]
    Remove {
        name: String,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// List registered servers
    #[command(alias = "ls")]
    List {
        /// Only servers carrying all of these tags
        #[arg(long = "tag", value_name = "TAG", value_delimiter = ',', action = clap::ArgAction::Append)]
        tags: Vec<String>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show one server by name or host
    Show { name: String },
    /// Check that a server is reachable over SSH
    Test { name: String },
    /// Include a server in `all` and tag selections again
    Enable { name: String },
    /// Exclude a server from `all` and tag selections
    Disable { name: String },
}

pub async fn run_server(ctx: &AppContext, cmd: ServerCommands) -> Result<i32> {
    match cmd {
        ServerCommands::Add {
            name,
            host,
            user,
            port,
            key,
            tags,
            disabled,
        } => run_add(ctx, name, host, user, port, key, tags, disabled),
        ServerCommands::Remove { name, yes } => run_remove(ctx, &name, yes),
        ServerCommands::List { tags, json } => run_list(ctx, &tags, json),
        ServerCommands::Show { name } => run_show(ctx, &name),
        ServerCommands::Test { name } => run_test(ctx, &name).await,
        ServerCommands::Enable { name } => set_enabled(ctx, &name, true),
        ServerCommands::Disable { name } => set_enabled(ctx, &name, false),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_add(
    ctx: &AppContext,
    name: String,
    host: Option<String>,
    user: Option<String>,
    port: Option<u16>,
    key: Option<PathBuf>,
    tags: Vec<String>,
    disabled: bool,
) -> Result<i32> {
    let defaults = &ctx.config.defaults;
    let missing = |field: &str| {
        CoreError::from(ValidationError::InvalidRecord {
            name: name.clone(),
            reason: format!("--{} is required (or set HAVEN_{})", field, field.to_uppercase()),
        })
    };

    let host = host
        .or_else(|| defaults.host.clone())
        .ok_or_else(|| missing("host"))?;
    let user = user
        .or_else(|| defaults.user.clone())
        .or_else(|| std::env::var("USER").ok())
        .ok_or_else(|| missing("user"))?;
    let port = port.unwrap_or(defaults.port);

    let mut record = ServerRecord::new(name, host, user)
        .with_port(port)
        .with_tags(tags.into_iter().map(|t| t.trim().to_string()).filter(|t| !t.is_empty()));
    if let Some(key) = key {
        record = record.with_key(key);
    }
    if disabled {
        record = record.disabled();
    }

    let endpoint = record.endpoint();
    let name = record.name.clone();
    ctx.registry.add(record)?;

    print_success(&format!("Registered {} ({})", style(&name).bold(), endpoint));
    print_next_step(&format!("Verify connectivity with `haven server test {}`", name));
    Ok(exit_code::SUCCESS)
}

fn run_remove(ctx: &AppContext, name: &str, yes: bool) -> Result<i32> {
    let record = ctx
        .registry
        .get(name)
        .ok_or_else(|| not_found(name))?;

    if !yes && !confirm_action(&format!("Remove {} ({})?", name, record.endpoint()), true) {
        print_info("Aborted");
        return Ok(exit_code::SUCCESS);
    }

    ctx.registry.remove(name)?;
    print_success(&format!("Removed {}", style(name).bold()));
    Ok(exit_code::SUCCESS)
}

fn run_list(ctx: &AppContext, tags: &[String], json: bool) -> Result<i32> {
    let records = ctx.registry.list(tags);

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(exit_code::SUCCESS);
    }

    if records.is_empty() {
        print_info("No servers registered");
        print_next_step("Add one with `haven server add <name> --host <host> --user <user>`");
        return Ok(exit_code::SUCCESS);
    }

    let mut table = new_table(&["NAME", "ENDPOINT", "TAGS", "ENABLED", "LAST SEEN"]);
    for r in &records {
        let tags = if r.tags.is_empty() {
            "-".to_string()
        } else {
            r.tags.iter().cloned().collect::<Vec<_>>().join(",")
        };
        let enabled = if r.enabled {
            Cell::new("yes").fg(Color::Green)
        } else {
            Cell::new("no").fg(Color::DarkGrey)
        };
        table.add_row(vec![
            Cell::new(r.name.as_str()),
            Cell::new(r.endpoint()),
            Cell::new(tags),
            enabled,
            Cell::new(format_last_seen(r)),
        ]);
    }
    println!("{}", table);

    let disabled = records.iter().filter(|r| !r.enabled).count();
    println!();
    println!(
        "Summary: {} total, {} enabled, {} disabled",
        records.len(),
        records.len() - disabled,
        disabled
    );
    Ok(exit_code::SUCCESS)
}

fn run_show(ctx: &AppContext, name: &str) -> Result<i32> {
    let record = ctx
        .registry
        .resolve(name)
        .ok_or_else(|| not_found(name))?;

    print_header(&format!("Server {}", record.name));
    log_detail("host", &record.host);
    log_detail("port", &record.port.to_string());
    log_detail("user", &record.user);
    log_detail(
        "key",
        &record
            .auth_key_path
            .as_ref()
            .or(ctx.config.ssh.key_path.as_ref())
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(ssh default)".to_string()),
    );
    log_detail(
        "tags",
        &record.tags.iter().cloned().collect::<Vec<_>>().join(", "),
    );
    log_detail("enabled", if record.enabled { "yes" } else { "no" });
    log_detail("last seen", &format_last_seen(&record));
    Ok(exit_code::SUCCESS)
}

async fn run_test(ctx: &AppContext, name: &str) -> Result<i32> {
    let record = ctx
        .registry
        .resolve(name)
        .ok_or_else(|| not_found(name))?;

    let spinner = create_spinner(&format!("Connecting to {}...", record.endpoint()));
    let result = ctx.executor.test_connection(&record).await;
    spinner.finish_and_clear();

    match result {
        Ok(rtt) => {
            ctx.registry.touch(record.name.as_str(), Utc::now())?;
            print_success(&format!(
                "{} is reachable ({} ms)",
                style(&record.name).bold(),
                rtt.as_millis()
            ));
            Ok(exit_code::SUCCESS)
        }
        Err(e) => {
            print_error(&format!("{} is unreachable: {}", style(&record.name).bold(), e));
            Err(e.into())
        }
    }
}

fn set_enabled(ctx: &AppContext, name: &str, enabled: bool) -> Result<i32> {
    let mut record = ctx
        .registry
        .get(name)
        .ok_or_else(|| not_found(name))?;

    if record.enabled == enabled {
        print_warning(&format!(
            "{} is already {}",
            name,
            if enabled { "enabled" } else { "disabled" }
        ));
        return Ok(exit_code::SUCCESS);
    }

    record.enabled = enabled;
    ctx.registry.update(record)?;
    print_success(&format!(
        "{} {}",
        if enabled { "Enabled" } else { "Disabled" },
        style(name).bold()
    ));
    Ok(exit_code::SUCCESS)
}

fn not_found(name: &str) -> CoreError {
    ValidationError::NotFound(name.to_string()).into()
}

fn format_last_seen(record: &ServerRecord) -> String {
    record
        .last_seen
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string())
}
