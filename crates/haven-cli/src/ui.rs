use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table, presets::UTF8_FULL};
use console::{Emoji, Term, style};
use haven_core::deploy::DeploymentState;
use haven_core::diagnostics::Severity;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::time::Duration;

pub struct Symbols;
impl Symbols {
    pub const SUCCESS: Emoji<'static, 'static> = Emoji("✔", "+");
    pub const ERROR: Emoji<'static, 'static> = Emoji("✖", "x");
    pub const WARNING: Emoji<'static, 'static> = Emoji("⚠", "!");
    pub const INFO: Emoji<'static, 'static> = Emoji("ℹ", "i");
    pub const ARROW: Emoji<'static, 'static> = Emoji("➜", ">");
    pub const STEP: Emoji<'static, 'static> = Emoji("⚡", "*");
}

pub fn print_header(title: &str) {
    println!();
    println!("{} {}", Symbols::STEP, style(title).bold().underlined());
    println!();
}

pub fn print_success(message: &str) {
    println!("  {} {}", style(Symbols::SUCCESS).green(), message);
}

pub fn print_error(message: &str) {
    println!("  {} {}", style(Symbols::ERROR).red(), message);
}

pub fn print_warning(message: &str) {
    println!("  {} {}", style(Symbols::WARNING).yellow(), message);
}

pub fn print_info(message: &str) {
    println!("  {} {}", style(Symbols::INFO).blue(), message);
}

pub fn print_next_step(message: &str) {
    println!("  {} {}", style(Symbols::ARROW).cyan(), message);
}

pub fn log_detail(key: &str, value: &str) {
    println!("    {}: {}", style(key).dim(), value);
}

pub fn confirm_action(message: &str, danger: bool) -> bool {
    println!();
    if danger {
        println!(
            "  {} {}",
            style(Symbols::WARNING).yellow(),
            style(message).red().bold()
        );
    } else {
        println!("  {} {}", style("?").blue(), message);
    }

    let term = Term::stdout();
    print!("  {} (y/N): ", style(Symbols::ARROW).cyan());
    let _ = std::io::stdout().flush();

    let input = term.read_line().unwrap_or_default();
    matches!(input.trim().to_lowercase().as_str(), "y" | "yes" | "true")
}

pub fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(s) = ProgressStyle::default_spinner()
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ")
        .template("{spinner:.blue} {msg}")
    {
        pb.set_style(s);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// 按目标计数的进度条
pub fn create_progress_bar(total: u64, message: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    if let Ok(s) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        pb.set_style(s.progress_chars("=>-"));
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

/// 统一风格的表格
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(
        headers
            .iter()
            .map(|h| Cell::new(h).add_attribute(Attribute::Bold))
            .collect::<Vec<_>>(),
    );
    table
}

pub fn severity_cell(severity: Severity) -> Cell {
    let cell = Cell::new(severity.as_str());
    match severity {
        Severity::Critical => cell.fg(Color::Red).add_attribute(Attribute::Bold),
        Severity::Warning => cell.fg(Color::Yellow),
        Severity::Info => cell.fg(Color::Blue),
    }
}

pub fn state_cell(state: DeploymentState, no_op: bool) -> Cell {
    let label = if no_op {
        format!("{} (no-op)", state)
    } else {
        state.to_string()
    };
    let cell = Cell::new(label);
    match state {
        DeploymentState::Succeeded => cell.fg(Color::Green).add_attribute(Attribute::Bold),
        DeploymentState::Failed => cell.fg(Color::Red).add_attribute(Attribute::Bold),
        DeploymentState::TimedOut => cell.fg(Color::Magenta),
        DeploymentState::Cancelled => cell.fg(Color::Yellow),
        DeploymentState::Pending | DeploymentState::Running => cell.fg(Color::Blue),
    }
}

/// 截断字符串（按字符）
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max_len).collect::<String>())
    }
}
