use anyhow::{Context, Result};
use clap::Parser;
use console::style;
use haven_core::CoreError;
use haven_core::config::HavenConfig;
use haven_core::error::exit_code;
use haven_core::telemetry::{LogConfig, init_tracing_with};

mod client;
mod commands;
mod ui;

#[tokio::main]
async fn main() {
    // clap 自行处理用法错误（退出码 2）
    let cli = client::Cli::parse();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", style("错误:").red().bold(), e);
            error_exit_code(&e)
        }
    };
    std::process::exit(code);
}

async fn run(cli: client::Cli) -> Result<i32> {
    let cfg = HavenConfig::load(cli.config.as_deref())
        .context("无法加载 haven.toml 配置文件，请检查文件内容或路径是否正确")?;

    let log = LogConfig::from(&cfg.telemetry).with_verbosity(cli.verbose);
    init_tracing_with(&log);

    client::run(cli, cfg).await
}

fn error_exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<CoreError>()
        .map_or(exit_code::GENERIC, CoreError::exit_code)
}
