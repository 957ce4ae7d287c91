use crate::commands::deploy::{DeployArgs, run_deploy};
use crate::commands::diagnose::{DiagnoseArgs, run_diagnose};
use crate::commands::server::{ServerCommands, run_server};
use crate::commands::watch::{WatchArgs, run_watch};
use anyhow::{Context, Result};
use clap::Parser;
use haven_core::config::HavenConfig;
use haven_core::executor::RemoteExecutor;
use haven_core::registry::ServerRegistry;
use haven_core::transport::SshTransport;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Keep laptops-turned-servers awake and in sync",
    long_about = None,
    after_help = r#"Examples:
  # Register hosts
  haven server add mini --host 192.168.1.20 --user admin --tag lab
  haven server add air --host air.local --user pi --key ~/.ssh/id_ed25519 --tag lab --tag arm
  haven server list --tag lab
  haven server test mini

  # Diagnose power settings (local host when --host is omitted)
  haven diagnose
  haven diagnose --host mini --fixes
  haven diagnose --host mini --json

  # Push a payload manifest (target: all | tag:a,b | name1,name2)
  haven deploy --target tag:lab --manifest ./keepawake.toml
  haven deploy --target mini,air --manifest ./keepawake.toml --concurrency 2 --timeout 120

  # Re-run diagnostics every 30 seconds until Ctrl+C
  haven watch --target all --interval 30

For detailed options:
  haven server --help
  haven deploy --help
  haven diagnose --help
  haven watch --help"#
)]
pub struct Cli {
    /// Configuration file path (defaults to HAVEN_CONFIG or the platform config dir)
    #[arg(long, global = true, value_name = "CONFIG_FILE")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Manage the server registry
    Server {
        #[command(subcommand)]
        cmd: ServerCommands,
    },
    /// Deploy a payload manifest to selected servers
    Deploy(DeployArgs),
    /// Evaluate power settings against the standard rule table
    Diagnose(DiagnoseArgs),
    /// Periodically diagnose targets until interrupted
    Watch(WatchArgs),
}

/// 各子命令共享的运行上下文
pub struct AppContext {
    pub config: HavenConfig,
    pub registry: Arc<ServerRegistry>,
    pub executor: RemoteExecutor,
}

impl AppContext {
    pub fn new(config: HavenConfig) -> Result<Self> {
        let path = config.registry_path();
        let registry = ServerRegistry::open(path.clone())
            .with_context(|| format!("无法打开服务器注册表 {}", path.display()))?;
        tracing::debug!(path = %path.display(), servers = registry.len(), "Registry opened");

        let transport = Arc::new(SshTransport::new(config.ssh.key_path.clone()));
        let executor = RemoteExecutor::from_config(transport, &config.ssh);

        Ok(Self {
            config,
            registry: Arc::new(registry),
            executor,
        })
    }
}

/// 分发子命令，返回进程退出码
pub async fn run(cli: Cli, cfg: HavenConfig) -> Result<i32> {
    let ctx = AppContext::new(cfg)?;

    match cli.command {
        Commands::Server { cmd } => run_server(&ctx, cmd).await,
        Commands::Deploy(args) => run_deploy(&ctx, args).await,
        Commands::Diagnose(args) => run_diagnose(&ctx, args).await,
        Commands::Watch(args) => run_watch(&ctx, args).await,
    }
}
