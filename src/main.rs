use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use apprunner::config::RunnerConfig;
use apprunner::server;

#[derive(Parser)]
#[command(name = "apprunner")]
#[command(version, about = "Clone, build, run and proxy apps from git")]
pub struct Cli {
    /// Directory holding apprunner.toml and the apps directory
    #[arg(long, global = true, env = "APPRUNNER_WORKING_DIR")]
    pub working_dir: Option<PathBuf>,

    /// Address to listen on, e.g. 127.0.0.1:8080. Overrides the config file.
    #[arg(long, global = true, env = "APPRUNNER_ADDR")]
    pub addr: Option<String>,

    /// Config file to use instead of <working-dir>/apprunner.toml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text, env = "APPRUNNER_LOG_FORMAT")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Rehydrate apps and serve the API and proxy (default)
    Serve,
    /// Print the effective configuration
    Config,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let default = if verbose {
        "apprunner=debug,tower_http=debug"
    } else {
        "apprunner=info,tower_http=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

fn load_config(cli: &Cli, working_dir: &Path) -> Result<RunnerConfig> {
    let mut config = RunnerConfig::load(working_dir, cli.config.as_deref())?;
    if let Some(addr) = &cli.addr {
        config.server.addr = addr.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let working_dir = match cli.working_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let working_dir = std::path::absolute(&working_dir)
        .with_context(|| format!("Invalid working directory {}", working_dir.display()))?;

    match cli.command.as_ref().unwrap_or(&Commands::Serve) {
        Commands::Serve => {
            init_tracing(cli.verbose, cli.log_format);
            let config = load_config(&cli, &working_dir)?;
            server::start_server(config).await?;
        }
        Commands::Config => {
            let config = load_config(&cli, &working_dir)?;
            println!("# working dir: {}", config.working_dir.display());
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}
