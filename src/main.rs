mod config;
mod connection;
mod error;
mod frame;
mod gateway_server;
mod handler;
mod identity;
mod outbound;
mod registry;
mod runtime;
mod session_store;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use config::{Config, DEFAULT_CONFIG_PATH};
use identity::HmacTokenValidator;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "Authenticated WebSocket channel gateway")]
struct Cli {
    /// Path to TOML config file.
    #[arg(
        long,
        global = true,
        env = "CHANNEL_GATEWAY_CONFIG",
        default_value = DEFAULT_CONFIG_PATH
    )]
    config: PathBuf,

    /// Override the listener address.
    #[arg(long, global = true)]
    bind: Option<String>,

    /// Override the token signing secret.
    #[arg(long, global = true)]
    secret: Option<String>,

    /// Log level filter, e.g. info,debug,trace.
    #[arg(long, global = true, env = "CHANNEL_GATEWAY_LOG", default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum CliCommand {
    /// Run the gateway until ctrl-c.
    Run,
    /// Load and validate the config, then print the effective settings.
    Check,
    /// Bearer token utilities.
    Token(TokenArgs),
}

#[derive(Debug, Clone, Args)]
struct TokenArgs {
    #[command(subcommand)]
    command: TokenSubcommand,
}

#[derive(Debug, Clone, Subcommand)]
enum TokenSubcommand {
    /// Issue a signed token for a subject.
    Issue {
        #[arg(long)]
        subject: String,
        /// Lifetime in seconds; defaults to identity.token_ttl_secs.
        #[arg(long = "ttl-secs")]
        ttl_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log)?;

    let command = cli.command.clone().unwrap_or(CliCommand::Run);
    match command {
        CliCommand::Run => run_gateway(&cli).await,
        CliCommand::Check => run_check(&cli),
        CliCommand::Token(args) => run_token_command(&cli, args),
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut cfg = Config::load(&cli.config)?;
    cfg.apply_cli_overrides(cli.bind.as_deref(), cli.secret.as_deref());
    cfg.validate()?;
    Ok(cfg)
}

async fn run_gateway(cli: &Cli) -> Result<()> {
    let cfg = load_config(cli)?;
    let runtime = runtime::GatewayRuntime::new(cfg).await?;
    runtime.run().await
}

fn run_check(cli: &Cli) -> Result<()> {
    let cfg = load_config(cli)?;
    println!("{}", serde_json::to_string_pretty(&cfg.summary())?);
    Ok(())
}

fn run_token_command(cli: &Cli, args: TokenArgs) -> Result<()> {
    match args.command {
        TokenSubcommand::Issue { subject, ttl_secs } => {
            let cfg = load_config(cli)?;
            let token = issue_token(&cfg, &subject, ttl_secs)?;
            println!("{token}");
            Ok(())
        }
    }
}

fn issue_token(cfg: &Config, subject: &str, ttl_secs: Option<u64>) -> Result<String> {
    let subject = subject.trim();
    if subject.is_empty() {
        anyhow::bail!("--subject must not be empty");
    }
    let secret = cfg.identity.secret.as_deref().unwrap_or_default();
    let ttl = Duration::from_secs(ttl_secs.unwrap_or(cfg.identity.token_ttl_secs).max(1));
    HmacTokenValidator::new(secret)?.issue(subject, ttl)
}

fn init_logging(filter: &str) -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env)
        .with_target(false)
        .init();
    Ok(())
}
