#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use ventvault::config::{self, Config};
use ventvault::ratelimit::{self, Identity, Tier};
use ventvault::{gateway, security};

/// VentVault - a private place to vent, with a listener that answers.
#[derive(Parser, Debug)]
#[command(name = "ventvault")]
#[command(version)]
#[command(about = "Privacy-first venting backend.", long_about = None)]
struct Cli {
    /// Config file (default: $VENTVAULT_CONFIG, then ~/.ventvault/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Host to bind to; defaults to config gateway.host
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (use 0 for random available port); defaults to config gateway.port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Scrub PII from TEXT (or stdin) and print the result
    Scrub {
        /// Text to scrub; reads stdin when omitted
        text: Option<String>,
    },

    /// Inspect or create the config file
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Clear the vent counter for one identity
    ResetLimit {
        /// Signed-in user id
        #[arg(long, conflicts_with_all = ["ip", "user_agent"])]
        user_id: Option<String>,

        /// Tier of the user (anonymous, signed_in, premium); default signed_in
        #[arg(long, requires = "user_id")]
        tier: Option<Tier>,

        /// Client IP of an anonymous caller
        #[arg(long, requires = "user_agent")]
        ip: Option<String>,

        /// User agent of an anonymous caller
        #[arg(long, requires = "ip")]
        user_agent: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the effective config with secrets redacted
    Show,
    /// Write the default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Runs before any load so a broken existing file can be replaced.
        Commands::Config {
            action: ConfigCommands::Init { force },
        } => init_config(cli.config.as_deref(), force),

        Commands::Config {
            action: ConfigCommands::Show,
        } => {
            let config = load_config(cli.config.as_deref())?;
            if let Some(path) = &config.config_path {
                eprintln!("# loaded from {}", path.display());
            }
            print!("{}", config.redacted().to_toml()?);
            Ok(())
        }

        Commands::Serve { host, port } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            info!(
                "Starting VentVault gateway on {}:{}",
                config.gateway.host, config.gateway.port
            );
            gateway::run_gateway(config).await
        }

        Commands::Scrub { text } => {
            load_config(cli.config.as_deref())?;
            let text = match text {
                Some(text) => text,
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("failed to read stdin")?;
                    buf
                }
            };
            println!("{}", security::scrub(&text));
            let kinds = security::pii_types(&text);
            if kinds.is_empty() {
                eprintln!("No PII detected");
            } else {
                let names: Vec<&str> = kinds.iter().map(|k| k.as_str()).collect();
                eprintln!("PII detected: {}", names.join(", "));
            }
            Ok(())
        }

        Commands::ResetLimit {
            user_id,
            tier,
            ip,
            user_agent,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let identity = match (user_id, ip, user_agent) {
                (Some(id), _, _) => Identity::user(id, tier),
                (None, Some(ip), Some(ua)) => Identity::anonymous(&ip, &ua),
                _ => bail!("Provide --user-id, or both --ip and --user-agent"),
            };
            ratelimit::reset_limit(&config.cache, &config.rate_limit, &identity).await?;
            println!("Reset vent limit for {}", identity.key());
            Ok(())
        }
    }
}

/// Load the effective config and install the tracing subscriber.
fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let config = Config::load(explicit)?;

    // Initialize logging - respects RUST_LOG env var, defaults to config log_level
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("ventvault={}", config.log_level))),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;
    Ok(config)
}

fn init_config(explicit: Option<&Path>, force: bool) -> Result<()> {
    let path = config::schema::requested_config_path(explicit)
        .or_else(config::schema::default_config_path)
        .context("could not determine home directory for the default config path")?;
    if path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    Config::default().save(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}
