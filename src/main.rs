use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use ngopen::client::{self, AgentConfig};
use ngopen::config::{self, StoredConfig};
use ngopen::hostname;
use ngopen::protocol::AUTO_HOSTNAME;
use ngopen::server::{self, IngressConfig};

#[derive(Parser, Debug)]
#[command(
    name = "ngopen",
    version = env!("CARGO_PKG_VERSION"),
    about = "Expose a local service under a public hostname through a reverse tunnel",
    long_about = "ngopen relays HTTP requests from a public ingress to a local service \
                  over a single outbound tunnel connection, so nothing behind the NAT \
                  needs an open port"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = config::LOG_LEVEL_ENV, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the public ingress (tunnel listener + HTTP front end)
    Server {
        /// Bind address for agent tunnel connections
        #[arg(long, default_value = "0.0.0.0:9000")]
        tunnel_bind: SocketAddr,

        /// Bind address for inbound HTTP
        #[arg(long, default_value = "0.0.0.0:8080")]
        http_bind: SocketAddr,

        /// Dot-prefixed domain appended to generated hostnames
        #[arg(long, env = config::SUFFIX_ENV, default_value = hostname::DEFAULT_SUFFIX)]
        suffix: String,

        /// HTML file served when no tunnel matches the Host header
        #[arg(long, default_value = "static/error.html")]
        error_page: PathBuf,
    },

    /// Expose a local service through the ingress
    Tunnel {
        /// Subdomain to register, or AUTO to let the server assign one
        #[arg(long)]
        hostname: Option<String>,

        /// Local service to forward to (host:port)
        #[arg(long)]
        local: Option<String>,

        /// Tunnel server address
        #[arg(long)]
        server: Option<String>,

        /// Delay between reconnection attempts (e.g. 5s)
        #[arg(long, value_parser = humantime::parse_duration)]
        reconnect_delay: Option<Duration>,

        /// Preserve the original client IP in X-Forwarded-For
        #[arg(long, num_args = 0..=1, default_missing_value = "true")]
        preserve_ip: Option<bool>,

        /// Authentication token for the server
        #[arg(long)]
        auth: Option<String>,

        /// Verbose logging
        #[arg(long)]
        debug: bool,
    },

    /// Show or update saved tunnel defaults
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print one saved value
    Get { key: String },
    /// Save a value
    Set { key: String, value: String },
    /// Print all saved values
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if matches!(&cli.command, Commands::Tunnel { debug: true, .. }) {
        "debug".to_string()
    } else {
        cli.log_level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(level.parse()?)
                .from_env_lossy(),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Server {
            tunnel_bind,
            http_bind,
            suffix,
            error_page,
        } => {
            server::run_server(IngressConfig {
                tunnel_bind,
                http_bind,
                hostname_suffix: suffix,
                error_page,
            })
            .await
        }

        Commands::Tunnel {
            hostname,
            local,
            server,
            reconnect_delay,
            preserve_ip,
            auth,
            debug: _,
        } => {
            let stored = StoredConfig::load()?;
            let cfg = resolve_agent_config(
                hostname,
                local,
                server,
                reconnect_delay,
                preserve_ip,
                auth,
                &stored,
            )?;

            let shutdown = CancellationToken::new();
            tokio::spawn({
                let shutdown = shutdown.clone();
                async move {
                    if wait_for_signal().await.is_ok() {
                        info!("shutdown signal received");
                    }
                    shutdown.cancel();
                }
            });
            client::run_agent(cfg, shutdown).await
        }

        Commands::Config { action } => run_config(action),
    }
}

/// Merges CLI flags over stored defaults over built-in defaults; `--local`
/// and `--auth` must come from one of the two.
fn resolve_agent_config(
    hostname: Option<String>,
    local: Option<String>,
    server: Option<String>,
    reconnect_delay: Option<Duration>,
    preserve_ip: Option<bool>,
    auth: Option<String>,
    stored: &StoredConfig,
) -> Result<AgentConfig> {
    let Some(local) = local.or_else(|| stored.local.clone()) else {
        bail!("--local is required (host:port of the service to expose)");
    };
    let Some(auth_token) = auth.or_else(|| stored.auth.clone()) else {
        bail!("--auth is required");
    };
    let reconnect_delay = match reconnect_delay {
        Some(delay) => delay,
        None => match &stored.reconnect_delay {
            Some(text) => humantime::parse_duration(text)
                .context("invalid reconnect-delay in config file")?,
            None => client::DEFAULT_RECONNECT_DELAY,
        },
    };
    Ok(AgentConfig {
        hostname: hostname
            .or_else(|| stored.hostname.clone())
            .unwrap_or_else(|| AUTO_HOSTNAME.to_string()),
        local,
        server: server
            .or_else(|| stored.server.clone())
            .unwrap_or_else(|| client::DEFAULT_SERVER.to_string()),
        reconnect_delay,
        preserve_ip: preserve_ip.or(stored.preserve_ip).unwrap_or(true),
        auth_token,
    })
}

async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res,
            _ = terminate.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

fn run_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Get { key } => {
            if let Some(value) = StoredConfig::load()?.get(&key)? {
                println!("{value}");
            }
        }
        ConfigAction::Set { key, value } => {
            let mut cfg = StoredConfig::load()?;
            cfg.set(&key, &value)?;
            cfg.save()?;
            println!("{key} = {value}");
        }
        ConfigAction::List => {
            for (key, value) in StoredConfig::load()?.entries() {
                println!("{key} = {value}");
            }
        }
    }
    Ok(())
}
