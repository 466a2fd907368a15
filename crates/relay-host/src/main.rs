//! Prompt Relay host: entry point.
//!
//! This binary runs on the desktop next to the editor.  It prints a pairing
//! payload (render it as a QR code), accepts the phone's WebSocket
//! connection, and writes every received prompt to stdout as one JSON line.
//!
//! # Usage
//!
//! ```text
//! relay-host [--config <PATH>] [COMMAND]
//!
//! Commands:
//!   serve        Run the relay (default)
//!   interfaces   Show every interface address and which one pairing uses
//!   config-path  Print where host.toml is read from
//!   init-config  Write a host.toml with every default spelled out
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable                     | Flag               |
//! |------------------------------|--------------------|
//! | `PROMPT_RELAY_CONFIG`        | `--config`         |
//! | `PROMPT_RELAY_BIND`          | `--bind`           |
//! | `PROMPT_RELAY_PORT`          | `--port`           |
//! | `PROMPT_RELAY_CODE_TTL`      | `--code-ttl`       |
//! | `PROMPT_RELAY_RESUME_GRACE`  | `--resume-grace`   |
//! | `PROMPT_RELAY_LOG_LEVEL`     | `--log-level`      |
//!
//! Flags beat environment variables, which beat `host.toml`, which beats the
//! built-in defaults.  `RUST_LOG` beats every log-level setting.
//!
//! # Output streams
//!
//! stdout carries only JSON lines (pairing payloads, prompts, statuses) for
//! the editor extension.  Logs go to stderr.

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use relay_host::application::pairing::pairing_payload;
use relay_host::application::RelayService;
use relay_host::infrastructure::network::address::{
    diagnose, resolve_primary_address, AddressResolutionError, NetworkAddress, SystemInterfaces,
};
use relay_host::infrastructure::storage::config::{
    config_file_path, load_config, save_config, HostConfig,
};
use relay_host::infrastructure::{JsonLinesConsumer, RelayServer};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Prompt Relay desktop host.
///
/// Pairs with a phone over the local network and forwards its prompts to the
/// editor extension reading this process's stdout.
#[derive(Debug, Parser)]
#[command(
    name = "relay-host",
    about = "Relay prompts typed on a phone to a desktop editor",
    version
)]
struct Cli {
    /// Path to host.toml (defaults to the platform config directory).
    #[arg(long, global = true, env = "PROMPT_RELAY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the relay (the default when no command is given).
    Serve(ServeArgs),
    /// Show every interface address and which one the pairing payload uses.
    Interfaces,
    /// Print the path host.toml is read from.
    ConfigPath,
    /// Write a host.toml containing every default.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

/// Overrides applied on top of host.toml.
#[derive(Debug, Default, Args)]
struct ServeArgs {
    /// IP address to bind.  `0.0.0.0` accepts phones on the LAN.
    #[arg(long, env = "PROMPT_RELAY_BIND")]
    bind: Option<String>,

    /// TCP port to listen on (also embedded in the pairing payload).
    #[arg(long, env = "PROMPT_RELAY_PORT")]
    port: Option<u16>,

    /// Pairing code lifetime in seconds.
    #[arg(long, env = "PROMPT_RELAY_CODE_TTL")]
    code_ttl: Option<u64>,

    /// Seconds a dropped phone may take to resume its session.
    #[arg(long, env = "PROMPT_RELAY_RESUME_GRACE")]
    resume_grace: Option<u64>,

    /// Log level used when RUST_LOG is unset.
    #[arg(long, env = "PROMPT_RELAY_LOG_LEVEL")]
    log_level: Option<String>,
}

impl ServeArgs {
    fn apply(&self, config: &mut HostConfig) {
        if let Some(bind) = &self.bind {
            config.network.bind_address = bind.clone();
        }
        if let Some(port) = self.port {
            config.network.port = port;
        }
        if let Some(ttl) = self.code_ttl {
            config.pairing.code_ttl_secs = ttl;
        }
        if let Some(grace) = self.resume_grace {
            config.relay.resume_grace_secs = grace;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None => serve(cli.config, ServeArgs::default()).await,
        Some(Command::Serve(args)) => serve(cli.config, args).await,
        Some(Command::Interfaces) => {
            init_logging("warn");
            print_interfaces()
        }
        Some(Command::ConfigPath) => {
            println!("{}", resolve_config_path(cli.config)?.display());
            Ok(())
        }
        Some(Command::InitConfig { force }) => {
            init_logging("info");
            init_config(cli.config, force)
        }
    }
}

/// Installs the stderr log subscriber.  `RUST_LOG` wins over `level`.
fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}

fn resolve_config_path(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => config_file_path().context("no --config given and no platform config directory"),
    }
}

// ── serve ─────────────────────────────────────────────────────────────────────

async fn serve(config_path: Option<PathBuf>, args: ServeArgs) -> anyhow::Result<()> {
    let mut config = load_config(config_path.as_deref()).context("failed to load host.toml")?;
    args.apply(&mut config);
    init_logging(&config.logging.level);
    config.validate().context("invalid configuration")?;

    let bind_addr = config.bind_addr()?;
    info!("Prompt Relay host starting on {bind_addr}");

    let consumer = Arc::new(JsonLinesConsumer::stdout());
    let service = RelayService::new(config.service_settings(), consumer.clone());
    let server = RelayServer::bind(bind_addr, Arc::clone(&service)).await?;
    let port = server.local_addr()?.port();

    // ── Graceful shutdown flag ────────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, shutting down");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => tracing::error!("failed to listen for Ctrl+C signal: {e}"),
        }
    });

    // ── Pairing code maintenance ──────────────────────────────────────────────
    //
    // Sweeps expired codes and issues a new one whenever none is pending, so
    // a scannable code is always on offer.
    let loopback_bind = bind_addr.ip().is_loopback();
    let sweep_interval = config.sweep_interval();
    let maintenance = {
        let service = Arc::clone(&service);
        let consumer = Arc::clone(&consumer);
        let running = Arc::clone(&running);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            while running.load(Ordering::Relaxed) {
                ticker.tick().await;
                match service.ensure_pairing_code().await {
                    Ok(Some(code)) => {
                        let address = pairing_address(loopback_bind);
                        let payload = pairing_payload(address.address, port, code);
                        info!("new pairing code on offer at {}", payload.ws_url());
                        consumer.emit_pairing(&payload).await;
                    }
                    Ok(None) => {}
                    Err(e) => warn!("could not issue a pairing code: {e}"),
                }
            }
        })
    };

    server.run(running).await?;
    maintenance.abort();

    info!("Prompt Relay host stopped");
    Ok(())
}

/// Resolves the address to advertise, fresh for every new code so a network
/// change is picked up.
fn pairing_address(loopback_bind: bool) -> NetworkAddress {
    if loopback_bind {
        return NetworkAddress::loopback();
    }
    match resolve_primary_address(&SystemInterfaces) {
        Ok(address) => address,
        Err(AddressResolutionError::NotFound) => {
            warn!("no LAN IPv4 address found: remote pairing disabled, advertising 127.0.0.1");
            NetworkAddress::loopback()
        }
        Err(e) => {
            warn!("{e}: remote pairing disabled, advertising 127.0.0.1");
            NetworkAddress::loopback()
        }
    }
}

// ── interfaces ────────────────────────────────────────────────────────────────

fn print_interfaces() -> anyhow::Result<()> {
    let report = diagnose(&SystemInterfaces).context("failed to enumerate interfaces")?;

    println!("{:<16} {:<40} {:<6} {:<9} SELECTED", "INTERFACE", "ADDRESS", "FAMILY", "INTERNAL");
    for iface in &report.interfaces {
        let family = if iface.address.is_ipv4() { "IPv4" } else { "IPv6" };
        let selected = report
            .selected
            .as_ref()
            .is_some_and(|s| s.interface == iface.name && std::net::IpAddr::V4(s.address) == iface.address);
        println!(
            "{:<16} {:<40} {:<6} {:<9} {}",
            iface.name,
            iface.address,
            family,
            iface.internal,
            if selected { "*" } else { "" }
        );
    }

    if report.selected.is_none() {
        println!();
        println!("no LAN IPv4 address found: remote pairing disabled");
    }
    Ok(())
}

// ── init-config ───────────────────────────────────────────────────────────────

fn init_config(explicit: Option<PathBuf>, force: bool) -> anyhow::Result<()> {
    let path = resolve_config_path(explicit)?;
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    save_config(&HostConfig::default(), &path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    info!("wrote {}", path.display());
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
