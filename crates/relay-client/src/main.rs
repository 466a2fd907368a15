//! Prompt Relay client: entry point.
//!
//! Pairs with a running `relay-host` and sends every line typed on stdin as a
//! prompt.  Useful for trying the host without the phone app.
//!
//! # Usage
//!
//! ```text
//! relay-client --payload '{"address":"192.168.1.42","port":24900,"code":"309322"}'
//! relay-client --url ws://192.168.1.42:24900 --code 309322 --name laptop-test
//! ```
//!
//! Lines starting with `/` are commands instead of prompts:
//!
//! | Line    | Effect                                             |
//! |---------|----------------------------------------------------|
//! | `/drop` | Close the socket without `Disconnect` (then resume) |
//! | `/quit` | Send `Disconnect` and exit                          |
//!
//! Events (paired, acked, status changes) are printed to stdout; logs go to
//! stderr.

use anyhow::Context;
use clap::Parser;
use relay_core::PairingPayload;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use relay_client::application::ClientEvent;
use relay_client::infrastructure::{ClientConfig, RelayClient};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Prompt Relay test client.
#[derive(Debug, Parser)]
#[command(
    name = "relay-client",
    about = "Pair with a relay host and send stdin lines as prompts",
    version
)]
struct Cli {
    /// Pairing payload JSON, as encoded in the host's QR code.
    #[arg(long, env = "PROMPT_RELAY_PAYLOAD", conflicts_with_all = ["url", "code"])]
    payload: Option<String>,

    /// Host WebSocket URL, e.g. ws://192.168.1.42:24900.
    #[arg(long, requires = "code")]
    url: Option<String>,

    /// Pairing code shown by the host.
    #[arg(long, requires = "url")]
    code: Option<String>,

    /// Name the host shows for this client.
    #[arg(long)]
    name: Option<String>,

    /// Log level used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn client_config(&self) -> anyhow::Result<ClientConfig> {
        let mut config = match (&self.payload, &self.url, &self.code) {
            (Some(json), _, _) => {
                let payload: PairingPayload =
                    serde_json::from_str(json).context("invalid --payload JSON")?;
                ClientConfig::from_payload(&payload)
            }
            (None, Some(url), Some(code)) => ClientConfig::new(url.as_str(), code.as_str()),
            _ => anyhow::bail!("pass either --payload or both --url and --code"),
        };
        config.client_name = self.name.clone();
        Ok(config)
    }
}

/// What a stdin line asks for.
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Prompt(&'a str),
    Drop,
    Quit,
    Skip,
}

fn parse_input(line: &str) -> Input<'_> {
    match line.trim_end() {
        "" => Input::Skip,
        "/drop" => Input::Drop,
        "/quit" => Input::Quit,
        text => Input::Prompt(text),
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = cli.client_config()?;
    println!("pairing with {} using code {}", config.url, config.code);

    let (client, mut events) = RelayClient::start(config);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ClientEvent::Ended { reason }) => {
                    println!("session ended: {reason}");
                    return Ok(());
                }
                Some(event) => print_event(&event),
                None => return Ok(()),
            },

            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                match parse_input(&line) {
                    Input::Prompt(text) => match client.send_prompt(text).await {
                        Ok(seq) => println!("queued #{seq}"),
                        Err(e) => println!("not sent: {e}"),
                    },
                    Input::Drop => client.drop_connection().await?,
                    Input::Quit => break,
                    Input::Skip => {}
                }
            }
        }
    }

    client.disconnect().await;
    Ok(())
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::Paired { session_id } => println!("paired, session {session_id}"),
        ClientEvent::Resumed {
            session_id,
            delivered,
        } => println!("resumed session {session_id}, host has #{delivered}"),
        ClientEvent::Acked { seq } => println!("delivered through #{seq}"),
        ClientEvent::Status(status) => println!("host status: {status:?}"),
        ClientEvent::HostMessage { seq, text } => println!("host #{seq}: {text}"),
        ClientEvent::Disconnected { reason } => println!("connection lost: {reason}"),
        ClientEvent::Ended { reason } => println!("session ended: {reason}"),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
