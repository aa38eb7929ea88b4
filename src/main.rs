// A TFTP client and server (RFC 1350, octet mode only).
//
// A transfer begins with a read or write request sent to the server's well-known port. The
// server answers from a fresh port, and that pair of ports (the transfer IDs) identifies the
// transfer from then on. Files move in 512-byte Data blocks, each acked before the next is
// sent. A block shorter than 512 bytes ends the transfer. Lost packets are recovered by
// resending the last packet after a timeout. An Error packet ends a transfer and is never acked
// or resent.
//
// `udp-tftp server` runs the listener. `udp-tftp client` starts an interactive shell.

pub mod client;
pub mod config;
pub mod handler;
pub mod processor;
pub mod server;
pub mod shell;
pub mod tftp;
pub mod transfer;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use config::{ServerConfig, TransferConfig};
use server::Server;
use shell::Shell;
use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(version, about = "TFTP client and server")]
struct Cli {
    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Serve files from a directory.
    Server(ServerArgs),
    /// Start an interactive client shell.
    Client(ClientArgs),
}

#[derive(Args, Debug)]
struct TransferArgs {
    /// Milliseconds to wait for a reply before resending.
    #[arg(long, default_value_t = config::DEFAULT_TIMEOUT.as_millis() as u64)]
    timeout_ms: u64,

    /// Retransmissions of one packet before a transfer is abandoned.
    #[arg(long, default_value_t = config::DEFAULT_MAX_RETRIES)]
    retries: u32,
}

impl TransferArgs {
    fn config(&self) -> TransferConfig {
        TransferConfig::default()
            .with_timeout(Duration::from_millis(self.timeout_ms))
            .with_max_retries(self.retries)
    }
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0")]
    ip: IpAddr,

    #[arg(long, default_value_t = config::DEFAULT_PORT)]
    port: u16,

    /// Directory files are served from and written to.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Refuse all write requests.
    #[arg(long)]
    read_only: bool,

    /// Refuse write requests for files that already exist.
    #[arg(long)]
    no_overwrite: bool,

    /// Ports to serve transfers from, as LO-HI.
    #[arg(long, value_parser = config::parse_port_range)]
    port_range: Option<RangeInclusive<u16>>,

    #[command(flatten)]
    transfer: TransferArgs,
}

#[derive(Args, Debug)]
struct ClientArgs {
    /// Server to connect to on startup.
    host: Option<String>,

    #[arg(long, default_value_t = config::DEFAULT_PORT)]
    port: u16,

    #[command(flatten)]
    transfer: TransferArgs,
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let config = ServerConfig::new(args.ip, args.port, args.root)
        .with_port_range(args.port_range)
        .with_read_only(args.read_only)
        .with_overwrite(!args.no_overwrite)
        .with_transfer(args.transfer.config());

    let server = Server::bind(config).context("Failed to bind the listening socket")?;
    server
        .serve_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Unable to listen for shutdown signal: {e}");
            }
        })
        .await;
    Ok(())
}

async fn run_client(args: ClientArgs) -> Result<()> {
    let target = match &args.host {
        Some(host) => Some(client::resolve_target(host, &args.port.to_string()).await?),
        None => None,
    };

    Shell::new(target, args.port, args.transfer.config())
        .run()
        .await
        .context("Failed to read from stdin")
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Mode::Server(args) => run_server(args).await,
        Mode::Client(args) => run_client(args).await,
    }
}
