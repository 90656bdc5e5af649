//! deskline - Remote desktop connection client

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use deskline::config::ClientConfig;
use deskline::network::{
    Connection, ConnectionStats, Inbound, PixelFrame, RendezvousClient, RendezvousOutcome,
};
use deskline::protocol::ConnType;

#[derive(Parser)]
#[command(name = "deskline")]
#[command(about = "Connect to a remote desktop peer through a rendezvous server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Rendezvous server (host, host:port or ws[s]://host:port)
    #[arg(short, long, global = true, env = "DESKLINE_SERVER")]
    server: Option<String>,

    /// Licence key presented to the rendezvous server
    #[arg(long, global = true, env = "DESKLINE_LICENCE_KEY")]
    licence_key: Option<String>,

    /// Kind of session to request
    #[arg(long, global = true, value_enum)]
    conn_type: Option<ConnTypeArg>,

    /// TOML config file
    #[arg(short, long, global = true, env = "DESKLINE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask the rendezvous server how to reach a peer
    Resolve {
        /// Peer ID
        id: String,

        /// Print the route as JSON
        #[arg(long)]
        json: bool,
    },

    /// Connect to a peer and log its traffic until Ctrl+C
    Connect {
        /// Peer ID
        id: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ConnTypeArg {
    Default,
    FileTransfer,
    PortForward,
    Rdp,
}

impl From<ConnTypeArg> for ConnType {
    fn from(arg: ConnTypeArg) -> Self {
        match arg {
            ConnTypeArg::Default => ConnType::DefaultConn,
            ConnTypeArg::FileTransfer => ConnType::FileTransfer,
            ConnTypeArg::PortForward => ConnType::PortForward,
            ConnTypeArg::Rdp => ConnType::Rdp,
        }
    }
}

fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Config file first, then flags on top
fn build_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => {
            let server = cli
                .server
                .clone()
                .context("No rendezvous server given (use --server or --config)")?;
            ClientConfig::new(server)
        }
    };

    if let Some(server) = &cli.server {
        config.rendezvous_server = server.clone();
    }
    if let Some(key) = &cli.licence_key {
        config.licence_key = key.clone();
    }
    if let Some(conn_type) = cli.conn_type {
        config.conn_type = conn_type.into();
    }
    config.validate()?;
    Ok(config)
}

async fn run_resolve(config: ClientConfig, id: String, json: bool) -> Result<()> {
    let client = RendezvousClient::from_config(&config)?;
    let outcome = client
        .resolve(&id, config.conn_type)
        .await
        .with_context(|| format!("Failed to resolve {}", id))?;

    if json {
        let value = match &outcome {
            RendezvousOutcome::Direct {
                uri,
                peer_public_key,
            } => serde_json::json!({
                "id": id,
                "route": "direct",
                "uri": uri,
                "signed_peer_key_len": peer_public_key.as_ref().map(Vec::len),
            }),
            RendezvousOutcome::Relay {
                uri,
                uuid,
                peer_public_key,
            } => serde_json::json!({
                "id": id,
                "route": "relay",
                "uri": uri,
                "uuid": uuid,
                "signed_peer_key_len": peer_public_key.as_ref().map(Vec::len),
            }),
        };
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    match outcome {
        RendezvousOutcome::Direct {
            uri,
            peer_public_key,
        } => {
            println!("Direct connection: {}", uri);
            println!("Signed peer key:   {}", describe_key(peer_public_key.as_deref()));
        }
        RendezvousOutcome::Relay {
            uri,
            uuid,
            peer_public_key,
        } => {
            println!("Relay:             {}", uri);
            println!("Relay session:     {}", uuid);
            println!("Signed peer key:   {}", describe_key(peer_public_key.as_deref()));
        }
    }
    Ok(())
}

fn describe_key(key: Option<&[u8]>) -> String {
    match key {
        Some(key) => format!("{} bytes", key.len()),
        None => "none".to_string(),
    }
}

async fn run_connect(config: ClientConfig, id: String) -> Result<()> {
    let ctx = config.context()?;
    let mut connection = Connection::new(ctx, config);

    let negotiated = connection
        .start(&id)
        .await
        .with_context(|| format!("Failed to connect to {}", id))?;
    info!(
        "Session {} established: {:?}",
        connection.id(),
        negotiated
    );
    println!("Connected to {}. Press Ctrl+C to stop.\n", id);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            item = connection.next() => match item {
                Ok(Inbound::Message(message)) => {
                    info!("Received {}", message.kind());
                }
                Ok(Inbound::Frame(PixelFrame::Yuv(frame))) => {
                    debug!(
                        "Received YUV frame: stride={}, y={} bytes",
                        frame.stride,
                        frame.y.len()
                    );
                }
                Ok(Inbound::Frame(PixelFrame::Rgb(frame))) => {
                    debug!("Received RGB frame: {} bytes", frame.data.len());
                }
                Err(e) => {
                    warn!("Connection ended: {}", e);
                    break;
                }
            }
        }
    }

    let stats = connection.stats();
    connection.close();
    print_session_stats(&stats);
    Ok(())
}

fn print_session_stats(stats: &ConnectionStats) {
    println!("\n═══════════════════════════════════════════════════════════════");
    println!(" Session Statistics");
    println!("═══════════════════════════════════════════════════════════════");
    println!("   Encrypted:        {:>7}", if stats.secured { "yes" } else { "no" });
    println!("   Messages sent:    {:>7}", stats.messages_sent);
    println!("   Messages recv:    {:>7}", stats.messages_received);
    println!("   Frames recv:      {:>7}", stats.frames_received);
    match stats.last_peer_delay_ms {
        Some(delay) => println!("   Peer delay:       {:>7} ms", delay),
        None => println!("   Peer delay:       {:>7}", "-"),
    }
    println!("   Uptime:           {:>7} sec", stats.uptime_seconds);
    println!("═══════════════════════════════════════════════════════════════\n");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = build_config(&cli)?;
    match cli.command {
        Commands::Resolve { id, json } => run_resolve(config, id, json).await?,
        Commands::Connect { id } => run_connect(config, id).await?,
    }

    Ok(())
}
