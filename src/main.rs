//! Keyed File Transfer CLI - Main Entry Point
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     CLI Application                      │
//! │        ┌──────────┐                ┌──────────┐          │
//! │        │  server  │                │  client  │          │
//! │        └──────────┘                └──────────┘          │
//! │                          │                               │
//! │  Command dispatch   LIST / GET / PUT / QUIT              │
//! │  Handshake          password -> AUTH_OK                  │
//! │  Transfer           size field + 1024-byte chunks        │
//! │  Cipher             repeating-key XOR per frame          │
//! │  Network (tokio)    one TCP stream per session           │
//! └──────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use keyed_file_transfer::client::{Client, ClientConfig, Reply};
use keyed_file_transfer::server::{Server, ServerConfig, MAX_CONNECTIONS};
use keyed_file_transfer::{ProtocolError, SharedKey, WireMode};

const DEFAULT_KEY: &str = "a_very_simple_shared_key";

/// Keyed File Transfer CLI
///
/// List, upload and download files on a password-protected server. Traffic
/// is obfuscated with a shared key, not encrypted.
#[derive(Parser)]
#[command(name = "kft")]
#[command(version)]
#[command(about = "Shared-key remote file access", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Shared obfuscation key (must match the peer)
    #[arg(long, global = true, default_value = DEFAULT_KEY)]
    key: String,

    /// Text framing on the wire (must match the peer)
    #[arg(long, global = true, value_enum, default_value_t = Wire::Legacy)]
    wire: Wire,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Wire {
    /// Single-read text frames, compatible with existing peers
    Legacy,
    /// Length-prefixed text frames, symmetric error reporting
    Hardened,
}

impl From<Wire> for WireMode {
    fn from(wire: Wire) -> Self {
        match wire {
            Wire::Legacy => WireMode::Legacy,
            Wire::Hardened => WireMode::Hardened,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start the file transfer server
    Server {
        /// Address to bind to
        #[arg(short, long, default_value = "0.0.0.0:65432")]
        bind: SocketAddr,

        /// Storage directory for files
        #[arg(short, long, default_value = "./server_files")]
        storage: PathBuf,

        /// Password clients must present
        #[arg(long)]
        password: String,

        /// Maximum concurrent connections
        #[arg(long, default_value_t = MAX_CONNECTIONS)]
        max_connections: usize,
    },

    /// Connect to a server and enter the command prompt
    Client {
        /// Server address
        #[arg(short, long, default_value = "127.0.0.1:65432")]
        server: SocketAddr,

        /// Local directory for downloads and uploads
        #[arg(short, long, default_value = "client_downloads")]
        downloads: PathBuf,

        /// Server password (prompted for when omitted)
        #[arg(long)]
        password: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let key = SharedKey::new(cli.key.as_bytes());
    let wire_mode = WireMode::from(cli.wire);

    match cli.command {
        Commands::Server {
            bind,
            storage,
            password,
            max_connections,
        } => {
            let config = ServerConfig {
                bind_addr: bind,
                storage_dir: storage,
                key,
                password,
                wire_mode,
                max_connections,
            };
            Server::new(config).run().await
        }
        Commands::Client {
            server,
            downloads,
            password,
        } => {
            let config = ClientConfig {
                server_addr: server,
                key,
                wire_mode,
                download_dir: downloads,
                show_progress: true,
            };
            run_client(config, password).await
        }
    }
}

async fn run_client(config: ClientConfig, password: Option<String>) -> Result<()> {
    let server_addr = config.server_addr;
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    let password = match password {
        Some(password) => password,
        None => prompt(&mut input, "Please enter the server password: ")
            .await?
            .unwrap_or_default(),
    };

    let client = Client::new(config);
    let mut session = client.connect(&password).await?;
    info!("Successfully connected to server {}", server_addr);

    loop {
        let line = prompt(
            &mut input,
            "\nEnter command (LIST, GET <file>, PUT <file>, QUIT): ",
        )
        .await?;

        // End of input behaves like QUIT
        let line = match line {
            Some(line) => line,
            None => "QUIT".to_string(),
        };
        if line.is_empty() {
            continue;
        }

        match session.execute(&line).await {
            Ok(Reply::Closed) => break,
            Ok(Reply::Listing(listing)) => {
                println!(
                    "\n--- Available Files ---\n{}-----------------------",
                    listing
                );
            }
            Ok(reply @ Reply::Downloaded { .. }) | Ok(reply @ Reply::Uploaded { .. }) => {
                println!("{}", reply);
            }
            Ok(Reply::Ignored) => {}
            Err(e) if e.is_fatal() => {
                return Err(e).context("Connection lost");
            }
            Err(ProtocolError::Remote(message)) => error!("Server Error: {}", message),
            Err(e) => error!("{}", e),
        }
    }

    info!("Client connection closed.");
    Ok(())
}

/// Print `message` and read one line from stdin; `None` at end of input.
async fn prompt(input: &mut Lines<BufReader<Stdin>>, message: &str) -> Result<Option<String>> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(message.as_bytes()).await?;
    stdout.flush().await?;

    let line = input.next_line().await.context("Failed to read stdin")?;
    Ok(line.map(|l| l.trim_end_matches('\r').to_string()))
}
