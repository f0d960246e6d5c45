//! File Transfer Client Module
//!
//! This module implements the client peer:
//! - Connects to the server and performs the password handshake
//! - Sends command lines exactly as typed and drives the matching reply
//! - Uploads from and downloads into a local directory
//! - Shows progress bars for transfers
//!
//! ## Session Flow
//!
//! ```text
//! Client                                    Server
//!   |-------- TCP connect ---------------->   |
//!   |-------- secret --------------------->   |
//!   |<------- AUTH_OK --------------------    |
//!   |                                          |
//!   |  [command loop until QUIT]              |
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::auth;
use crate::cipher::SharedKey;
use crate::protocol::{Command, Connection, ProtocolError, WireMode};
use crate::storage::FileStore;
use crate::transfer::{self, MissingSource};

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address to connect to
    pub server_addr: SocketAddr,
    /// Obfuscation key shared with the server
    pub key: SharedKey,
    /// Text framing both peers agreed on
    pub wire_mode: WireMode,
    /// Local directory for GET destinations and PUT sources
    pub download_dir: PathBuf,
    /// Show progress bars for transfers
    pub show_progress: bool,
}

/// File transfer client
pub struct Client {
    config: ClientConfig,
}

impl Client {
    /// Create a new client instance
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Connect to the server, authenticate and return a ready session
    pub async fn connect(&self, password: &str) -> Result<ClientSession<TcpStream>> {
        info!("🔗 Connecting to {}...", self.config.server_addr);

        let tcp_stream = TcpStream::connect(&self.config.server_addr)
            .await
            .with_context(|| {
                format!(
                    "Connection to {} failed. Is the server running?",
                    self.config.server_addr
                )
            })?;
        tcp_stream.set_nodelay(true)?;

        info!("Connected to server.");

        let store = FileStore::new(&self.config.download_dir);
        store
            .ensure_root()
            .await
            .with_context(|| format!("Failed to create {:?}", self.config.download_dir))?;

        let mut session = ClientSession::new(tcp_stream, &self.config);
        session.login(password).await?;

        info!("Authentication successful.");
        Ok(session)
    }
}

/// What the server sent back for one command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Listing(String),
    Downloaded { name: String, bytes: u64 },
    Uploaded { name: String, bytes: u64 },
    /// The line was sent but has no client-side reply to wait for
    Ignored,
    Closed,
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Listing(listing) => f.write_str(listing),
            Reply::Downloaded { name, bytes } => write!(
                f,
                "Successfully downloaded file: {} ({} bytes, {})",
                name,
                bytes,
                format_size(*bytes)
            ),
            Reply::Uploaded { name, bytes } => write!(
                f,
                "Successfully uploaded file: {} ({} bytes, {})",
                name,
                bytes,
                format_size(*bytes)
            ),
            Reply::Ignored => Ok(()),
            Reply::Closed => f.write_str("Connection closed"),
        }
    }
}

/// Connected client session
pub struct ClientSession<S> {
    conn: Connection<S>,
    store: FileStore,
    show_progress: bool,
}

impl<S> ClientSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an established transport. Call [`ClientSession::login`] before
    /// issuing commands.
    pub fn new(stream: S, config: &ClientConfig) -> Self {
        Self {
            conn: Connection::new(stream, config.key.clone(), config.wire_mode),
            store: FileStore::new(&config.download_dir),
            show_progress: config.show_progress,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.conn.is_authenticated()
    }

    /// Run the password handshake
    pub async fn login(&mut self, password: &str) -> Result<(), ProtocolError> {
        auth::login(&mut self.conn, password).await
    }

    /// Send one operator line and drive the reply it calls for.
    ///
    /// The line goes out verbatim, even when the client will not wait for a
    /// reply (unknown verbs, GET/PUT without a filename).
    pub async fn execute(&mut self, line: &str) -> Result<Reply, ProtocolError> {
        self.conn.ensure_authenticated()?;
        let command = Command::parse(line);
        self.conn.send_text(line.as_bytes()).await?;
        debug!("Sent command: {:?}", command);

        match command {
            Command::Quit => {
                let _ = self.conn.shutdown().await;
                Ok(Reply::Closed)
            }
            Command::List => {
                let listing = self.conn.recv_text().await?;
                Ok(Reply::Listing(String::from_utf8_lossy(&listing).into_owned()))
            }
            Command::Get(name) => {
                let bytes = self.receive(&name).await?;
                Ok(Reply::Downloaded { name, bytes })
            }
            Command::Put(name) => {
                let bytes = self.send(&name).await?;
                Ok(Reply::Uploaded { name, bytes })
            }
            Command::Unrecognized(line) => {
                debug!("No reply expected for {:?}", line);
                Ok(Reply::Ignored)
            }
        }
    }

    /// List files on the server
    pub async fn list(&mut self) -> Result<String, ProtocolError> {
        match self.execute(&Command::List.to_line()).await? {
            Reply::Listing(listing) => Ok(listing),
            other => Err(unexpected(other)),
        }
    }

    /// Download `name` into the local directory
    pub async fn get(&mut self, name: &str) -> Result<u64, ProtocolError> {
        match self.execute(&Command::Get(name.to_string()).to_line()).await? {
            Reply::Downloaded { bytes, .. } => Ok(bytes),
            other => Err(unexpected(other)),
        }
    }

    /// Upload `name` from the local directory
    pub async fn put(&mut self, name: &str) -> Result<u64, ProtocolError> {
        match self.execute(&Command::Put(name.to_string()).to_line()).await? {
            Reply::Uploaded { bytes, .. } => Ok(bytes),
            other => Err(unexpected(other)),
        }
    }

    /// Send QUIT and close our side without waiting
    pub async fn quit(mut self) -> Result<(), ProtocolError> {
        self.execute(&Command::Quit.to_line()).await.map(|_| ())
    }

    pub fn into_inner(self) -> S {
        self.conn.into_inner()
    }

    async fn receive(&mut self, name: &str) -> Result<u64, ProtocolError> {
        let path = match self.store.resolve(name) {
            Ok(path) => path,
            Err(e) => {
                // The server replies regardless; keep the stream in step
                warn!("Refusing local destination {}: {}", name, e);
                transfer::discard_file(&mut self.conn).await?;
                return Err(e);
            }
        };

        let pb = self.progress_bar("Downloading");
        let result = transfer::receive_file(&mut self.conn, &path, &pb).await;
        pb.finish_and_clear();

        let bytes = result?;
        debug!("Download finished: {} ({} bytes)", name, bytes);
        Ok(bytes)
    }

    async fn send(&mut self, name: &str) -> Result<u64, ProtocolError> {
        let on_missing = match self.conn.mode() {
            WireMode::Legacy => MissingSource::Abort,
            WireMode::Hardened => MissingSource::Report,
        };

        let path = match self.store.resolve(name) {
            Ok(path) => path,
            Err(e) => {
                if on_missing == MissingSource::Report {
                    transfer::send_error(&mut self.conn, &e.to_string()).await?;
                }
                return Err(e);
            }
        };

        let pb = self.progress_bar("Uploading");
        let result = transfer::send_file(&mut self.conn, &path, name, on_missing, &pb).await;
        pb.finish_and_clear();

        let bytes = result?;
        debug!("Upload finished: {} ({} bytes)", name, bytes);
        Ok(bytes)
    }

    fn progress_bar(&self, message: &'static str) -> ProgressBar {
        if self.show_progress {
            let pb = create_progress_bar(0);
            pb.set_message(message);
            pb
        } else {
            ProgressBar::hidden()
        }
    }
}

fn unexpected(reply: Reply) -> ProtocolError {
    ProtocolError::InvalidFormat(format!("Unexpected reply: {:?}", reply))
}

/// Create progress bar for transfers
fn create_progress_bar(total_size: u64) -> ProgressBar {
    let pb = ProgressBar::new(total_size);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} {msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);
    pb
}

/// Format file size for display
pub fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} B", size)
    }
}
