//! File Transfer Server Module
//!
//! This module implements the server peer:
//! - Accepts TCP connections, one tokio task per connection
//! - Runs the password handshake before any command
//! - Serves LIST, GET and PUT against a storage directory
//! - Answers failed downloads with the `-1` sentinel and an error frame
//!
//! Connections share only read-only configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use indicatif::ProgressBar;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::auth::{self, Authenticator, PasswordAuthenticator};
use crate::cipher::SharedKey;
use crate::protocol::{Command, Connection, ProtocolError, WireMode, LEGACY_TEXT_CAPACITY};
use crate::storage::{truncate_listing, FileStore};
use crate::transfer::{self, MissingSource};

/// Default maximum concurrent connections
pub const MAX_CONNECTIONS: usize = 100;

/// Server configuration
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Directory to store files
    pub storage_dir: PathBuf,
    /// Obfuscation key shared with clients
    pub key: SharedKey,
    /// Password clients must present
    pub password: String,
    /// Text framing both peers agreed on
    pub wire_mode: WireMode,
    /// Maximum concurrent connections
    pub max_connections: usize,
}

/// Read-only state every connection task sees
struct Shared {
    key: SharedKey,
    wire_mode: WireMode,
    store: FileStore,
    authenticator: Box<dyn Authenticator>,
}

/// File transfer server
pub struct Server {
    config: ServerConfig,
    shared: Arc<Shared>,
    connection_semaphore: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: ServerConfig) -> Self {
        let authenticator = PasswordAuthenticator::new(config.password.as_bytes());
        Self::with_authenticator(config, Box::new(authenticator))
    }

    /// Create a server that decides on secrets with a custom policy
    pub fn with_authenticator(config: ServerConfig, authenticator: Box<dyn Authenticator>) -> Self {
        let shared = Arc::new(Shared {
            key: config.key.clone(),
            wire_mode: config.wire_mode,
            store: FileStore::new(&config.storage_dir),
            authenticator,
        });

        Self {
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            config,
            shared,
        }
    }

    /// Bind and serve until the process is stopped
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", self.config.bind_addr))?;

        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.setup_storage_directory().await?;

        let local_addr = listener.local_addr()?;
        info!("🚀 File transfer server listening on {}", local_addr);
        info!("📁 Storage directory: {:?}", self.config.storage_dir);
        info!("Wire mode: {}", self.config.wire_mode);

        loop {
            let (tcp_stream, peer_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("Connection limit reached, rejecting {}", peer_addr);
                    continue;
                }
            };

            let shared = Arc::clone(&self.shared);

            tokio::spawn(async move {
                let _permit = permit;

                match Self::handle_connection(tcp_stream, peer_addr, shared).await {
                    Ok(()) => debug!("Connection from {} closed normally", peer_addr),
                    Err(e) => warn!("Connection from {} error: {}", peer_addr, e),
                }
            });
        }
    }

    /// Set up storage directory with owner-only permissions
    async fn setup_storage_directory(&self) -> Result<()> {
        self.shared.store.ensure_root().await.with_context(|| {
            format!(
                "Failed to create storage directory: {:?}",
                self.config.storage_dir
            )
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let metadata = tokio::fs::metadata(&self.config.storage_dir).await?;
            let mut permissions = metadata.permissions();
            permissions.set_mode(0o700);
            tokio::fs::set_permissions(&self.config.storage_dir, permissions).await?;
        }

        Ok(())
    }

    async fn handle_connection(
        tcp_stream: TcpStream,
        peer_addr: SocketAddr,
        shared: Arc<Shared>,
    ) -> Result<(), ProtocolError> {
        info!("📥 New connection from {}", peer_addr);
        tcp_stream.set_nodelay(true)?;

        let mut conn = Connection::new(tcp_stream, shared.key.clone(), shared.wire_mode);
        serve_connection(&mut conn, &shared.store, shared.authenticator.as_ref(), peer_addr).await
    }
}

/// Handshake, then dispatch commands until QUIT or the peer goes away.
async fn serve_connection<S>(
    conn: &mut Connection<S>,
    store: &FileStore,
    authenticator: &dyn Authenticator,
    peer: SocketAddr,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match auth::accept(conn, authenticator).await {
        Ok(()) => info!("🔐 {} authenticated", peer),
        Err(ProtocolError::ConnectionClosed) => {
            info!("Client {} disconnected during auth", peer);
            return Ok(());
        }
        Err(e) => return Err(e),
    }

    loop {
        let frame = match conn.recv_text().await {
            Ok(frame) => frame,
            Err(ProtocolError::ConnectionClosed) => {
                info!("Client {} disconnected", peer);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let command = Command::decode(&frame);
        debug!("Request from {}: {:?}", peer, command);

        let result = match command {
            Command::Quit => {
                info!("Client {} quit", peer);
                let _ = conn.shutdown().await;
                return Ok(());
            }
            Command::List => handle_list(conn, store).await,
            Command::Get(name) => handle_get(conn, store, &name).await,
            Command::Put(name) => handle_put(conn, store, &name).await,
            Command::Unrecognized(line) => {
                warn!("Ignoring unrecognized command from {}: {:?}", peer, line);
                Ok(())
            }
        };

        if let Err(e) = result {
            if e.is_fatal() {
                return Err(e);
            }
            warn!("Command from {} failed: {}", peer, e);
        }
    }
}

async fn handle_list<S>(conn: &mut Connection<S>, store: &FileStore) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut listing = match store.listing().await {
        Ok(listing) => listing,
        Err(e) => {
            error!("Failed to read directory {:?}: {}", store.root(), e);
            format!("Failed to read directory: {}\n", e)
        }
    };

    if listing.is_empty() {
        listing.push('\n');
    }

    let payload = match conn.mode() {
        WireMode::Legacy => {
            let fitted = truncate_listing(&listing, LEGACY_TEXT_CAPACITY);
            if fitted.len() < listing.len() {
                warn!(
                    "Listing truncated to {} of {} bytes",
                    fitted.len(),
                    listing.len()
                );
            }
            if fitted.is_empty() { "\n" } else { fitted }
        }
        WireMode::Hardened => listing.as_str(),
    };

    conn.send_text(payload.as_bytes()).await
}

async fn handle_get<S>(
    conn: &mut Connection<S>,
    store: &FileStore,
    name: &str,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let path = match store.resolve(name) {
        Ok(path) => path,
        Err(e) => {
            transfer::send_error(conn, &e.to_string()).await?;
            return Err(e);
        }
    };

    let sent =
        transfer::send_file(conn, &path, name, MissingSource::Report, &ProgressBar::hidden())
            .await?;
    info!("✅ File sent: {} ({} bytes)", name, sent);
    Ok(())
}

async fn handle_put<S>(
    conn: &mut Connection<S>,
    store: &FileStore,
    name: &str,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let path = match store.prepare_destination(name).await {
        Ok(path) => path,
        Err(e) => {
            let discarded = transfer::discard_file(conn).await?;
            warn!("Discarded upload {} ({} bytes): {}", name, discarded, e);
            return Err(e);
        }
    };

    let received = transfer::receive_file(conn, &path, &ProgressBar::hidden()).await?;
    info!("✅ File received: {} ({} bytes)", name, received);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    const PEER: &str = "127.0.0.1:40000";

    fn key() -> SharedKey {
        SharedKey::from("a_very_simple_shared_key")
    }

    /// Spawn a server loop on one end of a pipe, return the client end
    fn spawn_server(
        root: &std::path::Path,
        mode: WireMode,
    ) -> (
        Connection<DuplexStream>,
        tokio::task::JoinHandle<Result<(), ProtocolError>>,
    ) {
        let (a, b) = duplex(16 * 1024);
        let store = FileStore::new(root);
        let handle = tokio::spawn(async move {
            let mut conn = Connection::new(b, key(), mode);
            let policy = PasswordAuthenticator::new("pw");
            serve_connection(&mut conn, &store, &policy, PEER.parse().unwrap()).await
        });
        (Connection::new(a, key(), mode), handle)
    }

    async fn login(client: &mut Connection<DuplexStream>) {
        auth::login(client, "pw").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_and_quit() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one.txt"), b"1").unwrap();
        let (mut client, handle) = spawn_server(dir.path(), WireMode::Legacy);
        login(&mut client).await;

        client.send_text(b"LIST").await.unwrap();
        assert_eq!(client.recv_text().await.unwrap(), b"one.txt\n");

        client.send_text(b"QUIT").await.unwrap();
        handle.await.unwrap().unwrap();
        assert!(matches!(
            client.recv_text().await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_empty_listing_is_a_newline() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, _handle) = spawn_server(dir.path(), WireMode::Legacy);
        login(&mut client).await;

        client.send_text(b"LIST").await.unwrap();
        assert_eq!(client.recv_text().await.unwrap(), b"\n");
    }

    #[tokio::test]
    async fn test_get_missing_and_invalid_names() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, _handle) = spawn_server(dir.path(), WireMode::Legacy);
        login(&mut client).await;

        client.send_text(b"GET nope.txt").await.unwrap();
        assert_eq!(client.recv_size().await.unwrap(), -1);
        assert_eq!(client.recv_text().await.unwrap(), b"File not found: nope.txt");

        client.send_text(b"GET ../secret").await.unwrap();
        assert_eq!(client.recv_size().await.unwrap(), -1);
        assert_eq!(
            client.recv_text().await.unwrap(),
            b"Permission denied: Path traversal detected"
        );

        // Still in step afterwards
        client.send_text(b"LIST").await.unwrap();
        assert_eq!(client.recv_text().await.unwrap(), b"\n");
    }

    #[tokio::test]
    async fn test_malformed_path_keeps_session_alive() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, handle) = spawn_server(dir.path(), WireMode::Legacy);
        login(&mut client).await;

        client.send_text(b"GET a//b").await.unwrap();
        assert_eq!(client.recv_size().await.unwrap(), -1);
        assert_eq!(
            client.recv_text().await.unwrap(),
            b"Invalid path: Invalid path format"
        );

        client.send_text(b"LIST").await.unwrap();
        assert_eq!(client.recv_text().await.unwrap(), b"\n");

        client.send_text(b"QUIT").await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_put_to_malformed_path_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, _handle) = spawn_server(dir.path(), WireMode::Hardened);
        login(&mut client).await;

        client.send_text(b"PUT a//b").await.unwrap();
        client.send_size(3).await.unwrap();
        client.send_chunk(b"abc").await.unwrap();

        client.send_text(b"LIST").await.unwrap();
        assert_eq!(client.recv_text().await.unwrap(), b"\n");
    }

    #[tokio::test]
    async fn test_long_missing_name_error_fits_legacy_frame() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, _handle) = spawn_server(dir.path(), WireMode::Legacy);
        login(&mut client).await;

        let line = format!("GET {}", "x".repeat(1020));
        client.send_text(line.as_bytes()).await.unwrap();
        assert_eq!(client.recv_size().await.unwrap(), -1);
        let text = client.recv_text().await.unwrap();
        assert_eq!(text.len(), LEGACY_TEXT_CAPACITY);
        assert!(text.starts_with(b"File not found: "));

        client.send_text(b"LIST").await.unwrap();
        assert_eq!(client.recv_text().await.unwrap(), b"\n");
    }

    #[tokio::test]
    async fn test_unrecognized_commands_keep_session_alive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"abc").unwrap();
        let (mut client, _handle) = spawn_server(dir.path(), WireMode::Legacy);
        login(&mut client).await;

        client.send_text(b"DELETE a.txt").await.unwrap();
        client.send_text(b"GET").await.unwrap();

        // Neither line gets a reply; let the server consume them before the
        // next command so the legacy read boundary stays clean.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        client.send_text(b"GET a.txt").await.unwrap();
        assert_eq!(client.recv_size().await.unwrap(), 3);
        let mut buffer = [0u8; 3];
        assert_eq!(client.recv_chunk(&mut buffer).await.unwrap(), 3);
        assert_eq!(&buffer, b"abc");
    }

    #[tokio::test]
    async fn test_put_stores_file() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, _handle) = spawn_server(dir.path(), WireMode::Hardened);
        login(&mut client).await;

        client.send_text(b"PUT up/load.bin").await.unwrap();
        client.send_size(1030).await.unwrap();
        client.send_chunk(&[1u8; 1024]).await.unwrap();
        client.send_chunk(&[2u8; 6]).await.unwrap();

        client.send_text(b"LIST").await.unwrap();
        assert_eq!(client.recv_text().await.unwrap(), b"up/\n");

        let stored = std::fs::read(dir.path().join("up/load.bin")).unwrap();
        assert_eq!(stored.len(), 1030);
        assert_eq!(&stored[1024..], &[2u8; 6]);
    }

    #[tokio::test]
    async fn test_put_to_invalid_name_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, _handle) = spawn_server(dir.path(), WireMode::Hardened);
        login(&mut client).await;

        client.send_text(b"PUT ../escape.bin").await.unwrap();
        client.send_size(4).await.unwrap();
        client.send_chunk(b"evil").await.unwrap();

        client.send_text(b"LIST").await.unwrap();
        assert_eq!(client.recv_text().await.unwrap(), b"\n");
        assert!(!dir.path().parent().unwrap().join("escape.bin").exists());
    }

    #[tokio::test]
    async fn test_rejected_login_ends_connection() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, handle) = spawn_server(dir.path(), WireMode::Legacy);

        assert!(matches!(
            auth::login(&mut client, "wrong").await,
            Err(ProtocolError::AuthRejected(_))
        ));
        assert!(matches!(
            handle.await.unwrap(),
            Err(ProtocolError::AuthRejected(_))
        ));
    }
}
