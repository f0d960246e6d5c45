//! Protocol Definition Module
//!
//! This module defines the wire protocol shared by client and server:
//! - Command lines and their tagged decoding
//! - Frame encoding for text, size fields and file chunks
//! - The error taxonomy used by every peer role
//!
//! ## Protocol Overview
//!
//! ```text
//! Client                                 Server
//!   |                                      |
//!   |-- secret --------------------------->|
//!   |<------------------ AUTH_OK / reason -|
//!   |                                      |
//!   |-- "LIST" --------------------------->|
//!   |<----------------------- listing text -|
//!   |                                      |
//!   |-- "GET name" ----------------------->|
//!   |<------------------- size (i64 LE) ---|
//!   |<------------------- chunk <= 1024 ---|  (repeated)
//!   |                                      |
//!   |-- "PUT name" ----------------------->|
//!   |-- size (i64 LE) -------------------->|
//!   |-- chunk <= 1024 -------------------->|  (repeated)
//!   |                                      |
//!   |-- "QUIT" --------------------------->|  (both sides close)
//! ```
//!
//! Every frame is ciphered with the shared key as an independent buffer.
//! A size of `-1` means "failed, one error text frame follows".

use std::fmt;
use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::cipher::SharedKey;

/// Chunk size for file transfers
pub const CHUNK_SIZE: usize = 1024;

/// Largest text frame a legacy peer can receive in one read
pub const LEGACY_TEXT_CAPACITY: usize = 1024;

/// Maximum length-prefixed text frame (16 MB) - prevents memory exhaustion
pub const MAX_MESSAGE_SIZE: u64 = 16 * 1024 * 1024;

/// Width of the file size field before ciphering
pub const SIZE_FIELD_LEN: usize = 8;

/// Size value announcing an error text frame instead of file data
pub const ERROR_SENTINEL: i64 = -1;

/// Reply sent by the server when the secret is accepted
pub const AUTH_OK: &str = "AUTH_OK";

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Authentication failed. Server response: {0}")]
    AuthRejected(String),

    #[error("Connection is not authenticated")]
    NotAuthenticated,

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(u64, u64),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Server Error: {0}")]
    Remote(String),

    #[error("Cannot write {path}: {source}")]
    Destination {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Connection closed prematurely: received {received} of {expected} bytes")]
    Truncated { received: u64, expected: u64 },
}

impl ProtocolError {
    /// Whether the connection is unusable after this error.
    ///
    /// Non-fatal errors end the current operation only; the peers are still
    /// in step and the next command can be issued.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ProtocolError::FileNotFound(_)
                | ProtocolError::PermissionDenied(_)
                | ProtocolError::InvalidPath(_)
                | ProtocolError::Remote(_)
                | ProtocolError::Destination { .. }
                | ProtocolError::NotAuthenticated
        )
    }
}

/// How text frames are delimited on the wire.
///
/// Size fields and file chunks are identical in both modes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WireMode {
    /// One write, one read per text frame; a client that cannot open a file
    /// for PUT sends nothing after the command.
    #[default]
    Legacy,
    /// Text frames carry a ciphered u32 LE length prefix; both peers answer
    /// a failed send with the `-1` sentinel.
    Hardened,
}

impl fmt::Display for WireMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireMode::Legacy => f.write_str("legacy"),
            WireMode::Hardened => f.write_str("hardened"),
        }
    }
}

/// A decoded command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Get(String),
    Put(String),
    Quit,
    /// Unknown verb, or GET/PUT without a filename
    Unrecognized(String),
}

impl Command {
    /// Decode a command line: verb before the first space, argument after.
    pub fn parse(line: &str) -> Self {
        let (verb, argument) = match line.split_once(' ') {
            Some((verb, argument)) => (verb, argument),
            None => (line, ""),
        };

        match verb {
            "LIST" => Command::List,
            "QUIT" if argument.is_empty() => Command::Quit,
            "GET" if !argument.is_empty() => Command::Get(argument.to_string()),
            "PUT" if !argument.is_empty() => Command::Put(argument.to_string()),
            _ => Command::Unrecognized(line.to_string()),
        }
    }

    pub fn decode(frame: &[u8]) -> Self {
        Self::parse(&String::from_utf8_lossy(frame))
    }

    /// Literal line as sent on the wire, without any delimiter.
    pub fn to_line(&self) -> String {
        match self {
            Command::List => "LIST".to_string(),
            Command::Get(name) => format!("GET {}", name),
            Command::Put(name) => format!("PUT {}", name),
            Command::Quit => "QUIT".to_string(),
            Command::Unrecognized(line) => line.clone(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

/// Encode a size field: i64 little-endian, eight bytes.
pub fn encode_size(size: i64) -> [u8; SIZE_FIELD_LEN] {
    size.to_le_bytes()
}

pub fn decode_size(bytes: [u8; SIZE_FIELD_LEN]) -> i64 {
    i64::from_le_bytes(bytes)
}

/// One live transport stream plus the state the protocol keeps for it.
///
/// All reads and writes go through the frame methods below, which apply the
/// shared key to each frame as its own buffer. No buffered reader sits in
/// front of the stream: in legacy mode a text frame is whatever a single read
/// returns.
pub struct Connection<S> {
    stream: S,
    key: SharedKey,
    mode: WireMode,
    authenticated: bool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, key: SharedKey, mode: WireMode) -> Self {
        Self {
            stream,
            key,
            mode,
            authenticated: false,
        }
    }

    pub fn mode(&self) -> WireMode {
        self.mode
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Latch the handshake result. There is no way back.
    pub(crate) fn mark_authenticated(&mut self) {
        self.authenticated = true;
    }

    pub(crate) fn ensure_authenticated(&self) -> Result<(), ProtocolError> {
        if self.authenticated {
            Ok(())
        } else {
            Err(ProtocolError::NotAuthenticated)
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Write a text frame (secret, auth reply, command, error, listing)
    pub async fn send_text(&mut self, text: &[u8]) -> Result<(), ProtocolError> {
        match self.mode {
            WireMode::Legacy => {
                if text.is_empty() {
                    return Err(ProtocolError::InvalidFormat(
                        "Empty text frame cannot be delimited".to_string(),
                    ));
                }
                if text.len() > LEGACY_TEXT_CAPACITY {
                    return Err(ProtocolError::MessageTooLarge(
                        text.len() as u64,
                        LEGACY_TEXT_CAPACITY as u64,
                    ));
                }
            }
            WireMode::Hardened => {
                let len = text.len() as u64;
                if len > MAX_MESSAGE_SIZE {
                    return Err(ProtocolError::MessageTooLarge(len, MAX_MESSAGE_SIZE));
                }
                let mut prefix = (len as u32).to_le_bytes();
                self.key.apply(&mut prefix);
                self.stream.write_all(&prefix).await?;
            }
        }

        self.write_frame(text).await
    }

    /// Read a text frame
    pub async fn recv_text(&mut self) -> Result<Vec<u8>, ProtocolError> {
        match self.mode {
            WireMode::Legacy => {
                let mut buffer = vec![0u8; LEGACY_TEXT_CAPACITY];
                let n = self.stream.read(&mut buffer).await?;
                if n == 0 {
                    return Err(ProtocolError::ConnectionClosed);
                }
                buffer.truncate(n);
                self.key.apply(&mut buffer);
                trace!("recv text frame ({} bytes)", n);
                Ok(buffer)
            }
            WireMode::Hardened => {
                let mut prefix = [0u8; 4];
                self.read_exact_frame(&mut prefix).await?;
                let len = u32::from_le_bytes(prefix) as u64;
                if len > MAX_MESSAGE_SIZE {
                    return Err(ProtocolError::MessageTooLarge(len, MAX_MESSAGE_SIZE));
                }
                let mut buffer = vec![0u8; len as usize];
                self.read_exact_frame(&mut buffer).await?;
                trace!("recv text frame ({} bytes)", len);
                Ok(buffer)
            }
        }
    }

    /// Write the eight-byte size field
    pub async fn send_size(&mut self, size: i64) -> Result<(), ProtocolError> {
        self.write_frame(&encode_size(size)).await
    }

    /// Read the eight-byte size field
    pub async fn recv_size(&mut self) -> Result<i64, ProtocolError> {
        let mut field = [0u8; SIZE_FIELD_LEN];
        self.read_exact_frame(&mut field).await?;
        Ok(decode_size(field))
    }

    /// Write one file chunk (at most [`CHUNK_SIZE`] bytes)
    pub async fn send_chunk(&mut self, chunk: &[u8]) -> Result<(), ProtocolError> {
        debug_assert!(chunk.len() <= CHUNK_SIZE);
        self.write_frame(chunk).await
    }

    /// Read one file chunk into `buffer`, asking for exactly `buffer.len()`
    /// bytes.
    ///
    /// Returns the number of bytes received and deciphered. This is less than
    /// `buffer.len()` only when the peer closed the stream mid-chunk.
    pub async fn recv_chunk(&mut self, buffer: &mut [u8]) -> Result<usize, ProtocolError> {
        let n = self.fill(buffer).await?;
        self.key.apply(&mut buffer[..n]);
        Ok(n)
    }

    /// Close our side of the transport
    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.stream.shutdown().await?;
        Ok(())
    }

    async fn write_frame(&mut self, plain: &[u8]) -> Result<(), ProtocolError> {
        let mut frame = plain.to_vec();
        self.key.apply(&mut frame);
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Fill `buffer` completely and decipher it, or fail with
    /// `ConnectionClosed`.
    async fn read_exact_frame(&mut self, buffer: &mut [u8]) -> Result<(), ProtocolError> {
        let n = self.fill(buffer).await?;
        if n < buffer.len() {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.key.apply(buffer);
        Ok(())
    }

    /// Read until `buffer` is full or the stream ends.
    async fn fill(&mut self, buffer: &mut [u8]) -> Result<usize, ProtocolError> {
        let mut filled = 0;
        while filled < buffer.len() {
            let n = self.stream.read(&mut buffer[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}
