//! Keyed File Transfer
//!
//! A small remote file-access protocol over one TCP connection: the client
//! authenticates with a password, then lists, uploads and downloads files.
//! Every frame on the wire is obfuscated with a pre-shared repeating XOR key.
//!
//! The obfuscation is not encryption. Do not use this where the network is
//! untrusted.
//!
//! ## Usage
//!
//! ```bash
//! # Start server
//! kft server --password s3cret --storage ./server_files
//!
//! # Connect and type LIST, GET <file>, PUT <file>, QUIT
//! kft client --server 127.0.0.1:65432
//! ```

pub mod auth;
pub mod cipher;
pub mod client;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod transfer;

pub use auth::{Authenticator, PasswordAuthenticator, Verdict};
pub use cipher::SharedKey;
pub use client::{Client, ClientConfig, ClientSession, Reply};
pub use protocol::{Command, Connection, ProtocolError, WireMode};
pub use server::{Server, ServerConfig};
pub use storage::FileStore;
