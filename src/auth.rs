//! Authentication handshake
//!
//! The first exchange on every connection. The client sends its secret as one
//! text frame; the server answers with exactly one text frame, [`AUTH_OK`] or
//! a rejection reason, and closes the connection after a rejection.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::protocol::{Connection, ProtocolError, AUTH_OK};

/// Outcome of checking a presented secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(String),
}

/// Server-side authorization policy
pub trait Authenticator: Send + Sync {
    fn verify(&self, secret: &[u8]) -> Verdict;
}

/// Accepts exactly one configured password
pub struct PasswordAuthenticator {
    password: Vec<u8>,
}

impl PasswordAuthenticator {
    pub fn new(password: impl Into<Vec<u8>>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

impl Authenticator for PasswordAuthenticator {
    fn verify(&self, secret: &[u8]) -> Verdict {
        if secret == self.password.as_slice() {
            Verdict::Accept
        } else {
            Verdict::Reject("AUTH_FAILED: invalid password".to_string())
        }
    }
}

/// Client side of the handshake.
///
/// A closed transport yields `ConnectionClosed`; any reply other than
/// `AUTH_OK` yields `AuthRejected` carrying the server's text.
pub async fn login<S>(conn: &mut Connection<S>, secret: &str) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if conn.is_authenticated() {
        return Ok(());
    }
    if secret.is_empty() {
        return Err(ProtocolError::InvalidFormat("Empty password".to_string()));
    }

    conn.send_text(secret.as_bytes()).await?;

    let reply = conn.recv_text().await?;
    if reply != AUTH_OK.as_bytes() {
        let reason = String::from_utf8_lossy(&reply).into_owned();
        let _ = conn.shutdown().await;
        return Err(ProtocolError::AuthRejected(reason));
    }

    conn.mark_authenticated();
    debug!("Authenticated");
    Ok(())
}

/// Server side of the handshake.
///
/// On rejection the reason is sent, our side is shut down and the reason is
/// returned as `AuthRejected`.
pub async fn accept<S>(
    conn: &mut Connection<S>,
    authenticator: &dyn Authenticator,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let secret = conn.recv_text().await?;

    match authenticator.verify(&secret) {
        Verdict::Accept => {
            conn.send_text(AUTH_OK.as_bytes()).await?;
            conn.mark_authenticated();
            Ok(())
        }
        Verdict::Reject(reason) => {
            warn!("Rejected secret: {}", reason);
            conn.send_text(reason.as_bytes()).await?;
            let _ = conn.shutdown().await;
            Err(ProtocolError::AuthRejected(reason))
        }
    }
}
