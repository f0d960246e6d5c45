//! Repeating-key XOR obfuscation
//!
//! Every frame is passed through [`apply`] before it is written and after it
//! is read. The keystream position always starts at index 0 for the buffer at
//! hand: byte `i` is XORed with `key[i % key.len()]`. Nothing is carried from
//! one buffer to the next, so two frames on the same connection (or on two
//! different connections) never share cipher state.
//!
//! This is obfuscation only. It gives no confidentiality or integrity against
//! anyone who can see or touch the wire.

use std::fmt;
use std::sync::Arc;

/// XOR `data` in place with the repeating `key`, starting at key index 0.
///
/// An empty key leaves `data` untouched.
pub fn apply(data: &mut [u8], key: &[u8]) {
    if key.is_empty() {
        return;
    }
    for (byte, k) in data.iter_mut().zip(key.iter().cycle()) {
        *byte ^= k;
    }
}

/// Copying variant of [`apply`].
pub fn transform(data: &[u8], key: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    apply(&mut out, key);
    out
}

/// Pre-shared obfuscation key, identical on both peers.
///
/// Cheap to clone; connections hold their own handle to the same bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedKey(Arc<[u8]>);

impl SharedKey {
    pub fn new(bytes: impl AsRef<[u8]>) -> Self {
        Self(Arc::from(bytes.as_ref()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Cipher one independent buffer in place.
    pub fn apply(&self, data: &mut [u8]) {
        apply(data, &self.0);
    }
}

impl From<&str> for SharedKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Debug for SharedKey {
    // Keep key material out of logs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedKey({} bytes)", self.0.len())
    }
}
