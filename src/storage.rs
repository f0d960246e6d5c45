//! Local file access for both peers
//!
//! The protocol treats filenames as opaque. This module decides what a name
//! means on disk: it is always joined onto a single root directory after
//! validation.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::info;

use crate::protocol::ProtocolError;

/// Directory that filenames from the wire are resolved against
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root directory if it does not exist yet
    pub async fn ensure_root(&self) -> io::Result<()> {
        if !self.root.exists() {
            fs::create_dir_all(&self.root).await?;
            info!("Created directory: {:?}", self.root);
        }
        Ok(())
    }

    /// Map a wire filename to a path under the root
    pub fn resolve(&self, filename: &str) -> Result<PathBuf, ProtocolError> {
        let safe = validate_filename(filename)?;
        Ok(self.root.join(safe))
    }

    /// Resolve a destination and create its parent directories
    pub async fn prepare_destination(&self, filename: &str) -> Result<PathBuf, ProtocolError> {
        let path = self.resolve(filename)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| ProtocolError::Destination {
                    path: filename.to_string(),
                    source,
                })?;
        }
        Ok(path)
    }

    /// One entry per line, sorted by name; directories end with `/`.
    /// Hidden entries are skipped.
    pub async fn listing(&self) -> io::Result<String> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }

            let is_dir = match entry.file_type().await {
                Ok(t) => t.is_dir(),
                Err(_) => continue,
            };

            names.push(if is_dir { format!("{}/", name) } else { name });
        }

        names.sort();

        let mut listing = String::new();
        for name in names {
            listing.push_str(&name);
            listing.push('\n');
        }
        Ok(listing)
    }
}

/// Cut a listing down to whole lines that fit in `limit` bytes.
///
/// Returns the listing unchanged when it already fits.
pub fn truncate_listing(listing: &str, limit: usize) -> &str {
    if listing.len() <= limit {
        return listing;
    }
    match listing.as_bytes()[..limit].iter().rposition(|&b| b == b'\n') {
        Some(end) => &listing[..=end],
        None => "",
    }
}

/// Validate filename to prevent directory traversal
///
/// Rejects empty names, `..` components, absolute paths and hidden files;
/// backslashes are normalized to `/`.
pub fn validate_filename(filename: &str) -> Result<String, ProtocolError> {
    if filename.is_empty() {
        return Err(ProtocolError::InvalidPath("Empty filename".to_string()));
    }

    if filename.contains("..") {
        return Err(ProtocolError::PermissionDenied(
            "Path traversal detected".to_string(),
        ));
    }

    if filename.starts_with('/') || filename.starts_with('\\') {
        return Err(ProtocolError::PermissionDenied(
            "Absolute paths not allowed".to_string(),
        ));
    }

    if filename.starts_with('.') {
        return Err(ProtocolError::PermissionDenied(
            "Hidden files not allowed".to_string(),
        ));
    }

    let normalized = filename.replace('\\', "/");

    if normalized.contains("//") {
        return Err(ProtocolError::InvalidPath(
            "Invalid path format".to_string(),
        ));
    }

    Ok(normalized)
}
