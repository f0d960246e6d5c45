//! Size-prefixed chunked file streaming
//!
//! Shared by both directions. The sender writes one size frame, then the file
//! in chunks of [`CHUNK_SIZE`] bytes with a shorter final chunk when the size
//! is not a multiple of it. The receiver asks for `min(CHUNK_SIZE, remaining)`
//! bytes at a time so every chunk is deciphered on the same boundaries it was
//! ciphered on.
//!
//! A sender that cannot open its file answers with the size [`ERROR_SENTINEL`]
//! followed by one error text frame.

use std::path::Path;

use indicatif::ProgressBar;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::protocol::{
    Connection, ProtocolError, WireMode, CHUNK_SIZE, ERROR_SENTINEL, LEGACY_TEXT_CAPACITY,
};

/// What the send role does when its source cannot be opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingSource {
    /// Send the `-1` sentinel and an error text frame
    Report,
    /// Send nothing at all. The peer is left waiting for a size field.
    Abort,
}

/// Send the `-1` sentinel followed by `message` as an error text frame.
///
/// In legacy mode the text is cut to what one read can carry, so the
/// sentinel is never sent without its text frame.
pub async fn send_error<S>(conn: &mut Connection<S>, message: &str) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let text = match conn.mode() {
        WireMode::Legacy => clip_text(message, LEGACY_TEXT_CAPACITY),
        WireMode::Hardened => message,
    };
    conn.send_size(ERROR_SENTINEL).await?;
    conn.send_text(text.as_bytes()).await
}

/// Longest prefix of `text` within `limit` bytes that ends on a char boundary
fn clip_text(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Send role: stream the file at `path` to the peer.
///
/// Returns the number of file bytes sent. When the file cannot be opened the
/// error is `FileNotFound(name)`, after the sentinel has been sent or not,
/// depending on `on_missing`.
pub async fn send_file<S>(
    conn: &mut Connection<S>,
    path: &Path,
    name: &str,
    on_missing: MissingSource,
    progress: &ProgressBar,
) -> Result<u64, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (file, size) = match open_source(path).await {
        Some(opened) => opened,
        None => {
            match on_missing {
                MissingSource::Report => {
                    send_error(conn, &format!("File not found: {}", name)).await?;
                }
                MissingSource::Abort => {
                    warn!("Local file not found: {} (peer not notified)", name);
                }
            }
            return Err(ProtocolError::FileNotFound(name.to_string()));
        }
    };

    let declared = i64::try_from(size).map_err(|_| {
        ProtocolError::InvalidFormat(format!("File too large for size field: {} bytes", size))
    })?;

    conn.send_size(declared).await?;
    progress.set_length(size);
    debug!("Sending {} ({} bytes)", name, size);

    let mut reader = file.take(size);
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut sent: u64 = 0;

    loop {
        let n = read_full(&mut reader, &mut buffer).await?;
        if n == 0 {
            break;
        }

        conn.send_chunk(&buffer[..n]).await?;
        sent += n as u64;
        progress.set_position(sent);
    }

    if sent < size {
        // The file shrank after its size went out; the peer cannot recover.
        return Err(ProtocolError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("{} shrank during transfer ({} of {} bytes)", name, sent, size),
        )));
    }

    Ok(sent)
}

/// Receive role: read a size frame and the announced bytes into `path`.
///
/// On the `-1` sentinel the peer's error text is returned as
/// `ProtocolError::Remote` and no file is created. If the stream ends early
/// the partial file is kept and `ProtocolError::Truncated` is returned.
pub async fn receive_file<S>(
    conn: &mut Connection<S>,
    path: &Path,
    progress: &ProgressBar,
) -> Result<u64, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let size = match recv_announced_size(conn).await? {
        Announced::Size(size) => size,
        Announced::Error(message) => return Err(ProtocolError::Remote(message)),
    };

    let file = match File::create(path).await {
        Ok(file) => file,
        Err(source) => {
            warn!("Cannot create {:?}, discarding {} incoming bytes", path, size);
            drain(conn, size).await?;
            return Err(ProtocolError::Destination {
                path: path.display().to_string(),
                source,
            });
        }
    };

    progress.set_length(size);
    receive_into(conn, Some(file), size, progress).await
}

/// Receive role without a destination: consume the announced bytes and drop
/// them so the connection stays in step.
pub async fn discard_file<S>(conn: &mut Connection<S>) -> Result<u64, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match recv_announced_size(conn).await? {
        Announced::Size(size) => drain(conn, size).await,
        Announced::Error(message) => Err(ProtocolError::Remote(message)),
    }
}

enum Announced {
    Size(u64),
    Error(String),
}

async fn recv_announced_size<S>(conn: &mut Connection<S>) -> Result<Announced, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let size = conn.recv_size().await?;

    if size == ERROR_SENTINEL {
        let message = conn.recv_text().await?;
        return Ok(Announced::Error(
            String::from_utf8_lossy(&message).into_owned(),
        ));
    }

    u64::try_from(size)
        .map(Announced::Size)
        .map_err(|_| ProtocolError::InvalidFormat(format!("Negative file size: {}", size)))
}

async fn drain<S>(conn: &mut Connection<S>, size: u64) -> Result<u64, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    receive_into(conn, None, size, &ProgressBar::hidden()).await
}

async fn receive_into<S>(
    conn: &mut Connection<S>,
    mut file: Option<File>,
    size: u64,
    progress: &ProgressBar,
) -> Result<u64, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut received: u64 = 0;

    while received < size {
        let wanted = (size - received).min(CHUNK_SIZE as u64) as usize;
        let n = conn.recv_chunk(&mut buffer[..wanted]).await?;

        if let Some(file) = file.as_mut() {
            file.write_all(&buffer[..n]).await?;
        }
        received += n as u64;
        progress.set_position(received);

        if n < wanted {
            if let Some(file) = file.as_mut() {
                file.flush().await?;
            }
            return Err(ProtocolError::Truncated {
                received,
                expected: size,
            });
        }
    }

    if let Some(file) = file.as_mut() {
        file.flush().await?;
    }

    Ok(received)
}

/// Open a regular file for reading and report its length
async fn open_source(path: &Path) -> Option<(File, u64)> {
    let file = File::open(path).await.ok()?;
    let metadata = file.metadata().await.ok()?;
    if !metadata.is_file() {
        return None;
    }
    Some((file, metadata.len()))
}

/// Read until `buffer` is full or the reader is exhausted
async fn read_full<R>(reader: &mut R, buffer: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buffer.len() {
        let n = reader.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::SharedKey;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};
    use tokio::io::{duplex, DuplexStream, ReadBuf};

    fn key() -> SharedKey {
        SharedKey::from("a_very_simple_shared_key")
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn pair() -> (Connection<DuplexStream>, Connection<DuplexStream>) {
        let (a, b) = duplex(8 * 1024);
        (
            Connection::new(a, key(), WireMode::Legacy),
            Connection::new(b, key(), WireMode::Legacy),
        )
    }

    /// Write-only stream that records the size of every write
    #[derive(Clone, Default)]
    struct WriteRecorder {
        writes: Arc<Mutex<Vec<usize>>>,
    }

    impl AsyncRead for WriteRecorder {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for WriteRecorder {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.writes.lock().unwrap().push(buf.len());
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    async fn recorded_writes(len: usize) -> Vec<usize> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.bin");
        std::fs::write(&path, pattern(len)).unwrap();

        let recorder = WriteRecorder::default();
        let mut conn = Connection::new(recorder.clone(), key(), WireMode::Legacy);
        let sent = send_file(&mut conn, &path, "src.bin", MissingSource::Report, &ProgressBar::hidden())
            .await
            .unwrap();
        assert_eq!(sent, len as u64);

        let writes = recorder.writes.lock().unwrap().clone();
        writes
    }

    #[tokio::test]
    async fn test_chunk_boundaries() {
        assert_eq!(recorded_writes(0).await, vec![8]);
        assert_eq!(recorded_writes(1).await, vec![8, 1]);
        assert_eq!(recorded_writes(1023).await, vec![8, 1023]);
        assert_eq!(recorded_writes(1024).await, vec![8, 1024]);
        assert_eq!(recorded_writes(1025).await, vec![8, 1024, 1]);
        assert_eq!(recorded_writes(2048).await, vec![8, 1024, 1024]);
    }

    #[tokio::test]
    async fn test_send_receive_round_trip() {
        for len in [0usize, 1, 1023, 1024, 1025, 5000] {
            let dir = tempfile::tempdir().unwrap();
            let src = dir.path().join("src.bin");
            let dst = dir.path().join("dst.bin");
            let data = pattern(len);
            std::fs::write(&src, &data).unwrap();

            let (mut tx, mut rx) = pair();
            let sender = tokio::spawn(async move {
                send_file(&mut tx, &src, "src.bin", MissingSource::Report, &ProgressBar::hidden()).await
            });

            let received = receive_file(&mut rx, &dst, &ProgressBar::hidden()).await.unwrap();
            assert_eq!(sender.await.unwrap().unwrap(), len as u64);
            assert_eq!(received, len as u64);
            assert_eq!(std::fs::read(&dst).unwrap(), data);
        }
    }

    #[tokio::test]
    async fn test_missing_source_reports_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("never.bin");
        let (mut tx, mut rx) = pair();

        let result = send_file(
            &mut tx,
            &dir.path().join("missing.bin"),
            "missing.bin",
            MissingSource::Report,
            &ProgressBar::hidden(),
        )
        .await;
        assert!(matches!(result, Err(ProtocolError::FileNotFound(_))));

        match receive_file(&mut rx, &dst, &ProgressBar::hidden()).await {
            Err(ProtocolError::Remote(message)) => assert_eq!(message, "File not found: missing.bin"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(!dst.exists());
    }

    #[test]
    fn test_clip_text() {
        assert_eq!(clip_text("short", 1024), "short");
        assert_eq!(clip_text("abcdef", 4), "abcd");
        // 'é' is two bytes; never split it
        assert_eq!(clip_text("aé", 2), "a");
    }

    #[tokio::test]
    async fn test_long_error_text_fits_legacy_frame() {
        let dir = tempfile::tempdir().unwrap();
        let name = "x".repeat(1020);
        let (mut tx, mut rx) = pair();

        let result = send_file(
            &mut tx,
            &dir.path().join(&name),
            &name,
            MissingSource::Report,
            &ProgressBar::hidden(),
        )
        .await;
        assert!(matches!(result, Err(ProtocolError::FileNotFound(_))));

        assert_eq!(rx.recv_size().await.unwrap(), ERROR_SENTINEL);
        let text = rx.recv_text().await.unwrap();
        assert_eq!(text.len(), LEGACY_TEXT_CAPACITY);
        assert!(text.starts_with(b"File not found: xxx"));

        // Both ends are still in step
        tx.send_text(b"LIST").await.unwrap();
        assert_eq!(rx.recv_text().await.unwrap(), b"LIST");
    }

    #[tokio::test]
    async fn test_missing_source_abort_sends_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = WriteRecorder::default();
        let mut conn = Connection::new(recorder.clone(), key(), WireMode::Legacy);

        let result = send_file(
            &mut conn,
            &dir.path().join("missing.bin"),
            "missing.bin",
            MissingSource::Abort,
            &ProgressBar::hidden(),
        )
        .await;

        assert!(matches!(result, Err(ProtocolError::FileNotFound(_))));
        assert!(recorder.writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_directory_is_not_a_source() {
        let dir = tempfile::tempdir().unwrap();
        let (mut tx, mut rx) = pair();

        let result = send_file(&mut tx, dir.path(), "dir", MissingSource::Report, &ProgressBar::hidden()).await;
        assert!(matches!(result, Err(ProtocolError::FileNotFound(_))));
        assert_eq!(rx.recv_size().await.unwrap(), ERROR_SENTINEL);
    }

    #[tokio::test]
    async fn test_truncated_transfer_keeps_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("partial.bin");
        let (mut tx, mut rx) = pair();

        tx.send_size(3000).await.unwrap();
        tx.send_chunk(&pattern(1024)).await.unwrap();
        tx.send_chunk(&pattern(500)).await.unwrap();
        drop(tx);

        match receive_file(&mut rx, &dst, &ProgressBar::hidden()).await {
            Err(ProtocolError::Truncated { received, expected }) => {
                assert_eq!(received, 1524);
                assert_eq!(expected, 3000);
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let kept = std::fs::read(&dst).unwrap();
        assert_eq!(&kept[..1024], &pattern(1024)[..]);
        assert_eq!(&kept[1024..], &pattern(500)[..]);
    }

    #[tokio::test]
    async fn test_negative_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (mut tx, mut rx) = pair();
        tx.send_size(-7).await.unwrap();

        let result = receive_file(&mut rx, &dir.path().join("x"), &ProgressBar::hidden()).await;
        assert!(matches!(result, Err(ProtocolError::InvalidFormat(_))));
    }

    #[tokio::test]
    async fn test_unwritable_destination_is_drained() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        std::fs::write(&src, pattern(3000)).unwrap();
        let (mut tx, mut rx) = pair();

        let sender = tokio::spawn(async move {
            send_file(&mut tx, &src, "src.bin", MissingSource::Report, &ProgressBar::hidden()).await?;
            tx.send_text(b"LIST").await?;
            Ok::<_, ProtocolError>(())
        });

        // The destination's parent does not exist
        let dst = dir.path().join("no/such/dir/out.bin");
        let result = receive_file(&mut rx, &dst, &ProgressBar::hidden()).await;
        assert!(matches!(result, Err(ProtocolError::Destination { .. })));

        sender.await.unwrap().unwrap();
        assert_eq!(rx.recv_text().await.unwrap(), b"LIST");
    }

    #[tokio::test]
    async fn test_discard_file() {
        let (mut tx, mut rx) = pair();
        tx.send_size(1500).await.unwrap();
        tx.send_chunk(&pattern(1024)).await.unwrap();
        tx.send_chunk(&pattern(476)).await.unwrap();

        assert_eq!(discard_file(&mut rx).await.unwrap(), 1500);
    }
}
