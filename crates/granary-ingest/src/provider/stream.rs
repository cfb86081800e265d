//! Bridge from blocking protocol readers to async object-store uploads
//!
//! FTP and SFTP libraries expose `std::io::Read` handles. The reader runs on
//! the blocking pool and hands chunks to the upload through a bounded channel,
//! so at most `CHANNEL_DEPTH` chunks are in memory at any time.

use bytes::Bytes;
use granary_common::{GranaryError, Result};
use std::io::{self, Read};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::store::BodyStream;

const CHUNK_SIZE: usize = 256 * 1024;
const CHANNEL_DEPTH: usize = 8;

/// Sending half handed to the blocking reader
pub(crate) struct ChunkSender {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl ChunkSender {
    /// Forward everything `reader` yields; fails if the upload side hung up
    pub(crate) fn forward(&self, reader: &mut dyn Read) -> io::Result<u64> {
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                return Ok(total);
            }
            total += n as u64;
            self.tx
                .blocking_send(Ok(Bytes::copy_from_slice(&buffer[..n])))
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "upload stream closed"))?;
        }
    }

    /// Surface a reader failure to the upload side
    pub(crate) fn fail(&self, message: &str) {
        let _ = self.tx.blocking_send(Err(io::Error::other(message.to_string())));
    }
}

/// Run `produce` on the blocking pool, returning the body it feeds and its handle
pub(crate) fn spawn_blocking_body<F>(produce: F) -> (BodyStream, JoinHandle<Result<()>>)
where
    F: FnOnce(&ChunkSender) -> Result<()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    let handle = tokio::task::spawn_blocking(move || {
        let sender = ChunkSender { tx };
        let result = produce(&sender);
        if let Err(e) = &result {
            sender.fail(&e.to_string());
        }
        result
    });

    let body = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    (Box::pin(body), handle)
}

/// Await the reader task, preferring its error over the upload's
pub(crate) async fn finish<T>(
    handle: JoinHandle<Result<()>>,
    upload: Result<T>,
) -> Result<T> {
    let reader = handle
        .await
        .map_err(|e| GranaryError::Transport(format!("Transfer task panicked: {}", e)))?;
    reader?;
    upload
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::io::Cursor;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_body_carries_reader_bytes() {
        let data: Vec<u8> = (0..(CHUNK_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();
        let expected = data.clone();

        let (mut body, handle) = spawn_blocking_body(move |sender| {
            sender.forward(&mut Cursor::new(data))?;
            Ok(())
        });

        let mut received = Vec::new();
        while let Some(chunk) = body.next().await {
            received.extend_from_slice(&chunk.unwrap());
        }
        finish(handle, Ok(())).await.unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reader_error_reaches_both_sides() {
        let (mut body, handle) = spawn_blocking_body(|_| {
            Err(GranaryError::FileNotFound("missing.hdf".into()))
        });

        let first = body.next().await.unwrap();
        assert!(first.is_err());

        let err = finish(handle, Ok(())).await.unwrap_err();
        assert!(matches!(err, GranaryError::FileNotFound(_)));
    }
}
