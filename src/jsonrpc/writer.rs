use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::jsonrpc::error::ConnectionError;
use crate::jsonrpc::transport::frame_header;

type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Frames messages and writes them to the output stream one at a time.
///
/// The lock is held for the header, the payload and the flush of a single
/// frame, so concurrent writers never interleave bytes on the wire.
pub(crate) struct FramedWriter {
    out: Mutex<BoxedWrite>,
}

impl FramedWriter {
    pub(crate) fn new<W>(out: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        FramedWriter {
            out: Mutex::new(Box::new(out)),
        }
    }

    /// Writes one framed message and returns the time spent on the wire.
    pub(crate) async fn write<T: Serialize>(&self, message: &T) -> Result<Duration, ConnectionError> {
        let body = serde_json::to_vec(message)?;
        let header = frame_header(body.len());

        let start = Instant::now();
        let mut out = self.out.lock().await;
        out.write_all(header.as_bytes())
            .await
            .map_err(ConnectionError::Write)?;
        out.write_all(&body).await.map_err(ConnectionError::Write)?;
        out.flush().await.map_err(ConnectionError::Write)?;
        Ok(start.elapsed())
    }
}
