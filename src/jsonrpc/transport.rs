//! Frame reading for the LSP base protocol.
//!
//! Every message is preceded by a header block:
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <payload>
//! ```
//! Header fields other than `Content-Length` are accepted and ignored.

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use crate::jsonrpc::error::FrameError;

/// Longest header line accepted, terminator included.
pub const MAX_HEADER_LINE: usize = 8 * 1024;

/// Reads successive framed payloads from an async byte stream.
///
/// The sequence is lazy and cannot be restarted: once a read fails the reader
/// must be discarded.
pub struct FrameReader<R> {
    reader: BufReader<R>,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        FrameReader {
            reader: BufReader::new(reader),
        }
    }

    /// Reads the next payload.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly before the first header
    /// byte of a frame.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let Some(content_length) = self.read_headers().await? else {
            return Ok(None);
        };

        // The buffer grows with the bytes actually received, not the
        // declared length.
        let mut payload = Vec::new();
        let read = (&mut self.reader)
            .take(content_length as u64)
            .read_to_end(&mut payload)
            .await?;
        if read < content_length {
            return Err(FrameError::Truncated {
                expected: content_length,
                read,
            });
        }
        Ok(Some(payload))
    }

    async fn read_headers(&mut self) -> Result<Option<usize>, FrameError> {
        let mut content_length = None;
        let mut line = Vec::new();
        let mut first_line = true;

        loop {
            line.clear();
            let n = (&mut self.reader)
                .take(MAX_HEADER_LINE as u64)
                .read_until(b'\n', &mut line)
                .await?;
            if n == 0 && first_line {
                return Ok(None);
            }
            if !line.ends_with(b"\n") {
                if n == MAX_HEADER_LINE {
                    return Err(FrameError::HeaderTooLong {
                        limit: MAX_HEADER_LINE,
                    });
                }
                return Err(FrameError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed while reading headers",
                )));
            }
            first_line = false;

            let text = std::str::from_utf8(&line)
                .map_err(|_| FrameError::MalformedHeader(String::from_utf8_lossy(&line).into()))?;
            let text = text.trim_end_matches(['\r', '\n']);
            if text.is_empty() {
                break;
            }

            let (name, value) = text
                .split_once(':')
                .ok_or_else(|| FrameError::MalformedHeader(text.to_string()))?;
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = Some(parse_content_length(value)?);
            }
        }

        content_length.map(Some).ok_or(FrameError::MissingContentLength)
    }
}

pub(crate) fn parse_content_length(value: &str) -> Result<usize, FrameError> {
    let value = value.trim();
    value
        .parse::<usize>()
        .map_err(|_| FrameError::InvalidContentLength(value.to_string()))
}

/// Builds the header block for a payload of `len` bytes.
pub(crate) fn frame_header(len: usize) -> String {
    format!("Content-Length: {}\r\n\r\n", len)
}
