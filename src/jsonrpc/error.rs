//! Error types for framing and connection management.

use std::io;

use thiserror::Error;

use crate::jsonrpc::types::RequestId;

/// Errors raised while extracting a frame from the input stream.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Reading from the underlying stream failed.
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),

    /// The header block did not contain a `Content-Length` field.
    #[error("Content-Length header not found")]
    MissingContentLength,

    /// The `Content-Length` value was not a non-negative integer.
    #[error("invalid Content-Length value: {0:?}")]
    InvalidContentLength(String),

    /// A header line could not be parsed.
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),

    /// A header line exceeded the accepted length.
    #[error("header line longer than {limit} bytes")]
    HeaderTooLong {
        /// Longest accepted line, terminator included.
        limit: usize,
    },

    /// The stream ended before the declared payload length was read.
    #[error("expected {expected} bytes but {read} have been read")]
    Truncated {
        /// Declared payload length.
        expected: usize,
        /// Bytes actually received before the stream closed.
        read: usize,
    },
}

/// Errors surfaced by a [`Connection`](crate::jsonrpc::Connection).
///
/// Framing, classification and correlation errors terminate the connection.
/// The remaining variants are scoped to a single operation.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The peer closed the stream at a frame boundary.
    #[error("end of stream")]
    EndOfStream,

    /// The frame reader failed.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// A payload matched none of the request, notification or response shapes.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A response arrived for an ID with no pending outbound call.
    #[error("invalid ID in request response '{0}': double answer or request not sent")]
    UnknownResponseId(RequestId),

    /// A `$/cancelRequest` notification carried undecodable params.
    #[error("invalid cancelRequest: {0}")]
    InvalidCancelParams(#[source] serde_json::Error),

    /// Writing a frame to the output stream failed.
    #[error("error sending message: {0}")]
    Write(#[source] io::Error),

    /// Encoding or decoding a payload failed.
    #[error("JSON codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The connection has been closed.
    #[error("connection closed")]
    Closed,
}

impl ConnectionError {
    /// Returns `true` for the clean end-of-stream condition.
    #[must_use]
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream)
    }
}
