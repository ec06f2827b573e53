//! JSON-RPC connection for the LSP base protocol.
//!
//! A [`Connection`] reads `Content-Length` framed messages from one half of a
//! duplex stream and writes to the other. Both peers may issue requests and
//! notifications at any time; responses are correlated by request ID.

pub mod cancel;
pub mod connection;
pub mod error;
pub mod handler;
mod inbound;
pub mod message_parser;
pub mod observer;
mod outbound;
pub mod transport;
pub mod types;
mod writer;

pub use cancel::CancellationToken;
pub use connection::{Connection, ConnectionBuilder, ErrorHandler, NotificationMode};
pub use error::{ConnectionError, FrameError};
pub use handler::{HandlerTable, NotificationHandler, RequestContext, RequestHandler, Responder};
pub use message_parser::parse_message_from_slice;
pub use observer::{NullObserver, ProtocolObserver, TracingObserver};
pub use transport::FrameReader;
pub use types::{
    error_codes, CancelParams, Message, Notification, Request, RequestId, Response,
    ResponseError, CANCEL_REQUEST_METHOD, JSONRPC_VERSION,
};
