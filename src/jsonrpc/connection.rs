//! The dispatch core: read loop, request correlation and cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::jsonrpc::cancel::CancellationToken;
use crate::jsonrpc::error::ConnectionError;
use crate::jsonrpc::handler::{
    HandlerTable, NotificationHandler, RequestContext, RequestHandler, Responder,
};
use crate::jsonrpc::inbound::{InboundRegistry, Registration};
use crate::jsonrpc::message_parser::parse_message_from_slice;
use crate::jsonrpc::observer::{NullObserver, ProtocolObserver};
use crate::jsonrpc::outbound::OutboundRegistry;
use crate::jsonrpc::transport::FrameReader;
use crate::jsonrpc::types::{
    CancelParams, Message, Notification, Request, RequestId, Response, ResponseError,
    CANCEL_REQUEST_METHOD,
};
use crate::jsonrpc::writer::FramedWriter;

/// Invoked with the condition that terminated the connection, and with
/// non-fatal problems such as an undecodable `$/cancelRequest`.
pub type ErrorHandler = Arc<dyn Fn(&ConnectionError) + Send + Sync>;

/// How incoming notifications reach the [`NotificationHandler`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NotificationMode {
    /// Awaited on the read loop before the next frame is read.
    ///
    /// Notifications are observed strictly in wire order relative to
    /// requests, but a slow handler stalls every inbound message, including
    /// responses to outbound calls.
    #[default]
    Inline,
    /// Handed to a dedicated task through an unbounded queue.
    ///
    /// Notifications stay ordered among themselves and never block the
    /// reader, but may run after requests that arrived later.
    Queued,
}

pub struct ConnectionBuilder {
    request_handler: Arc<dyn RequestHandler>,
    notification_handler: Arc<dyn NotificationHandler>,
    error_handler: Option<ErrorHandler>,
    observer: Arc<dyn ProtocolObserver>,
    notification_mode: NotificationMode,
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        let table = Arc::new(HandlerTable::default());
        ConnectionBuilder {
            request_handler: table.clone(),
            notification_handler: table,
            error_handler: None,
            observer: Arc::new(NullObserver),
            notification_mode: NotificationMode::default(),
        }
    }
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `table` for both requests and notifications.
    pub fn handlers(self, table: HandlerTable) -> Self {
        let table = Arc::new(table);
        ConnectionBuilder {
            request_handler: table.clone(),
            notification_handler: table,
            ..self
        }
    }

    pub fn request_handler(mut self, handler: impl RequestHandler + 'static) -> Self {
        self.request_handler = Arc::new(handler);
        self
    }

    pub fn notification_handler(mut self, handler: impl NotificationHandler + 'static) -> Self {
        self.notification_handler = Arc::new(handler);
        self
    }

    pub fn error_handler(
        mut self,
        handler: impl Fn(&ConnectionError) + Send + Sync + 'static,
    ) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn observer(mut self, observer: impl ProtocolObserver + 'static) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    pub fn notification_mode(mut self, mode: NotificationMode) -> Self {
        self.notification_mode = mode;
        self
    }

    /// Creates the connection writing to `out`. Call [`Connection::run`] with
    /// the input half to start processing incoming messages.
    pub fn build<W>(self, out: W) -> Connection
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Connection {
            shared: Arc::new(Shared {
                writer: FramedWriter::new(out),
                outbound: OutboundRegistry::default(),
                inbound: InboundRegistry::default(),
                request_handler: self.request_handler,
                notification_handler: self.notification_handler,
                error_handler: self.error_handler,
                observer: RwLock::new(self.observer),
                notification_mode: self.notification_mode,
                closed: AtomicBool::new(false),
                running: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }
}

pub(crate) struct Shared {
    writer: FramedWriter,
    outbound: OutboundRegistry,
    inbound: InboundRegistry,
    request_handler: Arc<dyn RequestHandler>,
    notification_handler: Arc<dyn NotificationHandler>,
    error_handler: Option<ErrorHandler>,
    observer: RwLock<Arc<dyn ProtocolObserver>>,
    notification_mode: NotificationMode,
    closed: AtomicBool,
    running: AtomicBool,
    shutdown: CancellationToken,
}

impl Shared {
    fn observer(&self) -> Arc<dyn ProtocolObserver> {
        self.observer.read().clone()
    }

    async fn send(&self, message: &Message) -> Result<(), ConnectionError> {
        let elapsed = self.writer.write(message).await?;
        self.observer().outgoing_data_delay(elapsed);
        Ok(())
    }

    fn report(&self, error: &ConnectionError) {
        match &self.error_handler {
            Some(handler) => handler(error),
            None if error.is_end_of_stream() => tracing::debug!("peer closed the connection"),
            None => tracing::error!(%error, "connection error"),
        }
    }

    /// Reports a terminal condition once and closes the connection.
    fn fail(&self, error: &ConnectionError) {
        if self.release() {
            self.report(error);
        }
    }

    /// Marks the connection closed and releases both registries. Returns
    /// `false` if it was already closed.
    fn release(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let outbound = self.outbound.close();
        let inbound = self.inbound.drain();
        self.shutdown.cancel();
        tracing::debug!(outbound, inbound, "connection closed, registries released");
        true
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) async fn complete_inbound(
        &self,
        id: RequestId,
        method: &str,
        registration: Registration,
        outcome: Result<Value, ResponseError>,
    ) {
        self.inbound.complete(&id, registration);
        self.observer().outgoing_response(&id, method, &outcome);

        let response = Message::Response(Response::new(id, outcome));
        if let Err(error) = self.send(&response).await {
            if self.is_closed() {
                tracing::debug!(%error, method, "response not delivered, connection already closed");
            } else {
                self.fail(&error);
            }
        }
    }

    /// Drops a registration whose response can no longer be written.
    pub(crate) fn abandon_inbound(&self, id: &RequestId, registration: Registration) {
        self.inbound.complete(id, registration);
    }
}

/// A JSON-RPC connection over one duplex byte stream.
///
/// Cheap to clone; all clones share the same registries and writer.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    /// Replaces the protocol observer.
    pub fn set_observer(&self, observer: impl ProtocolObserver + 'static) {
        *self.shared.observer.write() = Arc::new(observer);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Closes the connection locally: stops the read loop, fails pending and
    /// future calls with [`ConnectionError::Closed`] and cancels active
    /// inbound handlers. Handlers still running may write their responses.
    /// An inline notification handler in progress is dropped.
    pub fn close(&self) {
        self.shared.release();
    }

    /// Runs the read loop until the input ends, a fatal error occurs or the
    /// connection is closed.
    ///
    /// The terminating condition is passed to the error handler (including
    /// [`ConnectionError::EndOfStream`]). A clean end of stream or a local
    /// [`close`](Self::close) returns `Ok(())`. A connection can only be run
    /// once.
    pub async fn run<R>(&self, input: R) -> Result<(), ConnectionError>
    where
        R: AsyncRead + Unpin + Send,
    {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }

        let queue = match self.shared.notification_mode {
            NotificationMode::Inline => None,
            NotificationMode::Queued => Some(self.spawn_notification_worker()),
        };

        let mut frames = FrameReader::new(input);
        let result = loop {
            let start = Instant::now();
            let frame = tokio::select! {
                biased;
                _ = self.shared.shutdown.cancelled() => break Ok(()),
                frame = frames.next_frame() => frame,
            };
            let frame = match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => break Err(ConnectionError::EndOfStream),
                Err(e) => break Err(ConnectionError::from(e)),
            };
            self.shared.observer().incoming_data_delay(start.elapsed());

            // An inline notification handler is awaited here; closing the
            // connection abandons it.
            let handled = tokio::select! {
                biased;
                _ = self.shared.shutdown.cancelled() => break Ok(()),
                handled = self.handle_incoming_data(&frame, queue.as_ref()) => handled,
            };
            if let Err(e) = handled {
                break Err(e);
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(error) => {
                self.shared.fail(&error);
                if error.is_end_of_stream() {
                    Ok(())
                } else {
                    Err(error)
                }
            }
        }
    }

    fn spawn_notification_worker(&self) -> mpsc::UnboundedSender<Notification> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
        let handler = self.shared.notification_handler.clone();
        tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                handler
                    .handle_notification(&notification.method, notification.params)
                    .await;
            }
        });
        tx
    }

    async fn handle_incoming_data(
        &self,
        frame: &[u8],
        queue: Option<&mpsc::UnboundedSender<Notification>>,
    ) -> Result<(), ConnectionError> {
        match parse_message_from_slice(frame)? {
            Message::Request(request) => {
                self.handle_incoming_request(request);
                Ok(())
            }
            Message::Notification(notification) => {
                self.handle_incoming_notification(notification, queue).await;
                Ok(())
            }
            Message::Response(response) => self.shared.outbound.resolve(response).map(|_| ()),
        }
    }

    fn handle_incoming_request(&self, request: Request) {
        let Request {
            id, method, params, ..
        } = request;
        let (token, registration) = self.shared.inbound.register(&id);
        self.shared
            .observer()
            .incoming_request(&id, &method, params.as_ref());

        let span = tracing::info_span!("request", %id, %method);
        let ctx = RequestContext::new(id.clone(), method.clone(), token, span.clone());
        let responder = Responder::new(self.shared.clone(), id, method.clone(), registration);
        let handler = self.shared.request_handler.clone();
        tokio::spawn(
            async move {
                handler.handle_request(ctx, &method, params, responder).await;
            }
            .instrument(span),
        );
    }

    async fn handle_incoming_notification(
        &self,
        notification: Notification,
        queue: Option<&mpsc::UnboundedSender<Notification>>,
    ) {
        if notification.method == CANCEL_REQUEST_METHOD {
            self.cancel_incoming_request(notification.params);
            return;
        }

        self.shared
            .observer()
            .incoming_notification(&notification.method, notification.params.as_ref());

        match queue {
            Some(queue) => {
                if let Err(mpsc::error::SendError(n)) = queue.send(notification) {
                    tracing::warn!(method = %n.method, "notification worker has stopped");
                }
            }
            None => {
                self.shared
                    .notification_handler
                    .handle_notification(&notification.method, notification.params)
                    .await;
            }
        }
    }

    fn cancel_incoming_request(&self, params: Option<Value>) {
        let params = match serde_json::from_value::<CancelParams>(params.unwrap_or(Value::Null)) {
            Ok(params) => params,
            Err(e) => {
                self.shared.report(&ConnectionError::InvalidCancelParams(e));
                return;
            }
        };
        if self.shared.inbound.cancel(&params.id) {
            self.shared.observer().incoming_cancel_request(&params.id);
        } else {
            tracing::debug!(id = %params.id, "cancel request for an inactive ID ignored");
        }
    }

    /// Sends a request and waits for its correlated response.
    ///
    /// When `cancel` fires, a single `$/cancelRequest` notification is sent
    /// and the call keeps waiting: the result is always the peer's own answer,
    /// which may be an error with code `REQUEST_CANCELLED`. There is no
    /// timeout; cancel the token from a timer to bound the wait.
    ///
    /// The outer `Result` fails only for connection-level problems; the inner
    /// one carries the peer's `result` or `error`.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Result<Value, ResponseError>, ConnectionError> {
        let shared = &self.shared;
        let (id, mut rx) = shared.outbound.register(method)?;
        let _guard = PendingGuard {
            outbound: &shared.outbound,
            id: id.clone(),
        };
        shared
            .observer()
            .outgoing_request(&id, method, params.as_ref());

        let request = Message::Request(Request::new(id.clone(), method, params));
        if let Err(e) = shared.send(&request).await {
            shared.outbound.unregister(&id);
            return Err(e);
        }

        let delivered = tokio::select! {
            biased;
            outcome = &mut rx => outcome,
            _ = cancel.cancelled() => {
                if shared.outbound.contains(&id) {
                    shared.observer().outgoing_cancel_request(&id);
                    let params = serde_json::to_value(CancelParams { id: id.clone() })?;
                    if let Err(error) = self.notify(CANCEL_REQUEST_METHOD, Some(params)).await {
                        tracing::debug!(%id, %error, "cancel notification not sent");
                    }
                }
                rx.await
            }
        };

        let outcome = delivered.map_err(|_| ConnectionError::Closed)?;
        shared.observer().incoming_response(&id, method, &outcome);
        Ok(outcome)
    }

    /// Sends a notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        self.shared
            .observer()
            .outgoing_notification(method, params.as_ref());
        self.shared
            .send(&Message::Notification(Notification::new(method, params)))
            .await
    }

    /// Typed form of [`call`](Self::call) for an LSP request.
    ///
    /// A result that cannot be decoded as `R::Result` is returned as
    /// [`ConnectionError::Codec`]; the connection itself is unaffected.
    pub async fn send_request<R>(
        &self,
        params: R::Params,
        cancel: &CancellationToken,
    ) -> Result<Result<R::Result, ResponseError>, ConnectionError>
    where
        R: lsp_types::request::Request,
    {
        let params = non_null(serde_json::to_value(params)?);
        match self.call(R::METHOD, params, cancel).await? {
            Ok(result) => Ok(Ok(serde_json::from_value(result)?)),
            Err(error) => Ok(Err(error)),
        }
    }

    /// Typed form of [`notify`](Self::notify) for an LSP notification.
    pub async fn send_notification<N>(&self, params: N::Params) -> Result<(), ConnectionError>
    where
        N: lsp_types::notification::Notification,
    {
        let params = non_null(serde_json::to_value(params)?);
        self.notify(N::METHOD, params).await
    }
}

/// Abandons an outbound call whose `call` future is dropped before the
/// answer arrives. A no-op once the call has been resolved or released.
struct PendingGuard<'a> {
    outbound: &'a OutboundRegistry,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.outbound.abandon(&self.id);
    }
}

/// `()` params serialize to `null`; those are omitted from the envelope.
fn non_null(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        value => Some(value),
    }
}
