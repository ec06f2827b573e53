//! Handler traits invoked by the connection and the method-keyed handler table.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::jsonrpc::cancel::CancellationToken;
use crate::jsonrpc::connection::Shared;
use crate::jsonrpc::inbound::Registration;
use crate::jsonrpc::types::{RequestId, ResponseError};

/// Per-request state handed to a [`RequestHandler`].
#[derive(Debug, Clone)]
pub struct RequestContext {
    id: RequestId,
    method: String,
    token: CancellationToken,
    span: tracing::Span,
}

impl RequestContext {
    pub(crate) fn new(
        id: RequestId,
        method: String,
        token: CancellationToken,
        span: tracing::Span,
    ) -> Self {
        RequestContext {
            id,
            method,
            token,
            span,
        }
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Whether the peer (or connection shutdown) asked for cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Span the handler runs in; events logged inside it carry the request ID
    /// and method.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }
}

struct Pending {
    shared: Arc<Shared>,
    id: RequestId,
    method: String,
    registration: Registration,
}

/// Single-use completion for an inbound request.
///
/// Exactly one response is written per request: if the responder is dropped
/// without [`respond`](Self::respond) being called, an internal error
/// response is sent on its behalf.
pub struct Responder {
    pending: Option<Pending>,
}

impl Responder {
    pub(crate) fn new(
        shared: Arc<Shared>,
        id: RequestId,
        method: String,
        registration: Registration,
    ) -> Self {
        Responder {
            pending: Some(Pending {
                shared,
                id,
                method,
                registration,
            }),
        }
    }

    pub fn id(&self) -> Option<&RequestId> {
        self.pending.as_ref().map(|p| &p.id)
    }

    /// Releases the request's cancellation token and writes the response.
    pub async fn respond(mut self, outcome: Result<Value, ResponseError>) {
        if let Some(p) = self.pending.take() {
            p.shared
                .complete_inbound(p.id, &p.method, p.registration, outcome)
                .await;
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        let Some(p) = self.pending.take() else {
            return;
        };
        tracing::warn!(id = %p.id, method = %p.method, "request handler dropped its responder without responding");
        let outcome = Err(ResponseError::internal_error(
            "request handler finished without responding",
        ));
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    p.shared
                        .complete_inbound(p.id, &p.method, p.registration, outcome)
                        .await;
                });
            }
            Err(_) => p.shared.abandon_inbound(&p.id, p.registration),
        }
    }
}

/// Handles requests from the peer.
///
/// Invoked on its own task, so it may take as long as it needs; it must
/// eventually consume the [`Responder`].
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle_request(
        &self,
        ctx: RequestContext,
        method: &str,
        params: Option<Value>,
        responder: Responder,
    );
}

/// Handles notifications from the peer.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn handle_notification(&self, method: &str, params: Option<Value>);
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type RequestFn =
    Arc<dyn Fn(RequestContext, Option<Value>) -> BoxFuture<Result<Value, ResponseError>> + Send + Sync>;
type NotificationFn = Arc<dyn Fn(Option<Value>) + Send + Sync>;

/// Method-name-keyed table of request and notification handlers.
///
/// Requests for unregistered methods are answered with `METHOD_NOT_FOUND`;
/// notifications for unregistered methods are dropped.
#[derive(Clone, Default)]
pub struct HandlerTable {
    requests: HashMap<String, RequestFn>,
    notifications: HashMap<String, NotificationFn>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_request<F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(RequestContext, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ResponseError>> + Send + 'static,
    {
        let handler: RequestFn = Arc::new(move |ctx, params| Box::pin(handler(ctx, params)));
        self.requests.insert(method.into(), handler);
        self
    }

    pub fn on_notification<F>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Option<Value>) + Send + Sync + 'static,
    {
        self.notifications.insert(method.into(), Arc::new(handler));
        self
    }

    /// Registers a typed handler for an LSP request.
    ///
    /// Params that fail to decode are answered with `INVALID_PARAMS`.
    pub fn request<R, F, Fut>(self, handler: F) -> Self
    where
        R: lsp_types::request::Request + 'static,
        R::Params: Send + 'static,
        R::Result: Send + 'static,
        F: Fn(RequestContext, R::Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R::Result, ResponseError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.on_request(R::METHOD, move |ctx, params| {
            let handler = handler.clone();
            async move {
                let params: R::Params = serde_json::from_value(params.unwrap_or(Value::Null))
                    .map_err(ResponseError::invalid_params)?;
                let result = handler(ctx, params).await?;
                serde_json::to_value(result).map_err(|e| ResponseError::internal_error(e.to_string()))
            }
        })
    }

    /// Registers a typed handler for an LSP notification.
    pub fn notification<N, F>(self, handler: F) -> Self
    where
        N: lsp_types::notification::Notification + 'static,
        F: Fn(N::Params) + Send + Sync + 'static,
    {
        self.on_notification(N::METHOD, move |params| {
            match serde_json::from_value::<N::Params>(params.unwrap_or(Value::Null)) {
                Ok(params) => handler(params),
                Err(e) => tracing::warn!(method = N::METHOD, error = %e, "dropping notification with undecodable params"),
            }
        })
    }
}

#[async_trait]
impl RequestHandler for HandlerTable {
    async fn handle_request(
        &self,
        ctx: RequestContext,
        method: &str,
        params: Option<Value>,
        responder: Responder,
    ) {
        let outcome = match self.requests.get(method) {
            Some(handler) => handler(ctx, params).await,
            None => Err(ResponseError::method_not_found(method)),
        };
        responder.respond(outcome).await;
    }
}

#[async_trait]
impl NotificationHandler for HandlerTable {
    async fn handle_notification(&self, method: &str, params: Option<Value>) {
        match self.notifications.get(method) {
            Some(handler) => handler(params),
            None => tracing::debug!(method, "no handler for notification"),
        }
    }
}
