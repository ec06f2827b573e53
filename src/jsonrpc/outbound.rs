//! Registry of requests sent to the peer and awaiting an answer.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::jsonrpc::error::ConnectionError;
use crate::jsonrpc::types::{RequestId, Response, ResponseError};

pub(crate) type Outcome = Result<Value, ResponseError>;

struct PendingCall {
    method: String,
    tx: oneshot::Sender<Outcome>,
}

#[derive(Default)]
struct State {
    pending: HashMap<RequestId, PendingCall>,
    /// Calls whose caller went away before the answer arrived, by method.
    abandoned: HashMap<RequestId, String>,
    last_id: i64,
    closed: bool,
}

#[derive(Default)]
pub(crate) struct OutboundRegistry {
    state: Mutex<State>,
}

impl OutboundRegistry {
    /// Allocates the next ID and registers a pending call for it.
    pub(crate) fn register(
        &self,
        method: &str,
    ) -> Result<(RequestId, oneshot::Receiver<Outcome>), ConnectionError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ConnectionError::Closed);
        }
        state.last_id += 1;
        let id = RequestId::Number(state.last_id);
        let (tx, rx) = oneshot::channel();
        state.pending.insert(
            id.clone(),
            PendingCall {
                method: method.to_string(),
                tx,
            },
        );
        Ok((id, rx))
    }

    pub(crate) fn unregister(&self, id: &RequestId) {
        self.state.lock().pending.remove(id);
    }

    /// Forgets a call whose caller stopped waiting. A later answer for `id`
    /// is dropped instead of being treated as unknown.
    pub(crate) fn abandon(&self, id: &RequestId) {
        let mut state = self.state.lock();
        if let Some(call) = state.pending.remove(id) {
            state.abandoned.insert(id.clone(), call.method);
        }
    }

    pub(crate) fn contains(&self, id: &RequestId) -> bool {
        self.state.lock().pending.contains_key(id)
    }

    /// Delivers a response to its pending call, returning the call's method.
    ///
    /// An ID without a pending or abandoned call is a peer protocol violation.
    pub(crate) fn resolve(&self, response: Response) -> Result<String, ConnectionError> {
        let call = {
            let mut state = self.state.lock();
            match state.pending.remove(&response.id) {
                Some(call) => call,
                None => match state.abandoned.remove(&response.id) {
                    Some(method) => {
                        tracing::debug!(id = %response.id, %method, "dropping answer to an abandoned call");
                        return Ok(method);
                    }
                    None => return Err(ConnectionError::UnknownResponseId(response.id)),
                },
            }
        };
        if call.tx.send(response.outcome).is_err() {
            tracing::debug!(id = %response.id, method = %call.method, "caller went away before the response arrived");
        }
        Ok(call.method)
    }

    /// Rejects further registrations and releases every pending caller.
    pub(crate) fn close(&self) -> usize {
        let mut state = self.state.lock();
        state.closed = true;
        let released = state.pending.len();
        // Dropping the senders completes each waiting caller with `Closed`.
        state.pending.clear();
        state.abandoned.clear();
        released
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.state.lock().pending.len()
    }
}
