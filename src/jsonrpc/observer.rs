//! Pluggable hook notified of every protocol event.
//!
//! Observers see events from the read loop and from arbitrary caller tasks at
//! the same time, so implementations must synchronize internally. They never
//! influence control flow.

use std::time::Duration;

use serde_json::Value;

use crate::jsonrpc::types::{RequestId, ResponseError};

pub trait ProtocolObserver: Send + Sync {
    fn outgoing_request(&self, _id: &RequestId, _method: &str, _params: Option<&Value>) {}
    fn incoming_request(&self, _id: &RequestId, _method: &str, _params: Option<&Value>) {}
    fn outgoing_response(
        &self,
        _id: &RequestId,
        _method: &str,
        _outcome: &Result<Value, ResponseError>,
    ) {
    }
    fn incoming_response(
        &self,
        _id: &RequestId,
        _method: &str,
        _outcome: &Result<Value, ResponseError>,
    ) {
    }
    fn outgoing_notification(&self, _method: &str, _params: Option<&Value>) {}
    fn incoming_notification(&self, _method: &str, _params: Option<&Value>) {}
    fn incoming_cancel_request(&self, _id: &RequestId) {}
    fn outgoing_cancel_request(&self, _id: &RequestId) {}
    /// Time spent reading one frame off the input stream.
    fn incoming_data_delay(&self, _elapsed: Duration) {}
    /// Time spent writing one frame to the output stream.
    fn outgoing_data_delay(&self, _elapsed: Duration) {}
}

/// Observer that ignores every event. The default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl ProtocolObserver for NullObserver {}

/// Observer that emits a `tracing` event for each protocol event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

fn outcome_summary(outcome: &Result<Value, ResponseError>) -> String {
    match outcome {
        Ok(result) => result.to_string(),
        Err(error) => format!("error: {error}"),
    }
}

impl ProtocolObserver for TracingObserver {
    fn outgoing_request(&self, id: &RequestId, method: &str, params: Option<&Value>) {
        tracing::debug!(%id, method, params = ?params, "--> request");
    }

    fn incoming_request(&self, id: &RequestId, method: &str, params: Option<&Value>) {
        tracing::debug!(%id, method, params = ?params, "<-- request");
    }

    fn outgoing_response(
        &self,
        id: &RequestId,
        method: &str,
        outcome: &Result<Value, ResponseError>,
    ) {
        tracing::debug!(%id, method, outcome = %outcome_summary(outcome), "--> response");
    }

    fn incoming_response(
        &self,
        id: &RequestId,
        method: &str,
        outcome: &Result<Value, ResponseError>,
    ) {
        tracing::debug!(%id, method, outcome = %outcome_summary(outcome), "<-- response");
    }

    fn outgoing_notification(&self, method: &str, params: Option<&Value>) {
        tracing::debug!(method, params = ?params, "--> notification");
    }

    fn incoming_notification(&self, method: &str, params: Option<&Value>) {
        tracing::debug!(method, params = ?params, "<-- notification");
    }

    fn incoming_cancel_request(&self, id: &RequestId) {
        tracing::debug!(%id, "<-- cancel request");
    }

    fn outgoing_cancel_request(&self, id: &RequestId) {
        tracing::debug!(%id, "--> cancel request");
    }

    fn incoming_data_delay(&self, elapsed: Duration) {
        tracing::trace!(?elapsed, "frame read");
    }

    fn outgoing_data_delay(&self, elapsed: Duration) {
        tracing::trace!(?elapsed, "frame written");
    }
}
