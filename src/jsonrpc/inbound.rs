//! Registry of peer requests currently being handled locally.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::jsonrpc::cancel::CancellationToken;
use crate::jsonrpc::types::RequestId;

struct ActiveCall {
    token: CancellationToken,
    generation: u64,
}

#[derive(Default)]
struct State {
    active: HashMap<RequestId, ActiveCall>,
    next_generation: u64,
}

/// Handle identifying one registration of an inbound request.
///
/// The peer may reuse an ID once it has been answered; the generation keeps a
/// late completion from removing a newer registration under the same ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Registration {
    generation: u64,
}

#[derive(Default)]
pub(crate) struct InboundRegistry {
    state: Mutex<State>,
}

impl InboundRegistry {
    pub(crate) fn register(&self, id: &RequestId) -> (CancellationToken, Registration) {
        let token = CancellationToken::new();
        let mut state = self.state.lock();
        state.next_generation += 1;
        let generation = state.next_generation;
        let previous = state.active.insert(
            id.clone(),
            ActiveCall {
                token: token.clone(),
                generation,
            },
        );
        if previous.is_some() {
            tracing::warn!(%id, "peer reused the ID of a request that is still active");
        }
        (token, Registration { generation })
    }

    /// Releases the registration: its token is triggered and the entry removed.
    pub(crate) fn complete(&self, id: &RequestId, registration: Registration) {
        let mut state = self.state.lock();
        let current = state
            .active
            .get(id)
            .is_some_and(|call| call.generation == registration.generation);
        if current {
            if let Some(call) = state.active.remove(id) {
                call.token.cancel();
            }
        }
    }

    /// Requests cooperative cancellation. Returns `false` if `id` is not active.
    pub(crate) fn cancel(&self, id: &RequestId) -> bool {
        match self.state.lock().active.get(id) {
            Some(call) => {
                call.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Triggers every active token and empties the registry.
    pub(crate) fn drain(&self) -> usize {
        let drained: Vec<ActiveCall> = self.state.lock().active.drain().map(|(_, c)| c).collect();
        for call in &drained {
            call.token.cancel();
        }
        drained.len()
    }

    #[cfg(test)]
    pub(crate) fn is_active(&self, id: &RequestId) -> bool {
        self.state.lock().active.contains_key(id)
    }
}
