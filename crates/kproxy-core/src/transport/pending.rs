//! Table of in-flight commands keyed by correlation token.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::ConnectorError;
use crate::protocol::{CorrelationToken, EventEnvelope};

#[derive(Default)]
struct TableState {
    requests: HashMap<CorrelationToken, mpsc::UnboundedSender<EventEnvelope>>,
    closed: Option<String>,
}

/// Shared between the read loop (routing) and senders (register/unregister).
///
/// Only ever locked for short, non-async sections.
#[derive(Clone, Default)]
pub(super) struct PendingTable {
    state: Arc<Mutex<TableState>>,
}

/// Keeps a request registered; dropping it (terminal event, error, or a
/// cancelled wait) removes the entry.
pub(super) struct Registration {
    table: PendingTable,
    token: CorrelationToken,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.table.lock().requests.remove(&self.token).is_some() {
            debug!(token = %self.token, "request unregistered before its terminal event");
        }
    }
}

impl PendingTable {
    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn register(
        &self,
        token: CorrelationToken,
    ) -> Result<(Registration, mpsc::UnboundedReceiver<EventEnvelope>), ConnectorError> {
        let mut state = self.lock();
        if let Some(reason) = &state.closed {
            return Err(ConnectorError::ConnectionLost(reason.clone()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.requests.insert(token.clone(), tx);
        let registration = Registration {
            table: self.clone(),
            token,
        };
        Ok((registration, rx))
    }

    /// Deliver an event to the request with the same token, if any.
    pub(super) fn route(&self, envelope: EventEnvelope) {
        let Some(token) = envelope.token.clone() else {
            debug!(
                event_type = envelope.event.event_type(),
                "discarding unsolicited event"
            );
            return;
        };

        let mut state = self.lock();
        let terminal = envelope.event.is_terminal();
        let delivered = if terminal {
            state
                .requests
                .remove(&token)
                .map(|tx| tx.send(envelope).is_ok())
        } else {
            state
                .requests
                .get(&token)
                .map(|tx| tx.send(envelope).is_ok())
        };

        match delivered {
            Some(true) => {}
            Some(false) => debug!(token = %token, "receiver gone, event dropped"),
            None => debug!(token = %token, "no pending request for token, event discarded"),
        }
    }

    /// Mark the table closed and drop every pending sender.
    pub(super) fn close(&self, reason: String) {
        let mut state = self.lock();
        if state.closed.is_none() {
            state.closed = Some(reason);
        }
        state.requests.clear();
    }

    pub(super) fn close_reason(&self) -> Option<String> {
        self.lock().closed.clone()
    }

    pub(super) fn len(&self) -> usize {
        self.lock().requests.len()
    }
}
