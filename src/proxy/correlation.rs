//! Correlation between transport-assigned and proxy-assigned request ids

use std::collections::HashMap;

use crate::proxy::types::{RequestId, TransportRequestId};

/// Maps a transport's per-leg id to the proxy request currently using it.
///
/// Transport ids may be reused once a request is gone, so an entry only
/// describes the live request and removal is keyed on both ids.
#[derive(Debug, Default)]
pub struct IdCorrelationTable {
    entries: HashMap<TransportRequestId, RequestId>,
}

impl IdCorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live request; unassigned transport ids are not tracked
    pub fn insert(&mut self, transport_request_id: TransportRequestId, request_id: RequestId) {
        if transport_request_id.is_assigned() {
            self.entries.insert(transport_request_id, request_id);
        }
    }

    pub fn lookup(&self, transport_request_id: TransportRequestId) -> Option<RequestId> {
        self.entries.get(&transport_request_id).copied()
    }

    /// Forget `request_id`, leaving any newer request with the same transport id alone
    pub fn remove(&mut self, transport_request_id: TransportRequestId, request_id: RequestId) {
        if self.lookup(transport_request_id) == Some(request_id) {
            self.entries.remove(&transport_request_id);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
