//! Responses waiting for the client that submitted a command.
//!
//! Entries are keyed by command position. A client that never asks for its
//! response would otherwise keep it forever, so the store holds at most
//! `capacity` entries and drops the oldest position first.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::context::CommandResponse;

/// Unclaimed responses kept per partition.
pub const DEFAULT_RESPONSE_CAPACITY: usize = 10_000;

/// Responses to user commands, by command position. Clones share entries.
#[derive(Debug, Clone)]
pub struct ResponseStore {
    responses: Arc<Mutex<BTreeMap<i64, CommandResponse>>>,
    capacity: usize,
}

impl Default for ResponseStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_RESPONSE_CAPACITY)
    }
}

impl ResponseStore {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            responses: Arc::new(Mutex::new(BTreeMap::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn insert(&self, position: i64, response: CommandResponse) {
        let Ok(mut responses) = self.responses.lock() else {
            return;
        };
        responses.insert(position, response);
        while responses.len() > self.capacity {
            if let Some((evicted, _)) = responses.pop_first() {
                debug!(position = evicted, "Dropped unclaimed response");
            }
        }
    }

    /// Take the response to the command at `position`.
    pub fn take(&self, position: i64) -> Option<CommandResponse> {
        self.responses
            .lock()
            .ok()
            .and_then(|mut responses| responses.remove(&position))
    }

    /// Responses nobody has taken yet.
    pub fn len(&self) -> usize {
        self.responses.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
