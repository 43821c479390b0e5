//! Strict FIFO queue of requests waiting for the worker

use crate::clients::ClientId;
use crate::protocol::{RequestId, WorkerRequest};
use std::collections::VecDeque;
use std::time::Instant;

/// What a queued request is for
#[derive(Debug, Clone, PartialEq)]
pub enum EntryKind {
    /// A client's tool invocation; its reply is routed back to the client
    Invocation { client_id: ClientId },
    /// Best-effort disposal of a resource left behind by a disconnected client.
    /// Nobody waits for the reply.
    Disposal { handle: String },
}

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub kind: EntryKind,
    pub request: WorkerRequest,
    pub enqueued_at: Instant,
}

impl QueueEntry {
    pub fn invocation(client_id: ClientId, request: WorkerRequest) -> Self {
        Self {
            kind: EntryKind::Invocation { client_id },
            request,
            enqueued_at: Instant::now(),
        }
    }

    pub fn disposal(handle: String, request: WorkerRequest) -> Self {
        Self {
            kind: EntryKind::Disposal { handle },
            request,
            enqueued_at: Instant::now(),
        }
    }

    pub fn client_id(&self) -> Option<ClientId> {
        match self.kind {
            EntryKind::Invocation { client_id } => Some(client_id),
            EntryKind::Disposal { .. } => None,
        }
    }
}

/// Returned when an invocation would exceed the configured depth
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull(pub usize);

/// FIFO queue with an optional cap on queued invocations.
///
/// Disposal entries are never refused; they are small and dropping them
/// would leak worker-side state.
#[derive(Debug, Default)]
pub struct RequestQueue {
    entries: VecDeque<QueueEntry>,
    max_depth: Option<usize>,
}

impl RequestQueue {
    pub fn new(max_depth: Option<usize>) -> Self {
        Self {
            entries: VecDeque::new(),
            max_depth,
        }
    }

    pub fn push(&mut self, entry: QueueEntry) -> Result<usize, QueueFull> {
        if let (Some(limit), EntryKind::Invocation { .. }) = (self.max_depth, &entry.kind) {
            if self.invocation_count() >= limit {
                return Err(QueueFull(limit));
            }
        }
        self.entries.push_back(entry);
        Ok(self.entries.len())
    }

    pub fn pop(&mut self) -> Option<QueueEntry> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether this client already has a request with `id` waiting
    pub fn contains(&self, client_id: ClientId, id: &RequestId) -> bool {
        self.entries
            .iter()
            .any(|e| e.client_id() == Some(client_id) && &e.request.id == id)
    }

    /// Remove every queued entry, oldest first
    pub fn drain(&mut self) -> Vec<QueueEntry> {
        self.entries.drain(..).collect()
    }

    fn invocation_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.kind, EntryKind::Invocation { .. }))
            .count()
    }
}
