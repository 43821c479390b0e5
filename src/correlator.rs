//! Correlation of worker replies with the clients waiting for them
//!
//! Entries are keyed by `(client, request id)`. Ids are chosen by clients, so
//! two clients may legitimately use the same id at the same time; keying by
//! id alone would cross-deliver their replies.

use crate::clients::{ClientId, ClientSender};
use crate::error::GatewayError;
use crate::protocol::{RequestId, RpcResponse};
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    pub client_id: ClientId,
    pub request_id: RequestId,
}

impl CorrelationKey {
    pub fn new(client_id: ClientId, request_id: RequestId) -> Self {
        Self {
            client_id,
            request_id,
        }
    }
}

/// How a pending request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Delivered to the client
    Delivered,
    /// The client was gone; the result was dropped
    Discarded,
}

/// Single-fire handle for answering one client request.
///
/// `complete` consumes the responder, so a request cannot be answered twice.
#[derive(Debug)]
pub struct Responder {
    sender: ClientSender,
}

impl Responder {
    pub fn new(sender: ClientSender) -> Self {
        Self { sender }
    }

    pub fn complete(self, message: String) -> Completion {
        match self.sender.send(message) {
            Ok(()) => Completion::Delivered,
            Err(_) => Completion::Discarded,
        }
    }
}

/// A request dispatched to the worker and awaiting its reply
#[derive(Debug)]
pub struct PendingRequest {
    /// Worker method the request was rewritten to
    pub method: String,
    pub issued_at: Instant,
    responder: Responder,
}

impl PendingRequest {
    pub fn new(method: impl Into<String>, responder: Responder) -> Self {
        Self {
            method: method.into(),
            issued_at: Instant::now(),
            responder,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.issued_at.elapsed()
    }

    /// Forward the worker's reply verbatim
    pub fn resolve(self, reply: String) -> Completion {
        self.responder.complete(reply)
    }

    /// Answer with an error instead of a worker reply
    pub fn reject(self, request_id: RequestId, error: &GatewayError) -> Completion {
        self.responder
            .complete(RpcResponse::failure(Some(request_id), error).to_json())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateRequest(pub CorrelationKey);

#[derive(Debug, Default)]
pub struct Correlator {
    pending: HashMap<CorrelationKey, PendingRequest>,
}

impl Correlator {
    pub fn register(
        &mut self,
        key: CorrelationKey,
        pending: PendingRequest,
    ) -> Result<(), DuplicateRequest> {
        if self.pending.contains_key(&key) {
            return Err(DuplicateRequest(key));
        }
        self.pending.insert(key, pending);
        Ok(())
    }

    pub fn contains(&self, key: &CorrelationKey) -> bool {
        self.pending.contains_key(key)
    }

    /// Remove and return the entry for `key`
    pub fn take(&mut self, key: &CorrelationKey) -> Option<PendingRequest> {
        self.pending.remove(key)
    }

    /// Fail every outstanding request with `error` and clear the table.
    /// Returns the keys that were rejected.
    pub fn reject_all(&mut self, error: &GatewayError) -> Vec<CorrelationKey> {
        let mut rejected = Vec::with_capacity(self.pending.len());
        for (key, pending) in self.pending.drain() {
            pending.reject(key.request_id.clone(), error);
            rejected.push(key);
        }
        rejected
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    #[test]
    fn test_same_id_from_different_clients() {
        let mut correlator = Correlator::default();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = CorrelationKey::new(Uuid::new_v4(), RequestId::from(1i64));
        let b = CorrelationKey::new(Uuid::new_v4(), RequestId::from(1i64));

        correlator
            .register(a.clone(), PendingRequest::new("open", Responder::new(tx_a)))
            .unwrap();
        correlator
            .register(b.clone(), PendingRequest::new("click", Responder::new(tx_b)))
            .unwrap();
        assert_eq!(correlator.len(), 2);

        let pending = correlator.take(&b).unwrap();
        assert_eq!(pending.method, "click");
        assert_eq!(pending.resolve("reply-b".to_string()), Completion::Delivered);

        assert_eq!(rx_b.try_recv().unwrap(), "reply-b");
        assert!(rx_a.try_recv().is_err());
        assert!(correlator.contains(&a));
        assert!(!correlator.contains(&b));
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut correlator = Correlator::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let key = CorrelationKey::new(Uuid::new_v4(), RequestId::from("x"));

        correlator
            .register(key.clone(), PendingRequest::new("a", Responder::new(tx.clone())))
            .unwrap();
        let err = correlator
            .register(key.clone(), PendingRequest::new("b", Responder::new(tx)))
            .unwrap_err();
        assert_eq!(err, DuplicateRequest(key.clone()));
        assert_eq!(correlator.take(&key).unwrap().method, "a");
    }

    #[test]
    fn test_reject_all_completes_each_once() {
        let mut correlator = Correlator::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = Uuid::new_v4();
        for id in 0..3i64 {
            correlator
                .register(
                    CorrelationKey::new(client, RequestId::from(id)),
                    PendingRequest::new("slow", Responder::new(tx.clone())),
                )
                .unwrap();
        }

        let rejected = correlator.reject_all(&GatewayError::worker_terminated());
        assert_eq!(rejected.len(), 3);
        assert!(correlator.is_empty());

        let mut ids = Vec::new();
        while let Ok(message) = rx.try_recv() {
            let json: Value = serde_json::from_str(&message).unwrap();
            assert_eq!(json["error"]["code"], -32603);
            assert_eq!(json["error"]["data"]["originalError"], "Worker process terminated");
            ids.push(json["id"].as_i64().unwrap());
        }
        ids.sort();
        assert_eq!(ids, vec![0, 1, 2]);
        assert!(correlator.reject_all(&GatewayError::worker_terminated()).is_empty());
    }

    #[test]
    fn test_completion_to_closed_client_is_discarded() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let pending = PendingRequest::new("open", Responder::new(tx));
        assert_eq!(pending.resolve("late".to_string()), Completion::Discarded);
    }
}
