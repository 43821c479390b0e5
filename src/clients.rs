//! Connected clients and the worker resources they own

use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

pub type ClientId = Uuid;

/// Outbound half of a client connection; each message is one JSON text frame
pub type ClientSender = mpsc::UnboundedSender<String>;

pub struct ClientConnection {
    sender: ClientSender,
    resources: HashSet<String>,
    connected_at: Instant,
}

impl ClientConnection {
    /// Queue a frame for the client. Returns false if the connection is gone.
    pub fn send(&self, message: String) -> bool {
        self.sender.send(message).is_ok()
    }

    pub fn sender(&self) -> ClientSender {
        self.sender.clone()
    }

    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }

    pub fn resources(&self) -> &HashSet<String> {
        &self.resources
    }
}

#[derive(Default)]
pub struct ClientRegistry {
    clients: HashMap<ClientId, ClientConnection>,
}

impl ClientRegistry {
    pub fn connect(&mut self, client_id: ClientId, sender: ClientSender) {
        self.clients.insert(
            client_id,
            ClientConnection {
                sender,
                resources: HashSet::new(),
                connected_at: Instant::now(),
            },
        );
    }

    /// Remove a client and hand back the resources it owned
    pub fn disconnect(&mut self, client_id: ClientId) -> Option<HashSet<String>> {
        self.clients.remove(&client_id).map(|client| {
            debug!(
                %client_id,
                connected_ms = client.connected_at.elapsed().as_millis() as u64,
                "Client removed from registry"
            );
            client.resources
        })
    }

    pub fn get(&self, client_id: ClientId) -> Option<&ClientConnection> {
        self.clients.get(&client_id)
    }

    /// Whether the client is registered and its transport is still open
    pub fn is_connected(&self, client_id: ClientId) -> bool {
        self.clients.get(&client_id).is_some_and(|c| c.is_open())
    }

    /// Record a resource handle created on behalf of a client.
    /// Returns false when the client is already gone.
    pub fn register(&mut self, client_id: ClientId, handle: String) -> bool {
        match self.clients.get_mut(&client_id) {
            Some(client) => {
                debug!(%client_id, handle = %handle, "Tracking resource for client");
                client.resources.insert(handle);
                true
            }
            None => false,
        }
    }

    /// Send a frame to one client, returns false if it could not be delivered
    pub fn send(&self, client_id: ClientId, message: String) -> bool {
        self.clients
            .get(&client_id)
            .map(|c| c.send(message))
            .unwrap_or(false)
    }

    /// Send a frame to every open client, returns how many received it
    pub fn broadcast(&self, message: &str) -> usize {
        self.clients
            .values()
            .filter(|c| c.send(message.to_string()))
            .count()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Resource handles currently owned across all clients
    pub fn resource_count(&self) -> usize {
        self.clients.values().map(|c| c.resources().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
