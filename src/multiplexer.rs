//! Serializes requests from every client onto the single worker
//!
//! All queue, correlation and registry state lives in one `MuxState` behind a
//! single mutex. Every entry point is synchronous and the lock is never held
//! across an await, so handlers observe the same serialization a
//! single-threaded event loop would give.
//!
//! At most one request is in flight to the worker. The worker is trusted to
//! answer requests in the order they were sent; with one request outstanding
//! that order is trivially the dispatch order.

use crate::clients::{ClientId, ClientRegistry, ClientSender};
use crate::config::{Config, ResourceConfig};
use crate::correlator::{Completion, CorrelationKey, Correlator, PendingRequest, Responder};
use crate::error::GatewayError;
use crate::protocol::{
    self, RequestId, RpcResponse, ServerInfo, Translation, WorkerMessage, WorkerRequest,
    DISCOVERY_REQUEST_ID, METHOD_INITIALIZED, METHOD_TOOLS_LIST,
};
use crate::queue::{EntryKind, QueueEntry, RequestQueue};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Write side of the current worker's stdin
#[derive(Debug, Clone)]
pub struct WorkerLink {
    pub generation: u64,
    sender: mpsc::UnboundedSender<String>,
}

impl WorkerLink {
    pub fn new(generation: u64, sender: mpsc::UnboundedSender<String>) -> Self {
        Self { generation, sender }
    }

    fn write(&self, line: String) -> bool {
        self.sender.send(line).is_ok()
    }
}

#[derive(Debug)]
enum Purpose {
    Invocation(CorrelationKey),
    Disposal(String),
    Discovery,
}

/// The one request currently being processed by the worker
#[derive(Debug)]
struct InFlight {
    id: RequestId,
    purpose: Purpose,
    dispatched_at: Instant,
}

struct MuxState {
    queue: RequestQueue,
    correlator: Correlator,
    clients: ClientRegistry,
    in_flight: Option<InFlight>,
    worker: Option<WorkerLink>,
    /// Capability discovery requested for the current worker but not yet sent
    discovery_due: bool,
    tools: Option<Vec<Value>>,
    /// Restart budget exhausted, invocations are refused
    unavailable: bool,
}

/// Point-in-time counters for health reporting
#[derive(Debug, Clone, Default)]
pub struct MuxStats {
    pub queue_depth: usize,
    pub pending_requests: usize,
    pub clients: usize,
    pub tracked_resources: usize,
    pub tools_cached: bool,
    pub in_flight_age: Option<Duration>,
}

pub struct Multiplexer {
    state: Mutex<MuxState>,
    server: ServerInfo,
    resources: ResourceConfig,
}

impl Multiplexer {
    pub fn new(config: &Config) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MuxState {
                queue: RequestQueue::new(config.queue.max_depth),
                correlator: Correlator::default(),
                clients: ClientRegistry::default(),
                in_flight: None,
                worker: None,
                discovery_due: false,
                tools: None,
                unavailable: false,
            }),
            server: ServerInfo {
                name: config.server.name.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            resources: config.resources.clone(),
        })
    }

    // === Client side ===

    /// Admit a new client connection
    pub fn connect_client(&self, sender: ClientSender) -> ClientId {
        let client_id = Uuid::new_v4();
        let mut state = self.state.lock();
        state.clients.connect(client_id, sender);
        info!(%client_id, total_clients = state.clients.len(), "Client connected");
        client_id
    }

    /// Remove a client and queue disposal of every resource it owned.
    /// Returns the number of disposal requests queued.
    pub fn disconnect_client(&self, client_id: ClientId) -> usize {
        let mut state = self.state.lock();
        let Some(resources) = state.clients.disconnect(client_id) else {
            return 0;
        };

        info!(
            %client_id,
            resources_to_dispose = resources.len(),
            total_clients = state.clients.len(),
            "Client disconnected, cleaning up resources"
        );

        if state.unavailable {
            for handle in resources {
                warn!(%client_id, handle = %handle, "Dropping resource disposal, worker unavailable");
            }
            return 0;
        }

        let count = resources.len();
        for handle in resources {
            self.enqueue_disposal(&mut state, handle);
        }
        if count > 0 {
            self.dispatch_next(&mut state);
        }
        count
    }

    /// Handle one text frame from a client
    pub fn handle_client_message(&self, client_id: ClientId, text: &str) {
        let request = match protocol::parse_client_message(text) {
            Ok(request) => request,
            Err(response) => {
                warn!(%client_id, "Rejected malformed client message");
                self.state.lock().clients.send(client_id, response.to_json());
                return;
            }
        };

        debug!(%client_id, method = %request.method, id = ?request.id, "Client request");

        let mut state = self.state.lock();
        match protocol::translate(request, &self.server, state.tools.as_deref()) {
            Translation::Respond(response) => {
                if response.error.is_some() {
                    debug!(%client_id, id = ?response.id, "Answered client request with error");
                }
                state.clients.send(client_id, response.to_json());
            }
            Translation::Forward(request) => {
                self.enqueue_invocation(&mut state, client_id, request);
            }
            Translation::Ignore => {
                debug!(%client_id, "Client notification acknowledged");
            }
        }
    }

    fn enqueue_invocation(&self, state: &mut MuxState, client_id: ClientId, request: WorkerRequest) {
        let id = request.id.clone();
        let reject = |state: &MuxState, error: GatewayError| {
            warn!(%client_id, request_id = %id, error = %error, "Invocation rejected");
            state
                .clients
                .send(client_id, RpcResponse::failure(Some(id.clone()), &error).to_json());
        };

        if state.unavailable {
            return reject(&*state, GatewayError::WorkerUnavailable);
        }

        if id == RequestId::from(DISCOVERY_REQUEST_ID) {
            return reject(
                &*state,
                GatewayError::InvalidRequest(format!("request id '{}' is reserved", id)),
            );
        }

        let key = CorrelationKey::new(client_id, id.clone());
        if state.correlator.contains(&key) || state.queue.contains(client_id, &id) {
            return reject(
                &*state,
                GatewayError::InvalidRequest(format!("request id {} is already in use", id)),
            );
        }

        let method = request.method.clone();
        match state.queue.push(QueueEntry::invocation(client_id, request)) {
            Ok(queue_length) => {
                debug!(%client_id, request_id = %id, %method, queue_length, "Request enqueued");
                self.dispatch_next(state);
            }
            Err(full) => reject(&*state, GatewayError::QueueFull(full.0)),
        }
    }

    fn enqueue_disposal(&self, state: &mut MuxState, handle: String) {
        let mut params = serde_json::Map::new();
        params.insert(self.resources.handle_field.clone(), Value::String(handle.clone()));
        let request = WorkerRequest::new(
            RequestId::String(Uuid::new_v4().to_string()),
            self.resources.dispose_method.clone(),
            Value::Object(params),
        );
        debug!(handle = %handle, request_id = %request.id, "Queued resource disposal");
        // Disposals bypass the depth limit
        let _ = state.queue.push(QueueEntry::disposal(handle, request));
    }

    // === Worker side ===

    /// A new worker process is running and accepting input
    pub fn attach_worker(&self, link: WorkerLink) {
        let mut state = self.state.lock();
        debug!(generation = link.generation, "Worker attached");
        state.worker = Some(link);
        state.in_flight = None;
        state.discovery_due = false;
        state.tools = None;
        state.unavailable = false;
        self.dispatch_next(&mut state);
    }

    /// Schedule the capability discovery request for the given worker
    pub fn request_discovery(&self, generation: u64) {
        let mut state = self.state.lock();
        if !state.worker.as_ref().is_some_and(|w| w.generation == generation) {
            return;
        }
        state.discovery_due = true;
        self.dispatch_next(&mut state);
    }

    /// Give up on a discovery request the worker has left unanswered for
    /// `timeout`, freeing the in-flight slot for queued requests.
    ///
    /// Returns how much longer to wait before checking again, or `None` once
    /// there is nothing left to watch for this worker.
    pub fn expire_discovery(&self, generation: u64, timeout: Duration) -> Option<Duration> {
        let mut state = self.state.lock();
        if !state.worker.as_ref().is_some_and(|w| w.generation == generation) {
            return None;
        }

        let age = match &state.in_flight {
            Some(InFlight { purpose: Purpose::Discovery, dispatched_at, .. }) => dispatched_at.elapsed(),
            // Not sent yet, another request holds the slot
            _ if state.discovery_due => return Some(timeout),
            _ => return None,
        };
        if age < timeout {
            return Some(timeout - age);
        }

        error!(
            generation,
            timeout_ms = timeout.as_millis() as u64,
            "Failed to get tools from worker: discovery timed out"
        );
        state.in_flight = None;
        self.dispatch_next(&mut state);
        None
    }

    /// The worker exited. Fails every dispatched request; queued requests stay
    /// queued for the next worker. Returns the number of requests failed.
    pub fn detach_worker(&self, generation: u64) -> usize {
        let mut state = self.state.lock();
        if state.worker.as_ref().is_some_and(|w| w.generation != generation) {
            debug!(generation, "Ignoring exit of a replaced worker");
            return 0;
        }

        state.worker = None;
        state.in_flight = None;
        state.discovery_due = false;
        state.tools = None;

        let rejected = state.correlator.reject_all(&GatewayError::worker_terminated());
        for key in &rejected {
            warn!(
                client_id = %key.client_id,
                request_id = %key.request_id,
                "Request failed: worker process terminated"
            );
        }
        if !rejected.is_empty() {
            info!(generation, failed = rejected.len(), queued = state.queue.len(), "Failed in-flight requests after worker exit");
        }
        rejected.len()
    }

    /// Mark the worker permanently unavailable (or available again).
    /// Queued invocations are failed since no worker will ever run them.
    pub fn set_unavailable(&self, unavailable: bool) {
        let mut state = self.state.lock();
        state.unavailable = unavailable;
        if !unavailable {
            return;
        }

        for entry in state.queue.drain() {
            match entry.kind {
                EntryKind::Invocation { client_id } => {
                    let response =
                        RpcResponse::failure(Some(entry.request.id), &GatewayError::WorkerUnavailable);
                    state.clients.send(client_id, response.to_json());
                }
                EntryKind::Disposal { handle } => {
                    warn!(handle = %handle, "Dropping resource disposal, worker unavailable");
                }
            }
        }
    }

    /// Handle one complete line of worker output
    pub fn handle_worker_line(&self, generation: u64, line: &str) {
        let message: WorkerMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                error!(generation, error = %e, line, "Failed to parse worker message");
                return;
            }
        };

        let mut state = self.state.lock();
        if !state.worker.as_ref().is_some_and(|w| w.generation == generation) {
            debug!(generation, "Ignoring output from a replaced worker");
            return;
        }

        if message.id.as_ref() == Some(&RequestId::from(DISCOVERY_REQUEST_ID)) {
            self.complete_discovery(&mut state, &message);
            self.dispatch_next(&mut state);
            return;
        }

        match (&message.id, &message.method) {
            (Some(id), None) => {
                if state.in_flight.as_ref().is_some_and(|f| &f.id == id) {
                    self.complete_in_flight(&mut state, &message, line);
                    self.dispatch_next(&mut state);
                } else {
                    debug!(request_id = %id, "Received response for unknown request id");
                }
            }
            (Some(id), Some(method)) => {
                warn!(request_id = %id, %method, "Received unexpected request from worker");
                let response = RpcResponse::failure(
                    Some(id.clone()),
                    &GatewayError::UnsupportedWorkerRequest,
                );
                if let Some(worker) = &state.worker {
                    worker.write(response.to_json());
                }
            }
            (None, Some(method)) => {
                if method == METHOD_INITIALIZED {
                    if let Some(tools) = message.announced_tools() {
                        info!(tool_count = tools.len(), "Worker initialized and tool schema captured");
                        state.tools = Some(tools);
                    }
                    return;
                }
                let delivered = state.clients.broadcast(line);
                debug!(%method, delivered, "Broadcast worker notification");
            }
            (None, None) => {
                debug!(line, "Ignoring worker message without id or method");
            }
        }
    }

    fn complete_discovery(&self, state: &mut MuxState, message: &WorkerMessage) {
        if state
            .in_flight
            .as_ref()
            .is_some_and(|f| matches!(f.purpose, Purpose::Discovery))
        {
            state.in_flight = None;
        }

        match message.announced_tools() {
            Some(tools) => {
                info!(tool_count = tools.len(), "Worker tool schema captured");
                state.tools = Some(tools);
            }
            None => {
                error!(error = ?message.error, "Failed to get tools from worker");
            }
        }
    }

    fn complete_in_flight(&self, state: &mut MuxState, message: &WorkerMessage, line: &str) {
        let Some(in_flight) = state.in_flight.take() else {
            return;
        };

        match in_flight.purpose {
            Purpose::Invocation(key) => {
                let Some(pending) = state.correlator.take(&key) else {
                    return;
                };

                if self.resources.creates_resource(&pending.method) {
                    if let Some(handle) = message.result_handle(&self.resources.handle_field) {
                        if !state.clients.register(key.client_id, handle.clone()) {
                            // Owner left while the resource was being created
                            debug!(client_id = %key.client_id, handle = %handle, "Disposing resource of departed client");
                            self.enqueue_disposal(state, handle);
                        }
                    }
                }

                let method = pending.method.clone();
                let duration_ms = pending.elapsed().as_millis() as u64;
                let status = if message.is_error() { "error" } else { "success" };
                let completion = pending.resolve(line.to_string());
                info!(
                    event = "tool_invocation",
                    tool_name = %method,
                    client_id = %key.client_id,
                    request_id = %key.request_id,
                    duration_ms,
                    status,
                    delivered = completion == Completion::Delivered,
                    "Tool invocation completed"
                );
            }
            Purpose::Disposal(handle) => {
                if message.is_error() {
                    warn!(handle = %handle, error = ?message.error, "Resource disposal failed");
                } else {
                    debug!(handle = %handle, "Resource disposed");
                }
            }
            Purpose::Discovery => {}
        }
    }

    /// Send the next queued request if the worker is attached and idle
    fn dispatch_next(&self, state: &mut MuxState) {
        loop {
            if state.in_flight.is_some() {
                return;
            }
            let Some(worker) = state.worker.clone() else {
                return;
            };

            if state.discovery_due {
                state.discovery_due = false;
                let request = WorkerRequest::new(
                    RequestId::from(DISCOVERY_REQUEST_ID),
                    METHOD_TOOLS_LIST,
                    Value::Object(Default::default()),
                );
                if !worker.write(request.to_line()) {
                    self.lose_worker(state, &worker);
                    return;
                }
                debug!(generation = worker.generation, "Sent capability discovery request to worker");
                state.in_flight = Some(InFlight {
                    id: request.id,
                    purpose: Purpose::Discovery,
                    dispatched_at: Instant::now(),
                });
                return;
            }

            let Some(entry) = state.queue.pop() else {
                return;
            };
            let id = entry.request.id.clone();

            let purpose = match entry.kind {
                EntryKind::Invocation { client_id } => {
                    let responder = match state.clients.get(client_id) {
                        Some(client) if client.is_open() => Responder::new(client.sender()),
                        _ => {
                            debug!(%client_id, request_id = %id, "Skipping request from disconnected client");
                            continue;
                        }
                    };
                    let key = CorrelationKey::new(client_id, id.clone());
                    let pending = PendingRequest::new(entry.request.method.clone(), responder);
                    if state.correlator.register(key.clone(), pending).is_err() {
                        warn!(%client_id, request_id = %id, "Request id already pending, skipping");
                        continue;
                    }
                    Purpose::Invocation(key)
                }
                EntryKind::Disposal { handle } => Purpose::Disposal(handle),
            };

            debug!(
                request_id = %id,
                method = %entry.request.method,
                queued_ms = entry.enqueued_at.elapsed().as_millis() as u64,
                "Sending request to worker"
            );

            if !worker.write(entry.request.to_line()) {
                if let Purpose::Invocation(key) = &purpose {
                    if let Some(pending) = state.correlator.take(key) {
                        pending.reject(
                            id.clone(),
                            &GatewayError::WorkerFault("Failed to write to worker stdin".to_string()),
                        );
                    }
                }
                self.lose_worker(state, &worker);
                return;
            }

            state.in_flight = Some(InFlight {
                id,
                purpose,
                dispatched_at: Instant::now(),
            });
            return;
        }
    }

    /// The worker's stdin is gone; stop dispatching until it is replaced
    fn lose_worker(&self, state: &mut MuxState, worker: &WorkerLink) {
        error!(generation = worker.generation, "Worker stdin closed, pausing dispatch until restart");
        state.worker = None;
    }

    // === Observers ===

    /// Cached worker tool schema, if discovery has completed
    pub fn tools(&self) -> Option<Vec<Value>> {
        self.state.lock().tools.clone()
    }

    /// How long the current request has been with the worker
    pub fn in_flight_age(&self) -> Option<Duration> {
        self.state
            .lock()
            .in_flight
            .as_ref()
            .map(|f| f.dispatched_at.elapsed())
    }

    pub fn stats(&self) -> MuxStats {
        let state = self.state.lock();
        MuxStats {
            queue_depth: state.queue.len(),
            pending_requests: state.correlator.len(),
            clients: state.clients.len(),
            tracked_resources: state.clients.resource_count(),
            tools_cached: state.tools.is_some(),
            in_flight_age: state.in_flight.as_ref().map(|f| f.dispatched_at.elapsed()),
        }
    }
}
