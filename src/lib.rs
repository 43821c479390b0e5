//! Toolgate - share one tool-server process between many WebSocket clients
//!
//! This library provides a gateway that:
//! - Supervises a single long-lived worker speaking newline-delimited JSON-RPC on stdio
//! - Restarts the worker with bounded exponential backoff when it exits
//! - Serializes requests from every client into one FIFO stream to the worker
//! - Routes each reply back to the client that sent the request, keyed by (client, id)
//! - Disposes worker-side resources left behind by disconnected clients
//! - Reports liveness and readiness on `GET /health`

pub mod clients;
pub mod config;
pub mod correlator;
pub mod error;
pub mod framer;
pub mod health;
pub mod multiplexer;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod supervisor;
