//! Network surface: WebSocket clients plus the HTTP status endpoints
//!
//! One listener serves everything. Requests carrying a WebSocket upgrade become
//! client sessions on any path; plain HTTP requests are answered from
//! `/health` and `/version`.

use crate::clients::ClientId;
use crate::health::HealthReporter;
use crate::multiplexer::Multiplexer;
use futures::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Shared by every connection
struct ServerContext {
    mux: Arc<Multiplexer>,
    health: HealthReporter,
    shutdown_rx: watch::Receiver<bool>,
}

pub struct GatewayServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    context: Arc<ServerContext>,
}

impl GatewayServer {
    /// Bind the listener. Failure here is fatal for the gateway.
    pub async fn bind(
        bind_addr: SocketAddr,
        mux: Arc<Multiplexer>,
        health: HealthReporter,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", bind_addr, e))?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            context: Arc::new(ServerContext {
                mux,
                health,
                shutdown_rx,
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until shutdown is signalled
    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.local_addr, "Gateway listening for WebSocket clients and health checks");

        let mut shutdown_rx = self.context.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, addr, context).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Gateway server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection<S>(stream: S, addr: SocketAddr, context: Arc<ServerContext>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let context = Arc::clone(&context);
        async move { handle_request(req, addr, context).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    addr: SocketAddr,
    context: Arc<ServerContext>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if is_websocket_upgrade(&req) {
        return Ok(accept_websocket(req, addr, context));
    }

    let path = req.uri().path();
    let method = req.method();
    debug!(%method, %path, "HTTP request");

    let response = match (method, path) {
        (&Method::GET, "/health") => {
            let report = context.health.report();
            let status = if report.is_healthy() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            let body = serde_json::to_string(&report).unwrap_or_else(|_| "{}".to_string());
            json_response(status, body)
        }

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        _ => json_response(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": "Not found" }).to_string(),
        ),
    };

    Ok(response)
}

/// Check for `Connection: upgrade` together with `Upgrade: websocket`
fn is_websocket_upgrade(req: &Request<Incoming>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let is_websocket = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    has_upgrade_connection && is_websocket
}

/// Complete the WebSocket handshake and hand the upgraded stream to a session
fn accept_websocket(req: Request<Incoming>, addr: SocketAddr, context: Arc<ServerContext>) -> Response<Full<Bytes>> {
    let Some(key) = req.headers().get(SEC_WEBSOCKET_KEY) else {
        warn!(addr = %addr, "WebSocket upgrade without Sec-WebSocket-Key");
        return response(StatusCode::BAD_REQUEST, "missing Sec-WebSocket-Key");
    };
    let accept = derive_accept_key(key.as_bytes());

    let Ok(accept) = HeaderValue::from_str(&accept) else {
        return response(StatusCode::BAD_REQUEST, "invalid Sec-WebSocket-Key");
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
                run_session(ws, addr, context).await;
            }
            Err(e) => {
                error!(addr = %addr, error = %e, "Failed to upgrade client connection");
            }
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "upgrade")
        .header(UPGRADE, "websocket")
        .header(SEC_WEBSOCKET_ACCEPT, accept)
        .body(Full::new(Bytes::new()))
        .expect("valid switching protocols response")
}

/// Pump frames between one client and the multiplexer until either side closes
async fn run_session<S>(ws: WebSocketStream<S>, addr: SocketAddr, context: Arc<ServerContext>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let client_id: ClientId = context.mux.connect_client(outbound_tx);
    let mut shutdown_rx = context.shutdown_rx.clone();
    let (mut sink, mut stream) = ws.split();

    debug!(%client_id, addr = %addr, "WebSocket session started");

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                let Some(text) = outbound else { break };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    debug!(%client_id, error = %e, "Failed to send to client");
                    break;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        context.mux.handle_client_message(client_id, &text);
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => context.mux.handle_client_message(client_id, &text),
                        Err(_) => warn!(%client_id, "Ignoring non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(%client_id, error = %e, "WebSocket error");
                        break;
                    }
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    context.mux.disconnect_client(client_id);
    debug!(%client_id, addr = %addr, "WebSocket session ended");
}
