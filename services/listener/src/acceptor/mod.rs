//! Connection acceptor: binds every configured endpoint and runs one accept
//! (TCP) or receive (UDP) loop per endpoint until shutdown.
//!
//! All loops share a [`ListenerContext`]. Each endpoint gets its own
//! [`DecoderSet`] built from its `protocols` list.

mod tcp;
mod udp;

use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracker_protocol::{DecoderSet, DeviceRegistry, LocationSink, ProtocolFamily};

use crate::config::{DeliveryConfig, EndpointConfig, SessionConfig, Transport};
use crate::session::{CloseReason, Session};
use crate::stats::ListenerStats;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum AcceptorError {
    #[error("failed to bind {transport} {address}: {source}")]
    Bind {
        transport: Transport,
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("endpoint {address} has no protocols")]
    NoProtocols { address: SocketAddr },
}

// ---------------------------------------------------------------------------
// Shared context
// ---------------------------------------------------------------------------

/// Collaborators and policy shared by every session.
#[derive(Debug)]
pub struct ListenerContext<R, S> {
    pub registry: Arc<R>,
    pub sink: Arc<S>,
    pub session: SessionConfig,
    pub delivery: DeliveryConfig,
    pub stats: Arc<ListenerStats>,
}

impl<R, S> Clone for ListenerContext<R, S> {
    fn clone(&self) -> Self {
        ListenerContext {
            registry: Arc::clone(&self.registry),
            sink: Arc::clone(&self.sink),
            session: self.session.clone(),
            delivery: self.delivery.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<R: DeviceRegistry, S: LocationSink> ListenerContext<R, S> {
    pub fn new(registry: R, sink: S, session: SessionConfig, delivery: DeliveryConfig) -> Self {
        ListenerContext {
            registry: Arc::new(registry),
            sink: Arc::new(sink),
            session,
            delivery,
            stats: Arc::new(ListenerStats::new()),
        }
    }
}

/// Per-endpoint state shared by that endpoint's sessions.
#[derive(Debug)]
struct Endpoint {
    local_addr: SocketAddr,
    decoders: Arc<DecoderSet>,
    max_sessions: usize,
}

impl Endpoint {
    fn new_session(&self, peer: SocketAddr, session: &SessionConfig, stats: &Arc<ListenerStats>) -> Session {
        Session::new(
            peer,
            Arc::clone(&self.decoders),
            session.clone(),
            Arc::clone(stats),
            tokio::time::Instant::now(),
        )
    }
}

/// Address an endpoint ended up bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundEndpoint {
    pub transport: Transport,
    pub local_addr: SocketAddr,
    pub protocols: Vec<ProtocolFamily>,
}

// ---------------------------------------------------------------------------
// Acceptor
// ---------------------------------------------------------------------------

pub struct Acceptor<R, S> {
    ctx: ListenerContext<R, S>,
    cancel: CancellationToken,
}

impl<R: DeviceRegistry, S: LocationSink> Acceptor<R, S> {
    pub fn new(ctx: ListenerContext<R, S>) -> Self {
        Acceptor {
            ctx,
            cancel: CancellationToken::new(),
        }
    }

    /// Bind every endpoint, then start their loops. Nothing is started if
    /// any endpoint fails to bind.
    pub async fn bind(self, endpoints: &[EndpointConfig]) -> Result<ListenerHandle, AcceptorError> {
        enum Socket {
            Tcp(tokio::net::TcpListener),
            Udp(tokio::net::UdpSocket),
        }

        let mut bound = Vec::with_capacity(endpoints.len());
        for config in endpoints {
            let address = SocketAddr::new(config.address, config.port);
            let decoders = DecoderSet::for_protocols(&config.protocols);
            if decoders.is_empty() {
                return Err(AcceptorError::NoProtocols { address });
            }
            let bind_err = |source| AcceptorError::Bind {
                transport: config.transport,
                address,
                source,
            };
            let (socket, local_addr) = match config.transport {
                Transport::Tcp => {
                    let listener = tokio::net::TcpListener::bind(address).await.map_err(bind_err)?;
                    let local = listener.local_addr().map_err(bind_err)?;
                    (Socket::Tcp(listener), local)
                }
                Transport::Udp => {
                    let socket = tokio::net::UdpSocket::bind(address).await.map_err(bind_err)?;
                    let local = socket.local_addr().map_err(bind_err)?;
                    (Socket::Udp(socket), local)
                }
            };
            info!(
                transport = %config.transport,
                address = %local_addr,
                protocols = ?decoders.families(),
                max_sessions = config.max_sessions,
                "endpoint listening"
            );
            let endpoint = Arc::new(Endpoint {
                local_addr,
                decoders: Arc::new(decoders),
                max_sessions: config.max_sessions,
            });
            bound.push((socket, endpoint, config.transport, config.protocols.clone()));
        }

        let mut tasks = Vec::with_capacity(bound.len());
        let mut local_addrs = Vec::with_capacity(bound.len());
        for (socket, endpoint, transport, protocols) in bound {
            local_addrs.push(BoundEndpoint {
                transport,
                local_addr: endpoint.local_addr,
                protocols,
            });
            let ctx = self.ctx.clone();
            let cancel = self.cancel.clone();
            tasks.push(match socket {
                Socket::Tcp(listener) => tokio::spawn(tcp::run(listener, endpoint, ctx, cancel)),
                Socket::Udp(socket) => tokio::spawn(udp::run(socket, endpoint, ctx, cancel)),
            });
        }

        Ok(ListenerHandle {
            cancel: self.cancel,
            tasks,
            local_addrs,
            stats: self.ctx.stats,
        })
    }
}

// ---------------------------------------------------------------------------
// ListenerHandle
// ---------------------------------------------------------------------------

/// Running endpoints. Dropping the handle leaves them running; call
/// [`ListenerHandle::shutdown`] to stop.
#[derive(Debug)]
pub struct ListenerHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    local_addrs: Vec<BoundEndpoint>,
    stats: Arc<ListenerStats>,
}

impl ListenerHandle {
    pub fn local_addrs(&self) -> &[BoundEndpoint] {
        &self.local_addrs
    }

    pub fn stats(&self) -> &Arc<ListenerStats> {
        &self.stats
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel every loop and session, then wait for them to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "endpoint task failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn log_close(endpoint: &Endpoint, session: &Session) {
    let reason = session.close_reason().cloned().unwrap_or(CloseReason::Shutdown);
    let device = session
        .identity()
        .map(ToString::to_string)
        .unwrap_or_else(|| "-".to_owned());
    match reason {
        CloseReason::Eof
        | CloseReason::IdleTimeout
        | CloseReason::Shutdown
        | CloseReason::IdentificationTimeout => info!(
            endpoint = %endpoint.local_addr,
            peer = %session.peer(),
            device = %device,
            reason = %reason,
            "session closed"
        ),
        _ => warn!(
            endpoint = %endpoint.local_addr,
            peer = %session.peer(),
            device = %device,
            reason = %reason,
            "session closed"
        ),
    }
}
