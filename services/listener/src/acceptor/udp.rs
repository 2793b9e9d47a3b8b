//! UDP receive loop. Datagrams are demultiplexed by source address into
//! sessions that live until they time out or the listener shuts down.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracker_protocol::{DeviceRegistry, LocationSink};

use super::{Endpoint, ListenerContext, log_close};
use crate::emitter::EmitterHandle;
use crate::session::{CloseReason, Session, SessionEvent};
use crate::stats::ListenerStats;

const MAX_DATAGRAM: usize = 65_535;
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

struct DatagramPeer {
    session: Session,
    emitter: EmitterHandle,
}

pub(super) async fn run<R, S>(
    socket: UdpSocket,
    endpoint: Arc<Endpoint>,
    ctx: ListenerContext<R, S>,
    cancel: CancellationToken,
) where
    R: DeviceRegistry,
    S: LocationSink,
{
    let mut peers: HashMap<SocketAddr, DatagramPeer> = HashMap::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = sweep.tick() => {
                let now = Instant::now();
                let expired: Vec<SocketAddr> = peers
                    .iter_mut()
                    .filter_map(|(addr, p)| p.session.poll_deadline(now).map(|_| *addr))
                    .collect();
                for addr in expired {
                    if let Some(p) = peers.remove(&addr) {
                        close_peer(p, &endpoint, &ctx.stats);
                    }
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (n, peer) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        // Usually an ICMP error for an earlier reply; the
                        // socket itself stays usable.
                        warn!(endpoint = %endpoint.local_addr, error = %e, "datagram receive failed");
                        continue;
                    }
                };
                let at_capacity = peers.len() >= endpoint.max_sessions;
                let entry = match peers.entry(peer) {
                    Entry::Occupied(o) => o.into_mut(),
                    Entry::Vacant(_) if at_capacity => {
                        ctx.stats.connection_rejected();
                        debug!(
                            endpoint = %endpoint.local_addr,
                            peer = %peer,
                            max_sessions = endpoint.max_sessions,
                            "session limit reached, ignoring datagram"
                        );
                        continue;
                    }
                    Entry::Vacant(v) => {
                        ctx.stats.connection_opened();
                        info!(endpoint = %endpoint.local_addr, peer = %peer, "datagram session opened");
                        v.insert(DatagramPeer {
                            session: endpoint.new_session(peer, &ctx.session, &ctx.stats),
                            emitter: EmitterHandle::spawn(
                                Arc::clone(&ctx.registry),
                                Arc::clone(&ctx.sink),
                                ctx.delivery.clone(),
                                Arc::clone(&ctx.stats),
                                &cancel,
                            ),
                        })
                    }
                };

                let events = entry.session.feed_guarded(&buf[..n], Instant::now());
                for event in events {
                    match event {
                        SessionEvent::Reply(bytes) => {
                            if let Err(e) = socket.send_to(&bytes, peer).await {
                                debug!(peer = %peer, error = %e, "datagram reply failed");
                            }
                        }
                        SessionEvent::Location { identity, position } => {
                            entry.emitter.submit(identity, position);
                        }
                    }
                }
                if entry.session.is_closing()
                    && let Some(p) = peers.remove(&peer)
                {
                    close_peer(p, &endpoint, &ctx.stats);
                }
            }
        }
    }

    let mut emitters: Vec<JoinHandle<()>> = Vec::with_capacity(peers.len());
    for (_, mut p) in peers.drain() {
        p.session.close(CloseReason::Shutdown);
        emitters.push(close_peer(p, &endpoint, &ctx.stats));
    }
    for task in emitters {
        if let Err(e) = task.await {
            warn!(endpoint = %endpoint.local_addr, error = %e, "emitter task failed during shutdown");
        }
    }
    debug!(endpoint = %endpoint.local_addr, "udp endpoint stopped");
}

fn close_peer(mut peer: DatagramPeer, endpoint: &Endpoint, stats: &ListenerStats) -> JoinHandle<()> {
    let drain = peer.session.close_reason().is_some_and(CloseReason::drains);
    let task = peer.emitter.close(drain);
    peer.session.finish();
    stats.connection_closed();
    log_close(endpoint, &peer.session);
    task
}
