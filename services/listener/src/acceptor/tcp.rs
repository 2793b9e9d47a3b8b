//! TCP accept loop and per-connection read task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracker_protocol::{DeviceRegistry, LocationSink};

use super::{Endpoint, ListenerContext, log_close};
use crate::emitter::EmitterHandle;
use crate::session::{CloseReason, SessionEvent};

const READ_CHUNK: usize = 4096;
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub(super) async fn run<R, S>(
    listener: TcpListener,
    endpoint: Arc<Endpoint>,
    ctx: ListenerContext<R, S>,
    cancel: CancellationToken,
) where
    R: DeviceRegistry,
    S: LocationSink,
{
    let slots = Arc::new(Semaphore::new(endpoint.max_sessions));
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let Ok(permit) = Arc::clone(&slots).try_acquire_owned() else {
                        ctx.stats.connection_rejected();
                        warn!(
                            endpoint = %endpoint.local_addr,
                            peer = %peer,
                            max_sessions = endpoint.max_sessions,
                            "session limit reached, rejecting connection"
                        );
                        drop(stream);
                        continue;
                    };
                    ctx.stats.connection_opened();
                    info!(endpoint = %endpoint.local_addr, peer = %peer, "connection accepted");
                    connections.spawn(handle_connection(
                        stream,
                        peer,
                        Arc::clone(&endpoint),
                        ctx.clone(),
                        cancel.child_token(),
                        permit,
                    ));
                }
                Err(e) => {
                    warn!(endpoint = %endpoint.local_addr, error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
        }
        while connections.try_join_next().is_some() {}
    }

    debug!(endpoint = %endpoint.local_addr, open = connections.len(), "tcp endpoint stopping");
    while connections.join_next().await.is_some() {}
}

async fn handle_connection<R, S>(
    mut stream: TcpStream,
    peer: SocketAddr,
    endpoint: Arc<Endpoint>,
    ctx: ListenerContext<R, S>,
    cancel: CancellationToken,
    permit: OwnedSemaphorePermit,
) where
    R: DeviceRegistry,
    S: LocationSink,
{
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
    }
    let mut session = endpoint.new_session(peer, &ctx.session, &ctx.stats);
    let emitter = EmitterHandle::spawn(
        Arc::clone(&ctx.registry),
        Arc::clone(&ctx.sink),
        ctx.delivery.clone(),
        Arc::clone(&ctx.stats),
        &cancel,
    );
    let mut buf = vec![0u8; READ_CHUNK];

    while !session.is_closing() {
        let deadline = session.next_deadline();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => session.close(CloseReason::Shutdown),
            _ = tokio::time::sleep_until(deadline) => {
                session.poll_deadline(Instant::now());
            }
            read = stream.read(&mut buf) => match read {
                Ok(0) => session.close(CloseReason::Eof),
                Ok(n) => {
                    let events = session.feed_guarded(&buf[..n], Instant::now());
                    if let Err(e) = dispatch(&mut stream, &emitter, events).await {
                        session.close(CloseReason::Io(e.to_string()));
                    }
                }
                Err(e) => session.close(CloseReason::Io(e.to_string())),
            },
        }
    }

    drop(stream);
    drop(permit);
    let drain = session.close_reason().is_some_and(CloseReason::drains);
    let emitter_task = emitter.close(drain);
    session.finish();
    ctx.stats.connection_closed();
    log_close(&endpoint, &session);
    if let Err(e) = emitter_task.await {
        warn!(peer = %peer, error = %e, "emitter task failed");
    }
}

/// Act on session events in order: replies are written before later
/// locations are queued.
async fn dispatch(
    stream: &mut TcpStream,
    emitter: &EmitterHandle,
    events: Vec<SessionEvent>,
) -> std::io::Result<()> {
    for event in events {
        match event {
            SessionEvent::Reply(bytes) => {
                tokio::time::timeout(WRITE_TIMEOUT, stream.write_all(&bytes))
                    .await
                    .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "reply write timed out"))??;
            }
            SessionEvent::Location { identity, position } => {
                emitter.submit(identity, position);
            }
        }
    }
    Ok(())
}
