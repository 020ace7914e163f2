//! Modbus TCP listener and per-connection sessions
//!
//! Each accepted connection runs in its own task with its own idle timeout.
//! Sessions report served requests and closures back to the listener so that
//! `server_loop` can surface them as [`LoopStatus`] values.

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::stats::ServerStats;
use super::{AddressValidator, LoopStatus};
use crate::codec::TcpCodec;
use crate::dispatcher::RequestDispatcher;
use crate::error::{Result, SlaveError};
use crate::registry::DataTableRegistry;
use crate::types::Address;

/// Session to listener notifications
#[derive(Debug)]
enum SessionEvent {
    Served {
        slave: Address,
        function_code: u8,
        responded: bool,
    },
    Closed(SocketAddr),
}

/// Pending session events before new ones are dropped
const EVENT_BACKLOG: usize = 256;

/// Everything a connection task needs
struct SessionContext {
    registry: Arc<DataTableRegistry>,
    stats: Arc<ServerStats>,
    events: mpsc::Sender<SessionEvent>,
    idle_timeout: Duration,
    token: CancellationToken,
}

/// Decrements the active connection count when a session ends
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

pub(crate) struct TcpSession {
    listener: TcpListener,
    validator: Option<AddressValidator>,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: mpsc::Receiver<SessionEvent>,
    connections: JoinSet<()>,
    active: Arc<AtomicUsize>,
    max_connections: usize,
    idle_timeout: Duration,
    token: CancellationToken,
}

impl TcpSession {
    pub(crate) fn new(
        listener: TcpListener,
        validator: Option<AddressValidator>,
        max_connections: usize,
        idle_timeout: Duration,
        token: CancellationToken,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BACKLOG);
        Self {
            listener,
            validator,
            events_tx,
            events_rx,
            connections: JoinSet::new(),
            active: Arc::new(AtomicUsize::new(0)),
            max_connections,
            idle_timeout,
            token,
        }
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Wait for the next accept, session event or master timeout
    pub(crate) async fn step(
        &mut self,
        registry: &Arc<DataTableRegistry>,
        stats: &Arc<ServerStats>,
        master_timeout: Duration,
    ) -> Result<LoopStatus> {
        let deadline = sleep(master_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = self.token.cancelled() => return Ok(LoopStatus::Shutdown),
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted.map_err(|e| {
                        warn!("TCP accept failed: {}", e);
                        SlaveError::connection(format!("Accept failed: {e}"))
                    })?;
                    return Ok(self.admit(stream, peer, registry, stats));
                },
                Some(event) = self.events_rx.recv() => {
                    return Ok(match event {
                        SessionEvent::Served { slave, function_code, responded } => {
                            LoopStatus::Served { slave, function_code, responded }
                        },
                        SessionEvent::Closed(peer) => LoopStatus::Closed(peer),
                    });
                },
                // Reap finished connection tasks
                Some(_) = self.connections.join_next(), if !self.connections.is_empty() => {},
                _ = &mut deadline => return Ok(LoopStatus::Timeout),
            }
        }
    }

    fn admit(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        registry: &Arc<DataTableRegistry>,
        stats: &Arc<ServerStats>,
    ) -> LoopStatus {
        if let Some(validator) = &self.validator {
            if !validator(&peer) {
                info!("Connection from {} rejected by address validation", peer);
                stats.record_rejected();
                return LoopStatus::Rejected(peer);
            }
        }

        if self.active.load(Ordering::Relaxed) >= self.max_connections {
            warn!(
                "Connection from {} rejected, limit of {} reached",
                peer, self.max_connections
            );
            stats.record_rejected();
            return LoopStatus::Rejected(peer);
        }

        if let Err(e) = stream.set_nodelay(true) {
            debug!("TCP_NODELAY: {}", e);
        }

        self.active.fetch_add(1, Ordering::Relaxed);
        stats.record_accepted();
        info!("Connection accepted from {}", peer);

        let guard = ActiveGuard(Arc::clone(&self.active));
        let ctx = SessionContext {
            registry: Arc::clone(registry),
            stats: Arc::clone(stats),
            events: self.events_tx.clone(),
            idle_timeout: self.idle_timeout,
            token: self.token.child_token(),
        };
        self.connections.spawn(async move {
            let _guard = guard;
            run_connection(stream, peer, ctx).await;
        });

        LoopStatus::Accepted(peer)
    }

    /// Stop accepting, close every connection after its current request
    pub(crate) async fn close(mut self) {
        self.token.cancel();
        while self.connections.join_next().await.is_some() {}
        info!("TCP listener closed");
    }
}

async fn run_connection(stream: TcpStream, peer: SocketAddr, ctx: SessionContext) {
    let mut framed = Framed::new(stream, TcpCodec::new());

    loop {
        let frame = tokio::select! {
            _ = ctx.token.cancelled() => break,
            frame = timeout(ctx.idle_timeout, framed.next()) => frame,
        };

        let request = match frame {
            Ok(Some(Ok(adu))) => adu,
            Ok(Some(Err(e))) => {
                warn!("Closing connection {}: {}", peer, e);
                // Broken framing costs the frame in progress, a socket error does not
                if e.corrupts_stream() {
                    ctx.stats.record_dropped(1);
                }
                break;
            },
            Ok(None) => {
                debug!("Connection {} closed by peer", peer);
                break;
            },
            Err(_) => {
                info!("Connection {} idle for {:?}, closing", peer, ctx.idle_timeout);
                break;
            },
        };

        let slave = request.address();
        if !slave.is_broadcast() && !ctx.registry.contains(slave) {
            debug!("{}: no data table for unit {}, request ignored", peer, slave);
            continue;
        }

        let function_code = request.pdu.function_code();
        let response = RequestDispatcher::handle(slave, &request.pdu, &ctx.registry);
        ctx.stats.record_request(
            slave.is_broadcast(),
            response.as_ref().is_some_and(|pdu| pdu.is_exception()),
        );

        let responded = response.is_some();
        if let Some(pdu) = response {
            if let Err(e) = framed.send(request.reply(pdu)).await {
                warn!("Closing connection {}: send failed: {}", peer, e);
                break;
            }
        }

        // Statuses are informational, a slow caller never stalls the session
        let _ = ctx.events.try_send(SessionEvent::Served {
            slave,
            function_code,
            responded,
        });
    }

    let _ = ctx.events.try_send(SessionEvent::Closed(peer));
}
