//! TCP accept loop
//!
//! One [`SessionHandler`] task per accepted connection. At most
//! `max_sessions` are served at once; requests on extra connections wait for a
//! slot up to the admission timeout and are answered *server device busy*
//! after that.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::session::{SessionContext, SessionHandler, SessionSlots};

pub struct GatewayListener {
    listener: TcpListener,
    ctx: SessionContext,
    slots: SessionSlots,
    shutdown: CancellationToken,
    next_id: AtomicU64,
}

impl GatewayListener {
    pub async fn bind(
        addr: &str,
        mut ctx: SessionContext,
        max_sessions: usize,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let slots = SessionSlots::new(max_sessions);
        ctx.slots = Some(slots.clone());
        info!(
            "Gateway listening on {} (max {} sessions)",
            listener.local_addr()?,
            slots.capacity()
        );

        Ok(Self {
            listener,
            ctx,
            slots,
            shutdown,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until shutdown, then wait for every session to finish
    pub async fn run(self) -> Result<()> {
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_session(&mut sessions, stream, peer),
                    Err(e) => {
                        // Transient (EMFILE, ECONNABORTED); keep listening
                        error!("Accept failed: {}", e);
                    },
                },
                Some(done) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = done {
                        error!("Session task panicked: {}", e);
                    }
                },
            }
        }

        info!("Listener stopping, draining {} sessions", sessions.len());
        while let Some(done) = sessions.join_next().await {
            if let Err(e) = done {
                error!("Session task panicked: {}", e);
            }
        }
        info!("All sessions closed");
        Ok(())
    }

    fn spawn_session(&self, sessions: &mut JoinSet<()>, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = stream.set_nodelay(true) {
            debug!("session {}: set_nodelay failed: {}", id, e);
        }

        if self.slots.in_use() >= self.slots.capacity() {
            info!(
                "session {}: {} connected while all {} slots are in use",
                id,
                peer,
                self.slots.capacity()
            );
        } else {
            info!("session {}: connected {}", id, peer);
        }

        let ctx = self.ctx.clone();
        let shutdown = self.shutdown.clone();

        sessions.spawn(async move {
            match SessionHandler::new(id, ctx).run(stream, shutdown).await {
                Ok(()) => info!("session {}: closed {}", id, peer),
                Err(e) => warn!("session {}: closed {} with error: {}", id, peer, e),
            }
        });
    }
}
