//! Decoy port listeners on the node side.
//!
//! Each listener accepts attacker connections on a local decoy address and
//! forwards every connection through its own tunnel stream to a target
//! service. Listeners are grouped by decoy IP so an identity can be retired
//! in one call, taking its live tunnels down with it.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::frame::TunnelFrame;
use super::relay;
use crate::error::TransportError;
use crate::proto::{BoxSink, BoxStream};

/// Opens a fresh tunnel stream to the acceptor.
pub trait TunnelOpener: Send + Sync + 'static {
    fn open_tunnel(
        &self,
    ) -> impl Future<Output = Result<(BoxSink<TunnelFrame>, BoxStream<TunnelFrame>), TransportError>> + Send;
}

struct DecoyListener {
    local: SocketAddr,
    target: String,
    cancel: CancellationToken,
}

#[derive(Clone, Default)]
pub struct TunnelStore {
    listeners: Arc<Mutex<HashMap<IpAddr, Vec<DecoyListener>>>>,
}

impl TunnelStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<IpAddr, Vec<DecoyListener>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Listen on `local` and forward each accepted connection to `target`.
    /// Returns the bound address.
    pub async fn open<O: TunnelOpener>(
        &self,
        local: &str,
        target: &str,
        opener: Arc<O>,
        parent: &CancellationToken,
    ) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind(local).await?;
        let bound = listener.local_addr()?;
        let cancel = parent.child_token();

        self.lock().entry(bound.ip()).or_default().push(DecoyListener {
            local: bound,
            target: target.to_string(),
            cancel: cancel.clone(),
        });

        let span = tracing::info_span!("decoy_port", local = %bound, target = %target);
        tokio::spawn(accept_loop(listener, target.to_string(), opener, cancel).instrument(span));
        info!(local = %bound, target, "Decoy port listening");
        Ok(bound)
    }

    /// Stop every listener bound to `ip` and tear down its tunnels.
    pub fn close_ip(&self, ip: IpAddr) -> usize {
        let removed = self.lock().remove(&ip).unwrap_or_default();
        for listener in &removed {
            listener.cancel.cancel();
        }
        if !removed.is_empty() {
            info!(ip = %ip, listeners = removed.len(), "Decoy identity retired");
        }
        removed.len()
    }

    pub fn close_all(&self) -> usize {
        let all: Vec<DecoyListener> = self.lock().drain().flat_map(|(_, v)| v).collect();
        for listener in &all {
            listener.cancel.cancel();
        }
        all.len()
    }

    /// `(local, target)` of every open listener.
    pub fn list(&self) -> Vec<(SocketAddr, String)> {
        self.lock()
            .values()
            .flatten()
            .map(|l| (l.local, l.target.clone()))
            .collect()
    }
}

async fn accept_loop<O: TunnelOpener>(
    listener: TcpListener,
    target: String,
    opener: Arc<O>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((conn, peer)) => {
                debug!(peer = %peer, "Decoy connection accepted");
                let task = forward(conn, Arc::clone(&opener), target.clone(), cancel.child_token());
                tokio::spawn(task.instrument(tracing::info_span!("tunnel", peer = %peer)));
            }
            Err(e) => {
                // EMFILE and friends are transient; back off instead of spinning.
                warn!(error = %e, "Decoy accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    debug!("Decoy listener stopped");
}

async fn forward<O: TunnelOpener>(conn: TcpStream, opener: Arc<O>, target: String, cancel: CancellationToken) {
    let opened = tokio::select! {
        biased;
        () = cancel.cancelled() => return,
        opened = opener.open_tunnel() => opened,
    };
    let (sink, stream) = match opened {
        Ok(pair) => pair,
        Err(e) => {
            warn!(target, error = %e, "Cannot open tunnel stream");
            return;
        }
    };
    if let Err(e) = relay::initiate(conn, sink, stream, &target, cancel).await {
        debug!(target, error = %e, "Tunnel ended with error");
    }
}
