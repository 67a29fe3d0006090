//! Byte relay between a TCP connection and a framed tunnel stream.
//!
//! The two directions run concurrently and share one cancellation token:
//!
//! - **uplink** reads the local socket in `CHUNK_SIZE` pieces and writes one
//!   frame per read. Local EOF closes the stream's send side and leaves the
//!   downlink running.
//! - **downlink** writes every received chunk to the socket. Stream EOF, a
//!   stream error or a socket write error cancels the whole tunnel.
//!
//! The socket halves are owned by the two directions and dropped when both
//! have returned, so the connection is closed exactly once.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::frame::TunnelFrame;
use crate::error::TunnelError;
use crate::proto::{BoxSink, BoxStream};

/// Read size for the local socket.
pub const CHUNK_SIZE: usize = 4096;

/// Byte counts of a finished tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Local socket → stream.
    pub sent: u64,
    /// Stream → local socket.
    pub received: u64,
}

/// Initiator role: announce `address` to the peer, then relay `conn`.
pub async fn initiate(
    conn: TcpStream,
    mut sink: BoxSink<TunnelFrame>,
    stream: BoxStream<TunnelFrame>,
    address: &str,
    cancel: CancellationToken,
) -> Result<RelayStats, TunnelError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(TunnelError::Cancelled),
        sent = sink.send(TunnelFrame::open(address)) => sent?,
    }
    debug!(address, "Tunnel opened");
    Ok(relay(conn, sink, stream, address, cancel).await)
}

/// Acceptor role: read the target address from the first frame, dial it
/// (abandoning the dial if the tunnel is cancelled), then relay.
///
/// A dial failure ends the tunnel; it is never retried.
pub async fn accept(
    mut sink: BoxSink<TunnelFrame>,
    mut stream: BoxStream<TunnelFrame>,
    cancel: CancellationToken,
) -> Result<RelayStats, TunnelError> {
    let first = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(TunnelError::Cancelled),
        first = stream.next() => first,
    };
    let first = match first {
        Some(frame) => frame?,
        None => return Err(TunnelError::MissingAddress),
    };
    if first.address.is_empty() {
        let _ = sink.close().await;
        return Err(TunnelError::MissingAddress);
    }
    let address = first.address;

    let dialed = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(TunnelError::Cancelled),
        dialed = TcpStream::connect(address.as_str()) => dialed,
    };
    let mut conn = match dialed {
        Ok(conn) => conn,
        Err(source) => {
            warn!(address, error = %source, "Tunnel dial failed");
            let _ = sink.close().await;
            return Err(TunnelError::Dial { address, source });
        }
    };
    debug!(address, "Tunnel target connected");

    if !first.chunk.is_empty() {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(TunnelError::Cancelled),
            written = conn.write_all(&first.chunk) => written?,
        }
    }
    let mut stats = relay(conn, sink, stream, &address, cancel).await;
    stats.received += first.chunk.len() as u64;
    Ok(stats)
}

/// Run both directions until the tunnel is torn down.
pub async fn relay(
    conn: TcpStream,
    sink: BoxSink<TunnelFrame>,
    stream: BoxStream<TunnelFrame>,
    address: &str,
    cancel: CancellationToken,
) -> RelayStats {
    let _ = conn.set_nodelay(true);
    let (reader, writer) = conn.into_split();
    let (sent, received) = tokio::join!(
        uplink(reader, sink, address, cancel.clone()),
        downlink(writer, stream, address, cancel.clone()),
    );
    let stats = RelayStats { sent, received };
    info!(address, sent = stats.sent, received = stats.received, "Tunnel closed");
    stats
}

async fn uplink(mut reader: OwnedReadHalf, mut sink: BoxSink<TunnelFrame>, address: &str, cancel: CancellationToken) -> u64 {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent = 0u64;
    loop {
        let n = tokio::select! {
            biased;
            () = cancel.cancelled() => return sent,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(address, error = %e, "Tunnel local read failed");
                    break;
                }
            },
        };

        let written = tokio::select! {
            biased;
            () = cancel.cancelled() => return sent,
            written = sink.send(TunnelFrame::data(&buf[..n])) => written,
        };
        if let Err(e) = written {
            debug!(address, error = %e, "Tunnel stream write failed");
            cancel.cancel();
            return sent;
        }
        sent += n as u64;
    }

    // Local side finished sending: half-close the stream, keep receiving.
    tokio::select! {
        () = cancel.cancelled() => {},
        _ = sink.close() => {},
    }
    sent
}

async fn downlink(mut writer: OwnedWriteHalf, mut stream: BoxStream<TunnelFrame>, address: &str, cancel: CancellationToken) -> u64 {
    let mut received = 0u64;
    loop {
        let frame = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            frame = stream.next() => frame,
        };
        let chunk = match frame {
            Some(Ok(frame)) => frame.chunk,
            Some(Err(e)) => {
                debug!(address, error = %e, "Tunnel stream read failed");
                break;
            }
            None => break,
        };
        if chunk.is_empty() {
            continue;
        }

        let written = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            written = writer.write_all(&chunk) => written,
        };
        if let Err(e) = written {
            debug!(address, error = %e, "Tunnel local write failed");
            break;
        }
        received += chunk.len() as u64;
    }
    cancel.cancel();
    received
}
