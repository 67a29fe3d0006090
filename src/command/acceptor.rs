//! Server side of a node's command stream.
//!
//! [`serve_command_stream`] runs for the lifetime of one node connection:
//! it registers a fresh channel (closing any channel it supersedes), runs the
//! send and receive loops, and unregisters the channel once both have exited.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::channel::{ChannelSettings, CommandChannel};
use super::queue::PushError;
use super::registry::ConnectionRegistry;
use crate::proto::{BoxSink, BoxStream, CmdRequest, CmdResponse};

const SINK_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Serve one node stream until either side ends it or it is superseded.
pub async fn serve_command_stream(
    registry: &ConnectionRegistry,
    settings: &ChannelSettings,
    node_id: &str,
    sink: BoxSink<CmdRequest>,
    stream: BoxStream<CmdResponse>,
) {
    let (channel, requests) = CommandChannel::open(node_id, settings);

    if let Some(previous) = registry.register(Arc::clone(&channel)) {
        warn!(
            node_id,
            old_conn = previous.conn_id(),
            new_conn = channel.conn_id(),
            "Node reconnected, superseding previous stream"
        );
        previous.close();
    }
    channel.mark_active();
    info!(node_id, conn_id = channel.conn_id(), "Node command stream connected");

    let send = tokio::spawn(send_loop(Arc::clone(&channel), sink, requests));
    let recv = tokio::spawn(receive_loop(Arc::clone(&channel), stream, *settings));
    let _ = tokio::join!(send, recv);

    channel.mark_closed();
    let removed = registry.unregister_channel(&channel);
    info!(
        node_id,
        conn_id = channel.conn_id(),
        superseded = !removed,
        "Node command stream closed"
    );
}

/// Drain the request queue into the stream. A write failure closes the
/// channel; requests are never retried on another connection.
async fn send_loop(
    channel: Arc<CommandChannel>,
    mut sink: BoxSink<CmdRequest>,
    mut requests: mpsc::Receiver<CmdRequest>,
) {
    let stop = channel.stopped();
    loop {
        let request = tokio::select! {
            biased;
            () = stop.cancelled() => break,
            next = requests.recv() => match next {
                Some(request) => request,
                None => break,
            },
        };

        let task_id = request.task_id.clone();
        let written = tokio::select! {
            biased;
            () = stop.cancelled() => break,
            written = sink.send(request) => written,
        };
        match written {
            Ok(()) => debug!(node_id = %channel.node_id(), task_id, "Request written"),
            Err(e) => {
                warn!(node_id = %channel.node_id(), task_id, error = %e, "Write to node failed, closing stream");
                channel.close();
                break;
            }
        }
    }
    let _ = tokio::time::timeout(SINK_CLOSE_TIMEOUT, sink.close()).await;
}

/// Move responses from the stream into the response queue until EOF, a read
/// error, a stop signal, or `heartbeat_timeout` of silence.
async fn receive_loop(channel: Arc<CommandChannel>, mut stream: BoxStream<CmdResponse>, settings: ChannelSettings) {
    let stop = channel.stopped();
    let mut idle_deadline = Instant::now() + settings.heartbeat_timeout;
    loop {
        let item = tokio::select! {
            biased;
            () = stop.cancelled() => break,
            () = tokio::time::sleep_until(idle_deadline) => {
                warn!(
                    node_id = %channel.node_id(),
                    timeout_secs = settings.heartbeat_timeout.as_secs(),
                    "Node silent past heartbeat timeout, closing stream"
                );
                break;
            }
            item = stream.next() => item,
        };
        idle_deadline = Instant::now() + settings.heartbeat_timeout;

        match item {
            Some(Ok(response)) if response.is_heartbeat() => {
                trace!(node_id = %channel.node_id(), "Heartbeat");
            }
            Some(Ok(response)) => {
                let deadline = Instant::now() + settings.response_push_timeout;
                match channel.push_response(response, deadline).await {
                    Ok(()) => {}
                    Err(PushError::Full(r)) => {
                        warn!(node_id = %channel.node_id(), task_id = %r.task_id, "Response queue full, dropping response");
                    }
                    Err(PushError::Unclaimed(r)) => {
                        debug!(node_id = %channel.node_id(), task_id = %r.task_id, "No correlator waiting, dropping response");
                    }
                    Err(PushError::Closed(_)) => break,
                }
            }
            Some(Err(e)) => {
                warn!(node_id = %channel.node_id(), error = %e, "Read from node failed");
                break;
            }
            None => {
                info!(node_id = %channel.node_id(), "Node ended command stream");
                break;
            }
        }
    }
    channel.close();
}

/// In-memory node endpoints for exercising the server side without sockets.
#[cfg(test)]
pub(crate) mod test_support {
    use futures::channel::mpsc as fmpsc;
    use futures::{SinkExt, StreamExt};

    use super::*;
    use crate::error::TransportError;

    pub(crate) struct FakeNode {
        pub requests: fmpsc::UnboundedReceiver<CmdRequest>,
        pub responses: fmpsc::UnboundedSender<Result<CmdResponse, TransportError>>,
        pub served: tokio::task::JoinHandle<()>,
    }

    /// Attach a fake node stream for `node_id` and wait until it is registered.
    pub(crate) async fn attach(registry: &ConnectionRegistry, settings: ChannelSettings, node_id: &str) -> FakeNode {
        let previous = registry.get(node_id).map(|ch| ch.conn_id());
        let (req_tx, req_rx) = fmpsc::unbounded::<CmdRequest>();
        let (resp_tx, resp_rx) = fmpsc::unbounded::<Result<CmdResponse, TransportError>>();
        let sink: BoxSink<CmdRequest> = Box::pin(req_tx.sink_map_err(|_| TransportError::Closed));
        let stream: BoxStream<CmdResponse> = Box::pin(resp_rx);

        let served = {
            let registry = registry.clone();
            let node_id = node_id.to_string();
            tokio::spawn(async move {
                serve_command_stream(&registry, &settings, &node_id, sink, stream).await;
            })
        };

        for _ in 0..200 {
            if registry.get(node_id).is_some_and(|ch| Some(ch.conn_id()) != previous) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        FakeNode {
            requests: req_rx,
            responses: resp_tx,
            served,
        }
    }

    impl FakeNode {
        pub(crate) async fn next_request(&mut self) -> Option<CmdRequest> {
            self.requests.next().await
        }

        pub(crate) async fn reply(&mut self, response: CmdResponse) {
            let _ = self.responses.send(Ok(response)).await;
        }
    }
}
