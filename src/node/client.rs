//! Node side of the command stream.
//!
//! [`NodeClient`] keeps one command stream open to the server:
//!
//! ```text
//!   Disconnected ──connect──▶ Connecting ──ok──▶ Connected
//!        ▲                       │                  │
//!        └──────── failure ──────┘◀── stream loss ──┘
//!                     (reconnect after a fixed delay)
//! ```
//!
//! Each connection gets its own outbound response queue. Disconnecting
//! replaces the queue, so responses produced for a dead connection are never
//! written to its successor. The reconnect timer is reset rather than stacked:
//! any number of reconnect requests within one delay produce one attempt.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::proto::{BoxSink, BoxStream, CmdRequest, CmdResponse, CmdType};

const SINK_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Opens a command stream to the server, identifying this node.
pub trait Connector: Send + Sync + 'static {
    fn open(
        &self,
    ) -> impl Future<Output = Result<(BoxSink<CmdResponse>, BoxStream<CmdRequest>), TransportError>> + Send;
}

/// Executes one command type. Responses go through the [`Responder`].
pub trait CommandHandler: Send + Sync + 'static {
    fn handle(&self, request: CmdRequest, responder: Responder) -> BoxFuture<'static, ()>;
}

/// Command type → handler.
#[derive(Clone, Default)]
pub struct HandlerSet {
    handlers: HashMap<CmdType, Arc<dyn CommandHandler>>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, cmd_type: CmdType, handler: impl CommandHandler) -> Self {
        self.handlers.insert(cmd_type, Arc::new(handler));
        self
    }

    pub fn get(&self, cmd_type: CmdType) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(&cmd_type).cloned()
    }
}

/// Queues responses for the connection that was live when the command arrived.
#[derive(Clone)]
pub struct Responder {
    node_id: String,
    outbound: mpsc::Sender<CmdResponse>,
    shutdown: CancellationToken,
}

impl Responder {
    /// Queue a response. Returns `false` if the connection it belongs to is
    /// gone or the client is shutting down; a full queue never blocks shutdown.
    pub async fn send(&self, mut response: CmdResponse) -> bool {
        response.node_id.clone_from(&self.node_id);
        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => false,
            sent = self.outbound.send(response) => sent.is_ok(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy)]
pub struct ClientSettings {
    pub reconnect_delay: Duration,
    pub queue_capacity: usize,
    /// Keepalive period while no response is being written.
    pub heartbeat_interval: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(2),
            queue_capacity: 10,
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

struct Machine {
    state: ConnState,
    /// Bumped on every successful connect; stale loops compare against it.
    generation: u64,
    outbound: mpsc::Sender<CmdResponse>,
    /// Receiving end of `outbound`, waiting for the next connection.
    pending: Option<mpsc::Receiver<CmdResponse>>,
    session: Option<CancellationToken>,
    reconnect: Option<JoinHandle<()>>,
    timer_seq: u64,
}

struct Inner<C> {
    node_id: String,
    connector: C,
    handlers: HandlerSet,
    settings: ClientSettings,
    shutdown: CancellationToken,
    machine: Mutex<Machine>,
    attempts: AtomicU64,
}

pub struct NodeClient<C> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for NodeClient<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> NodeClient<C> {
    pub fn new(node_id: &str, connector: C, handlers: HandlerSet, settings: ClientSettings) -> Self {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                node_id: node_id.to_string(),
                connector,
                handlers,
                settings,
                shutdown: CancellationToken::new(),
                machine: Mutex::new(Machine {
                    state: ConnState::Disconnected,
                    generation: 0,
                    outbound: tx,
                    pending: Some(rx),
                    session: None,
                    reconnect: None,
                    timer_seq: 0,
                }),
                attempts: AtomicU64::new(0),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Machine> {
        self.inner.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn state(&self) -> ConnState {
        self.lock().state
    }

    /// Number of connection attempts made so far.
    pub fn connect_attempts(&self) -> u64 {
        self.inner.attempts.load(Ordering::Relaxed)
    }

    /// Connect in the background.
    pub fn start(&self) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move { client.connect().await })
    }

    /// Open a stream unless one is open or opening. A failed attempt
    /// schedules a reconnect.
    pub async fn connect(&self) {
        {
            let mut machine = self.lock();
            if machine.state != ConnState::Disconnected || self.inner.shutdown.is_cancelled() {
                return;
            }
            machine.state = ConnState::Connecting;
        }
        let attempt = self.inner.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(node_id = %self.inner.node_id, attempt, "Connecting command stream");

        let opened = tokio::select! {
            biased;
            () = self.inner.shutdown.cancelled() => None,
            opened = self.inner.connector.open() => Some(opened),
        };
        let (sink, stream) = match opened {
            Some(Ok(pair)) => pair,
            Some(Err(e)) => {
                warn!(node_id = %self.inner.node_id, attempt, error = %e, "Command stream connect failed");
                self.lock().state = ConnState::Disconnected;
                self.schedule_reconnect(self.inner.settings.reconnect_delay);
                return;
            }
            None => {
                self.lock().state = ConnState::Disconnected;
                return;
            }
        };

        let (generation, outbound, session) = {
            let mut machine = self.lock();
            machine.generation += 1;
            machine.state = ConnState::Connected;
            let outbound = if let Some(rx) = machine.pending.take() {
                rx
            } else {
                let (tx, rx) = mpsc::channel(self.inner.settings.queue_capacity.max(1));
                machine.outbound = tx;
                rx
            };
            let session = self.inner.shutdown.child_token();
            machine.session = Some(session.clone());
            (machine.generation, outbound, session)
        };
        info!(node_id = %self.inner.node_id, generation, "Command stream connected");

        tokio::spawn(self.clone().send_loop(generation, sink, outbound, session.clone()));
        tokio::spawn(self.clone().receive_loop(generation, stream, session));
    }

    /// Tear down the live connection, if any. Idempotent.
    pub fn disconnect(&self) -> bool {
        self.disconnect_generation(None)
    }

    fn disconnect_generation(&self, generation: Option<u64>) -> bool {
        let mut machine = self.lock();
        if machine.state != ConnState::Connected || generation.is_some_and(|g| g != machine.generation) {
            return false;
        }
        if let Some(session) = machine.session.take() {
            session.cancel();
        }
        if let Some(timer) = machine.reconnect.take() {
            timer.abort();
        }
        let (tx, rx) = mpsc::channel(self.inner.settings.queue_capacity.max(1));
        machine.outbound = tx;
        machine.pending = Some(rx);
        machine.state = ConnState::Disconnected;
        info!(node_id = %self.inner.node_id, generation = machine.generation, "Command stream disconnected");
        true
    }

    /// Attempt to connect after `delay`, replacing any pending attempt.
    pub fn schedule_reconnect(&self, delay: Duration) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        let mut machine = self.lock();
        if let Some(timer) = machine.reconnect.take() {
            timer.abort();
        }
        machine.timer_seq += 1;
        let seq = machine.timer_seq;

        let client = self.clone();
        machine.reconnect = Some(tokio::spawn(async move {
            tokio::select! {
                biased;
                () = client.inner.shutdown.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            {
                let mut machine = client.lock();
                if machine.timer_seq != seq {
                    return;
                }
                machine.reconnect = None;
            }
            client.connect().await;
        }));
        debug!(node_id = %self.inner.node_id, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
    }

    /// Stop for good: no further reconnects, live stream closed.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.disconnect();
        if let Some(timer) = self.lock().reconnect.take() {
            timer.abort();
        }
    }

    fn fail(&self, generation: u64) {
        if self.disconnect_generation(Some(generation)) {
            self.schedule_reconnect(self.inner.settings.reconnect_delay);
        }
    }

    fn responder(&self) -> Responder {
        Responder {
            node_id: self.inner.node_id.clone(),
            outbound: self.lock().outbound.clone(),
            shutdown: self.inner.shutdown.clone(),
        }
    }

    fn handle_command(&self, request: CmdRequest) {
        let Some(cmd_type) = request.cmd_type() else {
            warn!(task_id = %request.task_id, "Unknown command type, ignoring");
            return;
        };
        let Some(handler) = self.inner.handlers.get(cmd_type) else {
            warn!(task_id = %request.task_id, cmd = %cmd_type, "No handler for command, ignoring");
            return;
        };
        info!(task_id = %request.task_id, cmd = %cmd_type, "Command received");
        tokio::spawn(handler.handle(request, self.responder()));
    }

    async fn send_loop(
        self,
        generation: u64,
        mut sink: BoxSink<CmdResponse>,
        mut outbound: mpsc::Receiver<CmdResponse>,
        session: CancellationToken,
    ) {
        let period = self.inner.settings.heartbeat_interval.max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let response = tokio::select! {
                biased;
                () = session.cancelled() => break,
                next = outbound.recv() => match next {
                    Some(response) => {
                        heartbeat.reset();
                        response
                    }
                    None => break,
                },
                _ = heartbeat.tick() => CmdResponse::heartbeat(&self.inner.node_id),
            };
            let task_id = response.task_id.clone();
            let sent = tokio::select! {
                biased;
                () = session.cancelled() => break,
                sent = sink.send(response) => sent,
            };
            if let Err(e) = sent {
                warn!(node_id = %self.inner.node_id, task_id, error = %e, "Response write failed");
                self.fail(generation);
                break;
            }
        }
        let _ = tokio::time::timeout(SINK_CLOSE_TIMEOUT, sink.close()).await;
    }

    async fn receive_loop(self, generation: u64, mut stream: BoxStream<CmdRequest>, session: CancellationToken) {
        loop {
            let item = tokio::select! {
                biased;
                () = session.cancelled() => return,
                item = stream.next() => item,
            };
            match item {
                Some(Ok(request)) => self.handle_command(request),
                Some(Err(e)) => {
                    warn!(node_id = %self.inner.node_id, error = %e, "Command stream read failed");
                    break;
                }
                None => {
                    info!(node_id = %self.inner.node_id, "Server closed command stream");
                    break;
                }
            }
        }
        self.fail(generation);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures::channel::mpsc as fmpsc;

    use super::*;
    use crate::proto::{NetworkFlushIn, NetworkFlushOut, RequestPayload, ResponsePayload};

    pub(crate) struct ServerEnd {
        pub requests: fmpsc::UnboundedSender<Result<CmdRequest, TransportError>>,
        pub responses: fmpsc::UnboundedReceiver<CmdResponse>,
    }

    #[derive(Clone, Default)]
    struct FakeConnector {
        opens: Arc<AtomicUsize>,
        refuse: bool,
        ends: Arc<Mutex<Vec<ServerEnd>>>,
    }

    impl FakeConnector {
        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }

        fn take_end(&self, index: usize) -> ServerEnd {
            self.ends.lock().unwrap().remove(index)
        }
    }

    impl Connector for FakeConnector {
        async fn open(&self) -> Result<(BoxSink<CmdResponse>, BoxStream<CmdRequest>), TransportError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.refuse {
                return Err(TransportError::Handshake("connection refused".into()));
            }
            let (req_tx, req_rx) = fmpsc::unbounded();
            let (resp_tx, resp_rx) = fmpsc::unbounded();
            self.ends.lock().unwrap().push(ServerEnd {
                requests: req_tx,
                responses: resp_rx,
            });
            Ok((
                Box::pin(resp_tx.sink_map_err(|_| TransportError::Closed)),
                Box::pin(req_rx),
            ))
        }
    }

    /// Answers every flush with an empty interface list.
    pub(crate) struct EmptyFlush;

    impl CommandHandler for EmptyFlush {
        fn handle(&self, request: CmdRequest, responder: Responder) -> BoxFuture<'static, ()> {
            Box::pin(async move {
                let payload = ResponsePayload::NetworkFlush(NetworkFlushOut::default());
                responder.send(CmdResponse::new(&request, payload)).await;
            })
        }
    }

    fn settings(reconnect_ms: u64) -> ClientSettings {
        ClientSettings {
            reconnect_delay: Duration::from_millis(reconnect_ms),
            queue_capacity: 4,
            heartbeat_interval: Duration::from_secs(60),
        }
    }

    fn flush_response(task: &str) -> CmdResponse {
        CmdResponse {
            task_id: task.into(),
            node_id: String::new(),
            payload: ResponsePayload::NetworkFlush(NetworkFlushOut::default()),
        }
    }

    #[tokio::test]
    async fn test_reconnect_requests_coalesce() {
        let connector = FakeConnector::default();
        let client = NodeClient::new("node-a", connector.clone(), HandlerSet::new(), settings(10_000));

        client.schedule_reconnect(Duration::from_millis(30));
        client.schedule_reconnect(Duration::from_millis(30));
        client.schedule_reconnect(Duration::from_millis(30));
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(connector.opens(), 1);
        assert_eq!(client.state(), ConnState::Connected);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let connector = FakeConnector::default();
        let client = NodeClient::new("node-a", connector.clone(), HandlerSet::new(), settings(10_000));
        tokio::join!(client.connect(), client.connect());
        client.connect().await;
        assert_eq!(connector.opens(), 1);
        assert_eq!(client.state(), ConnState::Connected);
    }

    #[tokio::test]
    async fn test_failed_connect_retries_after_delay() {
        let connector = FakeConnector {
            refuse: true,
            ..FakeConnector::default()
        };
        let client = NodeClient::new("node-a", connector.clone(), HandlerSet::new(), settings(50));
        client.connect().await;
        assert_eq!(client.state(), ConnState::Disconnected);
        tokio::time::sleep(Duration::from_millis(130)).await;
        assert!(connector.opens() >= 2);

        client.shutdown();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let settled = connector.opens();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(connector.opens(), settled, "no attempts after shutdown");
    }

    #[tokio::test]
    async fn test_stream_loss_reconnects_once() {
        let connector = FakeConnector::default();
        let client = NodeClient::new("node-a", connector.clone(), HandlerSet::new(), settings(50));
        client.connect().await;

        let end = connector.take_end(0);
        drop(end.requests);
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(connector.opens(), 2);
        assert_eq!(client.state(), ConnState::Connected);
        assert_eq!(client.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_stale_responses_not_delivered_after_reconnect() {
        let connector = FakeConnector::default();
        let client = NodeClient::new("node-a", connector.clone(), HandlerSet::new(), settings(10_000));
        client.connect().await;

        let stale = client.responder();
        assert!(client.disconnect());
        assert!(!client.disconnect());
        let _ = stale.send(flush_response("old-task")).await;

        client.connect().await;
        let mut second = connector.take_end(1);
        assert!(client.responder().send(flush_response("new-task")).await);

        let first_seen = second.responses.next().await.unwrap();
        assert_eq!(first_seen.task_id, "new-task");
        assert_eq!(first_seen.node_id, "node-a");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(second.responses.try_next().is_err(), "nothing else pending");
    }

    #[tokio::test]
    async fn test_idle_stream_sends_heartbeats() {
        let connector = FakeConnector::default();
        let settings = ClientSettings {
            heartbeat_interval: Duration::from_millis(20),
            ..settings(10_000)
        };
        let client = NodeClient::new("node-a", connector.clone(), HandlerSet::new(), settings);
        client.connect().await;
        let mut end = connector.take_end(0);

        let beat = tokio::time::timeout(Duration::from_secs(1), end.responses.next())
            .await
            .unwrap()
            .unwrap();
        assert!(beat.is_heartbeat());
        assert_eq!(beat.node_id, "node-a");
        assert!(beat.task_id.is_empty());
        client.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_command_is_ignored() {
        let connector = FakeConnector::default();
        let handlers = HandlerSet::new().with(CmdType::NetworkFlush, EmptyFlush);
        let client = NodeClient::new("node-a", connector.clone(), handlers, settings(10_000));
        client.connect().await;
        let mut end = connector.take_end(0);

        let mut unknown = CmdRequest::new(RequestPayload::Unknown);
        unknown.task_id = "reboot-1".into();
        let mut flush = CmdRequest::new(RequestPayload::NetworkFlush(NetworkFlushIn::default()));
        flush.task_id = "network_flush-2".into();
        end.requests.unbounded_send(Ok(unknown)).unwrap();
        end.requests.unbounded_send(Ok(flush)).unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(2), end.responses.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.task_id, "network_flush-2");
        assert_eq!(client.state(), ConnState::Connected);
    }
}
