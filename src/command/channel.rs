//! Per-node command channel.
//!
//! A [`CommandChannel`] owns the two bounded queues of one live node stream:
//! requests waiting to be written to the node and responses waiting for their
//! correlator. Its lifecycle is `Open → Active → Closing → Closed`, with every
//! transition validated in [`ChannelState::advance`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::queue::{PopError, PushError, ResponseQueue};
use crate::error::CommandError;
use crate::proto::{CmdRequest, CmdResponse};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Registered, loops not yet running.
    Open,
    /// Send and receive loops running.
    Active,
    /// Stop requested; loops draining.
    Closing,
    /// Both loops exited.
    Closed,
}

impl ChannelState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }

    /// Next state, or `None` if the move is not allowed.
    fn advance(self, to: Self) -> Option<Self> {
        use ChannelState::{Active, Closed, Closing, Open};
        match (self, to) {
            (Open, Active) | (Open | Active, Closing) | (Open | Active | Closing, Closed) => Some(to),
            _ => None,
        }
    }
}

/// Queue sizing for new channels.
#[derive(Debug, Clone, Copy)]
pub struct ChannelSettings {
    pub request_capacity: usize,
    pub response_capacity: usize,
    /// How long the receive loop waits for response-queue space.
    pub response_push_timeout: Duration,
    /// Close the stream when nothing, not even a heartbeat, arrives for this long.
    pub heartbeat_timeout: Duration,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            request_capacity: 10,
            response_capacity: 10,
            response_push_timeout: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(30),
        }
    }
}

pub struct CommandChannel {
    node_id: String,
    conn_id: u64,
    requests: mpsc::Sender<CmdRequest>,
    responses: ResponseQueue,
    stop: CancellationToken,
    state: Mutex<ChannelState>,
}

impl CommandChannel {
    /// Create a channel and hand back the receiving end of its request queue.
    pub fn open(node_id: &str, settings: &ChannelSettings) -> (Arc<Self>, mpsc::Receiver<CmdRequest>) {
        let (tx, rx) = mpsc::channel(settings.request_capacity.max(1));
        let channel = Arc::new(Self {
            node_id: node_id.to_string(),
            conn_id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            requests: tx,
            responses: ResponseQueue::new(settings.response_capacity),
            stop: CancellationToken::new(),
            state: Mutex::new(ChannelState::Open),
        });
        (channel, rx)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Distinguishes successive connections of the same node.
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ChannelState {
        *self.lock()
    }

    fn transition(&self, to: ChannelState) -> bool {
        let mut state = self.lock();
        match state.advance(to) {
            Some(next) => {
                tracing::debug!(
                    node_id = %self.node_id,
                    conn_id = self.conn_id,
                    from = state.as_str(),
                    to = next.as_str(),
                    "Channel state change"
                );
                *state = next;
                true
            }
            None => false,
        }
    }

    pub(crate) fn mark_active(&self) -> bool {
        self.transition(ChannelState::Active)
    }

    /// Request shutdown. Returns `true` only for the call that initiated it.
    pub fn close(&self) -> bool {
        if !self.transition(ChannelState::Closing) {
            return false;
        }
        self.stop.cancel();
        self.responses.close();
        true
    }

    /// Record that both loops have exited.
    pub(crate) fn mark_closed(&self) {
        self.stop.cancel();
        self.responses.close();
        self.transition(ChannelState::Closed);
    }

    /// Closing or closed: no new work should be routed here.
    pub fn is_closed(&self) -> bool {
        matches!(self.state(), ChannelState::Closing | ChannelState::Closed)
    }

    /// Fires once the channel starts closing.
    pub fn stopped(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Queue a request for the send loop. Fails with `Busy` if no space opens
    /// up within `timeout`, and with `NodeOffline` once the channel is closing.
    pub async fn enqueue(&self, request: CmdRequest, timeout: Duration) -> Result<(), CommandError> {
        if self.is_closed() {
            return Err(CommandError::NodeOffline(self.node_id.clone()));
        }
        tokio::select! {
            biased;
            () = self.stop.cancelled() => Err(CommandError::NodeOffline(self.node_id.clone())),
            sent = self.requests.send_timeout(request, timeout) => match sent {
                Ok(()) => Ok(()),
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    Err(CommandError::Busy(self.node_id.clone()))
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                    Err(CommandError::NodeOffline(self.node_id.clone()))
                }
            },
        }
    }

    /// Hand a response from the node to its correlator.
    pub async fn push_response(&self, response: CmdResponse, deadline: Instant) -> Result<(), PushError> {
        self.responses.push(response, deadline).await
    }

    pub(crate) fn responses(&self) -> &ResponseQueue {
        &self.responses
    }

    /// Start watching for responses to `task_id`. Must be called before the
    /// request is enqueued so no early response is refused.
    pub fn watch(self: &Arc<Self>, task_id: &str) -> TaskWatch {
        self.responses.expect(task_id);
        TaskWatch {
            channel: Arc::clone(self),
            task_id: task_id.to_string(),
        }
    }
}

/// A correlator's claim on one task id. Dropping it purges leftovers.
pub struct TaskWatch {
    channel: Arc<CommandChannel>,
    task_id: String,
}

impl TaskWatch {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn channel(&self) -> &Arc<CommandChannel> {
        &self.channel
    }

    /// Next response for this task, in arrival order.
    pub async fn next(&self, deadline: Instant) -> Result<CmdResponse, PopError> {
        self.channel.responses.pop_matching(&self.task_id, deadline).await
    }
}

impl Drop for TaskWatch {
    fn drop(&mut self) {
        self.channel.responses.forget(&self.task_id);
    }
}
