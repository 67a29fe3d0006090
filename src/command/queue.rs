//! Bounded response queue with selective receive by task id.
//!
//! [`ResponseQueue`] sits between a node's receive loop and the correlators
//! waiting on that node. Each correlator takes only the responses carrying its
//! own task id, oldest first, and everything else stays where it was. Several
//! tasks can therefore share one node without reordering or stealing each
//! other's messages.
//!
//! Responses for task ids nobody is waiting on are refused at push time, and a
//! correlator's leftovers are purged when it gives up, so the bounded queue
//! cannot be clogged by abandoned tasks.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::proto::CmdResponse;

#[derive(Debug, Error)]
pub enum PushError {
    #[error("response queue full")]
    Full(CmdResponse),
    #[error("response queue closed")]
    Closed(CmdResponse),
    #[error("no correlator waiting for task")]
    Unclaimed(CmdResponse),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PopError {
    #[error("deadline elapsed")]
    Timeout,
    #[error("response queue closed")]
    Closed,
}

struct QueueState {
    items: VecDeque<CmdResponse>,
    awaited: HashSet<String>,
    closed: bool,
}

pub struct ResponseQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    /// Signalled when an item is pushed or the queue closes.
    arrived: Notify,
    /// Signalled when space frees up or the queue closes.
    freed: Notify,
}

impl ResponseQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                awaited: HashSet::new(),
                closed: false,
            }),
            capacity: capacity.max(1),
            arrived: Notify::new(),
            freed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declare that a correlator is waiting for `task_id`.
    pub fn expect(&self, task_id: &str) {
        self.lock().awaited.insert(task_id.to_string());
    }

    /// Stop waiting for `task_id` and drop anything still queued for it.
    pub fn forget(&self, task_id: &str) {
        let mut state = self.lock();
        state.awaited.remove(task_id);
        let before = state.items.len();
        state.items.retain(|r| r.task_id != task_id);
        let purged = before - state.items.len();
        drop(state);
        if purged > 0 {
            tracing::debug!(task_id, purged, "Purged unclaimed responses");
            self.freed.notify_waiters();
        }
    }

    /// Append a response, waiting until `deadline` for space.
    pub async fn push(&self, response: CmdResponse, deadline: Instant) -> Result<(), PushError> {
        loop {
            let freed = self.freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return Err(PushError::Closed(response));
                }
                if !state.awaited.contains(&response.task_id) {
                    return Err(PushError::Unclaimed(response));
                }
                if state.items.len() < self.capacity {
                    state.items.push_back(response);
                    drop(state);
                    self.arrived.notify_waiters();
                    return Ok(());
                }
            }

            if tokio::time::timeout_at(deadline, freed).await.is_err() {
                return Err(PushError::Full(response));
            }
        }
    }

    /// Take the oldest response for `task_id`, waiting until `deadline`.
    ///
    /// Items queued before the close are still handed out; `Closed` is only
    /// returned once nothing for this task remains.
    pub async fn pop_matching(&self, task_id: &str, deadline: Instant) -> Result<CmdResponse, PopError> {
        loop {
            let arrived = self.arrived.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(pos) = state.items.iter().position(|r| r.task_id == task_id) {
                    let item = state.items.remove(pos);
                    drop(state);
                    self.freed.notify_waiters();
                    if let Some(item) = item {
                        return Ok(item);
                    }
                    continue;
                }
                if state.closed {
                    return Err(PopError::Closed);
                }
            }

            if tokio::time::timeout_at(deadline, arrived).await.is_err() {
                return Err(PopError::Timeout);
            }
        }
    }

    /// Close the queue and wake every waiter. Idempotent.
    pub fn close(&self) {
        self.lock().closed = true;
        self.arrived.notify_waiters();
        self.freed.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::proto::{NetworkScanOut, ResponsePayload};

    fn scan(task: &str, ip: &str, end: bool) -> CmdResponse {
        CmdResponse {
            task_id: task.into(),
            node_id: "node-a".into(),
            payload: ResponsePayload::NetworkScan(NetworkScanOut {
                end,
                ip: ip.into(),
                ..Default::default()
            }),
        }
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(200)
    }

    fn ip_of(resp: &CmdResponse) -> String {
        match &resp.payload {
            ResponsePayload::NetworkScan(out) => out.ip.clone(),
            _ => String::new(),
        }
    }

    #[tokio::test]
    async fn test_selective_pop_keeps_other_tasks_in_order() {
        let q = ResponseQueue::new(10);
        q.expect("a");
        q.expect("b");
        for resp in [
            scan("a", "1", false),
            scan("b", "2", false),
            scan("a", "3", false),
            scan("b", "4", false),
        ] {
            q.push(resp, soon()).await.unwrap();
        }

        assert_eq!(ip_of(&q.pop_matching("b", soon()).await.unwrap()), "2");
        assert_eq!(ip_of(&q.pop_matching("a", soon()).await.unwrap()), "1");
        assert_eq!(ip_of(&q.pop_matching("a", soon()).await.unwrap()), "3");
        assert_eq!(ip_of(&q.pop_matching("b", soon()).await.unwrap()), "4");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_unclaimed_response_is_refused() {
        let q = ResponseQueue::new(2);
        let err = q.push(scan("ghost", "1", true), soon()).await.unwrap_err();
        assert!(matches!(err, PushError::Unclaimed(_)));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_push_times_out_when_full() {
        let q = ResponseQueue::new(1);
        q.expect("a");
        q.push(scan("a", "1", false), soon()).await.unwrap();
        let deadline = Instant::now() + Duration::from_millis(30);
        let err = q.push(scan("a", "2", false), deadline).await.unwrap_err();
        assert!(matches!(err, PushError::Full(_)));
    }

    #[tokio::test]
    async fn test_pop_wakes_blocked_push() {
        let q = Arc::new(ResponseQueue::new(1));
        q.expect("a");
        q.push(scan("a", "1", false), soon()).await.unwrap();

        let pusher = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.push(scan("a", "2", false), soon()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(ip_of(&q.pop_matching("a", soon()).await.unwrap()), "1");
        pusher.await.unwrap().unwrap();
        assert_eq!(ip_of(&q.pop_matching("a", soon()).await.unwrap()), "2");
    }

    #[tokio::test]
    async fn test_forget_purges_leftovers() {
        let q = ResponseQueue::new(4);
        q.expect("a");
        q.push(scan("a", "1", false), soon()).await.unwrap();
        q.push(scan("a", "2", false), soon()).await.unwrap();
        q.forget("a");
        assert!(q.is_empty());
        let err = q.push(scan("a", "3", true), soon()).await.unwrap_err();
        assert!(matches!(err, PushError::Unclaimed(_)));
    }

    #[tokio::test]
    async fn test_close_wakes_waiter_after_draining() {
        let q = Arc::new(ResponseQueue::new(4));
        q.expect("a");
        q.push(scan("a", "1", false), soon()).await.unwrap();

        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move {
                let first = q.pop_matching("a", soon()).await;
                let second = q.pop_matching("a", Instant::now() + Duration::from_secs(5)).await;
                (first, second)
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.close();
        q.close();

        let (first, second) = waiter.await.unwrap();
        assert_eq!(ip_of(&first.unwrap()), "1");
        assert_eq!(second.unwrap_err(), PopError::Closed);
    }
}
