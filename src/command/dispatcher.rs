//! Task-correlated dispatch of commands to nodes.
//!
//! Every operation gets a fresh task id, claims it on the node's channel
//! before the request is queued, and then collects the responses carrying
//! that id until a terminal one arrives or the deadline passes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use super::channel::{CommandChannel, TaskWatch};
use super::queue::PopError;
use super::registry::ConnectionRegistry;
use crate::error::{CommandError, TransportError};
use crate::proto::{
    CmdRequest, CmdType, NetworkFlushIn, NetworkInfo, NetworkScanIn, NetworkScanOut, RequestPayload,
    ResponsePayload,
};

/// Timeouts applied by the dispatcher.
#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    /// How long to wait for space in a node's request queue.
    pub enqueue_timeout: Duration,
    pub flush_timeout: Duration,
    pub scan_timeout: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            enqueue_timeout: Duration::from_secs(1),
            flush_timeout: Duration::from_secs(30),
            scan_timeout: Duration::from_secs(300),
        }
    }
}

/// Result of a completed interface flush.
#[derive(Debug, Clone, Serialize)]
pub struct FlushReport {
    pub task_id: String,
    pub interfaces: Vec<NetworkInfo>,
}

/// How a scan worker ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum ScanOutcome {
    /// Terminal response received.
    Completed,
    /// Terminal response carried an error.
    Failed(String),
    /// Deadline passed without a terminal response.
    TimedOut,
    /// The node's channel closed before a terminal response.
    NodeLost,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub task_id: String,
    pub node_id: String,
    pub net_id: u32,
    pub outcome: ScanOutcome,
    /// Per-host records that carried an IP, in arrival order.
    pub hosts: Vec<NetworkScanOut>,
}

/// Handle to a scan running in the background.
pub struct ScanTask {
    pub task_id: String,
    pub handle: JoinHandle<ScanReport>,
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: ConnectionRegistry,
    settings: DispatchSettings,
    last_task_nanos: Arc<AtomicU64>,
}

impl Dispatcher {
    pub fn new(registry: ConnectionRegistry, settings: DispatchSettings) -> Self {
        Self {
            registry,
            settings,
            last_task_nanos: Arc::new(AtomicU64::new(0)),
        }
    }

    /// `<operation>-<unix nanos>`, strictly increasing within this process.
    pub fn next_task_id(&self, op: CmdType) -> String {
        #[allow(clippy::cast_possible_truncation)]
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos() as u64);
        let mut prev = self.last_task_nanos.load(Ordering::Relaxed);
        let stamp = loop {
            let next = now.max(prev + 1);
            match self
                .last_task_nanos
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break next,
                Err(actual) => prev = actual,
            }
        };
        format!("{}-{stamp}", op.as_str())
    }

    fn channel(&self, node_id: &str) -> Result<Arc<CommandChannel>, CommandError> {
        self.registry
            .get(node_id)
            .filter(|ch| !ch.is_closed())
            .ok_or_else(|| CommandError::NodeOffline(node_id.to_string()))
    }

    /// Stamp, claim and queue a request. The returned watch receives every
    /// response for the new task id.
    async fn dispatch(&self, node_id: &str, mut request: CmdRequest, op: CmdType) -> Result<TaskWatch, CommandError> {
        let channel = self.channel(node_id)?;
        request.task_id = self.next_task_id(op);
        request.node_id = node_id.to_string();

        let watch = channel.watch(&request.task_id);
        channel.enqueue(request, self.settings.enqueue_timeout).await?;
        debug!(node_id, task_id = %watch.task_id(), op = %op, "Request queued");
        Ok(watch)
    }

    /// Ask a node for its interface list and wait for the single reply.
    pub async fn network_flush(&self, node_id: &str, filter_prefixes: Vec<String>) -> Result<FlushReport, CommandError> {
        let request = CmdRequest::new(RequestPayload::NetworkFlush(NetworkFlushIn { filter_prefixes }));
        let watch = self.dispatch(node_id, request, CmdType::NetworkFlush).await?;
        let task_id = watch.task_id().to_string();
        let deadline = Instant::now() + self.settings.flush_timeout;

        let response = match watch.next(deadline).await {
            Ok(response) => response,
            Err(PopError::Timeout) => {
                warn!(node_id, task_id, "Network flush timed out");
                return Err(CommandError::Timeout {
                    node_id: node_id.to_string(),
                    task_id,
                });
            }
            Err(PopError::Closed) => {
                warn!(node_id, task_id, "Command stream closed before flush reply");
                return Err(TransportError::Closed.into());
            }
        };

        match response.payload {
            ResponsePayload::NetworkFlush(out) if out.err_msg.is_empty() => {
                info!(node_id, task_id, interfaces = out.interfaces.len(), "Network flush complete");
                Ok(FlushReport {
                    task_id,
                    interfaces: out.interfaces,
                })
            }
            ResponsePayload::NetworkFlush(out) => Err(CommandError::Rejected {
                task_id,
                message: out.err_msg,
            }),
            _ => Err(CommandError::UnexpectedResponse(task_id)),
        }
    }

    /// Start a scan and return once the request is queued.
    ///
    /// A background worker feeds each progress record, with its task id, to
    /// `on_progress` and, when a terminal response arrives, hands the final
    /// report to `on_complete`. If the deadline passes or the node goes away first the
    /// worker ends without calling `on_complete`.
    pub async fn network_scan<P, C>(
        &self,
        node_id: &str,
        scan: NetworkScanIn,
        on_progress: P,
        on_complete: C,
    ) -> Result<ScanTask, CommandError>
    where
        P: FnMut(&str, &NetworkScanOut) + Send + 'static,
        C: FnOnce(&ScanReport) + Send + 'static,
    {
        let net_id = scan.net_id;
        let request = CmdRequest::new(RequestPayload::NetworkScan(scan));
        let watch = self.dispatch(node_id, request, CmdType::NetworkScan).await?;
        let task_id = watch.task_id().to_string();
        let deadline = Instant::now() + self.settings.scan_timeout;

        let span = tracing::info_span!("scan", node_id = %node_id, task_id = %task_id);
        let handle = tokio::spawn(
            async move {
                let report = collect_scan(watch, net_id, deadline, on_progress).await;
                match &report.outcome {
                    ScanOutcome::Completed | ScanOutcome::Failed(_) => {
                        info!(hosts = report.hosts.len(), outcome = ?report.outcome, "Scan finished");
                        on_complete(&report);
                    }
                    ScanOutcome::TimedOut => warn!("Scan timed out, results discarded"),
                    ScanOutcome::NodeLost => warn!("Node lost during scan"),
                }
                report
            }
            .instrument(span),
        );

        Ok(ScanTask { task_id, handle })
    }
}

/// Collect one scan task's responses until a terminal one or the deadline.
async fn collect_scan<P>(watch: TaskWatch, net_id: u32, deadline: Instant, mut on_progress: P) -> ScanReport
where
    P: FnMut(&str, &NetworkScanOut),
{
    let mut hosts = Vec::new();
    let outcome = loop {
        let response = match watch.next(deadline).await {
            Ok(response) => response,
            Err(PopError::Timeout) => break ScanOutcome::TimedOut,
            Err(PopError::Closed) => break ScanOutcome::NodeLost,
        };
        let ResponsePayload::NetworkScan(out) = response.payload else {
            debug!(task_id = %response.task_id, "Ignoring non-scan response");
            continue;
        };

        on_progress(watch.task_id(), &out);
        if !out.err_msg.is_empty() {
            break ScanOutcome::Failed(out.err_msg);
        }
        let end = out.end;
        if !out.ip.is_empty() {
            hosts.push(out);
        }
        if end {
            break ScanOutcome::Completed;
        }
    };

    ScanReport {
        task_id: watch.task_id().to_string(),
        node_id: watch.channel().node_id().to_string(),
        net_id,
        outcome,
        hosts,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::command::acceptor::test_support::attach;
    use crate::command::channel::ChannelSettings;
    use crate::proto::{CmdResponse, NetworkFlushOut};

    fn iface(name: &str, ip: &str) -> NetworkInfo {
        NetworkInfo {
            network: name.into(),
            ip: ip.into(),
            net: format!("{ip}/24"),
            mask: "255.255.255.0".into(),
        }
    }

    fn scan_out(task: &str, ip: &str, end: bool) -> CmdResponse {
        CmdResponse {
            task_id: task.into(),
            node_id: "node-a".into(),
            payload: ResponsePayload::NetworkScan(NetworkScanOut {
                end,
                progress: if end { 100.0 } else { 50.0 },
                net_id: 7,
                ip: ip.into(),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_task_ids_are_unique_and_prefixed() {
        let dispatcher = Dispatcher::new(ConnectionRegistry::new(), DispatchSettings::default());
        let a = dispatcher.next_task_id(CmdType::NetworkScan);
        let b = dispatcher.next_task_id(CmdType::NetworkScan);
        let c = dispatcher.next_task_id(CmdType::NetworkFlush);
        assert!(a.starts_with("network_scan-"));
        assert!(c.starts_with("network_flush-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_flush_offline_node() {
        let dispatcher = Dispatcher::new(ConnectionRegistry::new(), DispatchSettings::default());
        let err = dispatcher.network_flush("nobody", vec![]).await.unwrap_err();
        assert!(matches!(err, CommandError::NodeOffline(_)));
    }

    #[tokio::test]
    async fn test_flush_happy_path() {
        let registry = ConnectionRegistry::new();
        let mut node = attach(&registry, ChannelSettings::default(), "node-a").await;
        let dispatcher = Dispatcher::new(registry, DispatchSettings::default());

        let responder = tokio::spawn(async move {
            let req = node.next_request().await.unwrap();
            let RequestPayload::NetworkFlush(input) = &req.payload else {
                panic!("expected flush request");
            };
            assert_eq!(input.filter_prefixes, vec!["hy-".to_string()]);
            let out = NetworkFlushOut {
                interfaces: vec![iface("eth0", "10.0.0.5"), iface("eth1", "10.0.1.5"), iface("wlan0", "192.168.1.9")],
                err_msg: String::new(),
            };
            node.reply(CmdResponse::new(&req, ResponsePayload::NetworkFlush(out))).await;
            (req.task_id, node)
        });

        let report = dispatcher.network_flush("node-a", vec!["hy-".into()]).await.unwrap();
        let (sent_task, _node) = responder.await.unwrap();
        assert_eq!(report.task_id, sent_task);
        assert_eq!(report.interfaces.len(), 3);
        assert_eq!(report.interfaces[2].network, "wlan0");
    }

    #[tokio::test]
    async fn test_flush_error_is_rejected() {
        let registry = ConnectionRegistry::new();
        let mut node = attach(&registry, ChannelSettings::default(), "node-a").await;
        let dispatcher = Dispatcher::new(registry, DispatchSettings::default());

        let responder = tokio::spawn(async move {
            let req = node.next_request().await.unwrap();
            let out = NetworkFlushOut {
                interfaces: vec![],
                err_msg: "ip: not found".into(),
            };
            node.reply(CmdResponse::new(&req, ResponsePayload::NetworkFlush(out))).await;
            node
        });

        let err = dispatcher.network_flush("node-a", vec![]).await.unwrap_err();
        let _node = responder.await.unwrap();
        assert!(matches!(err, CommandError::Rejected { ref message, .. } if message == "ip: not found"));
    }

    #[tokio::test]
    async fn test_flush_timeout() {
        let registry = ConnectionRegistry::new();
        let _node = attach(&registry, ChannelSettings::default(), "node-a").await;
        let settings = DispatchSettings {
            flush_timeout: Duration::from_millis(50),
            ..DispatchSettings::default()
        };
        let dispatcher = Dispatcher::new(registry, settings);
        let err = dispatcher.network_flush("node-a", vec![]).await.unwrap_err();
        assert!(matches!(err, CommandError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_flush_stream_lost_is_transport_failure() {
        let registry = ConnectionRegistry::new();
        let mut node = attach(&registry, ChannelSettings::default(), "node-a").await;
        let dispatcher = Dispatcher::new(registry.clone(), DispatchSettings::default());

        let dropper = tokio::spawn(async move {
            let _ = node.next_request().await.unwrap();
            drop(node.responses);
            node.served.await.unwrap();
        });

        let err = dispatcher.network_flush("node-a", vec![]).await.unwrap_err();
        dropper.await.unwrap();
        assert!(matches!(err, CommandError::Transport(TransportError::Closed)));
        assert_eq!(err.status().1, "TRANSPORT_FAILURE");
        assert!(!registry.is_online("node-a"));
    }

    #[tokio::test]
    async fn test_scan_timeout_discards_results() {
        let registry = ConnectionRegistry::new();
        let mut node = attach(&registry, ChannelSettings::default(), "node-a").await;
        let settings = DispatchSettings {
            scan_timeout: Duration::from_millis(100),
            ..DispatchSettings::default()
        };
        let dispatcher = Dispatcher::new(registry, settings);

        let completed = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&completed);
        let scan = NetworkScanIn {
            network: "eth0".into(),
            ip_range: "10.0.0.1-10".into(),
            filter_ips: vec![],
            net_id: 7,
        };
        let task = dispatcher
            .network_scan("node-a", scan, |_, _| {}, move |_| *flag.lock().unwrap() = true)
            .await
            .unwrap();

        let req = node.next_request().await.unwrap();
        assert_eq!(req.task_id, task.task_id);

        let report = tokio::time::timeout(Duration::from_secs(2), task.handle)
            .await
            .expect("worker must finish after its deadline")
            .unwrap();
        assert_eq!(report.outcome, ScanOutcome::TimedOut);
        assert!(report.hosts.is_empty());
        assert!(!*completed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_scan_streams_progress_and_completes() {
        let registry = ConnectionRegistry::new();
        let mut node = attach(&registry, ChannelSettings::default(), "node-a").await;
        let dispatcher = Dispatcher::new(registry, DispatchSettings::default());

        let progress = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&progress);
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let scan = NetworkScanIn {
            ip_range: "10.0.0.1-3".into(),
            net_id: 7,
            ..Default::default()
        };
        let task = dispatcher
            .network_scan(
                "node-a",
                scan,
                move |_, out| seen.lock().unwrap().push(out.progress),
                move |report| {
                    let _ = done_tx.send(report.hosts.len());
                },
            )
            .await
            .unwrap();

        let req = node.next_request().await.unwrap();
        node.reply(scan_out(&req.task_id, "10.0.0.1", false)).await;
        node.reply(scan_out(&req.task_id, "10.0.0.3", false)).await;
        node.reply(scan_out(&req.task_id, "", true)).await;

        let report = task.handle.await.unwrap();
        assert_eq!(report.outcome, ScanOutcome::Completed);
        assert_eq!(report.hosts.len(), 2);
        assert_eq!(done_rx.await.unwrap(), 2);
        assert_eq!(*progress.lock().unwrap(), vec![50.0, 50.0, 100.0]);
    }

    #[tokio::test]
    async fn test_scan_node_error_fails_task() {
        let registry = ConnectionRegistry::new();
        let mut node = attach(&registry, ChannelSettings::default(), "node-a").await;
        let dispatcher = Dispatcher::new(registry, DispatchSettings::default());

        let task = dispatcher
            .network_scan("node-a", NetworkScanIn::default(), |_, _| {}, |_| {})
            .await
            .unwrap();
        let req = node.next_request().await.unwrap();
        let mut resp = scan_out(&req.task_id, "", true);
        if let ResponsePayload::NetworkScan(out) = &mut resp.payload {
            out.err_msg = "invalid IP range".into();
        }
        node.reply(resp).await;

        let report = task.handle.await.unwrap();
        assert_eq!(report.outcome, ScanOutcome::Failed("invalid IP range".into()));
    }

    #[tokio::test]
    async fn test_concurrent_tasks_stay_isolated() {
        let (channel, _rx) = CommandChannel::open("node-a", &ChannelSettings::default());
        let watch_a = channel.watch("a");
        let watch_b = channel.watch("b");
        let deadline = Instant::now() + Duration::from_secs(2);

        let collect_a = tokio::spawn(collect_scan(watch_a, 7, deadline, |_, _| {}));
        let collect_b = tokio::spawn(collect_scan(watch_b, 7, deadline, |_, _| {}));

        for resp in [
            scan_out("a", "10.0.0.1", false),
            scan_out("b", "10.0.0.2", false),
            scan_out("a", "10.0.0.3", false),
            scan_out("b", "10.0.0.4", false),
            scan_out("a", "", true),
            scan_out("b", "", true),
        ] {
            channel.push_response(resp, deadline).await.unwrap();
        }

        let a = collect_a.await.unwrap();
        let b = collect_b.await.unwrap();
        let ips = |r: &ScanReport| r.hosts.iter().map(|h| h.ip.clone()).collect::<Vec<_>>();
        assert_eq!(ips(&a), vec!["10.0.0.1", "10.0.0.3"]);
        assert_eq!(ips(&b), vec!["10.0.0.2", "10.0.0.4"]);
        assert_eq!(a.outcome, ScanOutcome::Completed);
        assert_eq!(b.outcome, ScanOutcome::Completed);
    }

    #[tokio::test]
    async fn test_scan_node_lost_on_disconnect() {
        let registry = ConnectionRegistry::new();
        let mut node = attach(&registry, ChannelSettings::default(), "node-a").await;
        let dispatcher = Dispatcher::new(registry, DispatchSettings::default());

        let task = dispatcher
            .network_scan("node-a", NetworkScanIn::default(), |_, _| {}, |_| panic!("no completion"))
            .await
            .unwrap();
        let _ = node.next_request().await.unwrap();
        drop(node.responses);

        let report = tokio::time::timeout(Duration::from_secs(2), task.handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.outcome, ScanOutcome::NodeLost);
    }
}
