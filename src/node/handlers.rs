//! Command handlers run by the node.

use std::collections::HashSet;
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::{stream, StreamExt};
use tracing::{info, warn};

use super::client::{CommandHandler, Responder};
use super::iprange::parse_ip_range;
use super::probe::HostProber;
use super::sysinfo::{self, SysInfoError};
use crate::proto::{CmdRequest, CmdResponse, NetworkFlushOut, NetworkInfo, NetworkScanOut, RequestPayload, ResponsePayload};

// ─── Network flush ──────────────────────────────────────────────────────────

/// Where interface lists come from.
pub trait InterfaceSource: Send + Sync + 'static {
    fn interfaces(
        &self,
        filter_prefixes: &[String],
    ) -> impl Future<Output = Result<Vec<NetworkInfo>, SysInfoError>> + Send;
}

/// Interfaces of this host, via `ip -j addr show`.
pub struct SystemInterfaces;

impl InterfaceSource for SystemInterfaces {
    async fn interfaces(&self, filter_prefixes: &[String]) -> Result<Vec<NetworkInfo>, SysInfoError> {
        let links = sysinfo::collect_links().await?;
        Ok(sysinfo::network_infos(&links, filter_prefixes))
    }
}

/// Replies to a flush with one terminal response listing local interfaces.
pub struct FlushHandler<S> {
    source: Arc<S>,
    /// Used when the request names no prefixes.
    default_filters: Vec<String>,
}

impl<S: InterfaceSource> FlushHandler<S> {
    pub fn new(source: S, default_filters: Vec<String>) -> Self {
        Self {
            source: Arc::new(source),
            default_filters,
        }
    }
}

impl<S: InterfaceSource> CommandHandler for FlushHandler<S> {
    fn handle(&self, request: CmdRequest, responder: Responder) -> BoxFuture<'static, ()> {
        let source = Arc::clone(&self.source);
        let defaults = self.default_filters.clone();
        Box::pin(async move {
            let RequestPayload::NetworkFlush(input) = &request.payload else {
                return;
            };
            let filters = if input.filter_prefixes.is_empty() {
                defaults
            } else {
                input.filter_prefixes.clone()
            };

            let out = match source.interfaces(&filters).await {
                Ok(interfaces) => {
                    info!(task_id = %request.task_id, count = interfaces.len(), "Interfaces collected");
                    NetworkFlushOut {
                        interfaces,
                        err_msg: String::new(),
                    }
                }
                Err(e) => {
                    warn!(task_id = %request.task_id, error = %e, "Interface enumeration failed");
                    NetworkFlushOut {
                        interfaces: Vec::new(),
                        err_msg: e.to_string(),
                    }
                }
            };
            responder
                .send(CmdResponse::new(&request, ResponsePayload::NetworkFlush(out)))
                .await;
        })
    }
}

// ─── Network scan ───────────────────────────────────────────────────────────

/// Probes a range with bounded concurrency, streaming one response per host
/// found and a final `end` response.
pub struct ScanHandler<P> {
    prober: Arc<P>,
    concurrency: usize,
}

impl<P: HostProber> ScanHandler<P> {
    pub fn new(prober: P, concurrency: usize) -> Self {
        Self {
            prober: Arc::new(prober),
            concurrency: concurrency.max(1),
        }
    }
}

impl<P: HostProber> CommandHandler for ScanHandler<P> {
    fn handle(&self, request: CmdRequest, responder: Responder) -> BoxFuture<'static, ()> {
        Box::pin(run_scan(Arc::clone(&self.prober), self.concurrency, request, responder))
    }
}

async fn run_scan<P: HostProber>(prober: Arc<P>, concurrency: usize, request: CmdRequest, responder: Responder) {
    let RequestPayload::NetworkScan(input) = &request.payload else {
        return;
    };
    let net_id = input.net_id;
    let reply = |out: NetworkScanOut| CmdResponse::new(&request, ResponsePayload::NetworkScan(out));

    let targets = match parse_ip_range(&input.ip_range) {
        Ok(targets) => targets,
        Err(e) => {
            warn!(task_id = %request.task_id, range = %input.ip_range, error = %e, "Bad scan range");
            responder
                .send(reply(NetworkScanOut {
                    end: true,
                    net_id,
                    err_msg: e.to_string(),
                    ..NetworkScanOut::default()
                }))
                .await;
            return;
        }
    };
    let skip: HashSet<Ipv4Addr> = input.filter_ips.iter().filter_map(|s| s.trim().parse().ok()).collect();
    let targets: Vec<Ipv4Addr> = targets.into_iter().filter(|ip| !skip.contains(ip)).collect();
    let total = targets.len();

    info!(task_id = %request.task_id, total, concurrency, iface = %input.network, "Scan started");
    let started = Instant::now();

    let iface = input.network.clone();
    let mut probes = stream::iter(targets)
        .map(|ip| {
            let prober = Arc::clone(&prober);
            let iface = iface.clone();
            async move { (ip, prober.probe(ip, &iface).await) }
        })
        .buffer_unordered(concurrency);

    let mut processed = 0usize;
    let mut found = 0usize;
    while let Some((ip, host)) = probes.next().await {
        processed += 1;
        let Some(host) = host else { continue };
        found += 1;

        #[allow(clippy::cast_precision_loss)]
        let progress = processed as f32 / total as f32 * 100.0;
        let sent = responder
            .send(reply(NetworkScanOut {
                end: false,
                progress,
                net_id,
                ip: ip.to_string(),
                mac: host.mac,
                vendor: host.vendor,
                err_msg: String::new(),
            }))
            .await;
        if !sent {
            warn!(task_id = %request.task_id, "Connection gone, abandoning scan");
            return;
        }
    }

    responder
        .send(reply(NetworkScanOut {
            end: true,
            progress: 100.0,
            net_id,
            ..NetworkScanOut::default()
        }))
        .await;
    info!(
        task_id = %request.task_id,
        found,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Scan finished"
    );
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::channel::mpsc as fmpsc;
    use futures::SinkExt;

    use super::*;
    use crate::command::acceptor::serve_command_stream;
    use crate::command::{ChannelSettings, ConnectionRegistry, DispatchSettings, Dispatcher, ScanOutcome};
    use crate::error::TransportError;
    use crate::node::client::{ClientSettings, ConnState, Connector, HandlerSet, NodeClient};
    use crate::node::probe::HostProbe;
    use crate::proto::{BoxSink, BoxStream, CmdType, NetworkScanIn};

    /// Connects straight into an in-process server acceptor.
    #[derive(Clone)]
    struct InProcess {
        registry: ConnectionRegistry,
        node_id: String,
    }

    impl Connector for InProcess {
        async fn open(&self) -> Result<(BoxSink<CmdResponse>, BoxStream<CmdRequest>), TransportError> {
            let (req_tx, req_rx) = fmpsc::unbounded::<CmdRequest>();
            let (resp_tx, resp_rx) = fmpsc::unbounded::<CmdResponse>();
            let server_sink: BoxSink<CmdRequest> = Box::pin(req_tx.sink_map_err(|_| TransportError::Closed));
            let server_stream: BoxStream<CmdResponse> = Box::pin(resp_rx.map(Ok::<_, TransportError>));
            let registry = self.registry.clone();
            let node_id = self.node_id.clone();
            tokio::spawn(async move {
                serve_command_stream(&registry, &ChannelSettings::default(), &node_id, server_sink, server_stream).await;
            });
            Ok((
                Box::pin(resp_tx.sink_map_err(|_| TransportError::Closed)),
                Box::pin(req_rx.map(Ok::<_, TransportError>)),
            ))
        }
    }

    struct ThreeInterfaces;

    impl InterfaceSource for ThreeInterfaces {
        async fn interfaces(&self, filter_prefixes: &[String]) -> Result<Vec<NetworkInfo>, SysInfoError> {
            let all = ["eth0", "eth1", "hy-bait0", "wlan0"];
            Ok(all
                .iter()
                .filter(|name| !filter_prefixes.iter().any(|p| name.starts_with(p.as_str())))
                .enumerate()
                .map(|(i, name)| NetworkInfo {
                    network: (*name).to_string(),
                    ip: format!("10.0.{i}.5"),
                    net: format!("10.0.{i}.0/24"),
                    mask: "255.255.255.0".into(),
                })
                .collect())
        }
    }

    /// Even last octets answer.
    struct EvenHosts;

    impl HostProber for EvenHosts {
        async fn probe(&self, ip: Ipv4Addr, _iface: &str) -> Option<HostProbe> {
            tokio::time::sleep(Duration::from_millis(1)).await;
            (ip.octets()[3] % 2 == 0).then(|| HostProbe {
                mac: format!("02:00:00:00:00:{:02x}", ip.octets()[3]),
                vendor: String::new(),
            })
        }
    }

    async fn online_node(handlers: HandlerSet) -> (Dispatcher, NodeClient<InProcess>) {
        let registry = ConnectionRegistry::new();
        let connector = InProcess {
            registry: registry.clone(),
            node_id: "node-a".into(),
        };
        let client = NodeClient::new("node-a", connector, handlers, ClientSettings::default());
        client.connect().await;
        assert_eq!(client.state(), ConnState::Connected);
        for _ in 0..100 {
            if registry.is_online("node-a") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        (Dispatcher::new(registry, DispatchSettings::default()), client)
    }

    #[tokio::test]
    async fn test_flush_end_to_end() {
        let handlers = HandlerSet::new().with(
            CmdType::NetworkFlush,
            FlushHandler::new(ThreeInterfaces, vec!["hy-".into()]),
        );
        let (dispatcher, _client) = online_node(handlers).await;

        let report = dispatcher.network_flush("node-a", vec![]).await.unwrap();
        assert!(report.task_id.starts_with("network_flush-"));
        let names: Vec<_> = report.interfaces.iter().map(|i| i.network.as_str()).collect();
        assert_eq!(names, vec!["eth0", "eth1", "wlan0"]);
    }

    #[tokio::test]
    async fn test_scan_end_to_end() {
        let handlers = HandlerSet::new().with(CmdType::NetworkScan, ScanHandler::new(EvenHosts, 4));
        let (dispatcher, _client) = online_node(handlers).await;

        let scan = NetworkScanIn {
            network: "eth0".into(),
            ip_range: "10.0.0.1-10".into(),
            filter_ips: vec!["10.0.0.4".into()],
            net_id: 3,
        };
        let task = dispatcher.network_scan("node-a", scan, |_, _| {}, |_| {}).await.unwrap();
        let report = tokio::time::timeout(Duration::from_secs(5), task.handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.outcome, ScanOutcome::Completed);
        let mut ips: Vec<_> = report.hosts.iter().map(|h| h.ip.clone()).collect();
        ips.sort();
        assert_eq!(ips, vec!["10.0.0.10", "10.0.0.2", "10.0.0.6", "10.0.0.8"]);
        assert!(report.hosts.iter().all(|h| h.net_id == 3 && h.progress > 0.0 && h.progress <= 100.0));
    }

    #[tokio::test]
    async fn test_scan_bad_range_fails_task() {
        let handlers = HandlerSet::new().with(CmdType::NetworkScan, ScanHandler::new(EvenHosts, 4));
        let (dispatcher, _client) = online_node(handlers).await;

        let scan = NetworkScanIn {
            ip_range: "10.0.0.9-3".into(),
            ..NetworkScanIn::default()
        };
        let task = dispatcher.network_scan("node-a", scan, |_, _| {}, |_| {}).await.unwrap();
        let report = task.handle.await.unwrap();
        assert!(matches!(report.outcome, ScanOutcome::Failed(ref msg) if msg.contains("invalid range")));
    }
}
