//! In-memory records kept by the server: registered nodes, scan tasks and the
//! host table of each scanned network.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::command::{ScanOutcome, ScanReport};
use crate::proto::{NetworkInfo, NetworkScanOut, RegisterRequest, ResourceInfo, SystemInfo};

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── Nodes ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct NodeRecord {
    pub node_uid: String,
    pub ip: String,
    pub mac: String,
    pub version: String,
    pub commit: String,
    pub system_info: SystemInfo,
    pub network_interfaces: Vec<NetworkInfo>,
    pub resource: Option<ResourceInfo>,
    /// Unix seconds of the first registration.
    pub registered_at: u64,
    /// Unix seconds of the last registration or resource report.
    pub last_seen: u64,
}

#[derive(Clone, Default)]
pub struct NodeStore {
    nodes: Arc<Mutex<BTreeMap<String, NodeRecord>>>,
}

impl NodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a node. Returns `true` when the uid was new.
    pub fn register(&self, req: RegisterRequest) -> bool {
        let now = unix_now();
        let mut nodes = lock(&self.nodes);
        let registered_at = nodes.get(&req.node_uid).map_or(now, |r| r.registered_at);
        let resource = nodes.get(&req.node_uid).and_then(|r| r.resource.clone());
        let record = NodeRecord {
            node_uid: req.node_uid.clone(),
            ip: req.ip,
            mac: req.mac,
            version: req.version,
            commit: req.commit,
            system_info: req.system_info,
            network_interfaces: req.network_interfaces,
            resource,
            registered_at,
            last_seen: now,
        };
        nodes.insert(req.node_uid, record).is_none()
    }

    /// Store a resource sample. Returns `false` for an unknown node.
    pub fn report_resource(&self, node_uid: &str, resource: ResourceInfo) -> bool {
        let mut nodes = lock(&self.nodes);
        let Some(record) = nodes.get_mut(node_uid) else {
            return false;
        };
        record.resource = Some(resource);
        record.last_seen = unix_now();
        true
    }

    pub fn set_interfaces(&self, node_uid: &str, interfaces: Vec<NetworkInfo>) -> bool {
        let mut nodes = lock(&self.nodes);
        match nodes.get_mut(node_uid) {
            Some(record) => {
                record.network_interfaces = interfaces;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, node_uid: &str) -> Option<NodeRecord> {
        lock(&self.nodes).get(node_uid).cloned()
    }

    pub fn list(&self) -> Vec<NodeRecord> {
        lock(&self.nodes).values().cloned().collect()
    }
}

// ─── Scans ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Running,
    Completed,
    Failed,
    TimedOut,
    NodeLost,
}

impl ScanStatus {
    fn from_outcome(outcome: &ScanOutcome) -> Self {
        match outcome {
            ScanOutcome::Completed => Self::Completed,
            ScanOutcome::Failed(_) => Self::Failed,
            ScanOutcome::TimedOut => Self::TimedOut,
            ScanOutcome::NodeLost => Self::NodeLost,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredHost {
    pub ip: String,
    pub mac: String,
    pub vendor: String,
}

impl From<&NetworkScanOut> for DiscoveredHost {
    fn from(out: &NetworkScanOut) -> Self {
        Self {
            ip: out.ip.clone(),
            mac: out.mac.clone(),
            vendor: out.vendor.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanRecord {
    pub task_id: String,
    pub node_id: String,
    pub net_id: u32,
    pub status: ScanStatus,
    pub progress: f32,
    pub error: Option<String>,
    pub hosts: Vec<DiscoveredHost>,
    pub started_at: u64,
    pub finished_at: Option<u64>,
}

/// Counts from reconciling a host table against a finished scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HostDiff {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

#[derive(Default)]
struct ScanInner {
    tasks: HashMap<String, ScanRecord>,
    /// Finished task ids, oldest first.
    finished: VecDeque<String>,
    /// (node, net) pairs with a scan in flight, mapped to the task id.
    running: HashMap<(String, u32), String>,
    /// Host table per network, keyed by IP.
    hosts: HashMap<u32, BTreeMap<String, DiscoveredHost>>,
}

/// Finished scan records kept when no limit is configured.
pub const DEFAULT_SCAN_RETENTION: usize = 256;

#[derive(Clone)]
pub struct ScanStore {
    inner: Arc<Mutex<ScanInner>>,
    retention: usize,
}

impl Default for ScanStore {
    fn default() -> Self {
        Self::with_retention(DEFAULT_SCAN_RETENTION)
    }
}

impl ScanStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `retention` finished records; the oldest are evicted first.
    /// Running scans are never evicted.
    pub fn with_retention(retention: usize) -> Self {
        Self {
            inner: Arc::default(),
            retention: retention.max(1),
        }
    }

    /// Reserve `(node_id, net_id)`. Returns the running task id when taken.
    pub fn reserve(&self, node_id: &str, net_id: u32) -> Result<(), String> {
        let mut inner = lock(&self.inner);
        let key = (node_id.to_string(), net_id);
        if let Some(task_id) = inner.running.get(&key) {
            return Err(task_id.clone());
        }
        inner.running.insert(key, String::new());
        Ok(())
    }

    /// Give up a reservation that never turned into a task.
    pub fn release(&self, node_id: &str, net_id: u32) {
        let mut inner = lock(&self.inner);
        let key = (node_id.to_string(), net_id);
        if inner.running.get(&key).is_some_and(String::is_empty) {
            inner.running.remove(&key);
        }
    }

    /// Record a dispatched task under a reservation made with [`Self::reserve`].
    /// Progress that raced ahead of this call is kept.
    pub fn start(&self, task_id: &str, node_id: &str, net_id: u32) {
        let mut inner = lock(&self.inner);
        inner.running.insert((node_id.to_string(), net_id), task_id.to_string());
        inner.tasks.entry(task_id.to_string()).or_insert_with(|| ScanRecord {
            task_id: task_id.to_string(),
            node_id: node_id.to_string(),
            net_id,
            status: ScanStatus::Running,
            progress: 0.0,
            error: None,
            hosts: Vec::new(),
            started_at: unix_now(),
            finished_at: None,
        });
    }

    pub fn progress(&self, task_id: &str, node_id: &str, out: &NetworkScanOut) {
        let mut inner = lock(&self.inner);
        let record = inner.tasks.entry(task_id.to_string()).or_insert_with(|| ScanRecord {
            task_id: task_id.to_string(),
            node_id: node_id.to_string(),
            net_id: out.net_id,
            status: ScanStatus::Running,
            progress: 0.0,
            error: None,
            hosts: Vec::new(),
            started_at: unix_now(),
            finished_at: None,
        });
        if record.status != ScanStatus::Running {
            return;
        }
        record.progress = record.progress.max(out.progress);
        if !out.ip.is_empty() {
            record.hosts.push(DiscoveredHost::from(out));
        }
    }

    /// Mark a task finished and free its `(node, net)` slot. A task that is
    /// already finished keeps its first status.
    pub fn finish(&self, report: &ScanReport) {
        let mut inner = lock(&self.inner);
        let key = (report.node_id.clone(), report.net_id);
        if inner.running.get(&key) == Some(&report.task_id) {
            inner.running.remove(&key);
        }
        let Some(record) = inner.tasks.get_mut(&report.task_id) else {
            return;
        };
        if record.status != ScanStatus::Running {
            return;
        }
        record.status = ScanStatus::from_outcome(&report.outcome);
        record.finished_at = Some(unix_now());
        if let ScanOutcome::Failed(message) = &report.outcome {
            record.error = Some(message.clone());
        }
        if record.status == ScanStatus::Completed {
            record.progress = 100.0;
        }

        inner.finished.push_back(report.task_id.clone());
        while inner.finished.len() > self.retention {
            if let Some(evicted) = inner.finished.pop_front() {
                inner.tasks.remove(&evicted);
            }
        }
    }

    /// Replace the host table of `net_id` with the hosts of a finished scan.
    pub fn reconcile(&self, net_id: u32, found: &[NetworkScanOut]) -> HostDiff {
        let mut inner = lock(&self.inner);
        let table = inner.hosts.entry(net_id).or_default();
        let mut diff = HostDiff::default();

        let mut seen: BTreeMap<String, DiscoveredHost> = BTreeMap::new();
        for out in found.iter().filter(|o| !o.ip.is_empty()) {
            seen.insert(out.ip.clone(), DiscoveredHost::from(out));
        }

        table.retain(|ip, _| {
            let keep = seen.contains_key(ip);
            if !keep {
                diff.removed += 1;
            }
            keep
        });
        for (ip, host) in seen {
            match table.get_mut(&ip) {
                Some(existing) if existing.mac != host.mac || existing.vendor != host.vendor => {
                    *existing = host;
                    diff.updated += 1;
                }
                Some(_) => {}
                None => {
                    table.insert(ip, host);
                    diff.added += 1;
                }
            }
        }
        diff
    }

    pub fn get(&self, task_id: &str) -> Option<ScanRecord> {
        lock(&self.inner).tasks.get(task_id).cloned()
    }

    pub fn hosts(&self, net_id: u32) -> Vec<DiscoveredHost> {
        lock(&self.inner)
            .hosts
            .get(&net_id)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(ip: &str, mac: &str) -> NetworkScanOut {
        NetworkScanOut {
            ip: ip.into(),
            mac: mac.into(),
            progress: 50.0,
            net_id: 1,
            ..Default::default()
        }
    }

    fn register(uid: &str, ip: &str) -> RegisterRequest {
        RegisterRequest {
            node_uid: uid.into(),
            ip: ip.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_register_is_idempotent() {
        let store = NodeStore::new();
        assert!(store.register(register("n1", "10.0.0.1")));
        assert!(store.report_resource("n1", ResourceInfo::default()));
        assert!(!store.register(register("n1", "10.0.0.2")));

        let rec = store.get("n1").unwrap();
        assert_eq!(rec.ip, "10.0.0.2");
        assert!(rec.resource.is_some());
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn test_resource_for_unknown_node_rejected() {
        let store = NodeStore::new();
        assert!(!store.report_resource("ghost", ResourceInfo::default()));
        assert!(store.get("ghost").is_none());
    }

    #[test]
    fn test_scan_slot_is_exclusive_per_net() {
        let scans = ScanStore::new();
        scans.reserve("n1", 1).unwrap();
        scans.start("t1", "n1", 1);
        assert_eq!(scans.reserve("n1", 1).unwrap_err(), "t1");
        scans.reserve("n1", 2).unwrap();
        scans.reserve("n2", 1).unwrap();

        scans.finish(&ScanReport {
            task_id: "t1".into(),
            node_id: "n1".into(),
            net_id: 1,
            outcome: ScanOutcome::TimedOut,
            hosts: vec![],
        });
        assert_eq!(scans.get("t1").unwrap().status, ScanStatus::TimedOut);
        scans.reserve("n1", 1).unwrap();
    }

    #[test]
    fn test_release_frees_unused_reservation() {
        let scans = ScanStore::new();
        scans.reserve("n1", 1).unwrap();
        scans.release("n1", 1);
        scans.reserve("n1", 1).unwrap();
    }

    #[test]
    fn test_first_finish_wins() {
        let scans = ScanStore::new();
        scans.start("t1", "n1", 1);
        scans.progress("t1", "n1", &host("10.0.0.2", "aa"));
        let mut report = ScanReport {
            task_id: "t1".into(),
            node_id: "n1".into(),
            net_id: 1,
            outcome: ScanOutcome::Completed,
            hosts: vec![],
        };
        scans.finish(&report);
        report.outcome = ScanOutcome::NodeLost;
        scans.finish(&report);

        let rec = scans.get("t1").unwrap();
        assert_eq!(rec.status, ScanStatus::Completed);
        assert_eq!(rec.progress, 100.0);
        assert_eq!(rec.hosts.len(), 1);
    }

    #[test]
    fn test_finished_scans_are_evicted_oldest_first() {
        let scans = ScanStore::with_retention(3);
        scans.start("running", "n9", 9);
        for i in 0..10u32 {
            let task_id = format!("network_scan-{i}");
            scans.start(&task_id, "n1", i);
            scans.finish(&ScanReport {
                task_id,
                node_id: "n1".into(),
                net_id: i,
                outcome: ScanOutcome::Completed,
                hosts: vec![],
            });
        }

        let inner = lock(&scans.inner);
        assert_eq!(inner.finished.len(), 3);
        assert_eq!(inner.tasks.len(), 4);
        drop(inner);
        assert!(scans.get("network_scan-0").is_none());
        assert!(scans.get("network_scan-6").is_none());
        assert_eq!(scans.get("network_scan-9").unwrap().status, ScanStatus::Completed);
        assert_eq!(scans.get("running").unwrap().status, ScanStatus::Running);
    }

    #[test]
    fn test_reconcile_host_table() {
        let scans = ScanStore::new();
        let diff = scans.reconcile(1, &[host("10.0.0.2", "aa"), host("10.0.0.3", "bb")]);
        assert_eq!(diff, HostDiff { added: 2, updated: 0, removed: 0 });

        let diff = scans.reconcile(1, &[host("10.0.0.3", "cc"), host("10.0.0.4", "dd")]);
        assert_eq!(diff, HostDiff { added: 1, updated: 1, removed: 1 });

        let ips: Vec<_> = scans.hosts(1).into_iter().map(|h| (h.ip, h.mac)).collect();
        assert_eq!(
            ips,
            vec![("10.0.0.3".to_string(), "cc".to_string()), ("10.0.0.4".to_string(), "dd".to_string())]
        );
        assert!(scans.hosts(2).is_empty());
    }
}
