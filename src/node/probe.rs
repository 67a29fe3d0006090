//! Host discovery for network scans.
//!
//! [`ArpCacheProber`] needs no raw sockets: a UDP datagram to the target makes
//! the kernel resolve its link-layer address, and the answer is read back
//! from `/proc/net/arp`.

use std::future::Future;
use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::Instant;

const ARP_TABLE: &str = "/proc/net/arp";
/// ATF_COM: entry resolved.
const ATF_COM: u32 = 0x2;
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Discard service; nothing needs to listen there.
const NUDGE_PORT: u16 = 9;

/// A host that answered a probe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostProbe {
    pub mac: String,
    pub vendor: String,
}

pub trait HostProber: Send + Sync + 'static {
    /// `None` if the host did not answer in time.
    fn probe(&self, ip: Ipv4Addr, iface: &str) -> impl Future<Output = Option<HostProbe>> + Send;
}

pub struct ArpCacheProber {
    timeout: Duration,
}

impl ArpCacheProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl HostProber for ArpCacheProber {
    async fn probe(&self, ip: Ipv4Addr, iface: &str) -> Option<HostProbe> {
        if let Some(mac) = lookup(ip, iface).await {
            return Some(HostProbe {
                mac,
                vendor: String::new(),
            });
        }

        nudge(ip).await;
        let deadline = Instant::now() + self.timeout;
        while Instant::now() < deadline {
            tokio::time::sleep(POLL_INTERVAL).await;
            if let Some(mac) = lookup(ip, iface).await {
                return Some(HostProbe {
                    mac,
                    vendor: String::new(),
                });
            }
        }
        None
    }
}

async fn nudge(ip: Ipv4Addr) {
    if let Ok(socket) = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
        let _ = socket.send_to(&[0], (ip, NUDGE_PORT)).await;
    }
}

async fn lookup(ip: Ipv4Addr, iface: &str) -> Option<String> {
    let table = tokio::fs::read_to_string(ARP_TABLE).await.ok()?;
    find_arp_entry(&table, ip, iface)
}

/// MAC of a resolved entry for `ip`, restricted to `iface` unless it is empty.
///
/// ```text
/// IP address       HW type     Flags       HW address            Mask     Device
/// 10.0.0.1         0x1         0x2         52:54:00:aa:bb:cc     *        eth0
/// ```
pub fn find_arp_entry(table: &str, ip: Ipv4Addr, iface: &str) -> Option<String> {
    let wanted = ip.to_string();
    table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 || fields[0] != wanted {
            return None;
        }
        if !iface.is_empty() && fields[5] != iface {
            return None;
        }
        let flags = u32::from_str_radix(fields[2].trim_start_matches("0x"), 16).unwrap_or(0);
        let mac = fields[3];
        (flags & ATF_COM != 0 && mac != "00:00:00:00:00:00").then(|| mac.to_string())
    })
}
