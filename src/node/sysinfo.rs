//! Local host facts reported by the node.
//!
//! ## Data sources
//!
//! | Field              | Source                                   |
//! |--------------------|------------------------------------------|
//! | interfaces, MACs   | `ip -j addr show`                        |
//! | `hostname`         | `/proc/sys/kernel/hostname`              |
//! | `kernel`           | `/proc/sys/kernel/osrelease`             |
//! | `distribution`     | `/etc/os-release` (`PRETTY_NAME`)        |
//! | `boot_time`        | `/proc/stat` (`btime`)                   |
//! | CPU usage          | two `/proc/stat` samples                 |
//! | memory             | `/proc/meminfo`                          |
//! | disk               | `statvfs(node_path)` syscall             |
//! | agent RSS          | `/proc/self/status` (`VmRSS`)            |

use std::net::Ipv4Addr;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::proto::{NetworkInfo, ResourceInfo, SystemInfo};

const CPU_SAMPLE_WINDOW: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum SysInfoError {
    #[error("failed to run ip: {0}")]
    Command(#[from] std::io::Error),
    #[error("ip exited with {0}")]
    Status(String),
    #[error("unexpected ip output: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One interface as reported by `ip -j addr show`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkInfo {
    pub name: String,
    pub mac: String,
    /// IPv4 addresses with prefix length.
    pub addrs: Vec<(Ipv4Addr, u8)>,
}

/// Enumerate interfaces and their IPv4 addresses.
pub async fn collect_links() -> Result<Vec<LinkInfo>, SysInfoError> {
    let output = tokio::process::Command::new("ip")
        .args(["-j", "addr", "show"])
        .output()
        .await?;
    if !output.status.success() {
        return Err(SysInfoError::Status(output.status.to_string()));
    }
    parse_ip_json(&output.stdout)
}

/// Parse `ip -j addr show` output. Non-IPv4 addresses are skipped.
pub fn parse_ip_json(raw: &[u8]) -> Result<Vec<LinkInfo>, SysInfoError> {
    let json: Vec<Value> = serde_json::from_slice(raw)?;
    let mut links = Vec::with_capacity(json.len());

    for iface in &json {
        let name = iface["ifname"].as_str().unwrap_or("");
        if name.is_empty() {
            continue;
        }
        let mac = iface["address"].as_str().unwrap_or("");

        let addrs = iface["addr_info"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter(|a| a["family"].as_str().unwrap_or("inet") == "inet")
                    .filter_map(|a| {
                        let local: Ipv4Addr = a["local"].as_str()?.parse().ok()?;
                        let prefix = u8::try_from(a["prefixlen"].as_u64()?).ok()?;
                        (prefix <= 32).then_some((local, prefix))
                    })
                    .collect()
            })
            .unwrap_or_default();

        links.push(LinkInfo {
            name: name.to_string(),
            mac: mac.to_string(),
            addrs,
        });
    }

    Ok(links)
}

/// Reportable IPv4 interfaces: loopback and filtered name prefixes are skipped.
pub fn network_infos(links: &[LinkInfo], filter_prefixes: &[String]) -> Vec<NetworkInfo> {
    links
        .iter()
        .filter(|link| link.name != "lo")
        .filter(|link| !filter_prefixes.iter().any(|p| !p.is_empty() && link.name.starts_with(p.as_str())))
        .flat_map(|link| {
            link.addrs.iter().filter(|(ip, _)| !ip.is_loopback()).map(move |&(ip, prefix)| {
                let mask = prefix_mask(prefix);
                let net = Ipv4Addr::from(u32::from(ip) & u32::from(mask));
                NetworkInfo {
                    network: link.name.clone(),
                    ip: ip.to_string(),
                    net: format!("{net}/{prefix}"),
                    mask: mask.to_string(),
                }
            })
        })
        .collect()
}

/// `(ip, mac)` of the named interface; empty strings when it is absent.
pub fn primary_address(links: &[LinkInfo], name: &str) -> (String, String) {
    links
        .iter()
        .find(|link| link.name == name)
        .map(|link| {
            let ip = link.addrs.first().map(|(ip, _)| ip.to_string()).unwrap_or_default();
            (ip, link.mac.clone())
        })
        .unwrap_or_default()
}

fn prefix_mask(prefix: u8) -> Ipv4Addr {
    let bits = match prefix {
        0 => 0,
        p if p >= 32 => u32::MAX,
        p => u32::MAX << (32 - u32::from(p)),
    };
    Ipv4Addr::from(bits)
}

fn read_proc_file(path: &str) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

pub fn system_info() -> SystemInfo {
    SystemInfo {
        hostname: read_proc_file("/proc/sys/kernel/hostname").trim().to_string(),
        distribution: parse_os_release(&read_proc_file("/etc/os-release")),
        kernel: read_proc_file("/proc/sys/kernel/osrelease").trim().to_string(),
        arch: std::env::consts::ARCH.to_string(),
        boot_time: parse_btime(&read_proc_file("/proc/stat")),
    }
}

fn parse_os_release(content: &str) -> String {
    content
        .lines()
        .find_map(|line| line.strip_prefix("PRETTY_NAME="))
        .map(|v| v.trim().trim_matches('"').to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn parse_btime(stat: &str) -> u64 {
    stat.lines()
        .find_map(|line| line.strip_prefix("btime "))
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

/// `(busy, total)` jiffies from the aggregate `cpu` line of `/proc/stat`.
fn parse_cpu_times(stat: &str) -> Option<(u64, u64)> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let total: u64 = fields.iter().sum();
    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some((total - idle, total))
}

/// Parse `MemTotal` and `MemAvailable` from `/proc/meminfo`, in kB.
fn parse_meminfo(meminfo: &str) -> (u64, u64) {
    let mut total = 0u64;
    let mut available = 0u64;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = parse_kb_value(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = parse_kb_value(rest);
        }
    }
    (total, available)
}

fn parse_kb_value(s: &str) -> u64 {
    s.split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn parse_vm_rss(status: &str) -> u64 {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .map_or(0, parse_kb_value)
        * 1024
}

#[allow(clippy::cast_precision_loss)]
fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

/// `(total_bytes, used_bytes)` of the filesystem holding `path`.
fn disk_usage(path: &str) -> Option<(u64, u64)> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;

    let c_path = CString::new(path).ok()?;
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();

    // SAFETY: statvfs is a standard POSIX call, we pass a valid C string
    // and a pointer to uninitialized but properly aligned memory.
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if ret != 0 {
        return None;
    }

    // SAFETY: statvfs returned 0, so stat is fully initialized.
    let stat = unsafe { stat.assume_init() };

    #[allow(clippy::unnecessary_cast)]
    let block_size = stat.f_frsize as u64;
    #[allow(clippy::unnecessary_cast)]
    let total = stat.f_blocks as u64 * block_size;
    #[allow(clippy::unnecessary_cast)]
    let free = stat.f_bfree as u64 * block_size;
    Some((total, total.saturating_sub(free)))
}

/// Sample CPU, memory and disk usage. Takes about `CPU_SAMPLE_WINDOW`.
pub async fn resource_info(node_path: &str) -> ResourceInfo {
    let before = parse_cpu_times(&read_proc_file("/proc/stat"));
    tokio::time::sleep(CPU_SAMPLE_WINDOW).await;
    let after = parse_cpu_times(&read_proc_file("/proc/stat"));
    let cpu_use_rate = match (before, after) {
        (Some((busy0, total0)), Some((busy1, total1))) => {
            percent(busy1.saturating_sub(busy0), total1.saturating_sub(total0))
        }
        _ => 0.0,
    };

    let (mem_total_kb, mem_available_kb) = parse_meminfo(&read_proc_file("/proc/meminfo"));
    let (disk_total, disk_used) = disk_usage(node_path).unwrap_or((0, 0));

    ResourceInfo {
        cpu_count: std::thread::available_parallelism()
            .map_or(1, |n| u32::try_from(n.get()).unwrap_or(u32::MAX)),
        cpu_use_rate,
        mem_total: mem_total_kb * 1024,
        mem_use_rate: percent(mem_total_kb.saturating_sub(mem_available_kb), mem_total_kb),
        disk_total,
        disk_use_rate: percent(disk_used, disk_total),
        node_path: node_path.to_string(),
        node_resource_occupancy: parse_vm_rss(&read_proc_file("/proc/self/status")),
    }
}
