//! Connection-to-process attribution via /proc.
//!
//! The kernel's per-protocol connection tables give us the socket inode for
//! a (local address, port) pair; a scan over every process's fd links then
//! maps the inode to its owner. The scan is O(processes x fds), so results
//! are cached by inode — combined with the verdict cache this runs once per
//! new flow, not per packet.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use anyhow::{anyhow, bail, Context, Result};
use dashmap::DashMap;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: i32,
    pub name: String,
}

struct CachedProcess {
    pid: i32,
    name: String,
    updated_at: Instant,
}

pub struct ProcTable {
    cache: DashMap<u64, CachedProcess>,
    ttl: Duration,
}

impl ProcTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: DashMap::new(),
            ttl,
        }
    }

    /// Resolve the process owning the socket bound to `ip:port`.
    ///
    /// Any I/O or lookup failure surfaces as an error; callers treat it as
    /// enrichment failure, never as a pipeline failure.
    pub fn lookup(&self, ip: IpAddr, port: u16, protocol: u8) -> Result<ProcessInfo> {
        let table = table_path(ip.is_ipv6(), protocol)?;
        let content = fs::read_to_string(table).with_context(|| format!("reading {table}"))?;
        let inode = find_socket_inode(&content, ip, port)
            .ok_or_else(|| anyhow!("no socket matching {ip}:{port} in {table}"))?;

        if let Some(entry) = self.cache.get(&inode) {
            if Instant::now().duration_since(entry.updated_at) < self.ttl {
                return Ok(ProcessInfo {
                    pid: entry.pid,
                    name: entry.name.clone(),
                });
            }
        }

        let info = scan_for_inode(inode)?;
        self.cache.insert(
            inode,
            CachedProcess {
                pid: info.pid,
                name: info.name.clone(),
                updated_at: Instant::now(),
            },
        );
        Ok(info)
    }

    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.cache.len();
        self.cache
            .retain(|_, entry| now.duration_since(entry.updated_at) < self.ttl);
        before - self.cache.len()
    }
}

fn table_path(v6: bool, protocol: u8) -> Result<&'static str> {
    match (v6, protocol) {
        (false, 6) => Ok("/proc/net/tcp"),
        (false, 17) => Ok("/proc/net/udp"),
        (true, 6) => Ok("/proc/net/tcp6"),
        (true, 17) => Ok("/proc/net/udp6"),
        _ => bail!("unsupported protocol for attribution: {protocol}"),
    }
}

/// Scan a /proc/net table for a row whose local endpoint matches, returning
/// its socket inode (column 10).
fn find_socket_inode(content: &str, ip: IpAddr, port: u16) -> Option<u64> {
    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        let Some((addr, local_port)) = parse_local_column(fields[1], ip.is_ipv6()) else {
            continue;
        };
        if addr == ip && local_port == port {
            return fields[9].parse().ok();
        }
    }
    None
}

/// Split a "HEXADDR:HEXPORT" local_address column.
fn parse_local_column(column: &str, v6: bool) -> Option<(IpAddr, u16)> {
    let (addr_hex, port_hex) = column.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    let addr = if v6 {
        IpAddr::V6(parse_hex_ipv6(addr_hex)?)
    } else {
        IpAddr::V4(parse_hex_ipv4(addr_hex)?)
    };
    Some((addr, port))
}

/// /proc/net stores IPv4 addresses as one native-endian u32 printed in hex:
/// "0100007F" is 127.0.0.1.
fn parse_hex_ipv4(hex: &str) -> Option<Ipv4Addr> {
    if hex.len() != 8 {
        return None;
    }
    let raw = u32::from_str_radix(hex, 16).ok()?;
    Some(Ipv4Addr::from(raw.swap_bytes()))
}

/// IPv6 addresses are four native-endian u32 words in network word order.
fn parse_hex_ipv6(hex: &str) -> Option<Ipv6Addr> {
    if hex.len() != 32 {
        return None;
    }
    let mut octets = [0u8; 16];
    for i in 0..4 {
        let word = u32::from_str_radix(&hex[i * 8..(i + 1) * 8], 16)
            .ok()?
            .swap_bytes();
        octets[i * 4..(i + 1) * 4].copy_from_slice(&word.to_be_bytes());
    }
    Some(Ipv6Addr::from(octets))
}

/// Walk every process's fd links looking for `socket:[inode]`, then read the
/// owner's comm for its short name.
fn scan_for_inode(inode: u64) -> Result<ProcessInfo> {
    let needle = format!("socket:[{inode}]");
    for entry in fs::read_dir("/proc").context("reading /proc")?.flatten() {
        let name = entry.file_name();
        let Ok(pid) = name.to_string_lossy().parse::<i32>() else {
            continue;
        };
        let fd_dir = match fs::read_dir(entry.path().join("fd")) {
            Ok(dir) => dir,
            Err(_) => continue, // permission or raced exit
        };
        for fd in fd_dir.flatten() {
            let Ok(target) = fs::read_link(fd.path()) else {
                continue;
            };
            if target.to_string_lossy().contains(&needle) {
                let comm = fs::read_to_string(entry.path().join("comm"))
                    .with_context(|| format!("reading comm of pid {pid}"))?;
                return Ok(ProcessInfo {
                    pid,
                    name: comm.trim().to_string(),
                });
            }
        }
    }
    bail!("no process owns socket inode {inode}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_ipv4_round_trip() {
        assert_eq!(parse_hex_ipv4("0100007F"), Some(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(
            parse_hex_ipv4("0101A8C0"),
            Some(Ipv4Addr::new(192, 168, 1, 1))
        );
        assert_eq!(parse_hex_ipv4("00000000"), Some(Ipv4Addr::new(0, 0, 0, 0)));
        assert_eq!(parse_hex_ipv4("007F"), None);
        assert_eq!(parse_hex_ipv4("ZZZZZZZZ"), None);
    }

    #[test]
    fn test_hex_ipv6_loopback() {
        let parsed = parse_hex_ipv6("00000000000000000000000001000000").unwrap();
        assert_eq!(parsed, "::1".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn test_local_column() {
        let (addr, port) = parse_local_column("0100007F:1F90", false).unwrap();
        assert_eq!(addr, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(port, 0x1f90);
        assert!(parse_local_column("garbage", false).is_none());
    }

    #[test]
    fn test_table_selection() {
        assert_eq!(table_path(false, 6).unwrap(), "/proc/net/tcp");
        assert_eq!(table_path(false, 17).unwrap(), "/proc/net/udp");
        assert_eq!(table_path(true, 6).unwrap(), "/proc/net/tcp6");
        assert_eq!(table_path(true, 17).unwrap(), "/proc/net/udp6");
        assert!(table_path(false, 1).is_err());
    }

    #[test]
    fn test_find_socket_inode() {
        let table = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n   \
            0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345 1 0000000000000000 100 0 0 10 0\n   \
            1: 0101A8C0:0050 22D8B85D:01BB 01 00000000:00000000 00:00000000 00000000  1000        0 67890 1 0000000000000000 100 0 0 10 0\n";
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(find_socket_inode(table, ip, 0x1f90), Some(12345));
        let ip: IpAddr = "192.168.1.1".parse().unwrap();
        assert_eq!(find_socket_inode(table, ip, 80), Some(67890));
        assert_eq!(find_socket_inode(table, ip, 81), None);
    }

    #[test]
    fn test_cache_eviction() {
        let table = ProcTable::new(Duration::from_millis(10));
        table.cache.insert(
            42,
            CachedProcess {
                pid: 1234,
                name: "firefox".into(),
                updated_at: Instant::now(),
            },
        );
        assert_eq!(table.evict_expired(), 0);
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(table.evict_expired(), 1);
    }
}
