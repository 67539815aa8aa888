//! Packet records, header parsing, and the single-shot verdict latch.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;

use anyhow::{anyhow, Result};
use serde::Serialize;

/// Address family a queue worker is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Family::V4 => write!(f, "v4"),
            Family::V6 => write!(f, "v6"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
    Lateral,
}

/// Parsed L3/L4 header fields of a queued datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketMeta {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: u8,
    pub src_port: u16,
    pub dst_port: u16,
    /// ICMP / ICMPv6 type and code, when the transport is one of those.
    pub icmp: Option<(u8, u8)>,
}

/// The 5-tuple a verdict is cached under. No ordering is assumed on the
/// address fields; the tuple is used verbatim as a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src: IpAddr,
    pub src_port: u16,
    pub dst: IpAddr,
    pub dst_port: u16,
    pub protocol: u8,
}

impl FlowKey {
    pub fn from_meta(meta: &PacketMeta) -> Self {
        Self {
            src: meta.src,
            src_port: meta.src_port,
            dst: meta.dst,
            dst_port: meta.dst_port,
            protocol: meta.protocol,
        }
    }
}

/// Parse the L3 and L4 headers of a raw datagram.
///
/// Returns `None` when the version nibble is neither 4 nor 6, or when the
/// datagram is too short to carry the fixed L3 header — callers accept such
/// packets without classification. Transport headers that do not fit leave
/// the ports at 0.
pub fn parse_packet(data: &[u8]) -> Option<PacketMeta> {
    let version = data.first()? >> 4;
    let (src, dst, protocol, header_len) = match version {
        4 => {
            if data.len() < 20 {
                return None;
            }
            let header_len = ((data[0] & 0x0f) as usize) * 4;
            if header_len < 20 {
                return None;
            }
            let src = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
            let dst = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
            (IpAddr::V4(src), IpAddr::V4(dst), data[9], header_len)
        }
        6 => {
            if data.len() < 40 {
                return None;
            }
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&data[8..24]);
            dst.copy_from_slice(&data[24..40]);
            (
                IpAddr::V6(Ipv6Addr::from(src)),
                IpAddr::V6(Ipv6Addr::from(dst)),
                data[6],
                40,
            )
        }
        _ => return None,
    };

    let mut meta = PacketMeta {
        src,
        dst,
        protocol,
        src_port: 0,
        dst_port: 0,
        icmp: None,
    };

    match protocol {
        // TCP / UDP: ports are the first two big-endian u16s after the IP header.
        6 | 17 => {
            if data.len() >= header_len + 4 {
                meta.src_port = u16::from_be_bytes([data[header_len], data[header_len + 1]]);
                meta.dst_port = u16::from_be_bytes([data[header_len + 2], data[header_len + 3]]);
            }
        }
        // ICMP / ICMPv6: type and code.
        1 | 58 => {
            if data.len() >= header_len + 2 {
                meta.icmp = Some((data[header_len], data[header_len + 1]));
            }
        }
        _ => {}
    }

    Some(meta)
}

/// Whether an address belongs to this host's side of a flow: loopback,
/// link-local, RFC1918 (v4) or unique-local (v6). Interface enumeration is
/// deliberately not consulted.
pub fn is_host_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let seg0 = v6.segments()[0];
            v6.is_loopback() || (seg0 & 0xfe00) == 0xfc00 || (seg0 & 0xffc0) == 0xfe80
        }
    }
}

pub fn classify(src: IpAddr, dst: IpAddr) -> Direction {
    match (is_host_local(src), is_host_local(dst)) {
        (true, false) => Direction::Outbound,
        (false, true) => Direction::Inbound,
        _ => Direction::Lateral,
    }
}

/// Single state transition false -> true; the second attempt is an error.
pub(crate) struct VerdictLatch(AtomicBool);

impl VerdictLatch {
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn arm(&self) -> Result<()> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| anyhow!("verdict already set"))
    }
}

/// A verdict on its way back to the kernel, carried over the worker's
/// serializing channel to the thread that owns the socket.
pub struct VerdictRequest {
    pub msg: nfq::Message,
    pub mark: u32,
    pub summary: String,
}

/// The kernel-facing half of a packet record: the original queue message
/// plus the channel back to the socket owner.
pub struct ReplyHandle {
    pub(crate) msg: nfq::Message,
    pub(crate) tx: mpsc::Sender<VerdictRequest>,
}

/// One queued packet, alive from reception to verdict submission.
pub struct PacketRecord {
    pub id: u64,
    pub family: Family,
    pub data: Vec<u8>,
    pub seen_at: chrono::DateTime<chrono::Utc>,
    pub meta: Option<PacketMeta>,
    latch: VerdictLatch,
    reply: Option<ReplyHandle>,
}

impl PacketRecord {
    pub fn new(id: u64, family: Family, data: Vec<u8>, reply: ReplyHandle) -> Self {
        Self {
            id,
            family,
            data,
            seen_at: chrono::Utc::now(),
            meta: None,
            latch: VerdictLatch::new(),
            reply: Some(reply),
        }
    }

    /// A record with no kernel message behind it; `submit` only arms the latch.
    #[cfg(test)]
    pub fn detached(id: u64, family: Family, data: Vec<u8>) -> Self {
        Self {
            id,
            family,
            data,
            seen_at: chrono::Utc::now(),
            meta: None,
            latch: VerdictLatch::new(),
            reply: None,
        }
    }

    pub fn flow_summary(&self) -> String {
        match &self.meta {
            Some(m) => format!(
                "pkt:{} {}:{} -> {}:{}",
                self.id, m.src, m.src_port, m.dst, m.dst_port
            ),
            None => format!("pkt:{}", self.id),
        }
    }

    /// Submit the verdict mark for this packet. Exactly one submission is
    /// allowed per record; a second call returns "verdict already set"
    /// without touching the socket.
    pub fn submit(&mut self, mark: u32) -> Result<()> {
        self.latch.arm()?;
        if let Some(reply) = self.reply.take() {
            let summary = self.flow_summary();
            reply
                .tx
                .send(VerdictRequest {
                    msg: reply.msg,
                    mark,
                    summary,
                })
                .map_err(|_| anyhow!("verdict channel closed"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4_packet(protocol: u8, src: [u8; 4], dst: [u8; 4], l4: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0u8; 20];
        pkt[0] = 0x45; // version 4, IHL 5
        pkt[9] = protocol;
        pkt[12..16].copy_from_slice(&src);
        pkt[16..20].copy_from_slice(&dst);
        pkt.extend_from_slice(l4);
        pkt
    }

    fn v6_packet(next_header: u8, src: [u8; 16], dst: [u8; 16], l4: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0u8; 40];
        pkt[0] = 0x60;
        pkt[6] = next_header;
        pkt[8..24].copy_from_slice(&src);
        pkt[24..40].copy_from_slice(&dst);
        pkt.extend_from_slice(l4);
        pkt
    }

    #[test]
    fn test_parse_v4_tcp() {
        let l4 = [0xd4, 0x31, 0x01, 0xbb, 0, 0, 0, 0]; // 54321 -> 443
        let pkt = v4_packet(6, [192, 168, 1, 10], [93, 184, 216, 34], &l4);
        let meta = parse_packet(&pkt).unwrap();
        assert_eq!(meta.src, "192.168.1.10".parse::<IpAddr>().unwrap());
        assert_eq!(meta.dst, "93.184.216.34".parse::<IpAddr>().unwrap());
        assert_eq!(meta.protocol, 6);
        assert_eq!(meta.src_port, 54321);
        assert_eq!(meta.dst_port, 443);
        assert_eq!(meta.icmp, None);
    }

    #[test]
    fn test_parse_v4_udp_ports() {
        let l4 = [0x00, 0x35, 0xcf, 0x08]; // 53 -> 53000
        let pkt = v4_packet(17, [10, 0, 0, 1], [8, 8, 8, 8], &l4);
        let meta = parse_packet(&pkt).unwrap();
        assert_eq!(meta.src_port, 53);
        assert_eq!(meta.dst_port, 53000);
    }

    #[test]
    fn test_parse_v6_icmpv6() {
        let mut src = [0u8; 16];
        src[0] = 0xfe;
        src[1] = 0x80;
        src[15] = 1;
        let mut dst = [0u8; 16];
        dst[0] = 0xff;
        dst[1] = 0x02;
        dst[15] = 1;
        let pkt = v6_packet(58, src, dst, &[135, 0, 0, 0]); // neighbor solicitation
        let meta = parse_packet(&pkt).unwrap();
        assert_eq!(meta.protocol, 58);
        assert_eq!(meta.icmp, Some((135, 0)));
        assert_eq!(meta.src_port, 0);
        assert_eq!(meta.dst_port, 0);
    }

    #[test]
    fn test_truncated_v4_header_is_unparseable() {
        let mut pkt = v4_packet(6, [192, 168, 1, 10], [1, 2, 3, 4], &[]);
        pkt.truncate(19);
        assert!(parse_packet(&pkt).is_none());
    }

    #[test]
    fn test_v4_too_short_for_transport_falls_back_to_zero_ports() {
        // Well-formed IP header, two stray transport bytes.
        let pkt = v4_packet(6, [192, 168, 1, 10], [1, 2, 3, 4], &[0xff, 0xff]);
        let meta = parse_packet(&pkt).unwrap();
        assert_eq!(meta.src_port, 0);
        assert_eq!(meta.dst_port, 0);
    }

    #[test]
    fn test_unknown_version_nibble() {
        assert!(parse_packet(&[0x50; 64]).is_none());
        assert!(parse_packet(&[]).is_none());
    }

    #[test]
    fn test_bogus_ihl_is_unparseable() {
        let mut pkt = v4_packet(6, [10, 0, 0, 1], [10, 0, 0, 2], &[0; 8]);
        pkt[0] = 0x40; // version 4, IHL 0
        assert!(parse_packet(&pkt).is_none());
    }

    #[test]
    fn test_direction_classification() {
        let local: IpAddr = "192.168.1.10".parse().unwrap();
        let remote: IpAddr = "93.184.216.34".parse().unwrap();
        let peer: IpAddr = "10.0.0.7".parse().unwrap();
        assert_eq!(classify(local, remote), Direction::Outbound);
        assert_eq!(classify(remote, local), Direction::Inbound);
        assert_eq!(classify(local, peer), Direction::Lateral);
        assert_eq!(
            classify("8.8.8.8".parse().unwrap(), "1.1.1.1".parse().unwrap()),
            Direction::Lateral
        );
    }

    #[test]
    fn test_direction_v6() {
        let link_local: IpAddr = "fe80::1".parse().unwrap();
        let global: IpAddr = "2606:2800:220:1::1".parse().unwrap();
        let ula: IpAddr = "fd12:3456::1".parse().unwrap();
        assert_eq!(classify(link_local, global), Direction::Outbound);
        assert_eq!(classify(global, ula), Direction::Inbound);
        assert!(is_host_local("::1".parse().unwrap()));
    }

    #[test]
    fn test_latch_admits_one_transition() {
        let latch = VerdictLatch::new();
        assert!(latch.arm().is_ok());
        let err = latch.arm().unwrap_err();
        assert!(err.to_string().contains("verdict already set"));
    }

    #[test]
    fn test_detached_record_double_submit_fails() {
        let mut record = PacketRecord::detached(7, Family::V4, Vec::new());
        assert!(record.submit(crate::marks::ACCEPT_ALWAYS).is_ok());
        assert!(record.submit(crate::marks::ACCEPT).is_err());
    }

    #[test]
    fn test_flow_key_from_meta() {
        let pkt = v4_packet(6, [192, 168, 1, 10], [93, 184, 216, 34], &[0xd4, 0x31, 0x01, 0xbb]);
        let meta = parse_packet(&pkt).unwrap();
        let key = FlowKey::from_meta(&meta);
        assert_eq!(key.src_port, 54321);
        assert_eq!(key.dst_port, 443);
        assert_eq!(key.protocol, 6);
    }
}
