//! The verdict pipeline: parse, classify, cache-probe, enrich, decide, emit.
//!
//! Every queued packet runs this once on its own task. Exactly one mark is
//! submitted per packet; the record's latch enforces it.

use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::cache::VerdictCache;
use crate::dns::DnsCache;
use crate::geoip::GeoResolver;
use crate::marks;
use crate::packet::{self, Direction, FlowKey, PacketMeta, PacketRecord};
use crate::proc::{ProcTable, ProcessInfo};
use crate::proto;
use crate::state::{ConnectionRecord, ConnectionRegistry, UNATTRIBUTED};

/// Everything the decision function gets to see about a flow.
pub struct FlowContext<'a> {
    pub meta: &'a PacketMeta,
    pub direction: Direction,
    pub country: String,
    pub asn: u32,
    pub organization: String,
    pub process: Option<ProcessInfo>,
}

/// The pluggable rule-evaluation policy. Returns the mark to emit.
pub type DecisionFn = Arc<dyn Fn(&FlowContext) -> u32 + Send + Sync>;

/// Default policy: accept and remember every flow.
pub fn accept_always(_ctx: &FlowContext) -> u32 {
    marks::ACCEPT_ALWAYS
}

pub struct Pipeline {
    geo: Arc<GeoResolver>,
    procs: Arc<ProcTable>,
    verdicts: Arc<VerdictCache>,
    registry: Arc<ConnectionRegistry>,
    decision: DecisionFn,
    dns: Option<Arc<DnsCache>>,
}

impl Pipeline {
    pub fn new(
        geo: Arc<GeoResolver>,
        procs: Arc<ProcTable>,
        verdicts: Arc<VerdictCache>,
        registry: Arc<ConnectionRegistry>,
        decision: DecisionFn,
        dns: Option<Arc<DnsCache>>,
    ) -> Self {
        Self {
            geo,
            procs,
            verdicts,
            registry,
            decision,
            dns,
        }
    }

    pub async fn process(&self, mut record: PacketRecord) {
        self.registry.total_packets.fetch_add(1, Ordering::Relaxed);

        let Some(meta) = packet::parse_packet(&record.data) else {
            // Not IPv4/IPv6 (or too short to tell): wave it through unclassified.
            debug!(pkt = record.id, family = %record.family, "unparseable datagram, accepting");
            if let Err(e) = record.submit(marks::ACCEPT) {
                error!(pkt = record.id, error = %e, "verdict submission failed");
            }
            return;
        };

        let direction = packet::classify(meta.src, meta.dst);
        record.meta = Some(meta.clone());
        let key = FlowKey::from_meta(&meta);

        if let Some(mark) = self.verdicts.get(&key) {
            debug!(
                pkt = record.id,
                verdict = marks::describe(mark),
                "verdict cache hit"
            );
            if let Err(e) = record.submit(mark) {
                error!(
                    pkt = record.id,
                    flow = %record.flow_summary(),
                    error = %e,
                    "verdict submission failed"
                );
            }
            return;
        }

        // Enrichment never blocks the verdict: failures degrade to sentinels.
        let remote = remote_endpoint(direction, &meta);
        let country = self.geo.lookup_country(remote);
        let (asn, organization) = self.geo.lookup_asn(remote);
        let process = self.attribute(direction, &meta).await;

        let ctx = FlowContext {
            meta: &meta,
            direction,
            country,
            asn,
            organization,
            process,
        };
        let mark = (self.decision)(&ctx);
        debug_assert!(marks::DEFINED.contains(&mark), "undefined mark {mark}");

        let process_name = ctx
            .process
            .as_ref()
            .map(|p| p.name.clone())
            .unwrap_or_else(|| UNATTRIBUTED.to_string());
        info!(
            pkt = record.id,
            src = %meta.src,
            src_port = meta.src_port,
            dst = %meta.dst,
            dst_port = meta.dst_port,
            proto = proto::name(meta.protocol),
            direction = ?direction,
            country = %ctx.country,
            asn = ctx.asn,
            org = %ctx.organization,
            process = %process_name,
            pid = ctx.process.as_ref().map(|p| p.pid).unwrap_or(0),
            icmp = ?meta.icmp,
            verdict = marks::describe(mark),
            sticky = marks::is_sticky(mark),
            "flow decided"
        );

        if let Err(e) = record.submit(mark) {
            error!(
                pkt = record.id,
                flow = %record.flow_summary(),
                mark,
                error = %e,
                "verdict submission failed"
            );
        }
        self.verdicts.insert(key.clone(), mark);

        let hostname = match &self.dns {
            Some(dns) => dns.resolve(remote).await,
            None => None,
        };
        let FlowContext {
            country,
            asn,
            organization,
            ..
        } = ctx;
        let first_seen = record.seen_at.timestamp_millis();
        self.registry.record(&process_name, key, move || {
            ConnectionRecord::new(
                format!("{}:{}", meta.src, meta.src_port),
                format!("{}:{}", meta.dst, meta.dst_port),
                proto::name(meta.protocol).to_string(),
                country,
                asn,
                organization,
                direction,
                hostname,
                first_seen,
            )
        });
    }

    /// Attribute the local endpoint of the flow to its owning process. The
    /// /proc scan is blocking I/O, so it runs off the async workers.
    async fn attribute(&self, direction: Direction, meta: &PacketMeta) -> Option<ProcessInfo> {
        let (local_ip, local_port) = local_endpoint(direction, meta);
        let procs = self.procs.clone();
        let protocol = meta.protocol;
        let result = tokio::task::spawn_blocking(move || procs.lookup(local_ip, local_port, protocol))
            .await
            .ok()?;
        match result {
            Ok(info) => Some(info),
            Err(e) => {
                debug!(error = %e, "process attribution failed");
                None
            }
        }
    }
}

/// The endpoint used for geo/ASN lookup: the non-local one. Lateral flows
/// have no remote side; the destination stands in.
fn remote_endpoint(direction: Direction, meta: &PacketMeta) -> IpAddr {
    match direction {
        Direction::Inbound => meta.src,
        Direction::Outbound | Direction::Lateral => meta.dst,
    }
}

/// The endpoint the socket tables know about: ours. Inbound flows invert
/// the tuple, so pick by direction rather than assuming the source.
fn local_endpoint(direction: Direction, meta: &PacketMeta) -> (IpAddr, u16) {
    match direction {
        Direction::Inbound => (meta.dst, meta.dst_port),
        Direction::Outbound | Direction::Lateral => (meta.src, meta.src_port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> PacketMeta {
        PacketMeta {
            src: "192.168.1.10".parse().unwrap(),
            dst: "93.184.216.34".parse().unwrap(),
            protocol: 6,
            src_port: 54321,
            dst_port: 443,
            icmp: None,
        }
    }

    #[test]
    fn test_remote_endpoint_follows_direction() {
        let m = meta();
        assert_eq!(remote_endpoint(Direction::Outbound, &m), m.dst);
        assert_eq!(remote_endpoint(Direction::Inbound, &m), m.src);
        assert_eq!(remote_endpoint(Direction::Lateral, &m), m.dst);
    }

    #[test]
    fn test_local_endpoint_inverts_for_inbound() {
        let m = meta();
        assert_eq!(local_endpoint(Direction::Outbound, &m), (m.src, 54321));
        assert_eq!(local_endpoint(Direction::Inbound, &m), (m.dst, 443));
    }

    #[test]
    fn test_default_policy_is_sticky_accept() {
        let m = meta();
        let ctx = FlowContext {
            meta: &m,
            direction: Direction::Outbound,
            country: "US".into(),
            asn: 15133,
            organization: "FASTLY".into(),
            process: None,
        };
        let mark = accept_always(&ctx);
        assert_eq!(mark, marks::ACCEPT_ALWAYS);
        assert!(marks::is_sticky(mark));
    }
}
