//! In-memory connection registry backing the inspection endpoint.
//!
//! Flows are grouped by owning process short-name; within a process they are
//! keyed by 5-tuple so repeat decisions touch the existing record instead of
//! duplicating it. Entries age out on the maintenance timer.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::{Duration, Instant};

use crate::packet::{Direction, FlowKey};

/// Process bucket for flows with no attributed owner.
pub const UNATTRIBUTED: &str = "unknown";

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionRecord {
    pub source: String,
    pub destination: String,
    pub protocol: String,
    pub country: String,
    pub asn: u32,
    pub organization: String,
    pub direction: Direction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Millisecond epoch timestamp of the first decision for this flow.
    pub first_seen: i64,
    #[serde(skip)]
    last_seen: Instant,
}

impl ConnectionRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: String,
        destination: String,
        protocol: String,
        country: String,
        asn: u32,
        organization: String,
        direction: Direction,
        hostname: Option<String>,
        first_seen: i64,
    ) -> Self {
        Self {
            source,
            destination,
            protocol,
            country,
            asn,
            organization,
            direction,
            hostname,
            first_seen,
            last_seen: Instant::now(),
        }
    }
}

pub struct ConnectionRegistry {
    connections: DashMap<String, HashMap<FlowKey, ConnectionRecord>>,
    pub total_packets: AtomicU64,
    pub decisions: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            total_packets: AtomicU64::new(0),
            decisions: AtomicU64::new(0),
        }
    }

    /// Record a freshly decided flow under its owning process. A repeat
    /// decision for the same tuple only refreshes the record's age.
    pub fn record(&self, process: &str, key: FlowKey, make: impl FnOnce() -> ConnectionRecord) {
        self.decisions.fetch_add(1, Ordering::Relaxed);
        let mut flows = self.connections.entry(process.to_string()).or_default();
        flows
            .entry(key)
            .and_modify(|record| record.last_seen = Instant::now())
            .or_insert_with(make);
    }

    /// Drop records not refreshed within `timeout`; empty process buckets go
    /// with them. Returns how many records were removed.
    pub fn cleanup_stale(&self, timeout: Duration) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.connections.retain(|_, flows| {
            let before = flows.len();
            flows.retain(|_, record| now.duration_since(record.last_seen) <= timeout);
            removed += before - flows.len();
            !flows.is_empty()
        });
        removed
    }

    pub fn tracked(&self) -> usize {
        self.connections.iter().map(|entry| entry.value().len()).sum()
    }

    /// Clone out the registry as process-name -> connection list.
    pub fn snapshot(&self) -> HashMap<String, Vec<ConnectionRecord>> {
        self.connections
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().values().cloned().collect()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn key(src_port: u16) -> FlowKey {
        FlowKey {
            src: "192.168.1.10".parse::<IpAddr>().unwrap(),
            src_port,
            dst: "93.184.216.34".parse::<IpAddr>().unwrap(),
            dst_port: 443,
            protocol: 6,
        }
    }

    fn record() -> ConnectionRecord {
        ConnectionRecord::new(
            "192.168.1.10:54321".into(),
            "93.184.216.34:443".into(),
            "TCP".into(),
            "US".into(),
            15133,
            "FASTLY".into(),
            Direction::Outbound,
            None,
            chrono::Utc::now().timestamp_millis(),
        )
    }

    #[test]
    fn test_repeat_decision_keeps_one_record() {
        let registry = ConnectionRegistry::new();
        registry.record("firefox", key(54321), record);
        registry.record("firefox", key(54321), record);
        registry.record("firefox", key(54322), record);
        assert_eq!(registry.tracked(), 2);
        assert_eq!(registry.decisions.load(Ordering::Relaxed), 3);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot["firefox"].len(), 2);
    }

    #[test]
    fn test_grouping_by_process() {
        let registry = ConnectionRegistry::new();
        registry.record("firefox", key(1), record);
        registry.record(UNATTRIBUTED, key(2), record);
        let snapshot = registry.snapshot();
        assert!(snapshot.contains_key("firefox"));
        assert!(snapshot.contains_key(UNATTRIBUTED));
    }

    #[test]
    fn test_cleanup_drops_stale_and_empty_buckets() {
        let registry = ConnectionRegistry::new();
        registry.record("curl", key(7), record);
        std::thread::sleep(std::time::Duration::from_millis(15));
        assert_eq!(registry.cleanup_stale(Duration::from_millis(1)), 1);
        assert_eq!(registry.tracked(), 0);
        assert!(registry.snapshot().is_empty());
    }
}
