//! TTL-bounded verdict cache.
//!
//! Guarantees a stable mark per flow for the lifetime of an entry: a lookup
//! only returns entries whose expiry lies in the future, so an expired entry
//! is indistinguishable from an absent one.

use dashmap::DashMap;
use tokio::time::{Duration, Instant};

use crate::packet::FlowKey;

struct CachedVerdict {
    mark: u32,
    expires_at: Instant,
}

pub struct VerdictCache {
    entries: DashMap<FlowKey, CachedVerdict>,
    ttl: Duration,
}

impl VerdictCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, key: &FlowKey) -> Option<u32> {
        let entry = self.entries.get(key)?;
        if Instant::now() < entry.expires_at {
            Some(entry.mark)
        } else {
            None
        }
    }

    pub fn insert(&self, key: FlowKey, mark: u32) {
        self.entries.insert(
            key,
            CachedVerdict {
                mark,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, v| now < v.expires_at);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
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

    #[test]
    fn test_hit_within_ttl() {
        let cache = VerdictCache::new(Duration::from_secs(300));
        cache.insert(key(54321), crate::marks::ACCEPT_ALWAYS);
        assert_eq!(cache.get(&key(54321)), Some(crate::marks::ACCEPT_ALWAYS));
        assert_eq!(cache.get(&key(54322)), None);
    }

    #[test]
    fn test_expired_entry_is_absent() {
        let cache = VerdictCache::new(Duration::from_millis(10));
        cache.insert(key(1), crate::marks::DROP_ALWAYS);
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(cache.get(&key(1)), None);
        assert_eq!(cache.len(), 1); // still resident until eviction runs
        assert_eq!(cache.evict_expired(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_reinsert_refreshes_mark() {
        let cache = VerdictCache::new(Duration::from_secs(300));
        cache.insert(key(9), crate::marks::ACCEPT_ALWAYS);
        cache.insert(key(9), crate::marks::BLOCK_ALWAYS);
        assert_eq!(cache.get(&key(9)), Some(crate::marks::BLOCK_ALWAYS));
        assert_eq!(cache.len(), 1);
    }
}
