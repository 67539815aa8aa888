//! Reverse-DNS enrichment with a TTL-based cache.
//!
//! Lookups that fail (no PTR record, timeout, etc.) are cached as `None` to
//! prevent repeated queries for non-resolvable addresses. Enabled by the
//! `resolve_dns` setting; the datapath never waits on DNS for a verdict —
//! hostnames only decorate connection records.

use dashmap::DashMap;
use std::net::IpAddr;
use tokio::time::{Duration, Instant};

struct CacheEntry {
    hostname: Option<String>,
    expires_at: Instant,
}

pub struct DnsCache {
    cache: DashMap<IpAddr, CacheEntry>,
    ttl: Duration,
    timeout: Duration,
}

impl DnsCache {
    /// * `ttl` -- how long a successful (or failed) lookup is kept.
    /// * `timeout` -- max wall-clock time for a single DNS query.
    pub fn new(ttl: Duration, timeout: Duration) -> Self {
        Self {
            cache: DashMap::new(),
            ttl,
            timeout,
        }
    }

    /// Resolve an address to a hostname, consulting the cache first.
    ///
    /// Returns `None` when the address cannot be resolved or the lookup
    /// times out. Results (including failures) are cached.
    pub async fn resolve(&self, ip: IpAddr) -> Option<String> {
        if let Some(entry) = self.cache.get(&ip) {
            if Instant::now() < entry.expires_at {
                return entry.hostname.clone();
            }
        }

        // The resolver is blocking; run it off the async workers with a
        // timeout to prevent stalls.
        let result = tokio::time::timeout(self.timeout, async move {
            tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&ip).ok())
                .await
                .unwrap_or(None)
        })
        .await
        .unwrap_or(None);

        // A hostname that is just the address echoed back is a failed lookup.
        let hostname = result.filter(|h| h != &ip.to_string());

        self.cache.insert(
            ip,
            CacheEntry {
                hostname: hostname.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );

        hostname
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cache_stores_result() {
        let cache = DnsCache::new(Duration::from_secs(300), Duration::from_secs(2));

        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let first = cache.resolve(ip).await;
        // Whether it resolves or not, a second call must return the cached value.
        let second = cache.resolve(ip).await;
        assert_eq!(first, second);
        assert_eq!(cache.cache.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_lookup_is_cached() {
        let cache = DnsCache::new(Duration::from_secs(300), Duration::from_secs(2));

        // RFC 5737 TEST-NET: 192.0.2.1 has no PTR record on any real resolver.
        let ip: IpAddr = "192.0.2.1".parse().unwrap();
        let result = cache.resolve(ip).await;
        assert_eq!(result, None);
        assert!(cache.cache.contains_key(&ip));
    }
}
