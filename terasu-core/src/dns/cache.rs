use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Resolution cache with a single pool-wide TTL. No per-entry negotiation:
/// every hit is served for the full hour regardless of upstream TTLs.
pub struct TtlCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

struct CacheEntry {
    stored_at: Instant,
    addrs: Vec<IpAddr>,
}

impl TtlCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, host: &str) -> Option<Vec<IpAddr>> {
        let mut entries = self.entries.lock().expect("dns cache lock poisoned");
        match entries.get(host) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.addrs.clone()),
            Some(_) => {
                entries.remove(host);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, host: &str, addrs: Vec<IpAddr>) {
        let mut entries = self.entries.lock().expect("dns cache lock poisoned");
        entries.insert(
            host.to_owned(),
            CacheEntry {
                stored_at: Instant::now(),
                addrs,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_within_ttl_is_stable() {
        let cache = TtlCache::new(Duration::from_secs(3600));
        let addrs = vec!["1.2.3.4".parse().unwrap()];
        cache.set("example.com", addrs.clone());
        assert_eq!(cache.get("example.com"), Some(addrs.clone()));
        assert_eq!(cache.get("example.com"), Some(addrs));
        assert_eq!(cache.get("other.org"), None);
    }

    #[test]
    fn expired_entry_is_evicted() {
        let cache = TtlCache::new(Duration::from_millis(10));
        cache.set("example.com", vec!["1.2.3.4".parse().unwrap()]);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get("example.com"), None);
    }
}
