//! Resilient resolution: TTL cache → DoT over the upstream pool → DoH
//! cascade → hard-coded fallbacks.

mod cache;
mod doh;
mod dot;
mod pool;

pub use pool::{DnsConfig, DnsPool, Upstream};

use std::net::IpAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use hickory_resolver::TokioResolver;
use tracing::debug;

use crate::error::DnsError;
use cache::TtlCache;

const CACHE_TTL: Duration = Duration::from_secs(60 * 60);

pub(crate) struct ResolverInner {
    pub(crate) pool: DnsPool,
    cache: TtlCache,
    system: TokioResolver,
    pub(crate) first_fragment_len: u8,
    doh: OnceLock<doh::DohClient>,
}

impl ResolverInner {
    /// Resolution for the DoH servers themselves: cache first, then the
    /// system resolver. Never recurses into the pool.
    pub(crate) async fn lookup_cached_system(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        if let Some(addrs) = self.cache.get(host) {
            return Ok(addrs);
        }
        let addrs: Vec<IpAddr> = self.system.lookup_ip(host).await?.iter().collect();
        if addrs.is_empty() {
            return Err(DnsError::EmptyHostAddress);
        }
        self.cache.set(host, addrs.clone());
        Ok(addrs)
    }
}

/// Shared handle over the pool, cache, and system resolver.
#[derive(Clone)]
pub struct Resolver {
    inner: Arc<ResolverInner>,
}

impl Resolver {
    /// Resolver over the built-in pool matching this host's connectivity.
    pub fn new(first_fragment_len: u8) -> Result<Self, DnsError> {
        Self::with_pool(DnsPool::builtin(), first_fragment_len)
    }

    pub fn with_pool(pool: DnsPool, first_fragment_len: u8) -> Result<Self, DnsError> {
        let system = TokioResolver::builder_tokio()?.build();
        let inner = Arc::new(ResolverInner {
            pool,
            cache: TtlCache::new(CACHE_TTL),
            system,
            first_fragment_len,
            doh: OnceLock::new(),
        });
        let client = doh::client(Arc::clone(&inner));
        let _ = inner.doh.set(client);
        Ok(Self { inner })
    }

    pub fn pool(&self) -> &DnsPool {
        &self.inner.pool
    }

    /// The full cascade: cache, DoT resolver path, DoH, fallback map.
    /// Successful answers populate the cache for an hour.
    pub async fn lookup_host(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        if let Some(addrs) = self.inner.cache.get(host) {
            return Ok(addrs);
        }
        let addrs = match dot::lookup(&self.inner.pool, host, self.inner.first_fragment_len).await
        {
            Ok(addrs) => addrs,
            Err(err) => {
                debug!(%host, %err, "DoT resolution failed, trying DoH cascade");
                doh::cascade(&self.inner, host).await?
            }
        };
        self.inner.cache.set(host, addrs.clone());
        Ok(addrs)
    }

    /// Plain system resolution, uncached. Used by the `system` DNS mode,
    /// which keeps the frag-TLS handshake but not the pool.
    pub async fn lookup_system(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let addrs: Vec<IpAddr> = self.inner.system.lookup_ip(host).await?.iter().collect();
        if addrs.is_empty() {
            return Err(DnsError::EmptyHostAddress);
        }
        Ok(addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ip_literals_short_circuit_resolution() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let resolver = Resolver::with_pool(DnsPool::new(), 3).unwrap();
        assert_eq!(
            resolver.lookup_host("192.0.2.7").await.unwrap(),
            vec!["192.0.2.7".parse::<IpAddr>().unwrap()]
        );
        assert_eq!(
            resolver.lookup_system("2001:db8::1").await.unwrap(),
            vec!["2001:db8::1".parse::<IpAddr>().unwrap()]
        );
    }

    #[tokio::test]
    async fn empty_pool_falls_through_to_fallback_map() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let pool = DnsPool::new();
        let mut fallbacks = std::collections::HashMap::new();
        fallbacks.insert(
            "blocked.example".to_owned(),
            vec!["203.0.113.9".parse().unwrap()],
        );
        pool.add(&DnsConfig {
            servers: std::collections::HashMap::new(),
            fallbacks,
        })
        .await;

        let resolver = Resolver::with_pool(pool, 3).unwrap();
        assert_eq!(
            resolver.lookup_host("blocked.example").await.unwrap(),
            vec!["203.0.113.9".parse::<IpAddr>().unwrap()]
        );
        assert!(matches!(
            resolver.lookup_host("unlisted.example").await,
            Err(DnsError::NoDnsAvailable)
        ));
    }
}
