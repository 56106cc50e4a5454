//! Ordered DoT/DoH upstream pool with per-entry health state.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{is_transient_io, DnsError};
use crate::tls::{self, FragTlsStream};

/// Cooldown applied to an upstream that failed for a reason of its own.
const COOLDOWN: Duration = Duration::from_secs(60 * 60);

/// Default timeout for the TCP dial and TLS handshake to a DoT upstream.
const DEFAULT_DOT_TIMEOUT: Duration = Duration::from_secs(4);

/// ALPN offered on DoT channels.
const ALPN_DNS: &[u8] = b"dns";

/// Health of a single upstream. Sticky is terminal: an entry that answered
/// once is never disabled again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpstreamState {
    Enabled,
    DisabledUntil(Instant),
    Sticky,
}

/// One DoT endpoint (`host:port`) or DoH URL (`https://…`).
#[derive(Debug)]
pub struct Upstream {
    addr: String,
    state: Mutex<UpstreamState>,
}

impl Upstream {
    fn new(addr: String) -> Self {
        Self {
            addr,
            state: Mutex::new(UpstreamState::Enabled),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_doh(&self) -> bool {
        self.addr.starts_with("https://")
    }

    /// Whether the entry may be tried right now. A lapsed cooldown flips the
    /// entry back to enabled as a side effect.
    pub(crate) fn usable(&self) -> bool {
        let mut state = self.state.lock().expect("upstream state lock poisoned");
        match *state {
            UpstreamState::Enabled | UpstreamState::Sticky => true,
            UpstreamState::DisabledUntil(when) => {
                if Instant::now() >= when {
                    *state = UpstreamState::Enabled;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub(crate) fn mark_sticky(&self) {
        let mut state = self.state.lock().expect("upstream state lock poisoned");
        *state = UpstreamState::Sticky;
    }

    /// Disables the entry for the cooldown period. Sticky entries are immune.
    pub(crate) fn cool_down(&self) {
        let mut state = self.state.lock().expect("upstream state lock poisoned");
        if *state != UpstreamState::Sticky {
            *state = UpstreamState::DisabledUntil(Instant::now() + COOLDOWN);
        }
    }

    #[cfg(test)]
    fn cool_down_for(&self, period: Duration) {
        let mut state = self.state.lock().expect("upstream state lock poisoned");
        if *state != UpstreamState::Sticky {
            *state = UpstreamState::DisabledUntil(Instant::now() + period);
        }
    }
}

/// A provider (the TLS server name for its DoT endpoints) and its ordered
/// upstream list.
struct HostGroup {
    host: String,
    entries: Vec<Arc<Upstream>>,
}

/// Runtime extension of the pool: provider name → addresses, plus hard-coded
/// fallback answers used when the whole cascade fails.
#[derive(Debug, Default, Clone, serde::Deserialize)]
pub struct DnsConfig {
    #[serde(default)]
    pub servers: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub fallbacks: HashMap<String, Vec<IpAddr>>,
}

struct PoolInner {
    groups: Vec<HostGroup>,
    fallbacks: HashMap<String, Vec<IpAddr>>,
}

/// Ordered pool of DoT/DoH upstreams. Iteration is deterministic: groups in
/// insertion order, entries in insertion order within each group.
pub struct DnsPool {
    inner: RwLock<PoolInner>,
    dot_timeout: Mutex<Duration>,
}

fn dot_connector() -> TlsConnector {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    TlsConnector::from(Arc::clone(
        CONFIG.get_or_init(|| tls::client_config(&[ALPN_DNS])),
    ))
}

impl DnsPool {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(PoolInner {
                groups: Vec::new(),
                fallbacks: HashMap::new(),
            }),
            dot_timeout: Mutex::new(DEFAULT_DOT_TIMEOUT),
        }
    }

    /// The built-in pool matching this host's connectivity: IPv6 providers
    /// when a global route exists, IPv4 otherwise.
    pub fn builtin() -> Self {
        if crate::probe::is_ipv6_available() {
            Self::ipv6_defaults()
        } else {
            Self::ipv4_defaults()
        }
    }

    pub fn ipv4_defaults() -> Self {
        Self::from_entries(&[
            (
                "dot.sb",
                &[
                    "185.222.222.222:853",
                    "45.11.45.11:853",
                    "https://doh.sb/dns-query",
                ][..],
            ),
            (
                "dns.google",
                &[
                    "8.8.8.8:853",
                    "8.8.4.4:853",
                    "https://dns.google/resolve",
                    "https://8.8.8.8/resolve",
                    "https://8.8.4.4/resolve",
                ][..],
            ),
            (
                "cloudflare-dns.com",
                &[
                    "1.1.1.1:853",
                    "1.0.0.1:853",
                    "https://cloudflare-dns.com/dns-query",
                    "https://1.1.1.1/dns-query",
                    "https://1.0.0.1/dns-query",
                ][..],
            ),
            (
                "dns.opendns.com",
                &["208.67.222.222:853", "208.67.220.220:853"][..],
            ),
            ("dns10.quad9.net", &["9.9.9.10:853", "149.112.112.10:853"][..]),
        ])
    }

    pub fn ipv6_defaults() -> Self {
        Self::from_entries(&[
            (
                "dot.sb",
                &[
                    "[2a09::]:853",
                    "[2a11::]:853",
                    "https://doh.sb/dns-query",
                ][..],
            ),
            (
                "dns.google",
                &[
                    "[2001:4860:4860::8888]:853",
                    "[2001:4860:4860::8844]:853",
                    "https://dns.google/resolve",
                    "https://[2001:4860:4860::8888]/resolve",
                    "https://[2001:4860:4860::8844]/resolve",
                ][..],
            ),
            (
                "cloudflare-dns.com",
                &[
                    "[2606:4700:4700::1111]:853",
                    "[2606:4700:4700::1001]:853",
                    "https://cloudflare-dns.com/dns-query",
                    "https://[2606:4700:4700::1111]/dns-query",
                    "https://[2606:4700:4700::1001]/dns-query",
                ][..],
            ),
            (
                "dns.opendns.com",
                &["[2620:119:35::35]:853", "[2620:119:53::53]:853"][..],
            ),
            (
                "dns10.quad9.net",
                &["[2620:fe::10]:853", "[2620:fe::fe:10]:853"][..],
            ),
        ])
    }

    fn from_entries(groups: &[(&str, &[&str])]) -> Self {
        let groups = groups
            .iter()
            .map(|(host, addrs)| HostGroup {
                host: (*host).to_owned(),
                entries: addrs
                    .iter()
                    .map(|a| Arc::new(Upstream::new((*a).to_owned())))
                    .collect(),
            })
            .collect();
        Self {
            inner: RwLock::new(PoolInner {
                groups,
                fallbacks: HashMap::new(),
            }),
            dot_timeout: Mutex::new(DEFAULT_DOT_TIMEOUT),
        }
    }

    /// Merges additional providers and fallbacks. Known addresses are kept
    /// as-is (health state included); new groups append after existing ones.
    pub async fn add(&self, config: &DnsConfig) {
        let mut inner = self.inner.write().await;
        for (host, addrs) in &config.servers {
            let idx = match inner.groups.iter().position(|g| &g.host == host) {
                Some(idx) => idx,
                None => {
                    inner.groups.push(HostGroup {
                        host: host.clone(),
                        entries: Vec::new(),
                    });
                    inner.groups.len() - 1
                }
            };
            let group = &mut inner.groups[idx];
            for addr in addrs {
                if !group.entries.iter().any(|e| e.addr() == addr) {
                    group.entries.push(Arc::new(Upstream::new(addr.clone())));
                }
            }
        }
        for (host, addrs) in &config.fallbacks {
            let known = inner.fallbacks.entry(host.clone()).or_default();
            for addr in addrs {
                if !known.contains(addr) {
                    known.push(*addr);
                }
            }
        }
    }

    pub fn set_dot_timeout(&self, timeout: Duration) {
        *self.dot_timeout.lock().expect("dot timeout lock poisoned") = timeout;
    }

    pub fn dot_timeout(&self) -> Duration {
        *self.dot_timeout.lock().expect("dot timeout lock poisoned")
    }

    /// Hard-coded answers for `host`, consulted when the cascade is dry.
    pub async fn fallback(&self, host: &str) -> Option<Vec<IpAddr>> {
        self.inner.read().await.fallbacks.get(host).cloned()
    }

    /// Snapshot of the DoH entries across all groups, in iteration order.
    pub(crate) async fn doh_entries(&self) -> Vec<Arc<Upstream>> {
        let inner = self.inner.read().await;
        inner
            .groups
            .iter()
            .flat_map(|g| g.entries.iter())
            .filter(|e| e.is_doh())
            .cloned()
            .collect()
    }

    /// Opens an authenticated DoT channel to the first usable non-DoH entry.
    /// The first entry that completes a handshake is marked sticky; failures
    /// other than a missing route cool the entry down for an hour.
    pub async fn dial_dot(&self, first_fragment_len: u8) -> Result<FragTlsStream, DnsError> {
        let timeout = self.dot_timeout();
        let connector = dot_connector();
        let inner = self.inner.read().await;
        for group in &inner.groups {
            let server_name = match tls::server_name(&group.host) {
                Ok(name) => name,
                Err(_) => continue,
            };
            for entry in &group.entries {
                if entry.is_doh() || !entry.usable() {
                    continue;
                }
                debug!(host = %group.host, addr = %entry.addr(), "dialing DoT upstream");
                let tcp = match tokio::time::timeout(timeout, TcpStream::connect(entry.addr()))
                    .await
                {
                    Ok(Ok(tcp)) => tcp,
                    Ok(Err(err)) => {
                        debug!(addr = %entry.addr(), %err, "DoT tcp dial failed");
                        if !is_transient_io(&err) {
                            entry.cool_down();
                        }
                        continue;
                    }
                    Err(_) => {
                        debug!(addr = %entry.addr(), "DoT tcp dial timed out");
                        entry.cool_down();
                        continue;
                    }
                };
                match tokio::time::timeout(
                    timeout,
                    tls::handshake(&connector, server_name.clone(), tcp, first_fragment_len),
                )
                .await
                {
                    Ok(Ok(stream)) => {
                        debug!(host = %group.host, addr = %entry.addr(), "DoT handshake succeeded");
                        entry.mark_sticky();
                        return Ok(stream);
                    }
                    Ok(Err(err)) => {
                        debug!(addr = %entry.addr(), %err, "DoT handshake failed");
                        if !is_transient_io(&err) {
                            entry.cool_down();
                        }
                    }
                    Err(_) => {
                        debug!(addr = %entry.addr(), "DoT handshake timed out");
                        entry.cool_down();
                    }
                }
            }
        }
        Err(DnsError::NoDnsAvailable)
    }
}

impl Default for DnsPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooled_down_entry_reenables_after_deadline() {
        let up = Upstream::new("192.0.2.1:853".to_owned());
        assert!(up.usable());
        up.cool_down_for(Duration::from_millis(10));
        assert!(!up.usable());
        std::thread::sleep(Duration::from_millis(20));
        assert!(up.usable());
        assert!(up.usable(), "flip back to enabled is sticky-free and stable");
    }

    #[test]
    fn sticky_entry_cannot_be_disabled() {
        let up = Upstream::new("192.0.2.1:853".to_owned());
        up.mark_sticky();
        up.cool_down();
        assert!(up.usable());
    }

    #[test]
    fn doh_detection_by_scheme() {
        assert!(Upstream::new("https://dns.google/resolve".to_owned()).is_doh());
        assert!(!Upstream::new("8.8.8.8:853".to_owned()).is_doh());
    }

    #[tokio::test]
    async fn add_preserves_order_and_dedups() {
        let pool = DnsPool::new();
        let mut servers = HashMap::new();
        servers.insert(
            "dns.example".to_owned(),
            vec![
                "192.0.2.1:853".to_owned(),
                "192.0.2.2:853".to_owned(),
                "192.0.2.1:853".to_owned(),
            ],
        );
        pool.add(&DnsConfig {
            servers: servers.clone(),
            fallbacks: HashMap::new(),
        })
        .await;
        pool.add(&DnsConfig {
            servers,
            fallbacks: HashMap::new(),
        })
        .await;

        let inner = pool.inner.read().await;
        assert_eq!(inner.groups.len(), 1);
        let addrs: Vec<_> = inner.groups[0].entries.iter().map(|e| e.addr().to_owned()).collect();
        assert_eq!(addrs, vec!["192.0.2.1:853", "192.0.2.2:853"]);
    }

    #[tokio::test]
    async fn fallback_map_merge() {
        let pool = DnsPool::new();
        let mut fallbacks = HashMap::new();
        fallbacks.insert(
            "blocked.example".to_owned(),
            vec!["203.0.113.7".parse().unwrap()],
        );
        pool.add(&DnsConfig {
            servers: HashMap::new(),
            fallbacks,
        })
        .await;
        assert_eq!(
            pool.fallback("blocked.example").await,
            Some(vec!["203.0.113.7".parse().unwrap()])
        );
        assert_eq!(pool.fallback("other.example").await, None);
    }

    #[test]
    fn builtin_pools_have_five_providers_in_order() {
        for pool in [DnsPool::ipv4_defaults(), DnsPool::ipv6_defaults()] {
            let inner = pool.inner.try_read().unwrap();
            let hosts: Vec<_> = inner.groups.iter().map(|g| g.host.as_str()).collect();
            assert_eq!(
                hosts,
                vec![
                    "dot.sb",
                    "dns.google",
                    "cloudflare-dns.com",
                    "dns.opendns.com",
                    "dns10.quad9.net"
                ]
            );
        }
    }
}
