//! One-shot probe for IPv6 global connectivity.

use std::net::UdpSocket;
use std::sync::OnceLock;

/// Connecting a UDP socket never sends a packet; it only asks the kernel for
/// a route, which is exactly the question we want answered.
const PROBE_TARGET: &str = "[2001:4860:4860::8888]:53";

/// Whether this host has a global IPv6 route. Probed once per process; the
/// result selects the IPv6 or IPv4 upstream pool and the preferred DoH
/// record type.
pub fn is_ipv6_available() -> bool {
    static AVAILABLE: OnceLock<bool> = OnceLock::new();
    *AVAILABLE.get_or_init(|| {
        UdpSocket::bind("[::]:0")
            .and_then(|sock| sock.connect(PROBE_TARGET))
            .is_ok()
    })
}
