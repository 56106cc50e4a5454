//! Egress TLS stack with record-layer ClientHello fragmentation and a
//! censorship-resilient DNS resolver (DoT/DoH upstream pool, TTL cache,
//! hard-coded fallbacks).
//!
//! The fragmentation trick: SNI-filtering middleboxes read the first TLS
//! record looking for a complete ClientHello. Splitting the ClientHello
//! across two records at the sender is permitted by RFC 8446 §5.1 and is
//! reassembled transparently by the peer, but defeats naive inspectors.

pub mod dns;
pub mod egress;
pub mod error;
pub mod fragment;
pub mod probe;
pub mod tls;

pub use egress::{DnsMode, Egress, FragTlsConnector};
pub use error::DnsError;
pub use fragment::FragmentedStream;

/// Process-wide default for the length of the first handshake record
/// fragment, in bytes. Zero disables fragmentation entirely.
pub const DEFAULT_FIRST_FRAGMENT_LEN: u8 = 3;
