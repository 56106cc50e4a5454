use thiserror::Error;

/// Errors produced by the resolver cascade and the DoH/DoT transports.
#[derive(Debug, Error)]
pub enum DnsError {
    /// Every upstream was skipped, failed, or disabled and the fallback map
    /// had no entry for the host.
    #[error("no dns available")]
    NoDnsAvailable,

    #[error("empty host addr")]
    EmptyHostAddress,

    #[error("invalid host name {0:?}")]
    InvalidName(String),

    /// The DoH server answered with a non-zero `Status`.
    #[error("doh status {status}: {comment}")]
    DohStatus { status: u32, comment: String },

    #[error("doh request: {0}")]
    DohRequest(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Proto(#[from] hickory_proto::ProtoError),

    #[error(transparent)]
    Resolve(#[from] hickory_resolver::ResolveError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl DnsError {
    /// Failures caused by a missing route are transient: the upstream is not
    /// at fault and must not be cooled down for them.
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            DnsError::Io(err) => is_transient_io(err),
            _ => false,
        }
    }
}

pub(crate) fn is_transient_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::NetworkUnreachable
            | std::io::ErrorKind::NetworkDown
            | std::io::ErrorKind::HostUnreachable
    )
}
