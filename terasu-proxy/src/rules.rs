//! Per-target interception policy.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    All,
    List,
    Unknown,
}

/// Decides which CONNECT targets get man-in-the-middled and which are
/// tunneled opaquely.
#[derive(Debug, Clone)]
pub struct Rules {
    mode: Mode,
    suffixes: Vec<String>,
}

impl Rules {
    pub fn new(mode: &str, list: &[String]) -> Self {
        let mode = match mode {
            "all" => Mode::All,
            "list" => Mode::List,
            _ => Mode::Unknown,
        };
        let suffixes = list
            .iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        Self { mode, suffixes }
    }

    pub fn should_intercept(&self, hostport: &str) -> bool {
        let host = strip_port(hostport).to_lowercase();
        match self.mode {
            Mode::All => true,
            Mode::List => self
                .suffixes
                .iter()
                .any(|suffix| host == *suffix || host.ends_with(&format!(".{suffix}"))),
            Mode::Unknown => false,
        }
    }
}

pub(crate) fn strip_port(hostport: &str) -> &str {
    if let Some(rest) = hostport.strip_prefix('[') {
        // [v6]:port or [v6]
        return rest.split(']').next().unwrap_or(rest);
    }
    match hostport.rfind(':') {
        // A second colon means an unbracketed IPv6 literal, not a port.
        Some(idx) if hostport[..idx].contains(':') => hostport,
        Some(idx) => &hostport[..idx],
        None => hostport,
    }
}
