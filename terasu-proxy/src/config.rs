//! YAML configuration with `TERASU_PROXY_*` environment overrides.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: String,
    /// `all` intercepts every CONNECT, `list` only suffix matches.
    pub mode: String,
    pub intercept_list: Vec<String>,
    pub ca: Ca,
    pub security: Security,
    pub limits: Limits,
    pub logging: Logging,
    pub metrics: Metrics,
    pub dns: Dns,
    pub fragment: Fragment,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Ca {
    pub cert_file: String,
    pub key_file: String,
    pub auto_generate: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Security {
    pub basic_auth: BasicAuthConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BasicAuthConfig {
    pub enabled: bool,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_conns: usize,
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Logging {
    pub level: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Metrics {
    pub addr: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Dns {
    /// `terasu` | `system` | `auto`.
    pub mode: String,
    #[serde(with = "humantime_serde")]
    pub dot_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Fragment {
    /// Bytes in the first handshake record; 0 disables fragmentation.
    pub first_len: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_owned(),
            mode: "all".to_owned(),
            intercept_list: Vec::new(),
            ca: Ca::default(),
            security: Security::default(),
            limits: Limits::default(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            dns: Dns::default(),
            fragment: Fragment::default(),
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_conns: 4096,
            read_timeout: Duration::from_secs(15),
            write_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
        }
    }
}

impl Default for Dns {
    fn default() -> Self {
        Self {
            mode: "auto".to_owned(),
            dot_timeout: Duration::from_secs(4),
        }
    }
}

impl Default for Fragment {
    fn default() -> Self {
        Self {
            first_len: terasu_core::DEFAULT_FIRST_FRAGMENT_LEN,
        }
    }
}

/// Loads the config file (defaults only when `path` is `None`), then applies
/// environment overrides.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let mut cfg = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("read config {}", path.display()))?;
            serde_yaml::from_str(&raw).context("parse yaml")?
        }
        None => Config::default(),
    };
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(format!("TERASU_PROXY_{key}"))
        .ok()
        .filter(|v| !v.is_empty())
}

fn apply_env_overrides(cfg: &mut Config) {
    if let Some(v) = env_var("LISTEN") {
        cfg.listen = v;
    }
    if let Some(v) = env_var("MODE") {
        cfg.mode = v;
    }
    if let Some(v) = env_var("INTERCEPT_LIST") {
        let list: Vec<String> = v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();
        if !list.is_empty() {
            cfg.intercept_list = list;
        }
    }
    if let Some(v) = env_var("CA_CERT_FILE") {
        cfg.ca.cert_file = v;
    }
    if let Some(v) = env_var("CA_KEY_FILE") {
        cfg.ca.key_file = v;
    }
    if let Some(b) = env_var("CA_AUTO_GENERATE").and_then(|v| v.parse().ok()) {
        cfg.ca.auto_generate = b;
    }
    if let Some(b) = env_var("BASIC_AUTH_ENABLED").and_then(|v| v.parse().ok()) {
        cfg.security.basic_auth.enabled = b;
    }
    if let Some(v) = env_var("BASIC_AUTH_USERNAME") {
        cfg.security.basic_auth.username = v;
    }
    if let Some(v) = env_var("BASIC_AUTH_PASSWORD") {
        cfg.security.basic_auth.password = v;
    }
    if let Some(n) = env_var("LIMITS_MAX_CONNS").and_then(|v| v.parse().ok()) {
        cfg.limits.max_conns = n;
    }
    if let Some(d) = env_var("LIMITS_READ_TIMEOUT").and_then(|v| humantime::parse_duration(&v).ok())
    {
        cfg.limits.read_timeout = d;
    }
    if let Some(d) =
        env_var("LIMITS_WRITE_TIMEOUT").and_then(|v| humantime::parse_duration(&v).ok())
    {
        cfg.limits.write_timeout = d;
    }
    if let Some(v) = env_var("LOG_LEVEL") {
        cfg.logging.level = v;
    }
    if let Some(v) = env_var("METRICS_ADDR") {
        cfg.metrics.addr = Some(v);
    }
    if let Some(v) = env_var("DNS_MODE") {
        cfg.dns.mode = v;
    }
    if let Some(d) = env_var("DNS_DOT_TIMEOUT").and_then(|v| humantime::parse_duration(&v).ok()) {
        cfg.dns.dot_timeout = d;
    }
    if let Some(n) = env_var("FIRST_FRAGMENT_LEN").and_then(|v| v.parse().ok()) {
        cfg.fragment.first_len = n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize the tests that
    // touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_match_documented_values() {
        let _guard = ENV_LOCK.lock().unwrap();
        let cfg = load(None).unwrap();
        assert_eq!(cfg.listen, "0.0.0.0:8080");
        assert_eq!(cfg.mode, "all");
        assert_eq!(cfg.limits.max_conns, 4096);
        assert_eq!(cfg.limits.read_timeout, Duration::from_secs(15));
        assert_eq!(cfg.limits.write_timeout, Duration::from_secs(30));
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.dns.mode, "auto");
        assert_eq!(cfg.dns.dot_timeout, Duration::from_secs(4));
        assert_eq!(cfg.fragment.first_len, 3);
        assert!(cfg.metrics.addr.is_none());
        assert!(!cfg.security.basic_auth.enabled);
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        let yaml = r#"
listen: "127.0.0.1:3128"
mode: list
intercept_list: ["example.com", "internal.test"]
limits:
  read_timeout: 5s
security:
  basic_auth:
    enabled: true
    username: u
    password: p
metrics:
  addr: "127.0.0.1:9090"
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, yaml).unwrap();

        let cfg = load(Some(&path)).unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:3128");
        assert_eq!(cfg.mode, "list");
        assert_eq!(cfg.intercept_list, vec!["example.com", "internal.test"]);
        assert_eq!(cfg.limits.read_timeout, Duration::from_secs(5));
        // untouched fields keep their defaults
        assert_eq!(cfg.limits.write_timeout, Duration::from_secs(30));
        assert_eq!(cfg.limits.max_conns, 4096);
        assert!(cfg.security.basic_auth.enabled);
        assert_eq!(cfg.metrics.addr.as_deref(), Some("127.0.0.1:9090"));
    }

    #[test]
    fn invalid_yaml_is_an_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "listen: [not, a, string]").unwrap();
        assert!(load(Some(&path)).is_err());
        assert!(load(Some(&dir.path().join("missing.yaml"))).is_err());
    }

    #[test]
    fn env_overrides_win_over_yaml() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("TERASU_PROXY_LISTEN", "0.0.0.0:9999");
        std::env::set_var("TERASU_PROXY_MODE", "list");
        std::env::set_var("TERASU_PROXY_INTERCEPT_LIST", " a.com , ,b.org ");
        std::env::set_var("TERASU_PROXY_LIMITS_READ_TIMEOUT", "7s");
        std::env::set_var("TERASU_PROXY_FIRST_FRAGMENT_LEN", "5");
        std::env::set_var("TERASU_PROXY_CA_AUTO_GENERATE", "true");

        let cfg = load(None).unwrap();

        std::env::remove_var("TERASU_PROXY_LISTEN");
        std::env::remove_var("TERASU_PROXY_MODE");
        std::env::remove_var("TERASU_PROXY_INTERCEPT_LIST");
        std::env::remove_var("TERASU_PROXY_LIMITS_READ_TIMEOUT");
        std::env::remove_var("TERASU_PROXY_FIRST_FRAGMENT_LEN");
        std::env::remove_var("TERASU_PROXY_CA_AUTO_GENERATE");

        assert_eq!(cfg.listen, "0.0.0.0:9999");
        assert_eq!(cfg.mode, "list");
        assert_eq!(cfg.intercept_list, vec!["a.com", "b.org"]);
        assert_eq!(cfg.limits.read_timeout, Duration::from_secs(7));
        assert_eq!(cfg.fragment.first_len, 5);
        assert!(cfg.ca.auto_generate);
    }
}
