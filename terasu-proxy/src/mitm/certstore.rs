//! Per-SNI leaf certificate cache backing the TLS server side of the MITM.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rustls::crypto::CryptoProvider;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::warn;

use super::ca::Ca;

/// Key used when the client sent no SNI at all.
const UNKNOWN_SNI: &str = "unknown";

pub struct CertStore {
    ca: Arc<Ca>,
    cache: Mutex<HashMap<String, Arc<CertifiedKey>>>,
}

impl CertStore {
    pub fn new(ca: Arc<Ca>) -> Self {
        Self {
            ca,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Cached leaf for the SNI, minted on first sight. The RSA keygen and
    /// signing run outside the lock; two racing mints for the same name both
    /// produce valid certificates and the last writer wins.
    pub fn certified_for(&self, sni: &str) -> Result<Arc<CertifiedKey>> {
        let host = if sni.is_empty() { UNKNOWN_SNI } else { sni };
        if let Some(ck) = self
            .cache
            .lock()
            .expect("cert cache lock poisoned")
            .get(host)
        {
            return Ok(Arc::clone(ck));
        }

        let (chain, key_der) = self.ca.mint_leaf(host)?;
        let provider =
            CryptoProvider::get_default().context("no process-level CryptoProvider installed")?;
        let signing_key = provider
            .key_provider
            .load_private_key(key_der)
            .context("load leaf signing key")?;
        let certified = Arc::new(CertifiedKey::new(chain, signing_key));

        self.cache
            .lock()
            .expect("cert cache lock poisoned")
            .insert(host.to_owned(), Arc::clone(&certified));
        Ok(certified)
    }
}

impl ResolvesServerCert for CertStore {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let sni = client_hello.server_name().unwrap_or("");
        match self.certified_for(sni) {
            Ok(certified) => Some(certified),
            Err(err) => {
                warn!(%sni, "failed to mint leaf certificate: {err:#}");
                None
            }
        }
    }
}

impl fmt::Debug for CertStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cached = self.cache.lock().map(|c| c.len()).unwrap_or(0);
        f.debug_struct("CertStore")
            .field("cached", &cached)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> CertStore {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let dir = tempfile::tempdir().unwrap();
        let ca = Ca::load_or_create(
            dir.path().join("ca.crt").to_str().unwrap(),
            dir.path().join("ca.key").to_str().unwrap(),
            true,
        )
        .unwrap();
        CertStore::new(Arc::new(ca))
    }

    #[test]
    fn repeated_lookups_return_the_same_certificate() {
        let store = test_store();
        let first = store.certified_for("www.example.com").unwrap();
        let second = store.certified_for("www.example.com").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other = store.certified_for("other.example.com").unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn empty_sni_maps_to_the_unknown_key() {
        let store = test_store();
        let anon = store.certified_for("").unwrap();
        let named = store.certified_for("unknown").unwrap();
        assert!(Arc::ptr_eq(&anon, &named));
    }

    #[test]
    fn chain_ends_with_the_root() {
        let store = test_store();
        let certified = store.certified_for("site.test").unwrap();
        assert_eq!(certified.cert.len(), 2);
    }
}
