//! Basic proxy authentication.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hyper::header::HeaderValue;
use subtle::ConstantTimeEq;

#[derive(Debug, Clone)]
pub struct BasicAuth {
    pub enabled: bool,
    pub username: String,
    pub password: String,
}

impl BasicAuth {
    /// Validates a `Proxy-Authorization` header. Credential comparison is
    /// constant-time. When auth is enabled with both credentials configured
    /// empty, any syntactically valid Basic header passes — the header is
    /// required but its content is not checked (kept from the original
    /// deployment, where this served as a client-marker toggle).
    pub fn check(&self, header: Option<&HeaderValue>) -> bool {
        if !self.enabled {
            return true;
        }
        let Some(value) = header.and_then(|v| v.to_str().ok()) else {
            return false;
        };
        if value.len() < 6 || !value[..6].eq_ignore_ascii_case("basic ") {
            return false;
        }
        let Ok(decoded) = BASE64.decode(value[6..].trim()) else {
            return false;
        };
        let Some(colon) = decoded.iter().position(|&b| b == b':') else {
            return false;
        };
        if self.username.is_empty() && self.password.is_empty() {
            return true;
        }
        let user_ok = decoded[..colon].ct_eq(self.username.as_bytes());
        let pass_ok = decoded[colon + 1..].ct_eq(self.password.as_bytes());
        bool::from(user_ok & pass_ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(user: &str, pass: &str) -> HeaderValue {
        let encoded = BASE64.encode(format!("{user}:{pass}"));
        HeaderValue::from_str(&format!("Basic {encoded}")).unwrap()
    }

    fn auth(enabled: bool, user: &str, pass: &str) -> BasicAuth {
        BasicAuth {
            enabled,
            username: user.to_owned(),
            password: pass.to_owned(),
        }
    }

    #[test]
    fn disabled_auth_passes_everything() {
        let a = auth(false, "u", "p");
        assert!(a.check(None));
        assert!(a.check(Some(&header("x", "y"))));
    }

    #[test]
    fn missing_or_malformed_header_is_rejected() {
        let a = auth(true, "u", "p");
        assert!(!a.check(None));
        assert!(!a.check(Some(&HeaderValue::from_static("Bearer zzz"))));
        assert!(!a.check(Some(&HeaderValue::from_static("Basic %%%"))));
    }

    #[test]
    fn correct_credentials_pass_wrong_fail() {
        let a = auth(true, "u", "p");
        assert!(a.check(Some(&header("u", "p"))));
        assert!(!a.check(Some(&header("u", "wrong"))));
        assert!(!a.check(Some(&header("wrong", "p"))));
        assert!(!a.check(Some(&header("", ""))));
    }

    #[test]
    fn scheme_is_case_insensitive() {
        let a = auth(true, "u", "p");
        let encoded = BASE64.encode("u:p");
        let value = HeaderValue::from_str(&format!("basic {encoded}")).unwrap();
        assert!(a.check(Some(&value)));
    }

    #[test]
    fn empty_configured_credentials_only_require_the_header() {
        let a = auth(true, "", "");
        assert!(a.check(Some(&header("anything", "goes"))));
        assert!(!a.check(None));
    }
}
