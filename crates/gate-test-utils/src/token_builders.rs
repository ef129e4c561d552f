//! Builder for provider-style session tokens.

use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, Header};
use serde_json::{json, Map, Value};

use crate::crypto_fixtures::TestKeypair;

/// Builds an EdDSA-signed JWT with configurable claims.
///
/// Only `sub` is set by default; everything else is explicit.
pub struct TestTokenBuilder<'a> {
    key: &'a TestKeypair,
    kid: Option<String>,
    claims: Map<String, Value>,
}

impl<'a> TestTokenBuilder<'a> {
    pub fn new(key: &'a TestKeypair) -> Self {
        let mut claims = Map::new();
        claims.insert("sub".to_string(), json!("user_test"));
        Self {
            key,
            kid: Some(key.kid().to_string()),
            claims,
        }
    }

    pub fn subject(self, sub: &str) -> Self {
        self.claim("sub", json!(sub))
    }

    pub fn issuer(self, iss: &str) -> Self {
        self.claim("iss", json!(iss))
    }

    pub fn audience(self, aud: &str) -> Self {
        self.claim("aud", json!(aud))
    }

    pub fn audiences(self, aud: &[&str]) -> Self {
        self.claim("aud", json!(aud))
    }

    pub fn issued_at(self, iat: i64) -> Self {
        self.claim("iat", json!(iat))
    }

    pub fn expires_at(self, exp: i64) -> Self {
        self.claim("exp", json!(exp))
    }

    pub fn not_before(self, nbf: i64) -> Self {
        self.claim("nbf", json!(nbf))
    }

    /// Set `iat` to now and `exp` to now + `secs` (may be negative).
    pub fn expires_in_secs(self, secs: i64) -> Self {
        let now = Utc::now().timestamp();
        self.issued_at(now).expires_at(now + secs)
    }

    /// Override the header `kid` (`None` omits it).
    pub fn kid(mut self, kid: Option<&str>) -> Self {
        self.kid = kid.map(ToString::to_string);
        self
    }

    pub fn claim(mut self, name: &str, value: Value) -> Self {
        self.claims.insert(name.to_string(), value);
        self
    }

    /// Sign and serialize. Panics on signing failure.
    pub fn build(self) -> String {
        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = self.kid;
        encode(&header, &Value::Object(self.claims), &self.key.encoding_key())
            .expect("signing test token should succeed")
    }
}

/// Change one character of the signature segment.
pub fn tamper_signature(token: &str) -> String {
    let (signing_input, signature) = token
        .rsplit_once('.')
        .expect("token should have a signature segment");
    let mut chars: Vec<char> = signature.chars().collect();
    chars[0] = if chars[0] == 'A' { 'B' } else { 'A' };
    format!("{signing_input}.{}", chars.into_iter().collect::<String>())
}
