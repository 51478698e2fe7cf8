//! Request signing for the open-platform HTTP API.
//!
//! Every outbound request carries six signed headers. Their `key:value` pairs
//! are sorted by key, joined with `\n`, and the resulting string is signed
//! with HMAC-SHA256 under the access key secret. The hex digest is sent as
//! the `Authorization` header.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, InvalidHeaderValue};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

pub const TIMESTAMP_HEADER: &str = "x-bili-timestamp";
pub const SIGNATURE_METHOD_HEADER: &str = "x-bili-signature-method";
pub const SIGNATURE_NONCE_HEADER: &str = "x-bili-signature-nonce";
pub const ACCESS_KEY_ID_HEADER: &str = "x-bili-accesskeyid";
pub const SIGNATURE_VERSION_HEADER: &str = "x-bili-signature-version";
pub const CONTENT_MD5_HEADER: &str = "x-bili-content-md5";

pub const SIGNATURE_METHOD: &str = "HMAC-SHA256";
pub const SIGNATURE_VERSION: &str = "1.0";
pub const JSON_CONTENT_TYPE: &str = "application/json";

type HmacSha256 = Hmac<Sha256>;

static LAST_NONCE: AtomicU64 = AtomicU64::new(0);

/// Values that make up one signed request.
///
/// A context is built for exactly one request body and must not be reused.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureContext {
    pub timestamp: u64,
    pub nonce: String,
    pub access_key_id: String,
    pub content_md5: String,
}

impl SignatureContext {
    /// Builds a context for `body` stamped with the current time.
    pub fn for_body(access_key_id: &str, body: &str) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self::with_values(
            access_key_id,
            body,
            now.as_secs(),
            next_nonce(now.as_nanos() as u64).to_string(),
        )
    }

    /// Builds a context from explicit timestamp and nonce values.
    pub fn with_values(access_key_id: &str, body: &str, timestamp: u64, nonce: String) -> Self {
        Self {
            timestamp,
            nonce,
            access_key_id: access_key_id.to_string(),
            content_md5: content_md5(body),
        }
    }

    fn signed_headers(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            (TIMESTAMP_HEADER, self.timestamp.to_string()),
            (SIGNATURE_METHOD_HEADER, SIGNATURE_METHOD.to_string()),
            (SIGNATURE_NONCE_HEADER, self.nonce.clone()),
            (ACCESS_KEY_ID_HEADER, self.access_key_id.clone()),
            (SIGNATURE_VERSION_HEADER, SIGNATURE_VERSION.to_string()),
            (CONTENT_MD5_HEADER, self.content_md5.clone()),
        ])
    }

    /// Returns the exact string that gets signed.
    pub fn canonical_string(&self) -> String {
        self.signed_headers()
            .iter()
            .map(|(key, value)| format!("{key}:{value}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Computes the hex-encoded HMAC-SHA256 signature.
    pub fn signature(&self, secret: &SecretString) -> String {
        let mut mac = match HmacSha256::new_from_slice(secret.expose_secret().as_bytes()) {
            Ok(mac) => mac,
            Err(_) => unreachable!("hmac accepts keys of any length"),
        };
        mac.update(self.canonical_string().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Builds the complete header set for the request, signature included.
    pub fn header_map(&self, secret: &SecretString) -> Result<HeaderMap, InvalidHeaderValue> {
        let mut headers = HeaderMap::new();
        for (key, value) in self.signed_headers() {
            headers.insert(HeaderName::from_static(key), HeaderValue::from_str(&value)?);
        }
        headers.insert(
            reqwest::header::AUTHORIZATION,
            HeaderValue::from_str(&self.signature(secret))?,
        );
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static(JSON_CONTENT_TYPE),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static(JSON_CONTENT_TYPE),
        );
        Ok(headers)
    }
}

/// Lowercase hex MD5 of the request body.
pub fn content_md5(body: &str) -> String {
    format!("{:x}", md5::compute(body.as_bytes()))
}

/// Returns a nonce derived from `now_nanos` that never repeats in-process.
fn next_nonce(now_nanos: u64) -> u64 {
    let mut last = LAST_NONCE.load(Ordering::Relaxed);
    loop {
        let next = now_nanos.max(last.wrapping_add(1));
        match LAST_NONCE.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(observed) => last = observed,
        }
    }
}
