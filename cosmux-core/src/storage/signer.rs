//! COS request signing
//!
//! Implements the `q-sign-algorithm=sha1` scheme: the sign key is an
//! HMAC-SHA1 of the key time, and the signature covers the method, path,
//! sorted query parameters and sorted headers.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::HeaderMap;
use reqwest::Method;
use sha1::{Digest, Sha1};

type HmacSha1 = Hmac<Sha1>;

/// Characters left unescaped by the signing encoder
const SIGN_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Produces the `Authorization` value for a request
pub trait Signer: Send + Sync {
    /// Sign a request for `file_id` valid for `expiration` from now
    fn sign(
        &self,
        file_id: &str,
        method: &Method,
        query: &[(String, String)],
        headers: &HeaderMap,
        expiration: Duration,
    ) -> String;
}

/// Default signer using a secret id / secret key pair
#[derive(Clone)]
pub struct HmacSha1Signer {
    secret_id: String,
    secret_key: String,
}

impl std::fmt::Debug for HmacSha1Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacSha1Signer")
            .field("secret_id", &self.secret_id)
            .finish_non_exhaustive()
    }
}

impl HmacSha1Signer {
    pub fn new(secret_id: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            secret_id: secret_id.into(),
            secret_key: secret_key.into(),
        }
    }

    /// Sign with an explicit start time (unix seconds)
    pub fn sign_at(
        &self,
        now_secs: u64,
        file_id: &str,
        method: &Method,
        query: &[(String, String)],
        headers: &HeaderMap,
        expiration: Duration,
    ) -> String {
        let key_time = format!("{};{}", now_secs, now_secs + expiration.as_secs());

        let (url_param_list, http_parameters) =
            canonical_pairs(query.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        let (header_list, http_headers) = canonical_pairs(
            headers
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str(), v))),
        );

        let sign_key = hex::encode(hmac_sha1(self.secret_key.as_bytes(), key_time.as_bytes()));

        let http_string = format!(
            "{}\n/{}\n{}\n{}\n",
            method.as_str().to_lowercase(),
            file_id,
            http_parameters,
            http_headers
        );
        let http_string_digest = hex::encode(Sha1::digest(http_string.as_bytes()));
        let string_to_sign = format!("sha1\n{}\n{}\n", key_time, http_string_digest);

        let signature = hex::encode(hmac_sha1(sign_key.as_bytes(), string_to_sign.as_bytes()));

        format!(
            "q-sign-algorithm=sha1&q-ak={}&q-sign-time={}&q-key-time={}&q-header-list={}&q-url-param-list={}&q-signature={}",
            self.secret_id, key_time, key_time, header_list, url_param_list, signature
        )
    }
}

impl Signer for HmacSha1Signer {
    fn sign(
        &self,
        file_id: &str,
        method: &Method,
        query: &[(String, String)],
        headers: &HeaderMap,
        expiration: Duration,
    ) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.sign_at(now, file_id, method, query, headers, expiration)
    }
}

/// Percent-encode with the signing alphabet
pub fn sign_encode(s: &str) -> String {
    utf8_percent_encode(s, SIGN_ENCODE_SET).to_string()
}

/// Build the `;`-joined key list and `&`-joined `k=v` list, sorted by
/// lowercase encoded key; repeated keys keep every value
fn canonical_pairs<'a>(pairs: impl Iterator<Item = (&'a str, &'a str)>) -> (String, String) {
    let mut entries: Vec<(String, String)> = pairs
        .map(|(k, v)| (sign_encode(k).to_lowercase(), sign_encode(v)))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let keys = entries
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");
    let params = entries
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");
    (keys, params)
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha1::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac key length is unrestricted"),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}
