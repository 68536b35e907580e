//! Per-request signature computation for the upstream game API.
//!
//! The mobile client signs every request by concatenating the request path,
//! the serialized query/body, a Unix-seconds timestamp, and a JSON header
//! subset, then running HMAC-SHA256 keyed by the current bearer token and
//! MD5-digesting the hex-encoded MAC. The hex MD5 is the `sign` header.

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use md5::Md5;
use serde::Serialize;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Platform identifier the upstream API expects from the web client.
pub const PLATFORM: &str = "3";

/// Client version reported in the signed header subset.
pub const CLIENT_VERSION: &str = "1.0.0";

/// The header subset covered by the signature.
///
/// Field order matters: the sign string embeds this struct serialized with
/// keys in exactly this order (platform, timestamp, dId, vName).
#[derive(Debug, Clone, Serialize)]
pub struct SignHeaders {
    pub platform: &'static str,
    pub timestamp: String,
    #[serde(rename = "dId")]
    pub d_id: String,
    #[serde(rename = "vName")]
    pub v_name: &'static str,
}

impl SignHeaders {
    pub fn new(device_id: Option<&str>, timestamp: i64) -> Self {
        Self {
            platform: PLATFORM,
            timestamp: timestamp.to_string(),
            d_id: device_id.unwrap_or("").to_string(),
            v_name: CLIENT_VERSION,
        }
    }
}

/// A computed signature plus the timestamp it was computed for.
#[derive(Debug, Clone)]
pub struct Signature {
    pub signature: String,
    pub timestamp: String,
    pub headers: SignHeaders,
}

/// Current Unix time in whole seconds.
pub fn timestamp_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Compute the request signature.
///
/// * `path` - the URL path of the request (e.g. `/web/v1/item/list`).
/// * `params_or_body` - raw query string for GET/DELETE (no leading `?`),
///   or the exact serialized body string for POST/PUT (empty if none).
/// * `device_id` - the fingerprint device id, empty before fingerprinting.
/// * `token` - the session's current bearer token, used only as the HMAC key
///   (may be empty, e.g. for the unauthenticated refresh call).
pub fn sign(
    path: &str,
    params_or_body: &str,
    device_id: Option<&str>,
    token: &str,
    timestamp: i64,
) -> Signature {
    let headers = SignHeaders::new(device_id, timestamp);
    // serde_json keeps struct field order, so this matches the client exactly
    let header_json = serde_json::to_string(&headers).unwrap_or_default();

    let sign_str = format!("{path}{params_or_body}{timestamp}{header_json}");
    tracing::debug!(target: "infold_proxy::sign", %path, sign_str, "signing request");

    // HMAC accepts keys of any length, including empty
    let mut mac = HmacSha256::new_from_slice(token.as_bytes()).expect("HMAC key length");
    mac.update(sign_str.as_bytes());
    let mac_hex = hex::encode(mac.finalize().into_bytes());

    let digest = Md5::digest(mac_hex.as_bytes());
    let signature = hex::encode(digest);

    Signature {
        signature,
        timestamp: timestamp.to_string(),
        headers,
    }
}
