//! Shared Access Signature tokens for relay authorization
//!
//! Format: `SharedAccessSignature sr=<uri>&sig=<signature>&se=<expiry>&skn=<key name>`
//! where the signature is base64(HMAC-SHA256(key, "<uri>\n<expiry>")) and
//! `uri` and `signature` are form-url-encoded.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ring::hmac;
use url::form_urlencoded;

use crate::error::RelayError;

pub const SAS_PREFIX: &str = "SharedAccessSignature ";

/// Sign a token for `resource_uri` that expires `validity` from now
///
/// `key` is the base64 encoded shared access key.
pub fn generate_sas_token(
    resource_uri: &str,
    key_name: &str,
    key: &str,
    validity: Duration,
) -> Result<String, RelayError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    generate_sas_token_at(resource_uri, key_name, key, now + validity.as_secs())
}

/// Sign a token with an explicit expiry (seconds since the Unix epoch)
pub fn generate_sas_token_at(
    resource_uri: &str,
    key_name: &str,
    key: &str,
    expiry: u64,
) -> Result<String, RelayError> {
    if key_name.is_empty() {
        return Err(RelayError::InvalidKey("empty key name".to_string()));
    }
    let key_bytes = STANDARD
        .decode(key.trim())
        .map_err(|e| RelayError::InvalidKey(e.to_string()))?;

    let encoded_uri = encode(resource_uri);
    let to_sign = format!("{}\n{}", encoded_uri, expiry);

    let key = hmac::Key::new(hmac::HMAC_SHA256, &key_bytes);
    let tag = hmac::sign(&key, to_sign.as_bytes());
    let signature = STANDARD.encode(tag.as_ref());

    Ok(format!(
        "{}sr={}&sig={}&se={}&skn={}",
        SAS_PREFIX,
        encoded_uri,
        encode(&signature),
        expiry,
        key_name
    ))
}

pub fn is_shared_access_signature(token: &str) -> bool {
    token.starts_with(SAS_PREFIX)
}

/// The `se` field of a SAS token
pub fn sas_expiry(token: &str) -> Option<u64> {
    let fields = token.strip_prefix(SAS_PREFIX)?;
    form_urlencoded::parse(fields.as_bytes())
        .find(|(k, _)| k == "se")
        .and_then(|(_, v)| v.parse().ok())
}

fn encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}
