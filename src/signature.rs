use crate::protocol::openai::Message;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_WINDOW_MS: i64 = 5 * 60 * 1000;
pub const GUEST_USER_ID: &str = "guest";
const USER_ID_CLAIMS: [&str; 4] = ["id", "user_id", "uid", "sub"];

/// A derived request signature plus the inputs that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub value: String,
    pub canonical: String,
    pub timestamp_ms: i64,
}

/// Two-layer HMAC-SHA256: a key derived from the 5-minute window index
/// signs the canonical request string.
pub fn sign(
    last_user_message: &str,
    request_id: &str,
    timestamp_ms: i64,
    user_id: &str,
    secret: &str,
) -> Signature {
    let window_index = timestamp_ms.div_euclid(SIGNATURE_WINDOW_MS);
    let derived_key = hex::encode(hmac_sha256(secret.as_bytes(), window_index.to_string().as_bytes()));

    let canonical = format!(
        "requestId,{request_id},timestamp,{timestamp_ms},user_id,{user_id}|{last_user_message}|{timestamp_ms}"
    );
    let value = hex::encode(hmac_sha256(derived_key.as_bytes(), canonical.as_bytes()));

    Signature {
        value,
        canonical,
        timestamp_ms,
    }
}

fn hmac_sha256(key: &[u8], message: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so construction cannot fail.
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac accepts any key length"),
    };
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

/// Reads the user id from the unverified payload of a JWT-shaped token.
/// Never fails: anything unexpected yields `"guest"`.
pub fn extract_user_id(token: &str) -> String {
    if token.is_empty() {
        return GUEST_USER_ID.to_string();
    }
    let payload = decode_jwt_payload(token).unwrap_or_default();
    USER_ID_CLAIMS
        .iter()
        .filter_map(|claim| payload.get(*claim).and_then(|v| v.as_str()))
        .find(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| GUEST_USER_ID.to_string())
}

fn decode_jwt_payload(token: &str) -> Option<Map<String, Value>> {
    let mut segments = token.split('.');
    let _header = segments.next()?;
    let payload = segments.next()?;
    let bytes = decode_base64_url(payload)?;
    match serde_json::from_slice::<Value>(&bytes).ok()? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

fn decode_base64_url(segment: &str) -> Option<Vec<u8>> {
    let mut padded = segment.to_string();
    let remainder = padded.len() % 4;
    if remainder > 0 {
        padded.push_str(&"=".repeat(4 - remainder));
    }
    URL_SAFE.decode(padded).ok()
}

pub fn last_user_message(messages: &[Message]) -> &str {
    messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.as_str())
        .unwrap_or("")
}

/// Cuts `s` to at most `max_chars` characters for log output.
pub fn truncate_for_display(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
