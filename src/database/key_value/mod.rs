pub mod dms;
pub mod globals;
pub mod recovery;

use crate::utils;

/// Values in TTL-carrying trees start with 8 big-endian bytes holding
/// `expires_at` in unix milliseconds. 0 means the value never expires.
pub(crate) fn encode_expiring(expires_at_ms: u64, value: &[u8]) -> Vec<u8> {
    let mut buf = expires_at_ms.to_be_bytes().to_vec();
    buf.extend_from_slice(value);
    buf
}

/// The payload of an enveloped value, or None when it has expired.
pub(crate) fn live_value(raw: &[u8], now_ms: u64) -> Option<&[u8]> {
    let expires_at = utils::u64_from_bytes(raw.get(..8)?).ok()?;

    if expires_at != 0 && expires_at <= now_ms {
        return None;
    }

    raw.get(8..)
}

pub(crate) fn is_expired(raw: &[u8], now_ms: u64) -> bool {
    match raw.get(..8).and_then(|bytes| utils::u64_from_bytes(bytes).ok()) {
        Some(expires_at) => expires_at != 0 && expires_at <= now_ms,
        // A value too short to carry the envelope is garbage; reap it.
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_value_strips_the_envelope() {
        let raw = encode_expiring(2_000, b"payload");
        assert_eq!(live_value(&raw, 1_000), Some(&b"payload"[..]));
        assert_eq!(live_value(&raw, 2_000), None);
    }

    #[test]
    fn zero_expiry_never_expires() {
        let raw = encode_expiring(0, b"payload");
        assert_eq!(live_value(&raw, u64::MAX), Some(&b"payload"[..]));
        assert!(!is_expired(&raw, u64::MAX));
    }

    #[test]
    fn truncated_envelope_counts_as_expired() {
        assert!(is_expired(b"abc", 0));
    }
}
