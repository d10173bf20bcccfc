//! Signed-request verification.
//!
//! Privileged requests carry `{pubkey, signature, timestamp}` where the
//! signature is a detached Ed25519 signature over a canonical challenge
//! string. The challenge binds the operation name, any operation-specific
//! identifiers, and the client's timestamp, so a captured signature cannot
//! be replayed against another operation or outside the skew window.

use std::time::Duration;

use base64::{engine::general_purpose, Engine};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::{utils, Error, ErrorKind, Result};

pub struct Service {
    skew: Duration,
}

impl Service {
    pub fn new(skew: Duration) -> Self {
        Self { skew }
    }

    /// Rebuilds `action:param1:..:paramN:timestamp` and verifies the
    /// detached signature over its UTF-8 bytes.
    ///
    /// Every failure mode returns the same error so the response does not
    /// reveal whether the encoding, the freshness check, or the signature
    /// itself was at fault.
    pub fn verify(
        &self,
        pubkey: &str,
        signature_b64: &str,
        timestamp_ms: u64,
        action: &str,
        params: &[&str],
    ) -> Result<()> {
        let now = utils::millis_since_unix_epoch();
        if now.abs_diff(timestamp_ms) > self.skew.as_millis() as u64 {
            return Err(invalid_signature());
        }

        let challenge = challenge_string(action, params, timestamp_ms);

        let key_bytes: [u8; 32] = bs58::decode(pubkey)
            .into_vec()
            .map_err(|_| invalid_signature())?
            .try_into()
            .map_err(|_| invalid_signature())?;
        let key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| invalid_signature())?;

        let signature_bytes = general_purpose::STANDARD
            .decode(signature_b64)
            .map_err(|_| invalid_signature())?;
        let signature =
            Signature::from_slice(&signature_bytes).map_err(|_| invalid_signature())?;

        key.verify(challenge.as_bytes(), &signature)
            .map_err(|_| invalid_signature())
    }
}

pub(crate) fn challenge_string(action: &str, params: &[&str], timestamp_ms: u64) -> String {
    let mut challenge = String::from(action);
    for param in params {
        challenge.push(':');
        challenge.push_str(param);
    }
    challenge.push(':');
    challenge.push_str(&timestamp_ms.to_string());
    challenge
}

fn invalid_signature() -> Error {
    Error::BadRequest(ErrorKind::AuthInvalid, "Invalid signature")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn test_key(seed: u8) -> (SigningKey, String) {
        let signing_key = SigningKey::from_bytes(&[seed; 32]);
        let pubkey = bs58::encode(signing_key.verifying_key().as_bytes()).into_string();
        (signing_key, pubkey)
    }

    fn sign(key: &SigningKey, challenge: &str) -> String {
        general_purpose::STANDARD.encode(key.sign(challenge.as_bytes()).to_bytes())
    }

    fn verifier() -> Service {
        Service::new(Duration::from_secs(300))
    }

    #[test]
    fn challenge_matches_the_documented_action_strings() {
        assert_eq!(
            challenge_string("recovery:distribute", &[], 1_700_000_000_000),
            "recovery:distribute:1700000000000"
        );
        assert_eq!(
            challenge_string("recovery:approve", &["sid-1"], 5),
            "recovery:approve:sid-1:5"
        );
        assert_eq!(
            challenge_string("dms:create", &["alice"], 5),
            "dms:create:alice:5"
        );
    }

    #[test]
    fn accepts_a_fresh_valid_signature() {
        let (key, pubkey) = test_key(1);
        let now = utils::millis_since_unix_epoch();
        let signature = sign(&key, &challenge_string("dms:checkin", &[], now));

        verifier()
            .verify(&pubkey, &signature, now, "dms:checkin", &[])
            .unwrap();
    }

    #[test]
    fn rejects_a_signature_from_another_key() {
        let (key, _) = test_key(1);
        let (_, other_pubkey) = test_key(2);
        let now = utils::millis_since_unix_epoch();
        let signature = sign(&key, &challenge_string("dms:checkin", &[], now));

        assert!(verifier()
            .verify(&other_pubkey, &signature, now, "dms:checkin", &[])
            .is_err());
    }

    #[test]
    fn rejects_a_signature_over_another_action() {
        let (key, pubkey) = test_key(1);
        let now = utils::millis_since_unix_epoch();
        let signature = sign(&key, &challenge_string("recovery:revoke", &[], now));

        assert!(verifier()
            .verify(&pubkey, &signature, now, "recovery:distribute", &[])
            .is_err());
    }

    #[test]
    fn rejects_stale_and_future_timestamps() {
        let (key, pubkey) = test_key(1);
        let now = utils::millis_since_unix_epoch();

        for timestamp in [now - 301_000, now + 301_000] {
            let signature = sign(&key, &challenge_string("dms:checkin", &[], timestamp));
            assert!(verifier()
                .verify(&pubkey, &signature, timestamp, "dms:checkin", &[])
                .is_err());
        }
    }

    #[test]
    fn accepts_timestamps_inside_the_skew_window() {
        let (key, pubkey) = test_key(1);
        let now = utils::millis_since_unix_epoch();
        let timestamp = now - 200_000;
        let signature = sign(&key, &challenge_string("dms:checkin", &[], timestamp));

        verifier()
            .verify(&pubkey, &signature, timestamp, "dms:checkin", &[])
            .unwrap();
    }

    #[test]
    fn rejects_malformed_encodings() {
        let (key, pubkey) = test_key(1);
        let now = utils::millis_since_unix_epoch();
        let signature = sign(&key, &challenge_string("dms:checkin", &[], now));

        // Bad base58 pubkey, wrong-length pubkey, bad base64 signature.
        assert!(verifier()
            .verify("0Il", &signature, now, "dms:checkin", &[])
            .is_err());
        assert!(verifier()
            .verify("abc", &signature, now, "dms:checkin", &[])
            .is_err());
        assert!(verifier()
            .verify(&pubkey, "%%%", now, "dms:checkin", &[])
            .is_err());
    }
}
