use crate::{
    database::KeyValueDatabase,
    service::{
        self,
        recovery::{GuardianShare, RecoveryConfig, RecoverySession, SessionStatus},
    },
    utils, Error, Result,
};

use super::{encode_expiring, live_value};

fn share_key(guardian: &str, owner: &str) -> Vec<u8> {
    let mut key = guardian.as_bytes().to_vec();
    key.push(0xff);
    key.extend_from_slice(owner.as_bytes());
    key
}

fn session_share_key(session_id: &str, guardian: &str) -> Vec<u8> {
    let mut key = session_id.as_bytes().to_vec();
    key.push(0xff);
    key.extend_from_slice(guardian.as_bytes());
    key
}

impl service::recovery::Data for KeyValueDatabase {
    fn set_config(&self, owner: &str, config: &RecoveryConfig) -> Result<()> {
        self.recovery_configs
            .insert(owner.as_bytes(), &serde_json::to_vec(config)?)
    }

    fn config(&self, owner: &str) -> Result<Option<RecoveryConfig>> {
        self.recovery_configs
            .get(owner.as_bytes())?
            .map(|value| {
                serde_json::from_slice(&value)
                    .map_err(|_| Error::bad_database("Invalid recovery config in store."))
            })
            .transpose()
    }

    fn delete_config(&self, owner: &str) -> Result<()> {
        self.recovery_configs.remove(owner.as_bytes())
    }

    fn set_guardian_share(
        &self,
        guardian: &str,
        owner: &str,
        share: &GuardianShare,
    ) -> Result<()> {
        self.guardian_shares
            .insert(&share_key(guardian, owner), &serde_json::to_vec(share)?)
    }

    fn guardian_share(&self, guardian: &str, owner: &str) -> Result<Option<GuardianShare>> {
        self.guardian_shares
            .get(&share_key(guardian, owner))?
            .map(|value| {
                serde_json::from_slice(&value)
                    .map_err(|_| Error::bad_database("Invalid guardian share in store."))
            })
            .transpose()
    }

    fn delete_guardian_share(&self, guardian: &str, owner: &str) -> Result<()> {
        self.guardian_shares.remove(&share_key(guardian, owner))
    }

    fn guardianships(&self, guardian: &str) -> Result<Vec<String>> {
        let mut prefix = guardian.as_bytes().to_vec();
        prefix.push(0xff);

        self.guardian_shares
            .scan_prefix(prefix.clone())
            .map(|(key, _)| {
                utils::string_from_bytes(&key[prefix.len()..])
                    .map_err(|_| Error::bad_database("Invalid owner pubkey in share key."))
            })
            .collect()
    }

    fn set_session(&self, session: &RecoverySession, expires_at_ms: u64) -> Result<()> {
        self.recovery_sessions.insert(
            session.session_id.as_bytes(),
            &encode_expiring(expires_at_ms, &serde_json::to_vec(session)?),
        )
    }

    fn session(&self, session_id: &str) -> Result<Option<RecoverySession>> {
        let now = utils::millis_since_unix_epoch();

        self.recovery_sessions
            .get(session_id.as_bytes())?
            .as_deref()
            .and_then(|raw| live_value(raw, now))
            .map(|value| {
                serde_json::from_slice(value)
                    .map_err(|_| Error::bad_database("Invalid recovery session in store."))
            })
            .transpose()
    }

    fn set_session_share_if_absent(
        &self,
        session_id: &str,
        guardian: &str,
        re_encrypted_share: &str,
        expires_at_ms: u64,
    ) -> Result<bool> {
        self.session_shares.insert_if_absent(
            &session_share_key(session_id, guardian),
            &encode_expiring(expires_at_ms, re_encrypted_share.as_bytes()),
        )
    }

    fn session_shares(&self, session_id: &str) -> Result<Vec<(String, String)>> {
        let now = utils::millis_since_unix_epoch();
        let mut prefix = session_id.as_bytes().to_vec();
        prefix.push(0xff);

        self.session_shares
            .scan_prefix(prefix.clone())
            .filter_map(|(key, value)| {
                let share = live_value(&value, now)?.to_vec();
                Some((key, share))
            })
            .map(|(key, share)| {
                let guardian = utils::string_from_bytes(&key[prefix.len()..])
                    .map_err(|_| Error::bad_database("Invalid guardian pubkey in share key."))?;
                let share = String::from_utf8(share)
                    .map_err(|_| Error::bad_database("Invalid re-encrypted share in store."))?;
                Ok((guardian, share))
            })
            .collect()
    }

    fn record_approval(&self, session_id: &str) -> Result<Option<RecoverySession>> {
        let now = utils::millis_since_unix_epoch();
        let mut updated = None;

        self.recovery_sessions
            .update(session_id.as_bytes(), &mut |old| {
                let raw = old?;
                let expires_at = utils::u64_from_bytes(raw.get(..8)?).ok()?;
                let mut session: RecoverySession =
                    serde_json::from_slice(live_value(&raw, now)?).ok()?;

                session.approvals += 1;
                if session.approvals >= session.threshold {
                    session.status = SessionStatus::Ready;
                }

                let encoded =
                    encode_expiring(expires_at, &serde_json::to_vec(&session).ok()?);
                updated = Some(session);
                Some(encoded)
            })?;

        Ok(updated)
    }
}
