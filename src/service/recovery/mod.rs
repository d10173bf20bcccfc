//! The recovery orchestrator.
//!
//! Owners split their secret key client-side and park one encrypted share
//! per guardian here. When the owner resurfaces on a new device they open a
//! session; guardians who approve re-encrypt their share to the session's
//! one-time ephemeral key, and once the configured threshold of them has
//! done so the shares are released to whoever holds the session id.

mod data;

pub use data::Data;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{Error, ErrorKind, Result};

/// Sessions (and the shares collected under them) live this long.
pub const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub const MIN_THRESHOLD: u32 = 2;
pub const MAX_GUARDIANS: usize = 10;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryConfig {
    pub threshold: u32,
    pub guardians: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardianShare {
    pub encrypted_share: String,
    pub share_index: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Ready,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverySession {
    pub session_id: String,
    pub owner_pubkey: String,
    pub ephemeral_pubkey: String,
    pub requested_guardians: Vec<String>,
    pub threshold: u32,
    pub approvals: u32,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
}

impl RecoverySession {
    pub(crate) fn expires_at_ms(&self) -> u64 {
        self.created_at.timestamp_millis() as u64 + SESSION_TTL.as_millis() as u64
    }
}

/// One guardian's slot in a distribute call.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardianUpload {
    pub pubkey: String,
    pub encrypted_share: String,
    pub share_index: u32,
}

pub struct Service {
    pub db: &'static dyn Data,
}

impl Service {
    /// Idempotent replacement of the owner's k-of-n setup: any previous
    /// config and shares are revoked first, then the new set is written.
    pub fn distribute(
        &self,
        owner: &str,
        threshold: u32,
        guardians: &[GuardianUpload],
    ) -> Result<RecoveryConfig> {
        if threshold < MIN_THRESHOLD {
            return Err(Error::BadRequest(
                ErrorKind::Validation,
                "Threshold must be at least 2",
            ));
        }
        if (guardians.len() as u32) < threshold {
            return Err(Error::BadRequest(
                ErrorKind::Validation,
                "Threshold cannot exceed the number of guardians",
            ));
        }
        if guardians.len() > MAX_GUARDIANS {
            return Err(Error::BadRequest(
                ErrorKind::Validation,
                "At most 10 guardians are supported",
            ));
        }

        // Share indices must be exactly 0..n-1 and guardians must be
        // distinct, otherwise shares would overwrite each other.
        let mut seen_indices = vec![false; guardians.len()];
        for guardian in guardians {
            if guardian.pubkey.is_empty() || guardian.encrypted_share.is_empty() {
                return Err(Error::BadRequest(
                    ErrorKind::Validation,
                    "Guardian entries need a pubkey and an encrypted share",
                ));
            }
            match seen_indices.get_mut(guardian.share_index as usize) {
                Some(seen) if !*seen => *seen = true,
                _ => {
                    return Err(Error::BadRequest(
                        ErrorKind::Validation,
                        "Share indices must uniquely cover 0..n-1",
                    ))
                }
            }
        }
        let mut pubkeys: Vec<&str> = guardians.iter().map(|g| g.pubkey.as_str()).collect();
        pubkeys.sort_unstable();
        pubkeys.dedup();
        if pubkeys.len() != guardians.len() {
            return Err(Error::BadRequest(
                ErrorKind::Validation,
                "Guardian pubkeys must be distinct",
            ));
        }

        self.revoke(owner)?;

        let created_at = Utc::now();
        let config = RecoveryConfig {
            threshold,
            guardians: guardians.iter().map(|g| g.pubkey.clone()).collect(),
            created_at,
        };
        self.db.set_config(owner, &config)?;

        for guardian in guardians {
            self.db.set_guardian_share(
                &guardian.pubkey,
                owner,
                &GuardianShare {
                    encrypted_share: guardian.encrypted_share.clone(),
                    share_index: guardian.share_index,
                    created_at,
                },
            )?;
        }

        info!(
            "Distributed {}-of-{} recovery setup for {}",
            threshold,
            guardians.len(),
            owner
        );

        Ok(config)
    }

    pub fn config(&self, owner: &str) -> Result<Option<RecoveryConfig>> {
        self.db.config(owner)
    }

    pub fn guardianships(&self, guardian: &str) -> Result<Vec<String>> {
        self.db.guardianships(guardian)
    }

    /// Deletes the owner's shares, then the config. Revoking a non-existent
    /// setup is a no-op success.
    pub fn revoke(&self, owner: &str) -> Result<()> {
        let Some(config) = self.db.config(owner)? else {
            return Ok(());
        };

        for guardian in &config.guardians {
            self.db.delete_guardian_share(guardian, owner)?;
        }
        self.db.delete_config(owner)?;

        debug!("Revoked recovery setup for {}", owner);

        Ok(())
    }

    /// Opens an approval session. Unauthenticated by design: the caller
    /// has, by hypothesis, lost every signing key they ever had.
    pub fn create_session(
        &self,
        owner: &str,
        ephemeral_pubkey: &str,
        requested_guardians: Vec<String>,
    ) -> Result<RecoverySession> {
        let config = self.db.config(owner)?.ok_or(Error::BadRequest(
            ErrorKind::NotFound,
            "No recovery setup exists for this identity",
        ))?;

        if ephemeral_pubkey.is_empty() {
            return Err(Error::BadRequest(
                ErrorKind::Validation,
                "An ephemeral public key is required",
            ));
        }
        if requested_guardians.is_empty()
            || !requested_guardians
                .iter()
                .all(|g| config.guardians.contains(g))
        {
            return Err(Error::BadRequest(
                ErrorKind::Validation,
                "Requested guardians must be a non-empty subset of the configured guardians",
            ));
        }

        let session = RecoverySession {
            session_id: Uuid::new_v4().to_string(),
            owner_pubkey: owner.to_owned(),
            ephemeral_pubkey: ephemeral_pubkey.to_owned(),
            requested_guardians,
            threshold: config.threshold,
            approvals: 0,
            status: SessionStatus::Pending,
            created_at: Utc::now(),
        };

        self.db.set_session(&session, session.expires_at_ms())?;

        info!(
            "Opened recovery session {} for {}",
            session.session_id, owner
        );

        Ok(session)
    }

    pub fn session(&self, session_id: &str) -> Result<Option<RecoverySession>> {
        self.db.session(session_id)
    }

    /// Records one guardian's approval: stores their re-encrypted share,
    /// bumps the counter, and flips the session to ready at the threshold.
    pub fn approve(
        &self,
        session_id: &str,
        guardian: &str,
        re_encrypted_share: &str,
    ) -> Result<RecoverySession> {
        let session = self.db.session(session_id)?.ok_or(session_not_found())?;

        // A revoked owner must not keep accumulating shares.
        if self.db.config(&session.owner_pubkey)?.is_none() {
            return Err(Error::BadRequest(
                ErrorKind::NotFound,
                "No recovery setup exists for this identity",
            ));
        }

        if !session.requested_guardians.iter().any(|g| g == guardian) {
            return Err(Error::BadRequest(
                ErrorKind::AuthInvalid,
                "Guardian is not part of this session",
            ));
        }

        if re_encrypted_share.is_empty() {
            return Err(Error::BadRequest(
                ErrorKind::Validation,
                "A re-encrypted share is required",
            ));
        }

        let first_approval = self.db.set_session_share_if_absent(
            session_id,
            guardian,
            re_encrypted_share,
            session.expires_at_ms(),
        )?;
        if !first_approval {
            return Err(Error::BadRequest(
                ErrorKind::Conflict,
                "Guardian has already approved this session",
            ));
        }

        let session = self
            .db
            .record_approval(session_id)?
            .ok_or(session_not_found())?;

        debug!(
            "Approval {}/{} recorded on session {}",
            session.approvals, session.threshold, session_id
        );

        Ok(session)
    }

    /// The collected shares, released only once the threshold was reached.
    /// Unauthenticated by design: every share is sealed to the session's
    /// ephemeral key, which never travelled over the network.
    pub fn released_shares(&self, session_id: &str) -> Result<Vec<(String, String)>> {
        let session = self.db.session(session_id)?.ok_or(session_not_found())?;

        if session.status != SessionStatus::Ready {
            return Err(Error::BadRequest(
                ErrorKind::NotReady,
                "Not enough guardians have approved yet",
            ));
        }

        self.db.session_shares(session_id)
    }
}

fn session_not_found() -> Error {
    Error::BadRequest(ErrorKind::NotFound, "Recovery session not found or expired")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::test_utils;
    use crate::ErrorKind;

    fn service() -> Service {
        Service {
            db: test_utils::leaked_db(),
        }
    }

    fn upload(pubkey: &str, index: u32) -> GuardianUpload {
        GuardianUpload {
            pubkey: pubkey.to_owned(),
            encrypted_share: format!("ciphertext-{index}"),
            share_index: index,
        }
    }

    fn three_guardians() -> Vec<GuardianUpload> {
        vec![upload("g1", 0), upload("g2", 1), upload("g3", 2)]
    }

    fn kind(result: Result<impl std::fmt::Debug>) -> ErrorKind {
        match result.unwrap_err() {
            Error::BadRequest(kind, _) => kind,
            other => panic!("expected BadRequest, got {other}"),
        }
    }

    #[test]
    fn distribute_writes_config_and_one_share_per_guardian() {
        let svc = service();
        svc.distribute("owner", 2, &three_guardians()).unwrap();

        let config = svc.config("owner").unwrap().unwrap();
        assert_eq!(config.threshold, 2);
        assert_eq!(config.guardians, ["g1", "g2", "g3"]);

        for (guardian, index) in [("g1", 0), ("g2", 1), ("g3", 2)] {
            let share = svc.db.guardian_share(guardian, "owner").unwrap().unwrap();
            assert_eq!(share.share_index, index);
        }
    }

    #[test]
    fn distribute_is_an_idempotent_replacement() {
        let svc = service();
        svc.distribute("owner", 2, &three_guardians()).unwrap();
        svc.distribute("owner", 2, &[upload("g4", 0), upload("g5", 1)])
            .unwrap();

        let config = svc.config("owner").unwrap().unwrap();
        assert_eq!(config.guardians, ["g4", "g5"]);

        // The old guardians' shares are gone.
        assert!(svc.db.guardian_share("g1", "owner").unwrap().is_none());
        assert_eq!(svc.guardianships("g1").unwrap(), Vec::<String>::new());
        assert_eq!(svc.guardianships("g4").unwrap(), ["owner"]);
    }

    #[test]
    fn distribute_rejects_bad_shapes() {
        let svc = service();

        // threshold = 1
        assert_eq!(
            kind(svc.distribute("o", 1, &three_guardians())),
            ErrorKind::Validation
        );
        // more required approvals than guardians
        assert_eq!(
            kind(svc.distribute("o", 4, &three_guardians())),
            ErrorKind::Validation
        );
        // 11 guardians
        let eleven: Vec<_> = (0..11).map(|i| upload(&format!("g{i}"), i)).collect();
        assert_eq!(kind(svc.distribute("o", 2, &eleven)), ErrorKind::Validation);
        // duplicate share index
        assert_eq!(
            kind(svc.distribute("o", 2, &[upload("a", 0), upload("b", 0)])),
            ErrorKind::Validation
        );
        // index outside 0..n-1
        assert_eq!(
            kind(svc.distribute("o", 2, &[upload("a", 0), upload("b", 2)])),
            ErrorKind::Validation
        );
        // duplicate guardian pubkey
        assert_eq!(
            kind(svc.distribute("o", 2, &[upload("a", 0), upload("a", 1)])),
            ErrorKind::Validation
        );

        assert!(svc.config("o").unwrap().is_none());
    }

    #[test]
    fn distribute_accepts_threshold_equal_to_n() {
        let svc = service();
        let config = svc.distribute("owner", 3, &three_guardians()).unwrap();
        assert_eq!(config.threshold, 3);
    }

    #[test]
    fn revoke_removes_config_and_shares() {
        let svc = service();
        svc.distribute("owner", 2, &three_guardians()).unwrap();
        svc.revoke("owner").unwrap();

        assert!(svc.config("owner").unwrap().is_none());
        for guardian in ["g1", "g2", "g3"] {
            assert!(svc.db.guardian_share(guardian, "owner").unwrap().is_none());
        }

        // Idempotent.
        svc.revoke("owner").unwrap();
    }

    #[test]
    fn two_of_three_happy_path() {
        let svc = service();
        svc.distribute("owner", 2, &three_guardians()).unwrap();

        let session = svc
            .create_session(
                "owner",
                "ephemeral-pk",
                vec!["g1".into(), "g2".into(), "g3".into()],
            )
            .unwrap();
        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(session.threshold, 2);

        let sid = session.session_id.clone();

        let after_first = svc.approve(&sid, "g1", "r1").unwrap();
        assert_eq!(after_first.approvals, 1);
        assert_eq!(after_first.status, SessionStatus::Pending);

        // Shares are locked away until the threshold is met.
        assert_eq!(kind(svc.released_shares(&sid)), ErrorKind::NotReady);

        let after_second = svc.approve(&sid, "g2", "r2").unwrap();
        assert_eq!(after_second.approvals, 2);
        assert_eq!(after_second.status, SessionStatus::Ready);

        let mut shares = svc.released_shares(&sid).unwrap();
        shares.sort();
        assert_eq!(
            shares,
            [
                ("g1".to_owned(), "r1".to_owned()),
                ("g2".to_owned(), "r2".to_owned())
            ]
        );

        // A third approval after ready still lands.
        let after_third = svc.approve(&sid, "g3", "r3").unwrap();
        assert_eq!(after_third.approvals, 3);
        assert_eq!(svc.released_shares(&sid).unwrap().len(), 3);
    }

    #[test]
    fn double_approval_is_a_conflict() {
        let svc = service();
        svc.distribute("owner", 2, &three_guardians()).unwrap();
        let sid = svc
            .create_session("owner", "ep", vec!["g1".into(), "g2".into()])
            .unwrap()
            .session_id;

        svc.approve(&sid, "g1", "r1").unwrap();
        assert_eq!(kind(svc.approve(&sid, "g1", "r1-again")), ErrorKind::Conflict);

        // The counter did not move and the stored share is the original.
        let session = svc.session(&sid).unwrap().unwrap();
        assert_eq!(session.approvals, 1);
        assert_eq!(
            svc.db.session_shares(&sid).unwrap(),
            [("g1".to_owned(), "r1".to_owned())]
        );
    }

    #[test]
    fn approval_from_outside_the_requested_set_is_rejected() {
        let svc = service();
        svc.distribute("owner", 2, &three_guardians()).unwrap();
        let sid = svc
            .create_session("owner", "ep", vec!["g1".into(), "g2".into()])
            .unwrap()
            .session_id;

        // g3 is configured but was not requested for this session.
        assert_eq!(kind(svc.approve(&sid, "g3", "r3")), ErrorKind::AuthInvalid);
        // A complete stranger fails the same way.
        assert_eq!(kind(svc.approve(&sid, "mallory", "rm")), ErrorKind::AuthInvalid);
    }

    #[test]
    fn empty_re_encrypted_share_is_rejected() {
        let svc = service();
        svc.distribute("owner", 2, &three_guardians()).unwrap();
        let sid = svc
            .create_session("owner", "ep", vec!["g1".into(), "g2".into()])
            .unwrap()
            .session_id;

        assert_eq!(kind(svc.approve(&sid, "g1", "")), ErrorKind::Validation);
        assert_eq!(svc.session(&sid).unwrap().unwrap().approvals, 0);
    }

    #[test]
    fn sessions_require_an_existing_config_and_a_valid_subset() {
        let svc = service();

        assert_eq!(
            kind(svc.create_session("owner", "ep", vec!["g1".into()])),
            ErrorKind::NotFound
        );

        svc.distribute("owner", 2, &three_guardians()).unwrap();

        assert_eq!(
            kind(svc.create_session("owner", "ep", vec![])),
            ErrorKind::Validation
        );
        assert_eq!(
            kind(svc.create_session("owner", "ep", vec!["stranger".into()])),
            ErrorKind::Validation
        );
    }

    #[test]
    fn approval_against_a_revoked_setup_fails() {
        let svc = service();
        svc.distribute("owner", 2, &three_guardians()).unwrap();
        let sid = svc
            .create_session("owner", "ep", vec!["g1".into(), "g2".into()])
            .unwrap()
            .session_id;

        svc.revoke("owner").unwrap();

        assert_eq!(kind(svc.approve(&sid, "g1", "r1")), ErrorKind::NotFound);
    }

    #[test]
    fn expired_sessions_behave_as_absent() {
        let svc = service();
        svc.distribute("owner", 2, &three_guardians()).unwrap();
        let session = svc
            .create_session("owner", "ep", vec!["g1".into(), "g2".into()])
            .unwrap();
        let sid = session.session_id.clone();

        // Rewrite the record with an expiry that has already elapsed.
        svc.db.set_session(&session, 1).unwrap();

        assert!(svc.session(&sid).unwrap().is_none());
        assert_eq!(kind(svc.approve(&sid, "g1", "r1")), ErrorKind::NotFound);
        assert_eq!(kind(svc.released_shares(&sid)), ErrorKind::NotFound);
    }

    #[test]
    fn concurrent_double_approval_admits_exactly_one() {
        let db = test_utils::leaked_db();
        let svc = Service { db };
        svc.distribute("owner", 2, &three_guardians()).unwrap();
        let sid = svc
            .create_session("owner", "ep", vec!["g1".into(), "g2".into()])
            .unwrap()
            .session_id;

        let results: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let sid = sid.clone();
                    scope.spawn(move || Service { db }.approve(&sid, "g1", "race"))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect()
        });

        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
        assert_eq!(svc.session(&sid).unwrap().unwrap().approvals, 1);
        assert_eq!(svc.db.session_shares(&sid).unwrap().len(), 1);
    }

    #[test]
    fn unknown_sessions_are_not_found() {
        let svc = service();
        assert_eq!(kind(svc.released_shares("nope")), ErrorKind::NotFound);
        assert_eq!(kind(svc.approve("nope", "g1", "r1")), ErrorKind::NotFound);
        assert!(svc.session("nope").unwrap().is_none());
    }
}
