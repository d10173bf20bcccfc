use crate::Result;

use super::{GuardianShare, RecoveryConfig, RecoverySession};

pub trait Data: Send + Sync {
    fn set_config(&self, owner: &str, config: &RecoveryConfig) -> Result<()>;
    fn config(&self, owner: &str) -> Result<Option<RecoveryConfig>>;
    fn delete_config(&self, owner: &str) -> Result<()>;

    fn set_guardian_share(
        &self,
        guardian: &str,
        owner: &str,
        share: &GuardianShare,
    ) -> Result<()>;
    fn guardian_share(&self, guardian: &str, owner: &str) -> Result<Option<GuardianShare>>;
    fn delete_guardian_share(&self, guardian: &str, owner: &str) -> Result<()>;

    /// Owners this pubkey holds a share for, derived from the share keys.
    fn guardianships(&self, guardian: &str) -> Result<Vec<String>>;

    fn set_session(&self, session: &RecoverySession, expires_at_ms: u64) -> Result<()>;
    fn session(&self, session_id: &str) -> Result<Option<RecoverySession>>;

    /// Stores a guardian's re-encrypted share unless one already exists for
    /// this (session, guardian) pair. Returns false on the duplicate.
    fn set_session_share_if_absent(
        &self,
        session_id: &str,
        guardian: &str,
        re_encrypted_share: &str,
        expires_at_ms: u64,
    ) -> Result<bool>;

    /// All (guardian, re-encrypted share) pairs recorded for the session.
    fn session_shares(&self, session_id: &str) -> Result<Vec<(String, String)>>;

    /// Atomically bumps the session's approval counter, flipping the status
    /// to ready once the threshold is met. Returns the updated session, or
    /// None when the session is gone or expired.
    fn record_approval(&self, session_id: &str) -> Result<Option<RecoverySession>>;
}
