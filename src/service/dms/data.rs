use crate::Result;

use super::{DmsSwitch, ReleaseRecord};

pub trait Data: Send + Sync {
    fn set_switch(&self, switch: &DmsSwitch) -> Result<()>;
    fn switch(&self, switch_id: &str) -> Result<Option<DmsSwitch>>;

    fn index_user_switch(&self, owner: &str, switch_id: &str) -> Result<()>;
    fn unindex_user_switch(&self, owner: &str, switch_id: &str) -> Result<()>;
    fn user_switch_ids(&self, owner: &str) -> Result<Vec<String>>;

    fn mark_active(&self, switch_id: &str) -> Result<()>;
    fn unmark_active(&self, switch_id: &str) -> Result<()>;
    fn active_switch_ids(&self) -> Result<Vec<String>>;

    fn set_fallback_payload(
        &self,
        local_id: &str,
        ciphertext: &str,
        expires_at_ms: u64,
    ) -> Result<()>;
    fn fallback_payload(&self, local_id: &str) -> Result<Option<String>>;

    fn set_release(
        &self,
        switch_id: &str,
        release: &ReleaseRecord,
        expires_at_ms: u64,
    ) -> Result<()>;
    fn release(&self, switch_id: &str) -> Result<Option<ReleaseRecord>>;
}
