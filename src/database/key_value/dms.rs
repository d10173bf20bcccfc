use crate::{
    database::KeyValueDatabase,
    service::{
        self,
        dms::{DmsSwitch, ReleaseRecord},
    },
    utils, Error, Result,
};

use super::{encode_expiring, live_value};

fn user_index_key(owner: &str, switch_id: &str) -> Vec<u8> {
    let mut key = owner.as_bytes().to_vec();
    key.push(0xff);
    key.extend_from_slice(switch_id.as_bytes());
    key
}

impl service::dms::Data for KeyValueDatabase {
    fn set_switch(&self, switch: &DmsSwitch) -> Result<()> {
        self.dms_switches
            .insert(switch.switch_id.as_bytes(), &serde_json::to_vec(switch)?)
    }

    fn switch(&self, switch_id: &str) -> Result<Option<DmsSwitch>> {
        self.dms_switches
            .get(switch_id.as_bytes())?
            .map(|value| {
                serde_json::from_slice(&value)
                    .map_err(|_| Error::bad_database("Invalid switch record in store."))
            })
            .transpose()
    }

    fn index_user_switch(&self, owner: &str, switch_id: &str) -> Result<()> {
        self.dms_user_index.insert(&user_index_key(owner, switch_id), &[])
    }

    fn unindex_user_switch(&self, owner: &str, switch_id: &str) -> Result<()> {
        self.dms_user_index.remove(&user_index_key(owner, switch_id))
    }

    fn user_switch_ids(&self, owner: &str) -> Result<Vec<String>> {
        let mut prefix = owner.as_bytes().to_vec();
        prefix.push(0xff);

        self.dms_user_index
            .scan_prefix(prefix.clone())
            .map(|(key, _)| {
                utils::string_from_bytes(&key[prefix.len()..])
                    .map_err(|_| Error::bad_database("Invalid switch id in user index."))
            })
            .collect()
    }

    fn mark_active(&self, switch_id: &str) -> Result<()> {
        self.dms_active.insert(switch_id.as_bytes(), &[])
    }

    fn unmark_active(&self, switch_id: &str) -> Result<()> {
        self.dms_active.remove(switch_id.as_bytes())
    }

    fn active_switch_ids(&self) -> Result<Vec<String>> {
        self.dms_active
            .iter()
            .map(|(key, _)| {
                utils::string_from_bytes(&key)
                    .map_err(|_| Error::bad_database("Invalid switch id in active index."))
            })
            .collect()
    }

    fn set_fallback_payload(
        &self,
        local_id: &str,
        ciphertext: &str,
        expires_at_ms: u64,
    ) -> Result<()> {
        self.dms_payloads.insert(
            local_id.as_bytes(),
            &encode_expiring(expires_at_ms, ciphertext.as_bytes()),
        )
    }

    fn fallback_payload(&self, local_id: &str) -> Result<Option<String>> {
        let now = utils::millis_since_unix_epoch();

        self.dms_payloads
            .get(local_id.as_bytes())?
            .as_deref()
            .and_then(|raw| live_value(raw, now))
            .map(|value| {
                utils::string_from_bytes(value)
                    .map_err(|_| Error::bad_database("Invalid fallback payload in store."))
            })
            .transpose()
    }

    fn set_release(
        &self,
        switch_id: &str,
        release: &ReleaseRecord,
        expires_at_ms: u64,
    ) -> Result<()> {
        self.dms_releases.insert(
            switch_id.as_bytes(),
            &encode_expiring(expires_at_ms, &serde_json::to_vec(release)?),
        )
    }

    fn release(&self, switch_id: &str) -> Result<Option<ReleaseRecord>> {
        let now = utils::millis_since_unix_epoch();

        self.dms_releases
            .get(switch_id.as_bytes())?
            .as_deref()
            .and_then(|raw| live_value(raw, now))
            .map(|value| {
                serde_json::from_slice(value)
                    .map_err(|_| Error::bad_database("Invalid release record in store."))
            })
            .transpose()
    }
}
