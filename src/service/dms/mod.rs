//! The dead-man's-switch scheduler.
//!
//! Senders park a pre-encrypted message addressed to a named recipient,
//! then keep proving liveness with signed check-ins. Each check-in pushes
//! every active switch's deadline out by its own interval; when a deadline
//! passes unanswered, the sweep releases the message at a well-known
//! address the recipient can pull from.

mod data;

pub use data::Data;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::collaborators::{BlobStore, Directory};
use crate::{utils, Error, ErrorKind, Result};

pub const MIN_INTERVAL_HOURS: u32 = 1;
pub const MAX_INTERVAL_HOURS: u32 = 8760;

/// Fallback payloads stored locally when the blob store is down.
pub const PAYLOAD_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);
/// Released messages stay pullable this long.
pub const RELEASE_TTL: Duration = Duration::from_secs(90 * 24 * 60 * 60);

/// Payload handles with this prefix point into the local fallback store
/// rather than the external blob store.
pub const LOCAL_HANDLE_PREFIX: &str = "local:";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchStatus {
    Active,
    Triggered,
    Cancelled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DmsSwitch {
    pub switch_id: String,
    pub sender_pubkey: String,
    pub recipient_username: String,
    pub payload_handle: String,
    pub interval_hours: u32,
    pub next_deadline: DateTime<Utc>,
    pub status: SwitchStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_at: Option<DateTime<Utc>>,
}

/// What the recipient pulls once a switch has fired.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRecord {
    #[serde(rename = "type")]
    pub record_type: String,
    pub switch_id: String,
    pub sender_pubkey: String,
    pub recipient_username: String,
    pub encrypted_message: String,
    pub triggered_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepOutcome {
    pub processed: u32,
    pub total: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

pub struct Service {
    pub db: &'static dyn Data,
    pub directory: Arc<dyn Directory>,
    pub blobs: Arc<dyn BlobStore>,
}

impl Service {
    /// Creates a switch. The recipient must resolve; the ciphertext goes to
    /// the external blob store when possible, or into the local fallback
    /// store with a 1-year TTL when not (the caller is not told which).
    pub async fn create(
        &self,
        sender: &str,
        recipient_username: &str,
        encrypted_message: &str,
        interval_hours: u32,
    ) -> Result<DmsSwitch> {
        if !(MIN_INTERVAL_HOURS..=MAX_INTERVAL_HOURS).contains(&interval_hours) {
            return Err(Error::BadRequest(
                ErrorKind::Validation,
                "Check-in interval must be between 1 and 8760 hours",
            ));
        }
        if encrypted_message.is_empty() {
            return Err(Error::BadRequest(
                ErrorKind::Validation,
                "An encrypted message is required",
            ));
        }

        if self.directory.resolve(recipient_username).await?.is_none() {
            return Err(Error::BadRequest(
                ErrorKind::NotFound,
                "Recipient username is not registered",
            ));
        }

        let payload_handle = match self.blobs.upload(encrypted_message).await {
            Ok(handle) => handle,
            Err(error) => {
                warn!(
                    "Blob upload failed, storing payload locally: {}",
                    error.to_string()
                );

                let local_id = utils::random_string(32);
                let expires_at =
                    utils::millis_since_unix_epoch() + PAYLOAD_TTL.as_millis() as u64;
                self.db
                    .set_fallback_payload(&local_id, encrypted_message, expires_at)?;

                format!("{LOCAL_HANDLE_PREFIX}{local_id}")
            }
        };

        let now = Utc::now();
        let switch = DmsSwitch {
            switch_id: Uuid::new_v4().to_string(),
            sender_pubkey: sender.to_owned(),
            recipient_username: recipient_username.to_owned(),
            payload_handle,
            interval_hours,
            next_deadline: now + chrono::Duration::hours(i64::from(interval_hours)),
            status: SwitchStatus::Active,
            created_at: now,
            triggered_at: None,
        };

        self.db.set_switch(&switch)?;
        self.db.index_user_switch(sender, &switch.switch_id)?;
        self.db.mark_active(&switch.switch_id)?;

        info!(
            "Created switch {} for {} (interval {}h)",
            switch.switch_id, sender, interval_hours
        );

        Ok(switch)
    }

    /// Pushes every active switch's deadline out by its own interval.
    /// Returns how many switches were bumped and the latest new deadline.
    pub fn check_in(&self, sender: &str) -> Result<(u32, Option<DateTime<Utc>>)> {
        let now = Utc::now();
        let mut bumped = 0;
        let mut latest_deadline = None;

        for switch_id in self.db.user_switch_ids(sender)? {
            let Some(mut switch) = self.db.switch(&switch_id)? else {
                continue;
            };
            if switch.status != SwitchStatus::Active {
                continue;
            }

            switch.next_deadline = now + chrono::Duration::hours(i64::from(switch.interval_hours));
            self.db.set_switch(&switch)?;

            bumped += 1;
            if latest_deadline.map_or(true, |latest| switch.next_deadline > latest) {
                latest_deadline = Some(switch.next_deadline);
            }
        }

        debug!("Check-in from {} bumped {} switches", sender, bumped);

        Ok((bumped, latest_deadline))
    }

    /// Cancels a switch. A switch that does not exist and a switch owned by
    /// someone else answer identically, so the endpoint is not an existence
    /// oracle.
    pub fn cancel(&self, sender: &str, switch_id: &str) -> Result<()> {
        let not_found = || Error::BadRequest(ErrorKind::NotFound, "Switch not found");

        let mut switch = self.db.switch(switch_id)?.ok_or_else(not_found)?;
        if switch.sender_pubkey != sender {
            return Err(not_found());
        }

        switch.status = SwitchStatus::Cancelled;
        self.db.set_switch(&switch)?;
        self.db.unindex_user_switch(sender, switch_id)?;
        self.db.unmark_active(switch_id)?;

        info!("Cancelled switch {} for {}", switch_id, sender);

        Ok(())
    }

    /// Metadata for every switch in the owner's index. Ciphertexts are
    /// never part of this listing.
    pub fn list(&self, owner: &str) -> Result<Vec<DmsSwitch>> {
        let mut switches = Vec::new();

        for switch_id in self.db.user_switch_ids(owner)? {
            if let Some(switch) = self.db.switch(&switch_id)? {
                switches.push(switch);
            }
        }

        Ok(switches)
    }

    /// One sweep over the active index: garbage-collects stale entries,
    /// releases every overdue switch, and reports per-switch failures
    /// without aborting the batch.
    pub async fn process_due(&self) -> Result<SweepOutcome> {
        let now = Utc::now();
        let mut due = Vec::new();

        for switch_id in self.db.active_switch_ids()? {
            match self.db.switch(&switch_id)? {
                Some(switch) if switch.status == SwitchStatus::Active => {
                    if switch.next_deadline < now {
                        due.push(switch);
                    }
                }
                // The record vanished or left the active status without
                // leaving the index; heal the index here.
                _ => self.db.unmark_active(&switch_id)?,
            }
        }

        let total = due.len() as u32;
        let mut processed = 0;
        let mut errors = Vec::new();

        for switch in due {
            match self.release(&switch, now).await {
                Ok(()) => processed += 1,
                Err(error) => {
                    warn!(
                        "Failed to release switch {}: {}",
                        switch.switch_id,
                        error.to_string()
                    );
                    errors.push(format!("{}: {}", switch.switch_id, error));
                }
            }
        }

        info!("Sweep released {}/{} due switches", processed, total);

        Ok(SweepOutcome {
            processed,
            total,
            errors,
        })
    }

    async fn release(&self, switch: &DmsSwitch, now: DateTime<Utc>) -> Result<()> {
        // The recipient must still resolve; a vanished username leaves the
        // switch active so a later sweep can retry.
        self.directory
            .resolve(&switch.recipient_username)
            .await?
            .ok_or(Error::BadRequest(
                ErrorKind::NotFound,
                "Recipient username is not registered",
            ))?;

        let encrypted_message = match switch.payload_handle.strip_prefix(LOCAL_HANDLE_PREFIX) {
            Some(local_id) => self.db.fallback_payload(local_id)?.ok_or(
                Error::BadServerResponse("Fallback payload is missing or expired"),
            )?,
            None => self.blobs.fetch(&switch.payload_handle).await?,
        };

        let expires_at = utils::millis_since_unix_epoch() + RELEASE_TTL.as_millis() as u64;
        self.db.set_release(
            &switch.switch_id,
            &ReleaseRecord {
                record_type: "dms_release".to_owned(),
                switch_id: switch.switch_id.clone(),
                sender_pubkey: switch.sender_pubkey.clone(),
                recipient_username: switch.recipient_username.clone(),
                encrypted_message,
                triggered_at: now,
            },
            expires_at,
        )?;

        // Status first, then the index. A crash in between leaves a
        // triggered switch in the active index, which the next sweep heals.
        let mut triggered = switch.clone();
        triggered.status = SwitchStatus::Triggered;
        triggered.triggered_at = Some(now);
        self.db.set_switch(&triggered)?;
        self.db.unmark_active(&switch.switch_id)?;

        info!(
            "Released switch {} to {}",
            switch.switch_id, switch.recipient_username
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::test_utils;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct StubDirectory {
        known: Vec<String>,
    }

    #[async_trait]
    impl Directory for StubDirectory {
        async fn resolve(&self, username: &str) -> Result<Option<String>> {
            Ok(self
                .known
                .iter()
                .any(|known| known == username)
                .then(|| format!("pk-{username}")))
        }
    }

    #[derive(Default)]
    struct StubBlobs {
        fail_uploads: bool,
        stored: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl BlobStore for StubBlobs {
        async fn upload(&self, data: &str) -> Result<String> {
            if self.fail_uploads {
                return Err(Error::BadServerResponse("Blob upload failed"));
            }

            let mut stored = self.stored.lock().unwrap();
            let handle = format!("blob-{}", stored.len());
            stored.insert(handle.clone(), data.to_owned());
            Ok(handle)
        }

        async fn fetch(&self, handle: &str) -> Result<String> {
            self.stored
                .lock()
                .unwrap()
                .get(handle)
                .cloned()
                .ok_or(Error::BadServerResponse("Blob fetch failed"))
        }
    }

    fn service_with(known_recipients: &[&str], fail_uploads: bool) -> Service {
        Service {
            db: test_utils::leaked_db(),
            directory: Arc::new(StubDirectory {
                known: known_recipients.iter().map(|s| (*s).to_owned()).collect(),
            }),
            blobs: Arc::new(StubBlobs {
                fail_uploads,
                ..Default::default()
            }),
        }
    }

    fn backdate(svc: &Service, switch_id: &str, hours: i64) {
        let mut switch = svc.db.switch(switch_id).unwrap().unwrap();
        switch.next_deadline = Utc::now() - chrono::Duration::hours(hours);
        svc.db.set_switch(&switch).unwrap();
    }

    fn kind(result: Result<impl std::fmt::Debug>) -> ErrorKind {
        match result.unwrap_err() {
            Error::BadRequest(kind, _) => kind,
            other => panic!("expected BadRequest, got {other}"),
        }
    }

    #[tokio::test]
    async fn create_indexes_the_switch_and_stamps_a_future_deadline() {
        let svc = service_with(&["alice"], false);
        let switch = svc.create("sender", "alice", "ciphertext", 24).await.unwrap();

        assert_eq!(switch.status, SwitchStatus::Active);
        assert!(switch.next_deadline > Utc::now());
        assert!(!switch.payload_handle.starts_with(LOCAL_HANDLE_PREFIX));

        assert_eq!(svc.db.user_switch_ids("sender").unwrap(), [switch.switch_id.clone()]);
        assert_eq!(svc.db.active_switch_ids().unwrap(), [switch.switch_id]);
    }

    #[tokio::test]
    async fn create_validates_interval_and_recipient() {
        let svc = service_with(&["alice"], false);

        for interval in [0, 8761] {
            assert_eq!(
                kind(svc.create("s", "alice", "c", interval).await),
                ErrorKind::Validation
            );
        }
        // The boundary values themselves are fine.
        svc.create("s", "alice", "c", 1).await.unwrap();
        svc.create("s", "alice", "c", 8760).await.unwrap();

        assert_eq!(
            kind(svc.create("s", "nobody", "c", 24).await),
            ErrorKind::NotFound
        );
        assert_eq!(kind(svc.create("s", "alice", "", 24).await), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn create_falls_back_to_a_local_payload_when_uploads_fail() {
        let svc = service_with(&["alice"], true);
        let switch = svc.create("sender", "alice", "ciphertext", 24).await.unwrap();

        let local_id = switch
            .payload_handle
            .strip_prefix(LOCAL_HANDLE_PREFIX)
            .expect("handle uses the local fallback");
        assert_eq!(
            svc.db.fallback_payload(local_id).unwrap().as_deref(),
            Some("ciphertext")
        );
    }

    #[tokio::test]
    async fn check_in_bumps_each_active_switch_by_its_own_interval() {
        let svc = service_with(&["alice"], false);
        let short = svc.create("sender", "alice", "c1", 1).await.unwrap();
        let long = svc.create("sender", "alice", "c2", 48).await.unwrap();
        backdate(&svc, &short.switch_id, 2);
        backdate(&svc, &long.switch_id, 2);

        let before = Utc::now();
        let (count, latest) = svc.check_in("sender").unwrap();
        assert_eq!(count, 2);

        let short = svc.db.switch(&short.switch_id).unwrap().unwrap();
        let long = svc.db.switch(&long.switch_id).unwrap().unwrap();
        assert!(short.next_deadline >= before + chrono::Duration::hours(1));
        assert!(long.next_deadline >= before + chrono::Duration::hours(48));
        assert_eq!(latest, Some(long.next_deadline));
    }

    #[tokio::test]
    async fn check_in_with_no_switches_succeeds_with_count_zero() {
        let svc = service_with(&[], false);
        assert_eq!(svc.check_in("sender").unwrap(), (0, None));
    }

    #[tokio::test]
    async fn cancel_removes_the_switch_from_both_indices() {
        let svc = service_with(&["alice"], false);
        let switch = svc.create("sender", "alice", "c", 24).await.unwrap();

        svc.cancel("sender", &switch.switch_id).unwrap();

        let switch = svc.db.switch(&switch.switch_id).unwrap().unwrap();
        assert_eq!(switch.status, SwitchStatus::Cancelled);
        assert!(svc.db.user_switch_ids("sender").unwrap().is_empty());
        assert!(svc.db.active_switch_ids().unwrap().is_empty());
        assert!(svc.list("sender").unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_collapses_missing_and_foreign_switches_into_not_found() {
        let svc = service_with(&["alice"], false);
        let switch = svc.create("sender", "alice", "c", 24).await.unwrap();

        assert_eq!(kind(svc.cancel("sender", "no-such-switch")), ErrorKind::NotFound);
        assert_eq!(
            kind(svc.cancel("other-user", &switch.switch_id)),
            ErrorKind::NotFound
        );

        // And the switch is untouched.
        assert_eq!(
            svc.db.switch(&switch.switch_id).unwrap().unwrap().status,
            SwitchStatus::Active
        );
    }

    #[tokio::test]
    async fn sweep_releases_overdue_switches() {
        let svc = service_with(&["alice"], false);
        let overdue = svc.create("sender", "alice", "secret-msg", 1).await.unwrap();
        let healthy = svc.create("sender", "alice", "other-msg", 48).await.unwrap();
        backdate(&svc, &overdue.switch_id, 1);

        let outcome = svc.process_due().await.unwrap();
        assert_eq!((outcome.processed, outcome.total), (1, 1));
        assert!(outcome.errors.is_empty());

        let released = svc.db.switch(&overdue.switch_id).unwrap().unwrap();
        assert_eq!(released.status, SwitchStatus::Triggered);
        assert!(released.triggered_at.is_some());

        let record = svc.db.release(&overdue.switch_id).unwrap().unwrap();
        assert_eq!(record.record_type, "dms_release");
        assert_eq!(record.encrypted_message, "secret-msg");
        assert_eq!(record.recipient_username, "alice");

        // The healthy switch is untouched and alone in the active index;
        // the triggered one stays in the owner's history.
        assert_eq!(svc.db.active_switch_ids().unwrap(), [healthy.switch_id]);
        assert_eq!(svc.db.user_switch_ids("sender").unwrap().len(), 2);
        assert_eq!(svc.list("sender").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn sweep_releases_local_fallback_payloads_identically() {
        let svc = service_with(&["alice"], true);
        let switch = svc.create("sender", "alice", "fallback-msg", 1).await.unwrap();
        backdate(&svc, &switch.switch_id, 1);

        let outcome = svc.process_due().await.unwrap();
        assert_eq!(outcome.processed, 1);

        let record = svc.db.release(&switch.switch_id).unwrap().unwrap();
        assert_eq!(record.encrypted_message, "fallback-msg");
    }

    #[tokio::test]
    async fn sweep_records_resolution_failures_and_keeps_the_switch_active() {
        let svc = service_with(&["alice"], false);
        let switch = svc.create("sender", "alice", "c", 1).await.unwrap();
        backdate(&svc, &switch.switch_id, 1);

        // The recipient disappears from the registry before the deadline.
        let svc = Service {
            db: svc.db,
            directory: Arc::new(StubDirectory { known: vec![] }),
            blobs: svc.blobs,
        };

        let outcome = svc.process_due().await.unwrap();
        assert_eq!((outcome.processed, outcome.total), (0, 1));
        assert_eq!(outcome.errors.len(), 1);

        // Still active, still indexed: the next sweep retries.
        assert_eq!(
            svc.db.switch(&switch.switch_id).unwrap().unwrap().status,
            SwitchStatus::Active
        );
        assert_eq!(svc.db.active_switch_ids().unwrap(), [switch.switch_id]);
    }

    #[tokio::test]
    async fn sweep_heals_stale_active_index_entries() {
        let svc = service_with(&["alice"], false);
        let switch = svc.create("sender", "alice", "c", 24).await.unwrap();

        // Simulate a crash that left a cancelled switch in the active index.
        let mut cancelled = svc.db.switch(&switch.switch_id).unwrap().unwrap();
        cancelled.status = SwitchStatus::Cancelled;
        svc.db.set_switch(&cancelled).unwrap();

        let outcome = svc.process_due().await.unwrap();
        assert_eq!((outcome.processed, outcome.total), (0, 0));
        assert!(svc.db.active_switch_ids().unwrap().is_empty());
    }

    #[tokio::test]
    async fn check_in_before_the_deadline_keeps_the_switch_out_of_the_sweep() {
        let svc = service_with(&["alice"], false);
        let switch = svc.create("sender", "alice", "c", 1).await.unwrap();

        // 50 minutes in: the owner checks in, moving the deadline to ~110
        // minutes. A sweep at the original deadline finds nothing due.
        let mut aged = svc.db.switch(&switch.switch_id).unwrap().unwrap();
        aged.next_deadline = Utc::now() + chrono::Duration::minutes(10);
        svc.db.set_switch(&aged).unwrap();

        svc.check_in("sender").unwrap();

        let outcome = svc.process_due().await.unwrap();
        assert_eq!(outcome.total, 0);
        assert_eq!(
            svc.db.switch(&switch.switch_id).unwrap().unwrap().status,
            SwitchStatus::Active
        );
    }
}
