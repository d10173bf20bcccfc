pub mod abstraction;
pub mod key_value;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{debug, error, info};

use crate::{services, utils, Config, Result, Services, SERVICES};
use abstraction::{sqlite::SqliteEngine, KeyValueDatabaseEngine, KvTree};

pub struct KeyValueDatabase {
    pub(super) db: Arc<dyn KeyValueDatabaseEngine>,

    pub(super) recovery_configs: Arc<dyn KvTree>, // owner -> RecoveryConfig
    pub(super) guardian_shares: Arc<dyn KvTree>,  // guardian + owner -> GuardianShare
    pub(super) recovery_sessions: Arc<dyn KvTree>, // session id -> RecoverySession, TTL 24h
    pub(super) session_shares: Arc<dyn KvTree>, // session id + guardian -> re-encrypted share, TTL 24h

    pub(super) dms_switches: Arc<dyn KvTree>,   // switch id -> DmsSwitch
    pub(super) dms_user_index: Arc<dyn KvTree>, // owner + switch id -> (), presence set
    pub(super) dms_active: Arc<dyn KvTree>,     // switch id -> (), presence set
    pub(super) dms_payloads: Arc<dyn KvTree>,   // local id -> ciphertext, TTL 1y
    pub(super) dms_releases: Arc<dyn KvTree>,   // switch id -> release JSON, TTL 90d
}

impl KeyValueDatabase {
    pub(crate) fn open(config: &Config) -> Result<Self> {
        let engine: Arc<dyn KeyValueDatabaseEngine> =
            Arc::new(Arc::<SqliteEngine>::open(config)?);

        Ok(Self {
            recovery_configs: engine.open_tree("recovery_configs")?,
            guardian_shares: engine.open_tree("guardian_shares")?,
            recovery_sessions: engine.open_tree("recovery_sessions")?,
            session_shares: engine.open_tree("session_shares")?,

            dms_switches: engine.open_tree("dms_switches")?,
            dms_user_index: engine.open_tree("dms_user_index")?,
            dms_active: engine.open_tree("dms_active")?,
            dms_payloads: engine.open_tree("dms_payloads")?,
            dms_releases: engine.open_tree("dms_releases")?,

            db: engine,
        })
    }

    /// Opens the store, builds the services and makes them globally
    /// available, then starts the expiry cleanup task.
    pub async fn load_or_create(config: Config) -> Result<()> {
        let db = Box::leak(Box::new(Self::open(&config)?));

        let services_raw = Box::new(Services::build(db, config)?);

        // This is the first and only time we initialize the SERVICE static
        *SERVICES.write().unwrap() = Some(Box::leak(services_raw));

        db.start_cleanup_task().await;

        Ok(())
    }

    /// Physically deletes expired entries from the TTL-carrying trees.
    /// Reads already treat expired values as absent; this reclaims the
    /// space and keeps scans short.
    pub(crate) fn purge_expired(&self) -> Result<u32> {
        let now = utils::millis_since_unix_epoch();
        let mut removed = 0;

        for tree in [
            &self.recovery_sessions,
            &self.session_shares,
            &self.dms_payloads,
            &self.dms_releases,
        ] {
            let dead: Vec<Vec<u8>> = tree
                .iter()
                .filter(|(_, value)| key_value::is_expired(value, now))
                .map(|(key, _)| key)
                .collect();

            for key in dead {
                tree.remove(&key)?;
                removed += 1;
            }
        }

        Ok(removed)
    }

    async fn start_cleanup_task(&'static self) {
        let period = Duration::from_secs(
            services()
                .globals
                .config
                .cleanup_second_interval
                .into(),
        );

        info!("Cleanup interval set to {:?}", period);

        tokio::spawn(async move {
            let mut i = interval(period);

            loop {
                i.tick().await;
                let start = std::time::Instant::now();

                match self.purge_expired() {
                    Ok(0) => {}
                    Ok(removed) => {
                        debug!(
                            "TTL cleanup removed {} entries in {:?}",
                            removed,
                            start.elapsed()
                        );
                    }
                    Err(error) => error!("TTL cleanup failed: {}", error),
                }
            }
        });
    }
}
