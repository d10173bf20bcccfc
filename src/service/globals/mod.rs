mod data;

pub use data::Data;

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::error;

use crate::Config;

pub struct Service {
    pub db: &'static dyn Data,

    pub config: Config,

    pub shutdown: AtomicBool,
}

impl Service {
    pub fn load(db: &'static dyn Data, config: Config) -> Self {
        Self {
            db,
            config,
            shutdown: AtomicBool::new(false),
        }
    }

    /// Compares the presented `X-Cron-Secret` value against the configured
    /// one in constant time.
    pub fn cron_secret_matches(&self, presented: &str) -> bool {
        ring::constant_time::verify_slices_are_equal(
            presented.as_bytes(),
            self.config.dms_cron_secret.as_bytes(),
        )
        .is_ok()
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);

        // Last chance to get the write-ahead log onto disk.
        if let Err(error) = self.db.flush() {
            error!("Failed to flush the store during shutdown: {}", error);
        }
    }
}
