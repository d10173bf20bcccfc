use std::sync::Arc;
use std::time::Duration;

use crate::{Config, Result};

pub mod collaborators;
pub mod dms;
pub mod globals;
pub mod recovery;
pub mod verifier;

use collaborators::{HttpBlobStore, HttpDirectory};

pub struct Services {
    pub globals: globals::Service,
    pub verifier: verifier::Service,
    pub recovery: recovery::Service,
    pub dms: dms::Service,
}

impl Services {
    pub fn build<D: recovery::Data + dms::Data + globals::Data + 'static>(
        db: &'static D,
        config: Config,
    ) -> Result<Self> {
        let directory = Arc::new(HttpDirectory::new(&config)?);
        let blobs = Arc::new(HttpBlobStore::new(&config)?);

        Ok(Self {
            verifier: verifier::Service::new(Duration::from_secs(config.signature_skew_seconds)),
            recovery: recovery::Service { db },
            dms: dms::Service {
                db,
                directory,
                blobs,
            },
            globals: globals::Service::load(db, config),
        })
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use std::collections::BTreeMap;
    use std::net::{IpAddr, Ipv4Addr};
    use std::path::Path;

    use crate::{Config, KeyValueDatabase};

    pub(crate) fn test_config(store_path: &Path) -> Config {
        Config {
            address: IpAddr::from(Ipv4Addr::LOCALHOST),
            port: 0,
            tls: None,
            kv_url: store_path.to_string_lossy().into_owned(),
            blob_upload_endpoint: None,
            identity_lookup_endpoint: None,
            dms_cron_secret: "test-secret".to_owned(),
            signature_skew_seconds: 300,
            cleanup_second_interval: 60,
            log: "warn".to_owned(),
            catchall: BTreeMap::new(),
        }
    }

    /// A fresh store for one test. Leaked on purpose: services keep
    /// `&'static` references, and the per-test temp directory must live as
    /// long as they do.
    pub(crate) fn leaked_db() -> &'static KeyValueDatabase {
        let dir = Box::leak(Box::new(
            tempfile::tempdir().expect("test store directory is creatable"),
        ));
        let config = test_config(dir.path());

        Box::leak(Box::new(
            KeyValueDatabase::open(&config).expect("test store opens"),
        ))
    }
}
