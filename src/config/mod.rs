use std::{
    collections::BTreeMap,
    fmt,
    net::{IpAddr, Ipv4Addr},
};

use serde::{de::IgnoredAny, Deserialize};
use tracing::warn;
use url::Url;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_address")]
    pub address: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    pub tls: Option<TlsConfig>,

    /// Path (or `sqlite://` URL) of the key-value store directory.
    #[serde(default = "default_kv_url")]
    pub kv_url: String,

    /// External permanent ciphertext store. When unset or unreachable,
    /// `/api/dms/create` falls back to a local payload with a 1-year TTL.
    pub blob_upload_endpoint: Option<Url>,
    /// External username -> pubkey resolver.
    pub identity_lookup_endpoint: Option<Url>,

    /// Shared secret required by the `/api/dms/process` sweep endpoint.
    pub dms_cron_secret: String,

    /// Freshness window for signed-request timestamps.
    #[serde(default = "default_signature_skew_seconds")]
    pub signature_skew_seconds: u64,

    #[serde(default = "default_cleanup_second_interval")]
    pub cleanup_second_interval: u32,
    #[serde(default = "default_log")]
    pub log: String,

    #[serde(flatten)]
    pub catchall: BTreeMap<String, IgnoredAny>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TlsConfig {
    pub certs: String,
    pub key: String,
}

const DEPRECATED_KEYS: &[&str] = &["database_path", "cron_secret"];

impl Config {
    pub fn warn_deprecated(&self) {
        let mut was_deprecated = false;
        for key in self
            .catchall
            .keys()
            .filter(|key| DEPRECATED_KEYS.iter().any(|s| s == key))
        {
            warn!("Config parameter {} is deprecated", key);
            was_deprecated = true;
        }

        if was_deprecated {
            warn!("Check the vigil documentation if any new configuration parameters should be adjusted");
        }
    }

    /// The filesystem directory behind `kv_url`.
    pub fn store_path(&self) -> &str {
        self.kv_url
            .strip_prefix("sqlite://")
            .unwrap_or(&self.kv_url)
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Prepare a list of config values to show. The cron secret is
        // deliberately absent.
        let lines = [
            ("Address", self.address.to_string()),
            ("Port", self.port.to_string()),
            ("Store path", self.store_path().to_owned()),
            (
                "Blob upload endpoint",
                self.blob_upload_endpoint
                    .as_ref()
                    .map_or_else(|| "not configured".to_owned(), Url::to_string),
            ),
            (
                "Identity lookup endpoint",
                self.identity_lookup_endpoint
                    .as_ref()
                    .map_or_else(|| "not configured".to_owned(), Url::to_string),
            ),
            (
                "Signature skew (seconds)",
                self.signature_skew_seconds.to_string(),
            ),
            (
                "Cleanup interval (seconds)",
                self.cleanup_second_interval.to_string(),
            ),
            ("Log level", self.log.clone()),
        ];

        let mut msg = "Active config values:\n\n".to_owned();

        for line in &lines {
            msg += &format!("{}: {}\n", line.0, line.1);
        }

        write!(f, "{msg}")
    }
}

fn default_address() -> IpAddr {
    Ipv4Addr::LOCALHOST.into()
}

fn default_port() -> u16 {
    6167
}

fn default_kv_url() -> String {
    directories::ProjectDirs::from("org", "vigil", "vigil")
        .map_or_else(
            || "./vigil-store".to_owned(),
            |dirs| dirs.data_dir().to_string_lossy().into_owned(),
        )
}

fn default_signature_skew_seconds() -> u64 {
    300
}

fn default_cleanup_second_interval() -> u32 {
    60
}

fn default_log() -> String {
    "warn,vigil=info".to_owned()
}
