pub mod api;
pub mod clap;
mod config;
mod database;
mod service;
mod utils;

// Not async due to services() being used in many closures, and async closures are not stable as of writing
use std::sync::RwLock;

pub use config::Config;
pub use database::KeyValueDatabase;
pub use service::{
    dms::{DmsSwitch, SweepOutcome, SwitchStatus},
    recovery::{GuardianUpload, RecoveryConfig, RecoverySession, SessionStatus},
    Services,
};
pub use utils::error::{Error, ErrorKind, Result};

pub static SERVICES: RwLock<Option<&'static Services>> = RwLock::new(None);

pub fn services() -> &'static Services {
    SERVICES
        .read()
        .unwrap()
        .expect("SERVICES should be initialized when this is called")
}
