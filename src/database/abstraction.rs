use std::sync::Arc;

use crate::{Config, Result};

pub mod sqlite;

pub trait KeyValueDatabaseEngine: Send + Sync {
    fn open(config: &Config) -> Result<Self>
    where
        Self: Sized;
    fn open_tree(&self, name: &'static str) -> Result<Arc<dyn KvTree>>;
    fn flush(&self) -> Result<()>;
}

pub trait KvTree: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn insert(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Atomic set-if-not-exists. Returns false when the key was already
    /// present, in which case the stored value is untouched.
    fn insert_if_absent(&self, key: &[u8], value: &[u8]) -> Result<bool>;

    /// Atomic read-modify-write of a single key. The closure sees the
    /// current value (None when absent) and returns the replacement;
    /// returning None removes the key. Returns what was written.
    fn update(
        &self,
        key: &[u8],
        f: &mut dyn FnMut(Option<Vec<u8>>) -> Option<Vec<u8>>,
    ) -> Result<Option<Vec<u8>>>;

    fn remove(&self, key: &[u8]) -> Result<()>;

    fn iter<'a>(&'a self) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + Send + 'a>;

    fn scan_prefix<'a>(
        &'a self,
        prefix: Vec<u8>,
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + Send + 'a>;

    fn clear(&self) -> Result<()>;
}
