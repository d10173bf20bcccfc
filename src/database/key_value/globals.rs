use crate::{database::KeyValueDatabase, service, Result};

impl service::globals::Data for KeyValueDatabase {
    fn flush(&self) -> Result<()> {
        self.db.flush()
    }
}
