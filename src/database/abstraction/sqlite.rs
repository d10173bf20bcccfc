use std::{
    fs,
    ops::Deref,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::{Mutex, MutexGuard, RwLock};
use rusqlite::{Connection, DatabaseName::Main, OptionalExtension};
use tracing::warn;

use super::{KeyValueDatabaseEngine, KvTree};
use crate::{Config, Result};

struct Pool {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    reader_rwlock: RwLock<()>,
    path: PathBuf,
}

enum HoldingConn<'a> {
    FromGuard(MutexGuard<'a, Connection>),
    FromOwned(Connection),
}

impl Deref for HoldingConn<'_> {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        match self {
            HoldingConn::FromGuard(guard) => guard.deref(),
            HoldingConn::FromOwned(conn) => conn,
        }
    }
}

impl Pool {
    fn new<P: AsRef<Path>>(path: P, num_readers: usize) -> Result<Self> {
        let writer = Mutex::new(Self::prepare_conn(&path)?);

        let mut readers = Vec::new();

        for _ in 0..num_readers {
            readers.push(Mutex::new(Self::prepare_conn(&path)?));
        }

        Ok(Self {
            writer,
            readers,
            reader_rwlock: RwLock::new(()),
            path: path.as_ref().to_path_buf(),
        })
    }

    fn prepare_conn<P: AsRef<Path>>(path: P) -> Result<Connection> {
        let conn = Connection::open(path)?;

        conn.pragma_update(Some(Main), "journal_mode", "WAL")?;
        conn.pragma_update(Some(Main), "synchronous", "NORMAL")?;

        Ok(conn)
    }

    fn write_lock(&self) -> MutexGuard<'_, Connection> {
        self.writer.lock()
    }

    fn read_lock(&self) -> HoldingConn<'_> {
        let _guard = self.reader_rwlock.read();

        for r in &self.readers {
            if let Some(reader) = r.try_lock() {
                return HoldingConn::FromGuard(reader);
            }
        }

        drop(_guard);

        warn!("all readers locked, creating spillover reader...");

        let spilled = Self::prepare_conn(&self.path).expect("on-disk database file is accessible");

        HoldingConn::FromOwned(spilled)
    }
}

pub struct SqliteEngine {
    pool: Pool,
}

impl KeyValueDatabaseEngine for Arc<SqliteEngine> {
    fn open(config: &Config) -> Result<Self> {
        let path = Path::new(config.store_path());
        fs::create_dir_all(path)?;

        let pool = Pool::new(path.join("vigil.db"), num_cpus::get())?;

        pool.write_lock()
            .execute("CREATE TABLE IF NOT EXISTS _noop ( \"key\" INT )", [])?;

        Ok(Arc::new(SqliteEngine { pool }))
    }

    fn open_tree(&self, name: &'static str) -> Result<Arc<dyn KvTree>> {
        self.pool.write_lock().execute(
            format!(
                "CREATE TABLE IF NOT EXISTS {name} ( \"key\" BLOB PRIMARY KEY, \"value\" BLOB NOT NULL )"
            )
            .as_str(),
            [],
        )?;

        Ok(Arc::new(SqliteTable {
            engine: Arc::clone(self),
            name,
        }))
    }

    fn flush(&self) -> Result<()> {
        self.pool
            .write_lock()
            .execute_batch(
                "
            PRAGMA synchronous=FULL;
            BEGIN;
                DELETE FROM _noop;
                INSERT INTO _noop VALUES (1);
            COMMIT;
            PRAGMA synchronous=NORMAL;
            ",
            )
            .map_err(Into::into)
    }
}

pub struct SqliteTable {
    engine: Arc<SqliteEngine>,
    name: &'static str,
}

type TupleOfBytes = (Vec<u8>, Vec<u8>);

impl SqliteTable {
    fn get_with_guard(&self, guard: &Connection, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(guard
            .prepare(format!("SELECT value FROM {} WHERE key = ?", self.name).as_str())?
            .query_row([key], |row| row.get(0))
            .optional()?)
    }

    fn insert_with_guard(&self, guard: &Connection, key: &[u8], value: &[u8]) -> Result<()> {
        guard.execute(
            format!(
                "INSERT INTO {} (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                self.name
            )
            .as_str(),
            [key, value],
        )?;
        Ok(())
    }

    /// Runs the query on a reader and collects the rows up front. All scans
    /// here are small index walks, so buffering them beats holding a reader
    /// across caller-controlled iteration.
    fn collect_rows(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<TupleOfBytes>> {
        let guard = self.engine.pool.read_lock();

        let mut statement = guard.prepare(sql)?;
        let rows = statement
            .query_map(params, |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows)
    }
}

impl KvTree for SqliteTable {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let guard = self.engine.pool.read_lock();

        self.get_with_guard(&guard, key)
    }

    fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let guard = self.engine.pool.write_lock();

        self.insert_with_guard(&guard, key, value)
    }

    fn insert_if_absent(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        let guard = self.engine.pool.write_lock();

        let changed = guard.execute(
            format!(
                "INSERT INTO {} (key, value) VALUES (?, ?) ON CONFLICT(key) DO NOTHING",
                self.name
            )
            .as_str(),
            [key, value],
        )?;

        Ok(changed > 0)
    }

    fn update(
        &self,
        key: &[u8],
        f: &mut dyn FnMut(Option<Vec<u8>>) -> Option<Vec<u8>>,
    ) -> Result<Option<Vec<u8>>> {
        // The writer mutex is what makes the read-modify-write atomic; every
        // other mutation path also goes through it.
        let guard = self.engine.pool.write_lock();

        let old = self.get_with_guard(&guard, key)?;
        let new = f(old);

        match &new {
            Some(value) => self.insert_with_guard(&guard, key, value)?,
            None => {
                guard.execute(
                    format!("DELETE FROM {} WHERE key = ?", self.name).as_str(),
                    [key],
                )?;
            }
        }

        Ok(new)
    }

    fn remove(&self, key: &[u8]) -> Result<()> {
        let guard = self.engine.pool.write_lock();

        guard.execute(
            format!("DELETE FROM {} WHERE key = ?", self.name).as_str(),
            [key],
        )?;

        Ok(())
    }

    fn iter<'a>(&'a self) -> Box<dyn Iterator<Item = TupleOfBytes> + Send + 'a> {
        let rows = self
            .collect_rows(
                format!("SELECT key, value FROM {} ORDER BY key ASC", self.name).as_str(),
                rusqlite::params![],
            )
            .unwrap_or_default();

        Box::new(rows.into_iter())
    }

    fn scan_prefix<'a>(
        &'a self,
        prefix: Vec<u8>,
    ) -> Box<dyn Iterator<Item = TupleOfBytes> + Send + 'a> {
        let rows = self
            .collect_rows(
                format!(
                    "SELECT key, value FROM {} WHERE key >= ? ORDER BY key ASC",
                    self.name
                )
                .as_str(),
                [prefix.clone()],
            )
            .unwrap_or_default();

        Box::new(
            rows.into_iter()
                .take_while(move |(key, _)| key.starts_with(&prefix)),
        )
    }

    fn clear(&self) -> Result<()> {
        self.engine
            .pool
            .write_lock()
            .execute(format!("DELETE FROM {}", self.name).as_str(), [])?;

        Ok(())
    }
}
