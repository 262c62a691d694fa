//! The storage environment: one redb database per catalog.

use crate::error::{DbError, DbResult};
use crate::values::codec;
use parking_lot::{Condvar, Mutex};
use redb::{Database, ReadTransaction, ReadableTable, TableDefinition, WriteTransaction};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Engine storage-layout version written on bootstrap. No auto-migration:
/// a mismatch surfaces as [`DbError::VersionMismatch`].
pub const DB_VERSION: u32 = 1;

const META_STORE: &str = "meta";
const VERSION_KEY: &[u8] = b"db_version";

fn meta_table() -> TableDefinition<'static, &'static [u8], &'static [u8]> {
    TableDefinition::new(META_STORE)
}

/// Process-wide handle to the storage substrate.
///
/// Close discipline: every live sub-transaction holds a stamp; `close` blocks
/// until all stamps are released and fails further stamp acquisition with
/// [`DbError::Closed`].
pub struct StorageEnv {
    db: Database,
    path: Option<PathBuf>,
    closed: AtomicBool,
    stamps: Mutex<u64>,
    stamps_released: Condvar,
}

impl StorageEnv {
    /// Create a fresh environment at `path` and bootstrap the given stores.
    ///
    /// Fails with [`DbError::InvalidFile`] when the environment was already
    /// initialized.
    pub fn create(path: &Path, stores: &[&str]) -> DbResult<Arc<Self>> {
        let db = Database::create(path)?;
        let env = Self::wrap(db, Some(path.to_path_buf()));
        env.bootstrap(stores)?;
        Ok(env)
    }

    /// Open an existing environment and verify its version.
    pub fn open(path: &Path) -> DbResult<Arc<Self>> {
        let db = Database::open(path)?;
        let env = Self::wrap(db, Some(path.to_path_buf()));
        env.verify_version()?;
        Ok(env)
    }

    /// An ephemeral in-memory environment (tests, scratch work).
    pub fn in_memory(stores: &[&str]) -> DbResult<Arc<Self>> {
        let db = redb::Builder::new()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(redb::Error::from)?;
        let env = Self::wrap(db, None);
        env.bootstrap(stores)?;
        Ok(env)
    }

    fn wrap(db: Database, path: Option<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            db,
            path,
            closed: AtomicBool::new(false),
            stamps: Mutex::new(0),
            stamps_released: Condvar::new(),
        })
    }

    fn bootstrap(&self, stores: &[&str]) -> DbResult<()> {
        let tx = self.db.begin_write()?;
        {
            let mut meta = tx.open_table(meta_table())?;
            if meta.get(VERSION_KEY)?.is_some() {
                return Err(DbError::InvalidFile(format!(
                    "environment at {} is already initialized",
                    self.location()
                )));
            }
            let mut version = Vec::new();
            codec::write_varint(&mut version, u64::from(DB_VERSION));
            meta.insert(VERSION_KEY, version.as_slice())?;
        }
        for store in stores {
            tx.open_table(TableDefinition::<&[u8], &[u8]>::new(store))?;
        }
        tx.commit()?;
        debug!(version = DB_VERSION, "storage environment bootstrapped");
        Ok(())
    }

    fn verify_version(&self) -> DbResult<()> {
        let tx = self.db.begin_read()?;
        let meta = tx.open_table(meta_table()).map_err(|_| {
            DbError::DataCorruption("environment has no metadata store".into())
        })?;
        let raw = meta
            .get(VERSION_KEY)?
            .ok_or_else(|| DbError::DataCorruption("environment has no version record".into()))?;
        let mut pos = 0;
        let found = codec::read_varint(raw.value(), &mut pos)? as u32;
        if found != DB_VERSION {
            return Err(DbError::VersionMismatch {
                expected: DB_VERSION,
                found,
            });
        }
        Ok(())
    }

    fn location(&self) -> String {
        self.path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<memory>".to_string())
    }

    pub(crate) fn begin_write(&self) -> DbResult<WriteTransaction> {
        self.check_open()?;
        Ok(self.db.begin_write()?)
    }

    pub(crate) fn begin_read(&self) -> DbResult<ReadTransaction> {
        self.check_open()?;
        Ok(self.db.begin_read()?)
    }

    fn check_open(&self) -> DbResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::Closed(self.location()));
        }
        Ok(())
    }

    /// Take a shared read-stamp. Held by every live sub-transaction and
    /// released in its cleanup phase.
    pub fn acquire_stamp(&self) -> DbResult<()> {
        self.check_open()?;
        *self.stamps.lock() += 1;
        Ok(())
    }

    /// Release a stamp taken with [`StorageEnv::acquire_stamp`].
    pub fn release_stamp(&self) {
        let mut stamps = self.stamps.lock();
        *stamps = stamps.saturating_sub(1);
        if *stamps == 0 {
            self.stamps_released.notify_all();
        }
    }

    /// Close the environment. Blocks until all stamps are released; any
    /// operation after close observes [`DbError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut stamps = self.stamps.lock();
        while *stamps > 0 {
            self.stamps_released.wait(&mut stamps);
        }
        debug!("storage environment closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for StorageEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEnv")
            .field("path", &self.location())
            .field("closed", &self.is_closed())
            .finish()
    }
}
