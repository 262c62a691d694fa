//! The catalog: process-wide owner of all schemas and the entry point of the
//! engine.
//!
//! Six metadata stores keyed by hierarchical names carry the canonical
//! definition of every DBO; opening a DBO constructs its in-memory handle
//! from the catalog row. All access flows through transactions obtained from
//! [`Catalog::begin`].

mod column;
mod entity;
pub(crate) mod entry;
mod name;
mod tx;

pub use column::{ColumnCursor, ColumnTx};
pub use entity::{EntityScanCursor, EntityTx};
pub use entry::{ColumnDef, EntityEntry, EntityStatistics};
pub use name::{ColumnName, EntityName, IndexName, Name, SchemaName};
pub use tx::{CatalogTx, Schema};

use crate::config::EngineConfig;
use crate::error::DbResult;
use crate::planner::Planner;
use crate::storage::StorageEnv;
use crate::transaction::{Transaction, TransactionManager, TransactionType};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Record identifier within an entity: monotonically assigned, never reused.
/// Negative values are reserved; [`TUPLE_ID_BEFORE_FIRST`] is the
/// "before-first" sentinel.
pub type TupleId = i64;

/// Sentinel TupleId sorting before every assigned id.
pub const TUPLE_ID_BEFORE_FIRST: TupleId = -1;

/// Names of the metadata stores.
pub mod stores {
    pub const SCHEMAS: &str = "schemas";
    pub const ENTITIES: &str = "entities";
    pub const COLUMNS: &str = "columns";
    pub const STATISTICS: &str = "statistics";
    pub const INDEXES: &str = "indexes";
    pub const SEQUENCES: &str = "sequences";

    pub const ALL: [&str; 6] = [SCHEMAS, ENTITIES, COLUMNS, STATISTICS, INDEXES, SEQUENCES];
}

/// The root database object.
pub struct Catalog {
    env: Arc<StorageEnv>,
    transactions: Arc<TransactionManager>,
    planner: Planner,
    config: EngineConfig,
}

impl Catalog {
    /// Create a fresh catalog at `path`.
    pub fn create(path: &Path) -> DbResult<Self> {
        Self::create_with_config(path, EngineConfig::default())
    }

    pub fn create_with_config(path: &Path, config: EngineConfig) -> DbResult<Self> {
        let env = StorageEnv::create(path, &stores::ALL)?;
        info!(path = %path.display(), "catalog created");
        Ok(Self::assemble(env, config))
    }

    /// Open an existing catalog, verifying the on-disk version.
    pub fn open(path: &Path) -> DbResult<Self> {
        Self::open_with_config(path, EngineConfig::default())
    }

    pub fn open_with_config(path: &Path, config: EngineConfig) -> DbResult<Self> {
        let env = StorageEnv::open(path)?;
        info!(path = %path.display(), "catalog opened");
        Ok(Self::assemble(env, config))
    }

    /// An ephemeral in-memory catalog (tests, scratch work).
    pub fn in_memory() -> DbResult<Self> {
        let env = StorageEnv::in_memory(&stores::ALL)?;
        Ok(Self::assemble(env, EngineConfig::default()))
    }

    fn assemble(env: Arc<StorageEnv>, config: EngineConfig) -> Self {
        let transactions = TransactionManager::new(Arc::clone(&env), config.transaction_history);
        let planner = Planner::new(config.planner.clone());
        Self {
            env,
            transactions,
            planner,
            config,
        }
    }

    /// Begin a transaction.
    pub fn begin(&self, tx_type: TransactionType) -> DbResult<Arc<Transaction>> {
        self.transactions.begin(tx_type)
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Close the catalog: rolls back live transactions and blocks until all
    /// sub-transactions released their read-stamps.
    pub fn close(self) {
        self.transactions.rollback_all();
        self.env.close();
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("env", &self.env)
            .field("active_transactions", &self.transactions.active_count())
            .finish()
    }
}
