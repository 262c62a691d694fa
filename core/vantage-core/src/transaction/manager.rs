//! The global transaction registry.

use crate::error::{DbError, DbResult};
use crate::storage::StorageEnv;
use crate::transaction::{
    LockManager, Transaction, TransactionHistory, TransactionStatus, TransactionSummary,
    TransactionType, TxId,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

const DEFAULT_HISTORY_CAPACITY: usize = 256;

/// Owns the registry of live transactions, the lock manager and the history
/// of finished transactions.
pub struct TransactionManager {
    env: Arc<StorageEnv>,
    locks: Arc<LockManager>,
    next_id: AtomicU64,
    active: DashMap<TxId, Arc<Transaction>>,
    history: Mutex<TransactionHistory>,
}

impl TransactionManager {
    pub fn new(env: Arc<StorageEnv>, history_capacity: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            env,
            locks: Arc::new(LockManager::new()),
            next_id: AtomicU64::new(1),
            active: DashMap::new(),
            history: Mutex::new(TransactionHistory::new(
                history_capacity.unwrap_or(DEFAULT_HISTORY_CAPACITY),
            )),
        })
    }

    /// Begin a new transaction.
    pub fn begin(self: &Arc<Self>, tx_type: TransactionType) -> DbResult<Arc<Transaction>> {
        if self.env.is_closed() {
            return Err(DbError::Closed("transaction manager".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let tx = Arc::new(Transaction::new(
            id,
            tx_type,
            Arc::clone(&self.env),
            Arc::clone(&self.locks),
            Arc::downgrade(self),
        ));
        self.active.insert(id, Arc::clone(&tx));
        debug!(txid = id, ?tx_type, "transaction started");
        Ok(tx)
    }

    /// Look up a live transaction.
    pub fn transaction(&self, id: TxId) -> Option<Arc<Transaction>> {
        self.active.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Kill a live transaction; ongoing operator execution observes the flag
    /// at its next yielded record and aborts with `Cancellation`.
    pub fn kill(&self, id: TxId) -> DbResult<()> {
        let tx = self
            .transaction(id)
            .ok_or_else(|| DbError::Execution(format!("no live transaction {id}")))?;
        tx.kill()
    }

    /// Number of live transactions.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Recent finished transactions, oldest first.
    pub fn history(&self) -> Vec<TransactionSummary> {
        self.history.lock().entries().cloned().collect()
    }

    pub(crate) fn finish(&self, summary: TransactionSummary) {
        self.active.remove(&summary.id);
        self.history.lock().record(summary);
    }

    /// Roll back every live transaction (used on close).
    pub fn rollback_all(&self) {
        let live: Vec<Arc<Transaction>> = self
            .active
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for tx in live {
            if matches!(
                tx.status(),
                TransactionStatus::Ready | TransactionStatus::Error | TransactionStatus::Killed
            ) {
                let _ = tx.rollback();
            }
        }
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("active", &self.active.len())
            .finish()
    }
}
