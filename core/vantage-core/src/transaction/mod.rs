//! Transactions and their lifecycle.
//!
//! A [`Transaction`] coordinates multi-object ACID work: it owns one
//! substrate handle ([`StorageTx`]), a registry of per-DBO sub-transaction
//! entries (one per touched DBO, finalized in reverse creation order), and
//! its locks. The [`TransactionManager`] keeps the global registry of live
//! transactions and the history of finished ones.

mod history;
mod lock_manager;
mod manager;

pub use history::{TransactionHistory, TransactionSummary};
pub use lock_manager::{LockManager, LockMode, RESOURCE_ROOT, RESOURCE_WRITER};
pub use manager::TransactionManager;

use crate::error::{DbError, DbResult};
use crate::storage::{StorageEnv, StorageTx};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;
use tracing::debug;

/// Transaction identifier.
pub type TxId = u64;

/// How a transaction's end of life is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    /// Lives across operator executions until the client commits or rolls
    /// back.
    Explicit,
    /// Auto-commits when an operator tree completes, auto-rolls-back on
    /// error.
    Implicit,
    /// Internal housekeeping work.
    System,
}

/// Transaction state machine:
/// `Ready → Running → (Ready | Error | Killed) → Finalizing →
/// (Committed | RolledBack)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Ready,
    Running,
    Error,
    Killed,
    Finalizing,
    Committed,
    RolledBack,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Ready => "READY",
            TransactionStatus::Running => "RUNNING",
            TransactionStatus::Error => "ERROR",
            TransactionStatus::Killed => "KILLED",
            TransactionStatus::Finalizing => "FINALIZING",
            TransactionStatus::Committed => "COMMITTED",
            TransactionStatus::RolledBack => "ROLLED_BACK",
        }
    }
}

/// Kind-specific state of a per-DBO sub-transaction entry.
pub(crate) enum SubTxState {
    Catalog,
    Schema,
    Entity,
    Column,
    Index {
        /// Duplicate-key store the pending mappings merge into at commit.
        store: String,
        /// key bytes → ordered (tuple-id bytes, is-insert) operations.
        pending: BTreeMap<Vec<u8>, Vec<(Vec<u8>, bool)>>,
    },
}

struct SubTxRegistry {
    /// DBO keys in creation order; finalization walks this in reverse.
    order: Vec<String>,
    entries: HashMap<String, SubTxState>,
}

struct StatusCell {
    status: TransactionStatus,
    /// Nesting depth of in-flight operations; `Running` drops back to
    /// `Ready` only when it reaches zero.
    depth: u32,
}

/// A single multi-object transaction.
pub struct Transaction {
    id: TxId,
    tx_type: TransactionType,
    created: SystemTime,
    status: Mutex<StatusCell>,
    killed: AtomicBool,
    storage: Arc<StorageTx>,
    locks: Arc<LockManager>,
    env: Arc<StorageEnv>,
    manager: Weak<TransactionManager>,
    subtx: Mutex<SubTxRegistry>,
}

/// Guard for one in-flight operation; restores `Ready` on drop.
pub struct OpGuard<'a> {
    tx: &'a Transaction,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        let mut cell = self.tx.status.lock();
        cell.depth = cell.depth.saturating_sub(1);
        if cell.depth == 0 && cell.status == TransactionStatus::Running {
            cell.status = TransactionStatus::Ready;
        }
    }
}

impl Transaction {
    pub(crate) fn new(
        id: TxId,
        tx_type: TransactionType,
        env: Arc<StorageEnv>,
        locks: Arc<LockManager>,
        manager: Weak<TransactionManager>,
    ) -> Self {
        Self {
            id,
            tx_type,
            created: SystemTime::now(),
            status: Mutex::new(StatusCell {
                status: TransactionStatus::Ready,
                depth: 0,
            }),
            killed: AtomicBool::new(false),
            storage: Arc::new(StorageTx::new(Arc::clone(&env))),
            locks,
            env,
            manager,
            subtx: Mutex::new(SubTxRegistry {
                order: Vec::new(),
                entries: HashMap::new(),
            }),
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn tx_type(&self) -> TransactionType {
        self.tx_type
    }

    pub fn status(&self) -> TransactionStatus {
        self.status.lock().status
    }

    pub(crate) fn storage(&self) -> &Arc<StorageTx> {
        &self.storage
    }

    /// Fast cancellation check, observed by operators between yielded
    /// records.
    pub fn check_alive(&self) -> DbResult<()> {
        if self.killed.load(Ordering::Acquire) {
            return Err(DbError::Cancellation { txid: self.id });
        }
        Ok(())
    }

    /// Enter an operation: `Ready | Running → Running`.
    pub(crate) fn begin_op(&self) -> DbResult<OpGuard<'_>> {
        self.check_alive()?;
        let mut cell = self.status.lock();
        match cell.status {
            TransactionStatus::Ready | TransactionStatus::Running => {
                cell.status = TransactionStatus::Running;
                cell.depth += 1;
                Ok(OpGuard { tx: self })
            }
            other => Err(DbError::WrongTransactionState {
                txid: self.id,
                state: other.as_str(),
                required: "READY",
            }),
        }
    }

    /// Run one operation with state bookkeeping; storage and transactional
    /// failures move the transaction into `Error`.
    pub(crate) fn run_op<R>(&self, f: impl FnOnce() -> DbResult<R>) -> DbResult<R> {
        let guard = self.begin_op()?;
        let result = f();
        drop(guard);
        if let Err(err) = &result
            && matches!(
                err,
                DbError::Storage { .. }
                    | DbError::Io { .. }
                    | DbError::DataCorruption(_)
                    | DbError::Deadlock { .. }
                    | DbError::Cancellation { .. }
            )
        {
            self.mark_error();
        }
        result
    }

    fn mark_error(&self) {
        let mut cell = self.status.lock();
        if matches!(
            cell.status,
            TransactionStatus::Ready | TransactionStatus::Running
        ) {
            cell.status = TransactionStatus::Error;
        }
    }

    /// Register the sub-transaction entry for `dbo` (one per (tx, DBO));
    /// acquires the shared read-stamp on first touch.
    pub(crate) fn register_dbo(
        &self,
        dbo: &str,
        state: impl FnOnce() -> SubTxState,
    ) -> DbResult<()> {
        let mut registry = self.subtx.lock();
        if registry.entries.contains_key(dbo) {
            return Ok(());
        }
        self.env.acquire_stamp()?;
        registry.order.push(dbo.to_string());
        registry.entries.insert(dbo.to_string(), state());
        Ok(())
    }

    /// Acquire a shared lock on `path` (intention-shared on ancestors).
    pub(crate) fn lock_read(&self, path: &[String]) -> DbResult<()> {
        self.lock_path(path, LockMode::IntentionShared, LockMode::Shared)
    }

    /// Acquire an exclusive lock on `path` (intention-exclusive on
    /// ancestors).
    pub(crate) fn lock_write(&self, path: &[String]) -> DbResult<()> {
        self.lock_path(path, LockMode::IntentionExclusive, LockMode::Exclusive)
    }

    fn lock_path(&self, path: &[String], intention: LockMode, leaf: LockMode) -> DbResult<()> {
        self.locks.acquire(self.id, RESOURCE_ROOT, intention)?;
        if let Some((last, ancestors)) = path.split_last() {
            for ancestor in ancestors {
                self.locks.acquire(self.id, ancestor, intention)?;
            }
            self.locks.acquire(self.id, last, leaf)?;
        }
        Ok(())
    }

    /// Gate every substrate write: takes the exclusive writer slot through
    /// the lock manager (so writer waits join deadlock detection), then
    /// lazily begins the substrate write transaction.
    pub(crate) fn writer_gate(&self) -> DbResult<()> {
        self.locks
            .acquire(self.id, RESOURCE_WRITER, LockMode::Exclusive)?;
        self.storage.ensure_writer()
    }

    /// Mutate the pending-mapping buffer of an index sub-transaction.
    pub(crate) fn with_index_buffer<R>(
        &self,
        dbo: &str,
        f: impl FnOnce(&mut BTreeMap<Vec<u8>, Vec<(Vec<u8>, bool)>>) -> R,
    ) -> DbResult<R> {
        let mut registry = self.subtx.lock();
        match registry.entries.get_mut(dbo) {
            Some(SubTxState::Index { pending, .. }) => Ok(f(pending)),
            _ => Err(DbError::Execution(format!(
                "no index sub-transaction registered for '{dbo}'"
            ))),
        }
    }

    fn sub_transaction_count(&self) -> usize {
        self.subtx.lock().order.len()
    }

    /// Commit: finalize sub-transactions in reverse creation order, then
    /// commit the substrate transaction. Only `Ready` may commit.
    pub fn commit(&self) -> DbResult<()> {
        self.enter_finalize(&[TransactionStatus::Ready])?;
        if let Err(err) = self.flush_pending() {
            // A failed flush aborts: discard everything and report.
            let _ = self.storage.abort();
            self.cleanup(TransactionStatus::RolledBack);
            return Err(err);
        }
        self.storage.commit()?;
        self.cleanup(TransactionStatus::Committed);
        debug!(txid = self.id, "transaction committed");
        Ok(())
    }

    /// Roll back: discard pending sub-transaction state and all writes.
    /// Permitted from `Ready`, `Error` and `Killed`.
    pub fn rollback(&self) -> DbResult<()> {
        self.enter_finalize(&[
            TransactionStatus::Ready,
            TransactionStatus::Error,
            TransactionStatus::Killed,
        ])?;
        self.storage.abort()?;
        self.cleanup(TransactionStatus::RolledBack);
        debug!(txid = self.id, "transaction rolled back");
        Ok(())
    }

    fn enter_finalize(&self, allowed: &[TransactionStatus]) -> DbResult<()> {
        let mut cell = self.status.lock();
        if !allowed.contains(&cell.status) || cell.depth > 0 {
            return Err(DbError::WrongTransactionState {
                txid: self.id,
                state: cell.status.as_str(),
                required: allowed.first().map(|s| s.as_str()).unwrap_or("READY"),
            });
        }
        cell.status = TransactionStatus::Finalizing;
        Ok(())
    }

    /// Merge buffered index mappings into their stores, walking the
    /// sub-transaction registry in reverse creation order (indexes before
    /// their entity, entities before their schema).
    fn flush_pending(&self) -> DbResult<()> {
        let mut registry = self.subtx.lock();
        let order: Vec<String> = registry.order.iter().rev().cloned().collect();
        for dbo in order {
            if let Some(SubTxState::Index { store, pending }) = registry.entries.get_mut(&dbo)
                && !pending.is_empty()
            {
                let store = store.clone();
                let pending = std::mem::take(pending);
                drop(registry);
                self.writer_gate()?;
                for (key, operations) in pending {
                    for (tid, insert) in operations {
                        if insert {
                            self.storage.dup_insert(&store, &key, &tid)?;
                        } else {
                            self.storage.dup_remove(&store, &key, &tid)?;
                        }
                    }
                }
                registry = self.subtx.lock();
            }
        }
        Ok(())
    }

    /// Release stamps and locks regardless of outcome, set the terminal
    /// state and hand the summary to the manager.
    fn cleanup(&self, terminal: TransactionStatus) {
        let summary = self.summary(terminal);
        let mut registry = self.subtx.lock();
        for _ in registry.order.drain(..) {
            self.env.release_stamp();
        }
        registry.entries.clear();
        drop(registry);
        self.locks.release_all(self.id);
        self.status.lock().status = terminal;
        if let Some(manager) = self.manager.upgrade() {
            manager.finish(summary);
        }
    }

    /// Transition `Ready | Running → Killed`.
    pub(crate) fn kill(&self) -> DbResult<()> {
        let mut cell = self.status.lock();
        match cell.status {
            TransactionStatus::Ready | TransactionStatus::Running => {
                cell.status = TransactionStatus::Killed;
                self.killed.store(true, Ordering::Release);
                debug!(txid = self.id, "transaction killed");
                Ok(())
            }
            other => Err(DbError::WrongTransactionState {
                txid: self.id,
                state: other.as_str(),
                required: "RUNNING",
            }),
        }
    }

    pub(crate) fn summary(&self, terminal: TransactionStatus) -> TransactionSummary {
        TransactionSummary {
            id: self.id,
            tx_type: self.tx_type,
            state: terminal,
            created: self.created,
            ended: SystemTime::now(),
            sub_transactions: self.sub_transaction_count(),
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("type", &self.tx_type)
            .field("status", &self.status())
            .finish()
    }
}
