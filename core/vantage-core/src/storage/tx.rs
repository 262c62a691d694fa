//! Transaction-scoped access to the substrate.
//!
//! A [`StorageTx`] owns at most one exclusive write transaction (acquired
//! lazily, gated by the lock manager above this layer) and one cached read
//! snapshot for read-only access. All methods synchronize on internal
//! latches, so concurrent callers from the same transaction serialize.

use crate::error::{DbError, DbResult};
use crate::storage::StorageEnv;
use parking_lot::Mutex;
use redb::{
    MultimapTableDefinition, ReadTransaction, ReadableMultimapTable, ReadableTable,
    ReadableTableMetadata, TableDefinition, TableError, WriteTransaction,
};
use std::ops::Bound;
use std::sync::Arc;

type Plain<'a> = TableDefinition<'a, &'static [u8], &'static [u8]>;
type Dup<'a> = MultimapTableDefinition<'a, &'static [u8], &'static [u8]>;

fn plain(store: &str) -> Plain<'_> {
    TableDefinition::new(store)
}

fn dup(store: &str) -> Dup<'_> {
    MultimapTableDefinition::new(store)
}

fn is_missing(err: &TableError) -> bool {
    matches!(err, TableError::TableDoesNotExist(_))
}

/// Substrate handle scoped to one engine transaction.
pub struct StorageTx {
    env: Arc<StorageEnv>,
    write: Mutex<Option<WriteTransaction>>,
    snapshot: Mutex<Option<Arc<ReadTransaction>>>,
}

impl StorageTx {
    pub fn new(env: Arc<StorageEnv>) -> Self {
        Self {
            env,
            write: Mutex::new(None),
            snapshot: Mutex::new(None),
        }
    }

    pub fn env(&self) -> &Arc<StorageEnv> {
        &self.env
    }

    /// Begin the exclusive write transaction if not yet active.
    ///
    /// Callers must hold the environment writer lock; this layer does not
    /// re-check it.
    pub(crate) fn ensure_writer(&self) -> DbResult<()> {
        let mut write = self.write.lock();
        if write.is_none() {
            *write = Some(self.env.begin_write()?);
        }
        Ok(())
    }

    pub(crate) fn has_writer(&self) -> bool {
        self.write.lock().is_some()
    }

    /// The cached read snapshot for read-only access (created lazily, stable
    /// for the life of this transaction).
    fn cached_snapshot(&self) -> DbResult<Arc<ReadTransaction>> {
        let mut snapshot = self.snapshot.lock();
        if let Some(snap) = snapshot.as_ref() {
            return Ok(Arc::clone(snap));
        }
        let snap = Arc::new(self.env.begin_read()?);
        *snapshot = Some(Arc::clone(&snap));
        Ok(snap)
    }

    /// An independent snapshot of the latest committed state, for partitioned
    /// scans that must not observe this transaction's writes.
    pub fn fresh_snapshot(&self) -> DbResult<ReadTransaction> {
        self.env.begin_read()
    }

    /// Commit the write transaction (no-op for read-only transactions).
    pub(crate) fn commit(&self) -> DbResult<()> {
        if let Some(write) = self.write.lock().take() {
            write.commit()?;
        }
        Ok(())
    }

    /// Abort the write transaction, discarding all writes.
    pub(crate) fn abort(&self) -> DbResult<()> {
        if let Some(write) = self.write.lock().take() {
            write.abort()?;
        }
        Ok(())
    }

    fn with_writer<R>(
        &self,
        f: impl FnOnce(&WriteTransaction) -> DbResult<R>,
    ) -> DbResult<R> {
        let write = self.write.lock();
        let tx = write.as_ref().ok_or_else(|| {
            DbError::Execution("write access without an active write transaction".into())
        })?;
        f(tx)
    }

    // -- plain stores --------------------------------------------------------

    pub fn get(&self, store: &str, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        let write = self.write.lock();
        if let Some(tx) = write.as_ref() {
            let table = tx.open_table(plain(store))?;
            return Ok(table.get(key)?.map(|guard| guard.value().to_vec()));
        }
        drop(write);
        let snap = self.cached_snapshot()?;
        match snap.open_table(plain(store)) {
            Ok(table) => Ok(table.get(key)?.map(|guard| guard.value().to_vec())),
            Err(err) if is_missing(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Insert or overwrite; returns the previous value.
    pub fn put(&self, store: &str, key: &[u8], value: &[u8]) -> DbResult<Option<Vec<u8>>> {
        self.with_writer(|tx| {
            let mut table = tx.open_table(plain(store))?;
            Ok(table
                .insert(key, value)?
                .map(|guard| guard.value().to_vec()))
        })
    }

    /// Insert only when absent; returns the existing value otherwise.
    pub fn put_if_absent(
        &self,
        store: &str,
        key: &[u8],
        value: &[u8],
    ) -> DbResult<Option<Vec<u8>>> {
        self.with_writer(|tx| {
            let mut table = tx.open_table(plain(store))?;
            if let Some(existing) = table.get(key)? {
                return Ok(Some(existing.value().to_vec()));
            }
            table.insert(key, value)?;
            Ok(None)
        })
    }

    pub fn delete(&self, store: &str, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        self.with_writer(|tx| {
            let mut table = tx.open_table(plain(store))?;
            Ok(table.remove(key)?.map(|guard| guard.value().to_vec()))
        })
    }

    /// Remove every entry of a plain store, keeping the store itself.
    pub fn clear_store(&self, store: &str) -> DbResult<()> {
        self.with_writer(|tx| {
            tx.delete_table(plain(store))?;
            tx.open_table(plain(store))?;
            Ok(())
        })
    }

    pub fn drop_store(&self, store: &str) -> DbResult<()> {
        self.with_writer(|tx| {
            tx.delete_table(plain(store))?;
            Ok(())
        })
    }

    /// Create a plain store if it does not exist yet.
    pub fn create_store(&self, store: &str) -> DbResult<()> {
        self.with_writer(|tx| {
            tx.open_table(plain(store))?;
            Ok(())
        })
    }

    /// Number of entries in a plain store.
    pub fn store_len(&self, store: &str) -> DbResult<u64> {
        let write = self.write.lock();
        if let Some(tx) = write.as_ref() {
            let table = tx.open_table(plain(store))?;
            return Ok(table.len()?);
        }
        drop(write);
        let snap = self.cached_snapshot()?;
        match snap.open_table(plain(store)) {
            Ok(table) => Ok(table.len()?),
            Err(err) if is_missing(&err) => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    /// Read one ordered chunk of a plain store.
    ///
    /// `lower` bounds the scan, `upper` (exclusive) caps it, `limit` bounds
    /// the chunk size. Chunked re-seeks keep suspendable cursors bounded in
    /// memory while reading through the write transaction.
    pub fn range_chunk(
        &self,
        store: &str,
        lower: Bound<&[u8]>,
        upper: Option<&[u8]>,
        limit: usize,
    ) -> DbResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let bounds = (lower, upper.map_or(Bound::Unbounded, Bound::Excluded));
        let write = self.write.lock();
        if let Some(tx) = write.as_ref() {
            let table = tx.open_table(plain(store))?;
            return collect_chunk(table.range::<&[u8]>(bounds)?, limit);
        }
        drop(write);
        let snap = self.cached_snapshot()?;
        match snap.open_table(plain(store)) {
            Ok(table) => collect_chunk(table.range::<&[u8]>(bounds)?, limit),
            Err(err) if is_missing(&err) => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    // -- duplicate-key stores ------------------------------------------------

    /// Add a (key, value) pair; returns true when the pair already existed.
    pub fn dup_insert(&self, store: &str, key: &[u8], value: &[u8]) -> DbResult<bool> {
        self.with_writer(|tx| {
            let mut table = tx.open_multimap_table(dup(store))?;
            Ok(table.insert(key, value)?)
        })
    }

    /// Remove one (key, value) pair; returns true when it was present.
    pub fn dup_remove(&self, store: &str, key: &[u8], value: &[u8]) -> DbResult<bool> {
        self.with_writer(|tx| {
            let mut table = tx.open_multimap_table(dup(store))?;
            Ok(table.remove(key, value)?)
        })
    }

    /// Remove all values under `key`.
    pub fn dup_remove_all(&self, store: &str, key: &[u8]) -> DbResult<()> {
        self.with_writer(|tx| {
            let mut table = tx.open_multimap_table(dup(store))?;
            table.remove_all(key)?;
            Ok(())
        })
    }

    /// All values stored under `key`, in value order.
    pub fn dup_values(&self, store: &str, key: &[u8]) -> DbResult<Vec<Vec<u8>>> {
        let write = self.write.lock();
        if let Some(tx) = write.as_ref() {
            let table = tx.open_multimap_table(dup(store))?;
            return collect_dup_values(table.get(key)?);
        }
        drop(write);
        let snap = self.cached_snapshot()?;
        match snap.open_multimap_table(dup(store)) {
            Ok(table) => collect_dup_values(table.get(key)?),
            Err(err) if is_missing(&err) => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn clear_dup_store(&self, store: &str) -> DbResult<()> {
        self.with_writer(|tx| {
            tx.delete_multimap_table(dup(store))?;
            tx.open_multimap_table(dup(store))?;
            Ok(())
        })
    }

    pub fn drop_dup_store(&self, store: &str) -> DbResult<()> {
        self.with_writer(|tx| {
            tx.delete_multimap_table(dup(store))?;
            Ok(())
        })
    }

    pub fn create_dup_store(&self, store: &str) -> DbResult<()> {
        self.with_writer(|tx| {
            tx.open_multimap_table(dup(store))?;
            Ok(())
        })
    }

    /// Read one ordered chunk of (key, value) pairs from a duplicate-key
    /// store, resuming strictly after `resume` when given.
    pub fn dup_range_chunk(
        &self,
        store: &str,
        lower: Bound<&[u8]>,
        upper: Option<&[u8]>,
        resume: Option<(&[u8], &[u8])>,
        limit: usize,
    ) -> DbResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let lower = match resume {
            Some((key, _)) => Bound::Included(key),
            None => lower,
        };
        let bounds = (lower, upper.map_or(Bound::Unbounded, Bound::Excluded));
        let write = self.write.lock();
        if let Some(tx) = write.as_ref() {
            let table = tx.open_multimap_table(dup(store))?;
            return collect_dup_chunk(table.range::<&[u8]>(bounds)?, resume, limit);
        }
        drop(write);
        let snap = self.cached_snapshot()?;
        match snap.open_multimap_table(dup(store)) {
            Ok(table) => collect_dup_chunk(table.range::<&[u8]>(bounds)?, resume, limit),
            Err(err) if is_missing(&err) => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }
}

fn collect_chunk<'a>(
    range: redb::Range<'a, &'static [u8], &'static [u8]>,
    limit: usize,
) -> DbResult<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut out = Vec::new();
    for entry in range {
        let (key, value) = entry?;
        out.push((key.value().to_vec(), value.value().to_vec()));
        if out.len() >= limit {
            break;
        }
    }
    Ok(out)
}

fn collect_dup_values(
    values: redb::MultimapValue<'_, &'static [u8]>,
) -> DbResult<Vec<Vec<u8>>> {
    let mut out = Vec::new();
    for value in values {
        out.push(value?.value().to_vec());
    }
    Ok(out)
}

fn collect_dup_chunk(
    range: redb::MultimapRange<'_, &'static [u8], &'static [u8]>,
    resume: Option<(&[u8], &[u8])>,
    limit: usize,
) -> DbResult<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut out = Vec::new();
    'keys: for entry in range {
        let (key, values) = entry?;
        let key_bytes = key.value().to_vec();
        for value in values {
            let value_bytes = value?.value().to_vec();
            // Values under a key are ordered; skip up to the resume point.
            if let Some((rkey, rvalue)) = resume
                && key_bytes.as_slice() == rkey
                && value_bytes.as_slice() <= rvalue
            {
                continue;
            }
            out.push((key_bytes.clone(), value_bytes));
            if out.len() >= limit {
                break 'keys;
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_tx() -> StorageTx {
        let env = StorageEnv::in_memory(&[]).unwrap();
        let tx = StorageTx::new(env);
        tx.ensure_writer().unwrap();
        tx
    }

    #[test]
    fn put_get_delete_round_trip() {
        let tx = test_tx();
        assert_eq!(tx.put("s", b"k", b"v1").unwrap(), None);
        assert_eq!(tx.put("s", b"k", b"v2").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(tx.get("s", b"k").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(tx.delete("s", b"k").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(tx.get("s", b"k").unwrap(), None);
    }

    #[test]
    fn put_if_absent_preserves_existing() {
        let tx = test_tx();
        assert_eq!(tx.put_if_absent("s", b"k", b"a").unwrap(), None);
        assert_eq!(
            tx.put_if_absent("s", b"k", b"b").unwrap(),
            Some(b"a".to_vec())
        );
        assert_eq!(tx.get("s", b"k").unwrap(), Some(b"a".to_vec()));
    }

    #[test]
    fn range_chunk_respects_bounds() {
        let tx = test_tx();
        for i in 0u8..10 {
            tx.put("s", &[i], &[i]).unwrap();
        }
        let chunk = tx
            .range_chunk("s", Bound::Included(&[2u8][..]), Some(&[7u8][..]), 3)
            .unwrap();
        assert_eq!(
            chunk.iter().map(|(k, _)| k[0]).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
        let rest = tx
            .range_chunk("s", Bound::Excluded(&[4u8][..]), Some(&[7u8][..]), 10)
            .unwrap();
        assert_eq!(
            rest.iter().map(|(k, _)| k[0]).collect::<Vec<_>>(),
            vec![5, 6]
        );
    }

    #[test]
    fn dup_store_keeps_duplicates_sorted() {
        let tx = test_tx();
        assert!(!tx.dup_insert("d", b"k", b"b").unwrap());
        assert!(!tx.dup_insert("d", b"k", b"a").unwrap());
        assert!(tx.dup_insert("d", b"k", b"a").unwrap());
        assert_eq!(
            tx.dup_values("d", b"k").unwrap(),
            vec![b"a".to_vec(), b"b".to_vec()]
        );
        assert!(tx.dup_remove("d", b"k", b"a").unwrap());
        assert_eq!(tx.dup_values("d", b"k").unwrap(), vec![b"b".to_vec()]);
    }

    #[test]
    fn dup_chunk_resumes_after_pair() {
        let tx = test_tx();
        for v in [b"x" as &[u8], b"y", b"z"] {
            tx.dup_insert("d", b"k1", v).unwrap();
        }
        tx.dup_insert("d", b"k2", b"w").unwrap();
        let first = tx
            .dup_range_chunk("d", Bound::Unbounded, None, None, 2)
            .unwrap();
        assert_eq!(first.len(), 2);
        let resume = (first[1].0.as_slice(), first[1].1.as_slice());
        let rest = tx
            .dup_range_chunk("d", Bound::Unbounded, None, Some(resume), 10)
            .unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].1, b"z".to_vec());
        assert_eq!(rest[1].0, b"k2".to_vec());
    }

    #[test]
    fn snapshot_reads_only_committed_state() {
        let env = StorageEnv::in_memory(&[]).unwrap();
        let writer = StorageTx::new(Arc::clone(&env));
        writer.ensure_writer().unwrap();
        writer.put("s", b"k", b"committed").unwrap();
        writer.commit().unwrap();

        let writer = StorageTx::new(Arc::clone(&env));
        writer.ensure_writer().unwrap();
        writer.put("s", b"k", b"pending").unwrap();

        let reader = StorageTx::new(env);
        assert_eq!(reader.get("s", b"k").unwrap(), Some(b"committed".to_vec()));
        writer.abort().unwrap();
    }
}
