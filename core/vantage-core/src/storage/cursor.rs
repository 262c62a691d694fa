//! Suspendable cursors over substrate stores.
//!
//! Two flavours exist. [`TxCursor`] / [`TxDupCursor`] read through the owning
//! transaction (read-your-writes) by re-seeking bounded chunks, so they can
//! be held across arbitrarily many `next` calls without pinning substrate
//! resources. [`SnapshotCursor`] streams over an independent read snapshot
//! taken at creation time; concurrent writers never invalidate it.

use crate::error::DbResult;
use crate::storage::StorageTx;
use redb::{ReadTransaction, TableError};
use std::collections::VecDeque;
use std::ops::Bound;
use std::sync::Arc;

const CHUNK: usize = 256;

/// Chunked forward cursor over a plain store, read through the transaction.
pub struct TxCursor {
    tx: Arc<StorageTx>,
    store: String,
    upper: Option<Vec<u8>>,
    buffer: VecDeque<(Vec<u8>, Vec<u8>)>,
    /// Inclusive lower bound for the next refill when nothing was read yet.
    start: Option<Vec<u8>>,
    /// Last key handed out; refills resume strictly after it.
    last: Option<Vec<u8>>,
    exhausted: bool,
}

impl TxCursor {
    pub fn new(
        tx: Arc<StorageTx>,
        store: impl Into<String>,
        from: Option<Vec<u8>>,
        upper: Option<Vec<u8>>,
    ) -> Self {
        Self {
            tx,
            store: store.into(),
            upper,
            buffer: VecDeque::new(),
            start: from,
            last: None,
            exhausted: false,
        }
    }

    /// Reposition to `key` (inclusive), discarding buffered entries.
    pub fn seek(&mut self, key: &[u8]) {
        self.buffer.clear();
        self.start = Some(key.to_vec());
        self.last = None;
        self.exhausted = false;
    }

    /// Delete the entry most recently returned by `next_entry`.
    /// Requires the owning transaction to hold the writer.
    pub fn delete_current(&mut self) -> DbResult<()> {
        if let Some(last) = &self.last {
            self.tx.delete(&self.store, last)?;
        }
        Ok(())
    }

    pub fn next_entry(&mut self) -> DbResult<Option<(Vec<u8>, Vec<u8>)>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.refill()?;
        }
        match self.buffer.pop_front() {
            Some((key, value)) => {
                self.last = Some(key.clone());
                Ok(Some((key, value)))
            }
            None => Ok(None),
        }
    }

    fn refill(&mut self) -> DbResult<()> {
        let lower = match (&self.last, &self.start) {
            (Some(last), _) => Bound::Excluded(last.as_slice()),
            (None, Some(start)) => Bound::Included(start.as_slice()),
            (None, None) => Bound::Unbounded,
        };
        let chunk = self
            .tx
            .range_chunk(&self.store, lower, self.upper.as_deref(), CHUNK)?;
        if chunk.len() < CHUNK {
            self.exhausted = true;
        }
        self.buffer.extend(chunk);
        Ok(())
    }
}

/// Chunked forward cursor over a duplicate-key store, emitting one
/// (key, value) pair per step.
pub struct TxDupCursor {
    tx: Arc<StorageTx>,
    store: String,
    lower: Option<Vec<u8>>,
    upper: Option<Vec<u8>>,
    buffer: VecDeque<(Vec<u8>, Vec<u8>)>,
    last: Option<(Vec<u8>, Vec<u8>)>,
    exhausted: bool,
}

impl TxDupCursor {
    pub fn new(
        tx: Arc<StorageTx>,
        store: impl Into<String>,
        lower: Option<Vec<u8>>,
        upper: Option<Vec<u8>>,
    ) -> Self {
        Self {
            tx,
            store: store.into(),
            lower,
            upper,
            buffer: VecDeque::new(),
            last: None,
            exhausted: false,
        }
    }

    pub fn next_entry(&mut self) -> DbResult<Option<(Vec<u8>, Vec<u8>)>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.refill()?;
        }
        match self.buffer.pop_front() {
            Some((key, value)) => {
                self.last = Some((key.clone(), value.clone()));
                Ok(Some((key, value)))
            }
            None => Ok(None),
        }
    }

    fn refill(&mut self) -> DbResult<()> {
        let lower = match &self.lower {
            Some(bound) => Bound::Included(bound.as_slice()),
            None => Bound::Unbounded,
        };
        let resume = self
            .last
            .as_ref()
            .map(|(key, value)| (key.as_slice(), value.as_slice()));
        let chunk = self.tx.dup_range_chunk(
            &self.store,
            lower,
            self.upper.as_deref(),
            resume,
            CHUNK,
        )?;
        if chunk.len() < CHUNK {
            self.exhausted = true;
        }
        self.buffer.extend(chunk);
        Ok(())
    }
}

/// Streaming cursor over an independent read snapshot.
pub struct SnapshotCursor {
    // Held so the snapshot outlives the range iterating over it.
    _snapshot: ReadTransaction,
    range: Option<redb::Range<'static, &'static [u8], &'static [u8]>>,
}

impl SnapshotCursor {
    /// Open a cursor over `[lower, upper)` of `store` in `snapshot`.
    ///
    /// A store that does not exist in the snapshot (e.g. created by a still
    /// uncommitted transaction) yields an empty cursor.
    pub fn new(
        snapshot: ReadTransaction,
        store: &str,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> DbResult<Self> {
        let definition =
            redb::TableDefinition::<&'static [u8], &'static [u8]>::new(store);
        let range = match snapshot.open_table(definition) {
            Ok(table) => Some(table.range::<&[u8]>((lower, upper))?),
            Err(err) if matches!(err, TableError::TableDoesNotExist(_)) => None,
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            _snapshot: snapshot,
            range,
        })
    }

    pub fn next_entry(&mut self) -> DbResult<Option<(Vec<u8>, Vec<u8>)>> {
        let Some(range) = self.range.as_mut() else {
            return Ok(None);
        };
        match range.next() {
            Some(entry) => {
                let (key, value) = entry?;
                Ok(Some((key.value().to_vec(), value.value().to_vec())))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageEnv;

    fn seeded_tx() -> Arc<StorageTx> {
        let env = StorageEnv::in_memory(&[]).unwrap();
        let tx = Arc::new(StorageTx::new(env));
        tx.ensure_writer().unwrap();
        for i in 0u16..600 {
            tx.put("s", &i.to_be_bytes(), &i.to_be_bytes()).unwrap();
        }
        tx
    }

    #[test]
    fn tx_cursor_streams_across_chunks() {
        let tx = seeded_tx();
        let mut cursor = TxCursor::new(Arc::clone(&tx), "s", None, None);
        let mut count = 0u16;
        while let Some((key, _)) = cursor.next_entry().unwrap() {
            assert_eq!(key, count.to_be_bytes().to_vec());
            count += 1;
        }
        assert_eq!(count, 600);
    }

    #[test]
    fn tx_cursor_observes_own_writes_between_chunks() {
        let tx = seeded_tx();
        let mut cursor = TxCursor::new(Arc::clone(&tx), "s", None, None);
        cursor.next_entry().unwrap();
        // Written beyond the buffered chunk; the cursor must pick it up.
        tx.put("s", &700u16.to_be_bytes(), b"late").unwrap();
        let mut last = Vec::new();
        while let Some((key, _)) = cursor.next_entry().unwrap() {
            last = key;
        }
        assert_eq!(last, 700u16.to_be_bytes().to_vec());
    }

    #[test]
    fn tx_cursor_delete_current() {
        let tx = seeded_tx();
        let mut cursor = TxCursor::new(Arc::clone(&tx), "s", None, None);
        let (key, _) = cursor.next_entry().unwrap().unwrap();
        cursor.delete_current().unwrap();
        assert_eq!(tx.get("s", &key).unwrap(), None);
    }

    #[test]
    fn tx_cursor_seek_repositions() {
        let tx = seeded_tx();
        let mut cursor = TxCursor::new(Arc::clone(&tx), "s", None, None);
        cursor.next_entry().unwrap();
        cursor.seek(&598u16.to_be_bytes());
        let (key, _) = cursor.next_entry().unwrap().unwrap();
        assert_eq!(key, 598u16.to_be_bytes().to_vec());
    }

    #[test]
    fn snapshot_cursor_ignores_pending_writes() {
        let tx = seeded_tx();
        tx.commit().unwrap();
        let tx2 = Arc::new(StorageTx::new(Arc::clone(tx.env())));
        tx2.ensure_writer().unwrap();
        tx2.put("s", &1000u16.to_be_bytes(), b"pending").unwrap();

        let snapshot = tx2.fresh_snapshot().unwrap();
        let mut cursor =
            SnapshotCursor::new(snapshot, "s", Bound::Unbounded, Bound::Unbounded).unwrap();
        let mut count = 0;
        while cursor.next_entry().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 600);
        tx2.abort().unwrap();
    }
}
