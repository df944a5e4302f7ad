//! Keyed record store over sled.
//!
//! Records are CBOR encoded and addressed by logical keys such as
//! `transaction:<id>`. Every mutation goes through a compare-and-swap loop on
//! the record's key, so concurrent writers to the same record are serialised
//! and the losing writer re-runs its closure against the fresh record.
//! Transitions spanning several records (a transaction and its dispute) run
//! in [`Store::transact`] instead, which commits all of their writes or none.

use crate::error::{Result, SettlementError};
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use sled::{Batch, Db};
use std::sync::Arc;

pub const TRANSACTION_PREFIX: &str = "transaction:";
pub const DISPUTE_PREFIX: &str = "dispute:";
pub const DISPUTE_INDEX_PREFIX: &str = "dispute-id:";
pub const TRUST_PREFIX: &str = "trust:";
pub const FLAG_PREFIX: &str = "flag:";

pub fn transaction_key(id: &str) -> String {
    format!("{TRANSACTION_PREFIX}{id}")
}
pub fn dispute_key(transaction_id: &str) -> String {
    format!("{DISPUTE_PREFIX}{transaction_id}")
}
pub fn dispute_index_key(dispute_id: &str) -> String {
    format!("{DISPUTE_INDEX_PREFIX}{dispute_id}")
}
pub fn trust_key(party_id: &str) -> String {
    format!("{TRUST_PREFIX}{party_id}")
}
pub fn flag_key(id: &str) -> String {
    format!("{FLAG_PREFIX}{id}")
}

#[derive(Clone)]
pub struct Store {
    instance: Arc<Db>,
}

/// Writes applied together by [`Store::apply`].
#[derive(Default)]
pub struct RecordBatch {
    inner: Batch,
}

impl RecordBatch {
    pub fn put<T: minicbor::Encode<()>>(&mut self, key: &str, value: &T) -> Result<()> {
        self.inner.insert(key, encode(value)?);
        Ok(())
    }
}

pub type TxResult<T> = ConflictableTransactionResult<T, SettlementError>;

/// Abort the surrounding [`Store::transact`] with `err`.
pub fn abort(err: SettlementError) -> ConflictableTransactionError<SettlementError> {
    ConflictableTransactionError::Abort(err)
}

/// View of the tree inside [`Store::transact`].
pub struct TxRecords<'a> {
    tree: &'a TransactionalTree,
}

impl TxRecords<'_> {
    pub fn get<T>(&self, key: &str) -> TxResult<Option<T>>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        match self.tree.get(key)? {
            Some(bytes) => minicbor::decode(&bytes)
                .map(Some)
                .map_err(|e| abort(e.into())),
            None => Ok(None),
        }
    }

    /// Read a record that has to exist.
    pub fn fetch<T>(&self, key: &str) -> TxResult<T>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        self.get(key)?
            .ok_or_else(|| abort(SettlementError::NotFound(key.to_string())))
    }

    pub fn put<T: minicbor::Encode<()>>(&self, key: &str, value: &T) -> TxResult<()> {
        let bytes = encode(value).map_err(abort)?;
        self.tree.insert(key, bytes)?;
        Ok(())
    }
}

fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>> {
    minicbor::to_vec(value).map_err(|e| SettlementError::Encode(e.to_string()))
}

impl Store {
    pub fn new(instance: Arc<Db>) -> Self {
        Self { instance }
    }

    pub fn get<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        match self.instance.get(key)? {
            Some(bytes) => Ok(Some(minicbor::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Insert a record that must not exist yet.
    pub fn insert_new<T: minicbor::Encode<()>>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = encode(value)?;
        match self
            .instance
            .compare_and_swap(key, None::<&[u8]>, Some(bytes))?
        {
            Ok(()) => Ok(()),
            Err(_) => Err(SettlementError::AlreadyExists(key.to_string())),
        }
    }

    /// Unconditional write; only for records with a single logical owner.
    pub fn put<T: minicbor::Encode<()>>(&self, key: &str, value: &T) -> Result<()> {
        self.instance.insert(key, encode(value)?)?;
        Ok(())
    }

    /// Apply every write of `batch` atomically.
    pub fn apply(&self, batch: RecordBatch) -> Result<()> {
        self.instance.apply_batch(batch.inner)?;
        Ok(())
    }

    /// Run `f` as one serialisable transaction over the whole tree.
    ///
    /// `f` is re-run on conflict, so it must only read and write through the
    /// [`TxRecords`] it is given. Aborting with [`abort`] writes nothing.
    pub fn transact<R, F>(&self, f: F) -> Result<R>
    where
        F: Fn(&TxRecords<'_>) -> TxResult<R>,
    {
        self.instance
            .transaction(|tree| f(&TxRecords { tree }))
            .map_err(|e| match e {
                TransactionError::Abort(e) => e,
                TransactionError::Storage(e) => SettlementError::Storage(e),
            })
    }

    pub fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.instance.remove(key)?.is_some())
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.instance.contains_key(key)?)
    }

    /// Atomic read-modify-write of an existing record.
    ///
    /// `f` may run more than once; it must only touch the record it is given.
    /// An `Err` from `f` aborts without writing.
    pub fn update<T, R, F>(&self, key: &str, f: F) -> Result<(T, R)>
    where
        T: minicbor::Encode<()> + for<'b> minicbor::Decode<'b, ()>,
        F: FnMut(&mut T) -> Result<R>,
    {
        self.cas_loop(key, None::<fn() -> T>, f)
    }

    /// Like [`Store::update`] but creates the record with `init` when absent.
    pub fn upsert<T, R, I, F>(&self, key: &str, init: I, f: F) -> Result<(T, R)>
    where
        T: minicbor::Encode<()> + for<'b> minicbor::Decode<'b, ()>,
        I: Fn() -> T,
        F: FnMut(&mut T) -> Result<R>,
    {
        self.cas_loop(key, Some(init), f)
    }

    fn cas_loop<T, R, I, F>(&self, key: &str, init: Option<I>, mut f: F) -> Result<(T, R)>
    where
        T: minicbor::Encode<()> + for<'b> minicbor::Decode<'b, ()>,
        I: Fn() -> T,
        F: FnMut(&mut T) -> Result<R>,
    {
        loop {
            let current = self.instance.get(key)?;
            let mut record = match (&current, &init) {
                (Some(bytes), _) => minicbor::decode(bytes)?,
                (None, Some(init)) => init(),
                (None, None) => return Err(SettlementError::NotFound(key.to_string())),
            };

            let out = f(&mut record)?;
            let bytes = encode(&record)?;

            match self
                .instance
                .compare_and_swap(key, current.as_ref(), Some(bytes))?
            {
                Ok(()) => return Ok((record, out)),
                Err(_) => {
                    tracing::debug!(key, "concurrent write detected, retrying");
                }
            }
        }
    }

    /// Decode every record under `prefix`, in key order.
    pub fn scan<T>(&self, prefix: &str) -> Result<Vec<T>>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        self.instance
            .scan_prefix(prefix)
            .map(|entry| {
                let (_, bytes) = entry?;
                Ok(minicbor::decode(&bytes)?)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let db = sled::open(dir.path().join("store.db")).unwrap();
        (dir, Store::new(Arc::new(db)))
    }

    #[test]
    fn insert_new_refuses_existing_keys() {
        let (_dir, store) = open_store();

        store.insert_new("flag:a", &"stolen".to_string()).unwrap();
        let err = store.insert_new("flag:a", &"other".to_string()).unwrap_err();

        assert!(matches!(err, SettlementError::AlreadyExists(_)));
        let kept: Option<String> = store.get("flag:a").unwrap();
        assert_eq!(kept.as_deref(), Some("stolen"));
    }

    #[test]
    fn update_requires_existing_record() {
        let (_dir, store) = open_store();

        let err = store
            .update("trust:nobody", |n: &mut u64| {
                *n += 1;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, SettlementError::NotFound(_)));
    }

    #[test]
    fn failed_closure_leaves_record_untouched() {
        let (_dir, store) = open_store();
        store.put("counter", &5u64).unwrap();

        let res = store.update("counter", |n: &mut u64| -> Result<()> {
            *n = 99;
            Err(SettlementError::InvalidInput("rejected".into()))
        });

        assert!(res.is_err());
        assert_eq!(store.get::<u64>("counter").unwrap(), Some(5));
    }

    #[test]
    fn concurrent_upserts_do_not_lose_writes() {
        let (_dir, store) = open_store();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        store
                            .upsert("counter", || 0u64, |n: &mut u64| {
                                *n += 1;
                                Ok(())
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.get::<u64>("counter").unwrap(), Some(200));
    }

    #[test]
    fn batch_writes_land_together() {
        let (_dir, store) = open_store();
        let mut batch = RecordBatch::default();
        batch.put(&dispute_key("tx_1"), &"record".to_string()).unwrap();
        batch.put(&dispute_index_key("dispute_1"), &"tx_1".to_string()).unwrap();
        store.apply(batch).unwrap();

        assert!(store.contains(&dispute_key("tx_1")).unwrap());
        let target: Option<String> = store.get(&dispute_index_key("dispute_1")).unwrap();
        assert_eq!(target.as_deref(), Some("tx_1"));
    }

    #[test]
    fn transaction_writes_every_record_or_none() {
        let (_dir, store) = open_store();
        store.put("transaction:tx_1", &"SENT".to_string()).unwrap();

        let err = store
            .transact(|records| {
                records.put("transaction:tx_1", &"DISPUTED".to_string())?;
                Err::<(), _>(abort(SettlementError::InvalidInput("dispute rejected".into())))
            })
            .unwrap_err();
        assert!(matches!(err, SettlementError::InvalidInput(_)));
        assert_eq!(
            store.get::<String>("transaction:tx_1").unwrap().as_deref(),
            Some("SENT")
        );

        store
            .transact(|records| {
                let state: String = records.fetch("transaction:tx_1")?;
                assert_eq!(state, "SENT");
                records.put("transaction:tx_1", &"DISPUTED".to_string())?;
                records.put(&dispute_key("tx_1"), &"OPEN".to_string())
            })
            .unwrap();
        assert_eq!(
            store.get::<String>("transaction:tx_1").unwrap().as_deref(),
            Some("DISPUTED")
        );
        assert!(store.contains(&dispute_key("tx_1")).unwrap());
    }

    #[test]
    fn transaction_fetch_reports_missing_records() {
        let (_dir, store) = open_store();
        let err = store
            .transact(|records| records.fetch::<String>("dispute:tx_9"))
            .unwrap_err();
        assert!(matches!(err, SettlementError::NotFound(_)));
    }

    #[test]
    fn scan_reads_only_the_prefix() {
        let (_dir, store) = open_store();
        store.put("flag:a", &"x".to_string()).unwrap();
        store.put("flag:b", &"y".to_string()).unwrap();
        store.put("trust:a", &"z".to_string()).unwrap();

        let flags: Vec<String> = store.scan(FLAG_PREFIX).unwrap();
        assert_eq!(flags, vec!["x".to_string(), "y".to_string()]);
    }
}
