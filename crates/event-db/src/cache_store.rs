use std::sync::Arc;

use redb::{Database, ReadableTable, WriteTransaction};
use serde_json::Value;

use crate::{CACHE_TABLE, DbError};

/// Named JSON bookkeeping rows, unique per `(chain_id, name)`. The original
/// service merged in-memory and persisted state behind a proxy object; here
/// it is plain explicit get/set.
pub struct CacheStore {
    db: Arc<Database>,
    chain_id: u64,
}

impl CacheStore {
    pub(crate) fn new(db: Arc<Database>, chain_id: u64) -> Self {
        Self { db, chain_id }
    }

    pub fn get(&self, name: &str) -> Result<Option<Value>, DbError> {
        let read = self.db.begin_read()?;
        let table = read.open_table(CACHE_TABLE)?;
        match table.get((self.chain_id, name))? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    pub fn set(&self, name: &str, value: &Value, txn: &WriteTransaction) -> Result<(), DbError> {
        let mut table = txn.open_table(CACHE_TABLE)?;
        let data = serde_json::to_vec(value)?;
        table.insert((self.chain_id, name), data.as_slice())?;
        Ok(())
    }

    /// Convenience for single-row updates outside a larger transaction.
    pub fn put(&self, name: &str, value: &Value) -> Result<(), DbError> {
        let txn = self.db.begin_write()?;
        self.set(name, value, &txn)?;
        txn.commit()?;
        Ok(())
    }

    pub fn get_u64(&self, name: &str) -> Result<Option<u64>, DbError> {
        Ok(self.get(name)?.and_then(|value| value.as_u64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temp_store;
    use serde_json::json;

    #[test]
    fn rows_are_scoped_by_chain_and_name() {
        let db = temp_store();
        let a = db.caches(1);
        let b = db.caches(2);
        a.put("storage", &json!({"blockNumber": 42})).expect("put");
        b.put("storage", &json!({"blockNumber": 7})).expect("put");

        let got = a.get("storage").expect("get").expect("present");
        assert_eq!(got["blockNumber"], 42);
        assert!(a.get("snapshot").expect("get").is_none());
        let got = b.get("storage").expect("get").expect("present");
        assert_eq!(got["blockNumber"], 7);
    }

    #[test]
    fn u64_accessor() {
        let db = temp_store();
        let cache = db.caches(1);
        cache.put("lastPersistedBlock", &json!(1800)).expect("put");
        assert_eq!(
            cache.get_u64("lastPersistedBlock").expect("get"),
            Some(1800)
        );
    }
}
