use std::ops::Bound;
use std::sync::Arc;

use redb::{Database, ReadableTable, WriteTransaction};

use indexer_core::types::Position;

use crate::{DbError, SNAPSHOT_TABLE};

type SnapKey = (u64, u64, u32, u32);

/// Serialized snapshots keyed by `(chain_id, Position)`.
pub struct SnapshotStore {
    db: Arc<Database>,
    chain_id: u64,
}

impl SnapshotStore {
    pub(crate) fn new(db: Arc<Database>, chain_id: u64) -> Self {
        Self { db, chain_id }
    }

    fn key(&self, position: Position) -> SnapKey {
        (
            self.chain_id,
            position.block_number,
            position.transaction_index,
            position.log_index,
        )
    }

    /// Idempotent: an existing row at the exact position is left untouched.
    pub fn save(
        &self,
        position: Position,
        serialized: &[u8],
        txn: &WriteTransaction,
    ) -> Result<bool, DbError> {
        let mut table = txn.open_table(SNAPSHOT_TABLE)?;
        if table.get(self.key(position))?.is_some() {
            return Ok(false);
        }
        table.insert(self.key(position), serialized)?;
        Ok(true)
    }

    /// Deletes every snapshot with `block_number >= from_block`. Returns the
    /// number of rows removed.
    pub fn destroy_from(&self, from_block: u64, txn: &WriteTransaction) -> Result<u64, DbError> {
        let mut table = txn.open_table(SNAPSHOT_TABLE)?;
        let lower = (self.chain_id, from_block, 0u32, 0u32);
        let upper = (self.chain_id, u64::MAX, u32::MAX, u32::MAX);
        let mut doomed = Vec::new();
        for item in table.range(lower..=upper)? {
            let (key, _) = item?;
            doomed.push(key.value());
        }
        let removed = doomed.len() as u64;
        for key in doomed {
            table.remove(key)?;
        }
        Ok(removed)
    }

    /// Deletes a single snapshot row; true when it existed.
    pub fn destroy_at(&self, position: Position, txn: &WriteTransaction) -> Result<bool, DbError> {
        let mut table = txn.open_table(SNAPSHOT_TABLE)?;
        Ok(table.remove(self.key(position))?.is_some())
    }

    /// The row with the greatest position `<= position`.
    pub fn nearest_at_or_before(
        &self,
        position: Position,
    ) -> Result<Option<(Position, Vec<u8>)>, DbError> {
        let read = self.db.begin_read()?;
        let table = read.open_table(SNAPSHOT_TABLE)?;
        let bounds = (
            Bound::Included((self.chain_id, 0u64, 0u32, 0u32)),
            Bound::Included(self.key(position)),
        );
        match table.range::<SnapKey>(bounds)?.next_back() {
            Some(item) => {
                let (key, value) = item?;
                let (_, block, tx, log) = key.value();
                Ok(Some((Position::new(block, tx, log), value.value().to_vec())))
            }
            None => Ok(None),
        }
    }

    /// All stored positions in ascending order.
    pub fn list(&self) -> Result<Vec<Position>, DbError> {
        let read = self.db.begin_read()?;
        let table = read.open_table(SNAPSHOT_TABLE)?;
        let lower = (self.chain_id, 0u64, 0u32, 0u32);
        let upper = (self.chain_id, u64::MAX, u32::MAX, u32::MAX);
        let mut out = Vec::new();
        for item in table.range(lower..=upper)? {
            let (key, _) = item?;
            let (_, block, tx, log) = key.value();
            out.push(Position::new(block, tx, log));
        }
        Ok(out)
    }
}
