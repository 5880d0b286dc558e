use std::ops::Bound;
use std::sync::{Arc, PoisonError, RwLock};

use alloy::primitives::{Address, B256};
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};

use indexer_core::types::{Position, StoredEvent};

use crate::{DbError, EVENT_INDEX_TABLE, pack, unpack};

/// Default cap on rows per sub-table.
pub const SUBTABLE_CAPACITY: u64 = 1_000_000;

/// Sub-tables pre-created past the last known index row on `init`.
const SUBTABLE_RUNWAY: u32 = 30;

type SubKey = (u64, u32, u32);
type SubTableDef<'a> = TableDefinition<'a, SubKey, &'static [u8]>;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct IndexRow {
    block_number_max: u64,
    size: u64,
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    k: u32,
    block_number_max: u64,
    size: u64,
}

/// Horizontally partitioned log table. Rows are keyed by the Position triple
/// so each sub-table streams in Position order natively; the in-memory index
/// mirrors the persisted `event_index` rows.
///
/// `create`/`destroy_one` must be called serially per chain; on a rolled-back
/// transaction the caller must `reload()` before retrying.
pub struct EventStore {
    db: Arc<Database>,
    chain_id: u64,
    capacity: u64,
    index: RwLock<Vec<IndexEntry>>,
}

impl EventStore {
    pub(crate) fn new(db: Arc<Database>, chain_id: u64) -> Self {
        Self {
            db,
            chain_id,
            capacity: SUBTABLE_CAPACITY,
            index: RwLock::new(Vec::new()),
        }
    }

    /// Overrides the per-sub-table row cap (tuning and tests).
    #[must_use]
    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Loads index rows and pre-creates sub-tables up to a small runway past
    /// the last known partition.
    pub fn init(&self) -> Result<(), DbError> {
        let mut entries = self.read_index_rows()?;
        let txn = self.db.begin_write()?;
        {
            if entries.is_empty() {
                let mut table = txn.open_table(EVENT_INDEX_TABLE)?;
                let row = IndexRow {
                    block_number_max: 0,
                    size: 0,
                };
                table.insert((self.chain_id, 0u32), pack(&row)?.as_slice())?;
                entries.push(IndexEntry {
                    k: 0,
                    block_number_max: 0,
                    size: 0,
                });
            }
            let last = entries.last().map(|entry| entry.k).unwrap_or(0);
            for k in 0..=last + SUBTABLE_RUNWAY {
                let name = self.subtable_name(k);
                let def: SubTableDef<'_> = TableDefinition::new(&name);
                txn.open_table(def)?;
            }
        }
        txn.commit()?;
        *self.write_lock() = entries;
        Ok(())
    }

    /// Re-reads the persisted index, discarding in-memory state. Required
    /// after a rolled-back write transaction.
    pub fn reload(&self) -> Result<(), DbError> {
        let entries = self.read_index_rows()?;
        *self.write_lock() = entries;
        Ok(())
    }

    /// Inserts a new event into the sub-table dictated by the placement
    /// invariant, updating `block_number_max`/`size` under `txn`.
    pub fn create(&self, event: &StoredEvent, txn: &WriteTransaction) -> Result<(), DbError> {
        let block = event.position.block_number;
        let mut index = self.write_lock();

        let slot = match index
            .iter()
            .position(|entry| entry.block_number_max >= block)
        {
            Some(found) => {
                let is_tail = found + 1 == index.len();
                if is_tail && index[found].size >= self.capacity {
                    let k = index.len() as u32;
                    index.push(IndexEntry {
                        k,
                        block_number_max: 0,
                        size: 0,
                    });
                    index.len() - 1
                } else {
                    found
                }
            }
            None => {
                let tail = index.len().saturating_sub(1);
                if index.is_empty() || index[tail].size >= self.capacity {
                    let k = index.len() as u32;
                    index.push(IndexEntry {
                        k,
                        block_number_max: 0,
                        size: 0,
                    });
                    index.len() - 1
                } else {
                    tail
                }
            }
        };

        let entry = &mut index[slot];
        let name = self.subtable_name(entry.k);
        let def: SubTableDef<'_> = TableDefinition::new(&name);
        {
            let mut table = txn.open_table(def)?;
            table.insert(event.position.key(), pack(event)?.as_slice())?;
        }
        entry.block_number_max = entry.block_number_max.max(block);
        entry.size += 1;
        self.persist_entry(txn, *entry)?;
        Ok(())
    }

    /// Overwrites an already-stored event in place (status transitions);
    /// index metadata is untouched.
    pub fn update(&self, event: &StoredEvent, txn: &WriteTransaction) -> Result<(), DbError> {
        let block = event.position.block_number;
        for entry in self.candidates(block) {
            let name = self.subtable_name(entry.k);
            let def: SubTableDef<'_> = TableDefinition::new(&name);
            let mut table = txn.open_table(def)?;
            let exists = table.get(event.position.key())?.is_some();
            if exists {
                table.insert(event.position.key(), pack(event)?.as_slice())?;
                return Ok(());
            }
        }
        Ok(())
    }

    /// Probes only sub-tables whose block range may contain `block_number`.
    pub fn find_one(&self, id: B256, block_number: u64) -> Result<Option<StoredEvent>, DbError> {
        let read = self.db.begin_read()?;
        for entry in self.candidates(block_number) {
            let name = self.subtable_name(entry.k);
            let def: SubTableDef<'_> = TableDefinition::new(&name);
            let table = match read.open_table(def) {
                Ok(table) => table,
                Err(redb::TableError::TableDoesNotExist(_)) => continue,
                Err(err) => return Err(err.into()),
            };
            let from = (block_number, 0u32, 0u32);
            let to = (block_number, u32::MAX, u32::MAX);
            for item in table.range(from..=to)? {
                let (_, value) = item?;
                let event: StoredEvent = unpack(value.value())?;
                if event.id == id {
                    return Ok(Some(event));
                }
            }
        }
        Ok(None)
    }

    /// Deletes rows with `id` at `block_number`, decrementing `size` by the
    /// number of rows removed. Returns that count.
    pub fn destroy_one(
        &self,
        id: B256,
        block_number: u64,
        txn: &WriteTransaction,
    ) -> Result<u64, DbError> {
        let mut index = self.write_lock();
        let mut prev_max: Option<u64> = None;
        for entry in index.iter_mut() {
            let lower_ok = prev_max.is_none_or(|prev| prev < block_number);
            let candidate = lower_ok && block_number <= entry.block_number_max;
            prev_max = Some(entry.block_number_max);
            if !candidate {
                continue;
            }

            let name = self.subtable_name(entry.k);
            let def: SubTableDef<'_> = TableDefinition::new(&name);
            let mut table = txn.open_table(def)?;
            let from = (block_number, 0u32, 0u32);
            let to = (block_number, u32::MAX, u32::MAX);
            let mut doomed = Vec::new();
            for item in table.range(from..=to)? {
                let (key, value) = item?;
                let event: StoredEvent = unpack(value.value())?;
                if event.id == id {
                    doomed.push(key.value());
                }
            }
            let removed = doomed.len() as u64;
            for key in doomed {
                table.remove(key)?;
            }
            drop(table);
            if removed > 0 {
                entry.size = entry.size.saturating_sub(removed);
                self.persist_entry(txn, *entry)?;
                return Ok(removed);
            }
        }
        Ok(0)
    }

    /// Lazily paged scan over sub-tables overlapping `[from, to]`; the
    /// filter may be refined between batches.
    pub fn find_all(
        &self,
        filter: EventFilter,
        from: Option<u64>,
        to: Option<u64>,
        limit: usize,
    ) -> EventCursor {
        EventCursor {
            db: Arc::clone(&self.db),
            chain_id: self.chain_id,
            entries: self.read_lock().clone(),
            entry_idx: 0,
            offset: 0,
            from: from.unwrap_or(0),
            to: to.unwrap_or(u64::MAX),
            limit: limit.max(1),
            filter,
        }
    }

    /// Position-ordered streaming over `(after, to]`, re-anchored after each
    /// yielded batch.
    pub fn find_all_ordered(
        &self,
        after: Position,
        to: Position,
        filter: Option<EventFilter>,
        limit: usize,
    ) -> OrderedScan {
        OrderedScan {
            db: Arc::clone(&self.db),
            chain_id: self.chain_id,
            entries: self.read_lock().clone(),
            entry_idx: 0,
            after,
            to,
            limit: limit.max(1),
            filter,
        }
    }

    pub fn latest_position(&self) -> Result<Option<Position>, DbError> {
        let read = self.db.begin_read()?;
        let entries = self.read_lock().clone();
        for entry in entries.iter().rev() {
            let name = self.subtable_name(entry.k);
            let def: SubTableDef<'_> = TableDefinition::new(&name);
            let table = match read.open_table(def) {
                Ok(table) => table,
                Err(redb::TableError::TableDoesNotExist(_)) => continue,
                Err(err) => return Err(err.into()),
            };
            if let Some(item) = table.last()? {
                let (key, _) = item;
                return Ok(Some(Position::from_key(key.value())));
            }
        }
        Ok(None)
    }

    pub fn latest_stored_block(&self) -> Result<Option<u64>, DbError> {
        Ok(self
            .latest_position()?
            .map(|position| position.block_number))
    }

    pub fn total_size(&self) -> u64 {
        self.read_lock().iter().map(|entry| entry.size).sum()
    }

    /// `(k, block_number_max, size)` triples in k order.
    pub fn index_rows(&self) -> Vec<(u32, u64, u64)> {
        self.read_lock()
            .iter()
            .map(|entry| (entry.k, entry.block_number_max, entry.size))
            .collect()
    }

    fn candidates(&self, block_number: u64) -> Vec<IndexEntry> {
        let index = self.read_lock();
        let mut prev_max: Option<u64> = None;
        let mut out = Vec::new();
        for entry in index.iter() {
            let lower_ok = prev_max.is_none_or(|prev| prev < block_number);
            if lower_ok && block_number <= entry.block_number_max {
                out.push(*entry);
            }
            prev_max = Some(entry.block_number_max);
        }
        out
    }

    fn read_index_rows(&self) -> Result<Vec<IndexEntry>, DbError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(EVENT_INDEX_TABLE)?;
        let mut entries = Vec::new();
        let from = (self.chain_id, 0u32);
        let to = (self.chain_id, u32::MAX);
        for item in table.range(from..=to)? {
            let (key, value) = item?;
            let row: IndexRow = unpack(value.value())?;
            entries.push(IndexEntry {
                k: key.value().1,
                block_number_max: row.block_number_max,
                size: row.size,
            });
        }
        Ok(entries)
    }

    fn persist_entry(&self, txn: &WriteTransaction, entry: IndexEntry) -> Result<(), DbError> {
        let mut table = txn.open_table(EVENT_INDEX_TABLE)?;
        let row = IndexRow {
            block_number_max: entry.block_number_max,
            size: entry.size,
        };
        table.insert((self.chain_id, entry.k), pack(&row)?.as_slice())?;
        Ok(())
    }

    fn subtable_name(&self, k: u32) -> String {
        format!("events_{}_{}", self.chain_id, k)
    }

    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, Vec<IndexEntry>> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, Vec<IndexEntry>> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Row predicate for scans. Absent fields match everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub id: Option<B256>,
    pub address: Option<Address>,
    pub name: Option<String>,
}

impl EventFilter {
    pub fn matches(&self, event: &StoredEvent) -> bool {
        if let Some(id) = &self.id
            && event.id != *id
        {
            return false;
        }
        if let Some(address) = &self.address
            && event.address != *address
        {
            return false;
        }
        if let Some(name) = &self.name
            && event.name != *name
        {
            return false;
        }
        true
    }
}

/// Continuation cursor over `find_all`. Each call yields up to `limit`
/// matching rows; `None` when exhausted. A refinement supplied to
/// `next_batch` replaces the filter for the remainder of the scan.
pub struct EventCursor {
    db: Arc<Database>,
    chain_id: u64,
    entries: Vec<IndexEntry>,
    entry_idx: usize,
    offset: u64,
    from: u64,
    to: u64,
    limit: usize,
    filter: EventFilter,
}

impl EventCursor {
    pub fn next_batch(
        &mut self,
        refine: Option<EventFilter>,
    ) -> Result<Option<Vec<StoredEvent>>, DbError> {
        if let Some(refined) = refine {
            self.filter = refined;
        }
        let read = self.db.begin_read()?;
        while self.entry_idx < self.entries.len() {
            let entry = self.entries[self.entry_idx];
            let name = format!("events_{}_{}", self.chain_id, entry.k);
            let def: SubTableDef<'_> = TableDefinition::new(&name);
            let table = match read.open_table(def) {
                Ok(table) => table,
                Err(redb::TableError::TableDoesNotExist(_)) => {
                    self.entry_idx += 1;
                    self.offset = 0;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let lower = (self.from, 0u32, 0u32);
            let upper = (self.to, u32::MAX, u32::MAX);
            let mut skipped = 0;
            let mut page = Vec::new();
            for item in table.range(lower..=upper)? {
                let (_, value) = item?;
                let event: StoredEvent = unpack(value.value())?;
                if !self.filter.matches(&event) {
                    continue;
                }
                if skipped < self.offset {
                    skipped += 1;
                    continue;
                }
                page.push(event);
                if page.len() == self.limit {
                    break;
                }
            }

            if page.len() == self.limit {
                self.offset += self.limit as u64;
                return Ok(Some(page));
            }
            // Short page: this sub-table is exhausted for the filter.
            self.entry_idx += 1;
            self.offset = 0;
            if !page.is_empty() {
                return Ok(Some(page));
            }
        }
        Ok(None)
    }
}

/// Position-ordered streaming scan with a strict lower bound, across
/// sub-tables in k order (globally ordered by the partition invariant).
pub struct OrderedScan {
    db: Arc<Database>,
    chain_id: u64,
    entries: Vec<IndexEntry>,
    entry_idx: usize,
    after: Position,
    to: Position,
    limit: usize,
    filter: Option<EventFilter>,
}

impl OrderedScan {
    /// An empty batch means the scan is exhausted.
    pub fn next_batch(&mut self) -> Result<Vec<StoredEvent>, DbError> {
        let read = self.db.begin_read()?;
        let mut batch = Vec::new();
        while self.entry_idx < self.entries.len() {
            let entry = self.entries[self.entry_idx];
            if entry.block_number_max < self.after.block_number {
                self.entry_idx += 1;
                continue;
            }
            let name = format!("events_{}_{}", self.chain_id, entry.k);
            let def: SubTableDef<'_> = TableDefinition::new(&name);
            let table = match read.open_table(def) {
                Ok(table) => table,
                Err(redb::TableError::TableDoesNotExist(_)) => {
                    self.entry_idx += 1;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let bounds = (
                Bound::Excluded(self.after.key()),
                Bound::Included(self.to.key()),
            );
            let mut exhausted = true;
            for item in table.range::<SubKey>(bounds)? {
                let (key, value) = item?;
                let event: StoredEvent = unpack(value.value())?;
                let position = Position::from_key(key.value());
                if let Some(filter) = &self.filter
                    && !filter.matches(&event)
                {
                    continue;
                }
                batch.push(event);
                if batch.len() == self.limit {
                    self.after = position;
                    exhausted = false;
                    break;
                }
            }
            if exhausted {
                self.entry_idx += 1;
                continue;
            }
            return Ok(batch);
        }
        if let Some(last) = batch.last() {
            self.after = last.position;
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temp_store;
    use alloy::primitives::{Address, B256, Bytes};

    fn event(chain_id: u64, block: u64, tx: u32, log: u32) -> StoredEvent {
        let position = Position::new(block, tx, log);
        let mut seed = [0u8; 32];
        seed[..8].copy_from_slice(&block.to_be_bytes());
        seed[8..12].copy_from_slice(&tx.to_be_bytes());
        seed[12..16].copy_from_slice(&log.to_be_bytes());
        StoredEvent {
            id: B256::from(seed),
            chain_id,
            address: Address::with_last_byte(1),
            position,
            block_hash: B256::with_last_byte(2),
            tx_hash: B256::with_last_byte(3),
            topics: vec![],
            data: Bytes::new(),
            name: "Trade".to_string(),
            args: "{}".to_string(),
            timestamp: None,
            status: 0,
        }
    }

    fn create_all(store: &EventStore, db: &crate::DbStore, events: &[StoredEvent]) {
        for ev in events {
            let txn = db.begin_write().expect("begin write");
            store.create(ev, &txn).expect("create event");
            txn.commit().expect("commit");
        }
    }

    #[test]
    fn tail_split_allocates_next_subtable() {
        let db = temp_store();
        let store = db.events(10).with_capacity(3);
        store.init().expect("init");

        let events: Vec<_> = (1..=7u64).map(|b| event(10, b, 0, 0)).collect();
        create_all(&store, &db, &events);

        let rows = store.index_rows();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], (0, 3, 3));
        assert_eq!(rows[1], (1, 6, 3));
        assert_eq!(rows[2], (2, 7, 1));
        assert_eq!(store.total_size(), 7);
        // max non-decreasing in k
        assert!(rows.windows(2).all(|w| w[0].1 <= w[1].1));
    }

    #[test]
    fn backfill_goes_to_smallest_covering_subtable() {
        let db = temp_store();
        let store = db.events(10).with_capacity(3);
        store.init().expect("init");

        create_all(
            &store,
            &db,
            &[
                event(10, 10, 0, 0),
                event(10, 20, 0, 0),
                event(10, 30, 0, 0),
                event(10, 40, 0, 0),
            ],
        );
        // block 15 is covered by sub-table 0 (max 30)
        create_all(&store, &db, &[event(10, 15, 0, 0)]);
        let rows = store.index_rows();
        assert_eq!(rows[0].2, 4);
        assert_eq!(rows[1].2, 1);
    }

    #[test]
    fn find_one_probes_only_covering_range() {
        let db = temp_store();
        let store = db.events(10).with_capacity(100);
        store.init().expect("init");
        let ev = event(10, 42, 1, 2);
        create_all(&store, &db, std::slice::from_ref(&ev));

        let found = store.find_one(ev.id, 42).expect("lookup").expect("present");
        assert_eq!(found.position, ev.position);
        assert!(store.find_one(ev.id, 43).expect("lookup").is_none());
        assert!(store.find_one(B256::ZERO, 42).expect("lookup").is_none());
    }

    #[test]
    fn destroy_then_recreate_keeps_accounting() {
        let db = temp_store();
        let store = db.events(10).with_capacity(100);
        store.init().expect("init");
        let ev = event(10, 42, 1, 2);
        create_all(&store, &db, std::slice::from_ref(&ev));
        let before = store.index_rows();

        let txn = db.begin_write().expect("begin write");
        let removed = store.destroy_one(ev.id, 42, &txn).expect("destroy");
        txn.commit().expect("commit");
        assert_eq!(removed, 1);
        assert_eq!(store.total_size(), 0);

        create_all(&store, &db, std::slice::from_ref(&ev));
        assert_eq!(store.index_rows(), before);
    }

    #[test]
    fn ordered_scan_streams_across_subtables() {
        let db = temp_store();
        let store = db.events(10).with_capacity(2);
        store.init().expect("init");

        let mut events = Vec::new();
        for block in 1..=5u64 {
            events.push(event(10, block, 0, 0));
            events.push(event(10, block, 1, 0));
        }
        create_all(&store, &db, &events);

        let mut scan = store.find_all_ordered(
            Position::new(1, 0, 0),
            Position::block_end(4),
            None,
            3,
        );
        let mut seen = Vec::new();
        loop {
            let batch = scan.next_batch().expect("scan");
            if batch.is_empty() {
                break;
            }
            seen.extend(batch.into_iter().map(|ev| ev.position));
        }
        // strict lower bound excludes (1,0,0); inclusive upper keeps block 4
        assert_eq!(seen.first(), Some(&Position::new(1, 1, 0)));
        assert_eq!(seen.last(), Some(&Position::new(4, 1, 0)));
        assert_eq!(seen.len(), 7);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn cursor_pages_and_accepts_refinement() {
        let db = temp_store();
        let store = db.events(10).with_capacity(100);
        store.init().expect("init");

        let mut events: Vec<_> = (1..=6u64).map(|b| event(10, b, 0, 0)).collect();
        events[4].name = "Place".to_string();
        events[5].name = "Place".to_string();
        create_all(&store, &db, &events);

        let mut cursor = store.find_all(EventFilter::default(), Some(1), Some(6), 2);
        let first = cursor.next_batch(None).expect("batch").expect("rows");
        assert_eq!(first.len(), 2);
        let refined = cursor
            .next_batch(Some(EventFilter {
                name: Some("Place".to_string()),
                ..EventFilter::default()
            }))
            .expect("batch")
            .expect("rows");
        assert!(refined.iter().all(|ev| ev.name == "Place"));
    }

    #[test]
    fn latest_position_reads_tail() {
        let db = temp_store();
        let store = db.events(10).with_capacity(2);
        store.init().expect("init");
        assert!(store.latest_position().expect("latest").is_none());
        create_all(
            &store,
            &db,
            &[event(10, 1, 0, 0), event(10, 2, 0, 0), event(10, 9, 3, 4)],
        );
        assert_eq!(
            store.latest_position().expect("latest"),
            Some(Position::new(9, 3, 4))
        );
    }
}
