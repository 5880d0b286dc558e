use std::sync::Arc;

use alloy::primitives::Address;
use redb::{Database, ReadableTable, WriteTransaction};
use serde::{Deserialize, Serialize};

use crate::{DbError, INSTRUMENT_TABLE, pack, unpack};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentRow {
    pub address: Address,
    pub base: Address,
    pub quote: Address,
    pub symbol: String,
    pub created_at_block: u64,
}

/// Registry of instrument contracts discovered via Gate `NewInstrument`.
pub struct InstrumentStore {
    db: Arc<Database>,
    chain_id: u64,
}

impl InstrumentStore {
    pub(crate) fn new(db: Arc<Database>, chain_id: u64) -> Self {
        Self { db, chain_id }
    }

    pub fn insert(&self, row: &InstrumentRow, txn: &WriteTransaction) -> Result<(), DbError> {
        let mut table = txn.open_table(INSTRUMENT_TABLE)?;
        table.insert(
            (self.chain_id, row.address.into_array()),
            pack(row)?.as_slice(),
        )?;
        Ok(())
    }

    pub fn get(&self, address: Address) -> Result<Option<InstrumentRow>, DbError> {
        let read = self.db.begin_read()?;
        let table = read.open_table(INSTRUMENT_TABLE)?;
        match table.get((self.chain_id, address.into_array()))? {
            Some(value) => Ok(Some(unpack(value.value())?)),
            None => Ok(None),
        }
    }

    pub fn list(&self) -> Result<Vec<InstrumentRow>, DbError> {
        let read = self.db.begin_read()?;
        let table = read.open_table(INSTRUMENT_TABLE)?;
        let lower = (self.chain_id, [0u8; 20]);
        let upper = (self.chain_id, [0xffu8; 20]);
        let mut out = Vec::new();
        for item in table.range(lower..=upper)? {
            let (_, value) = item?;
            out.push(unpack(value.value())?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temp_store;

    #[test]
    fn insert_and_list_round_trip() {
        let db = temp_store();
        let instruments = db.instruments(81457);
        let row = InstrumentRow {
            address: Address::with_last_byte(7),
            base: Address::with_last_byte(1),
            quote: Address::with_last_byte(2),
            symbol: "ETH-USDB-PERP".to_string(),
            created_at_block: 178_100,
        };
        let txn = db.begin_write().expect("begin");
        instruments.insert(&row, &txn).expect("insert");
        txn.commit().expect("commit");

        assert_eq!(
            instruments.get(row.address).expect("get"),
            Some(row.clone())
        );
        assert_eq!(instruments.list().expect("list"), vec![row]);
    }
}
