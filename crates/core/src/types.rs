use std::fmt;

use alloy::primitives::{Address, B256, Bytes, keccak256};
use alloy_rpc_types_eth::Log;
use serde::{Deserialize, Serialize};

/// A point in the log stream, ordered lexicographically by
/// `(block_number, transaction_index, log_index)`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Position {
    pub block_number: u64,
    pub transaction_index: u32,
    pub log_index: u32,
}

impl Position {
    pub const ZERO: Self = Self {
        block_number: 0,
        transaction_index: 0,
        log_index: 0,
    };

    pub const MAX: Self = Self {
        block_number: u64::MAX,
        transaction_index: u32::MAX,
        log_index: u32::MAX,
    };

    pub const fn new(block_number: u64, transaction_index: u32, log_index: u32) -> Self {
        Self {
            block_number,
            transaction_index,
            log_index,
        }
    }

    /// The greatest position within `block_number`.
    pub const fn block_end(block_number: u64) -> Self {
        Self {
            block_number,
            transaction_index: u32::MAX,
            log_index: u32::MAX,
        }
    }

    /// Storage key form; the tuple ordering matches `Ord`.
    pub const fn key(&self) -> (u64, u32, u32) {
        (self.block_number, self.transaction_index, self.log_index)
    }

    pub const fn from_key(key: (u64, u32, u32)) -> Self {
        Self {
            block_number: key.0,
            transaction_index: key.1,
            log_index: key.2,
        }
    }

    /// Extracts the position of a chain log. Pending logs carry no position.
    pub fn of_log(log: &Log) -> Option<Self> {
        Some(Self {
            block_number: log.block_number?,
            transaction_index: log.transaction_index? as u32,
            log_index: log.log_index? as u32,
        })
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            self.block_number, self.transaction_index, self.log_index
        )
    }
}

/// Stable 256-bit identity of a log across parsed/stored representations.
pub fn log_id(chain_id: u64, log: &Log) -> B256 {
    let mut buf = Vec::with_capacity(8 + 20 + 32 + 32 + 8);
    buf.extend_from_slice(&chain_id.to_be_bytes());
    buf.extend_from_slice(log.address().as_slice());
    buf.extend_from_slice(log.block_hash.unwrap_or_default().as_slice());
    buf.extend_from_slice(log.transaction_hash.unwrap_or_default().as_slice());
    buf.extend_from_slice(&log.log_index.unwrap_or_default().to_be_bytes());
    keccak256(&buf)
}

/// `status` bit set once the event has been dispatched to its handler.
pub const STATUS_PROCESSED: u8 = 1;

/// A log persisted into the event store, together with its parse result.
/// The sub-table row key is the [`Position`] triple; everything else lives
/// in the encoded value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub id: B256,
    pub chain_id: u64,
    pub address: Address,
    pub position: Position,
    pub block_hash: B256,
    pub tx_hash: B256,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub name: String,
    /// JSON-serialized parsed arguments (tagged, see `abi::ParsedEvent`).
    pub args: String,
    pub timestamp: Option<u64>,
    pub status: u8,
}

impl StoredEvent {
    pub fn is_processed(&self) -> bool {
        self.status & STATUS_PROCESSED != 0
    }

    pub fn mark_processed(&mut self) {
        self.status |= STATUS_PROCESSED;
    }
}

/// Slim block header view kept by the block cache and head loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_total_order() {
        let a = Position::new(5, 0, 7);
        let b = Position::new(5, 1, 0);
        let c = Position::new(6, 0, 0);
        assert!(a < b && b < c);
        assert!(Position::block_end(5) < c);
        assert!(a < Position::block_end(5));
    }

    #[test]
    fn log_id_depends_on_log_index() {
        let mut log = Log::default();
        log.block_hash = Some(B256::with_last_byte(1));
        log.transaction_hash = Some(B256::with_last_byte(2));
        log.log_index = Some(3);
        let a = log_id(81457, &log);
        log.log_index = Some(4);
        let b = log_id(81457, &log);
        assert_ne!(a, b);
    }
}
