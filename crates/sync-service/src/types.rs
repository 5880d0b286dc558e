use alloy::primitives::{Address, B256};

use indexer_core::abi::{ContractKind, ParsedEvent};
use indexer_core::types::Position;

/// Fixed protocol addresses of one chain; instruments are discovered at
/// runtime and tracked by the fetcher's subscription list.
#[derive(Debug, Clone, Copy)]
pub struct ChainAddresses {
    pub gate: Address,
    pub config: Address,
}

/// Selects the parsing ABI for a log's emitting address. Anything that is
/// neither the Gate nor the Config contract is an instrument; the fetcher
/// only subscribes to known addresses, so stray logs cannot reach parsing.
pub fn contract_kind_for(addresses: &ChainAddresses, address: Address) -> ContractKind {
    if address == addresses.gate {
        ContractKind::Gate
    } else if address == addresses.config {
        ContractKind::Config
    } else {
        ContractKind::Instrument
    }
}

/// A stored-and-parsed event fanned out by the storage processor to the
/// snapshot driver and notification hooks.
#[derive(Debug, Clone)]
pub struct ParsedLogEvent {
    pub id: B256,
    pub position: Position,
    pub address: Address,
    pub event: ParsedEvent,
    /// True when the event had already carried the PROCESSED bit before this
    /// dispatch (reorg reprocessing); handlers must be idempotent for these.
    pub processed: bool,
}
