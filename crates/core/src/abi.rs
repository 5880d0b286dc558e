use alloy::primitives::{Address, B256, I256, U256};
use alloy::sol;
use alloy::sol_types::SolEvent;
use alloy_rpc_types_eth::Log;
use serde::{Deserialize, Serialize};

sol! {
    // Gate
    event NewInstrument(bytes32 index, address instrument, address base, address quote, string symbol, uint256 total);
    event Deposit(address indexed token, address indexed trader, uint256 quantity);
    event Withdraw(address indexed token, address indexed trader, uint256 quantity);

    // Config
    event SetQuoteParam(address indexed quote, uint128 minMarginAmount, uint16 tradingFeeRatio, uint16 protocolFeeRatio, uint128 tip);

    // Instrument
    event UpdatePair(uint32 indexed expiry, uint32 timestamp, uint8 status, int32 tick, uint160 sqrtPX96, uint128 liquidity, uint128 totalLiquidity, uint128 involvedFund, uint128 openInterests, uint128 feeIndex, uint128 protocolFee, uint128 totalLong, uint128 totalShort, uint128 insuranceFund, uint256 mark);
    event Trade(uint32 indexed expiry, address indexed trader, int256 size, uint256 amount, int256 takenSize, uint256 takenValue, uint256 entryNotional, uint16 feeRatio, int32 tick, uint256 mark);
    event Adjust(uint32 indexed expiry, address indexed trader, int256 net);
    event Add(uint32 indexed expiry, address indexed trader, int32 tickLower, int32 tickUpper, uint128 liquidity, uint128 balance, uint160 sqrtEntryPX96);
    event Remove(uint32 indexed expiry, address indexed trader, int32 tickLower, int32 tickUpper, uint128 fee, int256 pnl, address operator);
    event Place(uint32 indexed expiry, address indexed trader, int32 tick, uint32 nonce, uint128 balance, int256 size);
    event Cancel(uint32 indexed expiry, address indexed trader, int32 tick, uint32 nonce, uint128 fee, int256 pnl);
    event Fill(uint32 indexed expiry, address indexed trader, int32 tick, uint32 nonce, uint128 fee, int256 pnl, address operator);
    event Liquidate(uint32 indexed expiry, address indexed trader, address target, uint256 amount, uint256 mark, int256 size);
    event Settle(uint32 indexed expiry, address indexed trader, uint256 settlement, uint128 balance, address operator);
    event UpdateCondition(uint32 indexed expiry, uint8 condition);
    event UpdateFundingIndex(uint32 indexed expiry, int256 longFundingIndex, int256 shortFundingIndex);
    event UpdateSocialLoss(uint32 indexed expiry, uint128 longSocialLossIndex, uint128 shortSocialLossIndex);
    event DeleteContext(uint32 indexed expiry);
}

/// Which ABI a log is parsed against, selected by its emitting address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractKind {
    Gate,
    Config,
    Instrument,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("log has no topic0")]
    MissingTopic,
    #[error("unknown {kind:?} event topic {topic}")]
    UnknownTopic { kind: ContractKind, topic: B256 },
    #[error("event decode error: {0}")]
    Decode(#[from] alloy::sol_types::Error),
}

/// A decoded protocol event. Serializes as `{"name": ..., "args": {...}}`;
/// the stored representation must deserialize back losslessly so reorg
/// reprocessing can skip re-parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "args", rename_all_fields = "camelCase")]
pub enum ParsedEvent {
    NewInstrument {
        index: B256,
        instrument: Address,
        base: Address,
        quote: Address,
        symbol: String,
        total: U256,
    },
    Deposit {
        token: Address,
        trader: Address,
        quantity: U256,
    },
    Withdraw {
        token: Address,
        trader: Address,
        quantity: U256,
    },
    SetQuoteParam {
        quote: Address,
        min_margin_amount: u128,
        trading_fee_ratio: u16,
        protocol_fee_ratio: u16,
        tip: u128,
    },
    UpdatePair {
        expiry: u32,
        timestamp: u32,
        status: u8,
        tick: i32,
        sqrt_px96: U256,
        liquidity: u128,
        total_liquidity: u128,
        involved_fund: u128,
        open_interests: u128,
        fee_index: u128,
        protocol_fee: u128,
        total_long: u128,
        total_short: u128,
        insurance_fund: u128,
        mark: U256,
    },
    Trade {
        expiry: u32,
        trader: Address,
        size: I256,
        amount: U256,
        taken_size: I256,
        taken_value: U256,
        entry_notional: U256,
        fee_ratio: u16,
        tick: i32,
        mark: U256,
    },
    Adjust {
        expiry: u32,
        trader: Address,
        net: I256,
    },
    Add {
        expiry: u32,
        trader: Address,
        tick_lower: i32,
        tick_upper: i32,
        liquidity: u128,
        balance: u128,
        sqrt_entry_px96: U256,
    },
    Remove {
        expiry: u32,
        trader: Address,
        tick_lower: i32,
        tick_upper: i32,
        fee: u128,
        pnl: I256,
        operator: Address,
    },
    Place {
        expiry: u32,
        trader: Address,
        tick: i32,
        nonce: u32,
        balance: u128,
        size: I256,
    },
    Cancel {
        expiry: u32,
        trader: Address,
        tick: i32,
        nonce: u32,
        fee: u128,
        pnl: I256,
    },
    Fill {
        expiry: u32,
        trader: Address,
        tick: i32,
        nonce: u32,
        fee: u128,
        pnl: I256,
        operator: Address,
    },
    Liquidate {
        expiry: u32,
        trader: Address,
        target: Address,
        amount: U256,
        mark: U256,
        size: I256,
    },
    Settle {
        expiry: u32,
        trader: Address,
        settlement: U256,
        balance: u128,
        operator: Address,
    },
    UpdateCondition {
        expiry: u32,
        condition: u8,
    },
    UpdateFundingIndex {
        expiry: u32,
        long_funding_index: I256,
        short_funding_index: I256,
    },
    UpdateSocialLoss {
        expiry: u32,
        long_social_loss_index: u128,
        short_social_loss_index: u128,
    },
    DeleteContext {
        expiry: u32,
    },
}

impl ParsedEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NewInstrument { .. } => "NewInstrument",
            Self::Deposit { .. } => "Deposit",
            Self::Withdraw { .. } => "Withdraw",
            Self::SetQuoteParam { .. } => "SetQuoteParam",
            Self::UpdatePair { .. } => "UpdatePair",
            Self::Trade { .. } => "Trade",
            Self::Adjust { .. } => "Adjust",
            Self::Add { .. } => "Add",
            Self::Remove { .. } => "Remove",
            Self::Place { .. } => "Place",
            Self::Cancel { .. } => "Cancel",
            Self::Fill { .. } => "Fill",
            Self::Liquidate { .. } => "Liquidate",
            Self::Settle { .. } => "Settle",
            Self::UpdateCondition { .. } => "UpdateCondition",
            Self::UpdateFundingIndex { .. } => "UpdateFundingIndex",
            Self::UpdateSocialLoss { .. } => "UpdateSocialLoss",
            Self::DeleteContext { .. } => "DeleteContext",
        }
    }
}

/// Topic lists used when registering fetcher/subscriber subscriptions.
pub fn gate_topics() -> Vec<B256> {
    vec![
        NewInstrument::SIGNATURE_HASH,
        Deposit::SIGNATURE_HASH,
        Withdraw::SIGNATURE_HASH,
    ]
}

pub fn config_topics() -> Vec<B256> {
    vec![SetQuoteParam::SIGNATURE_HASH]
}

pub fn instrument_topics() -> Vec<B256> {
    vec![
        UpdatePair::SIGNATURE_HASH,
        Trade::SIGNATURE_HASH,
        Adjust::SIGNATURE_HASH,
        Add::SIGNATURE_HASH,
        Remove::SIGNATURE_HASH,
        Place::SIGNATURE_HASH,
        Cancel::SIGNATURE_HASH,
        Fill::SIGNATURE_HASH,
        Liquidate::SIGNATURE_HASH,
        Settle::SIGNATURE_HASH,
        UpdateCondition::SIGNATURE_HASH,
        UpdateFundingIndex::SIGNATURE_HASH,
        UpdateSocialLoss::SIGNATURE_HASH,
        DeleteContext::SIGNATURE_HASH,
    ]
}

/// Cheap discovery probe: decodes the new instrument address if this is a
/// Gate `NewInstrument` log.
pub fn new_instrument_address(log: &Log) -> Option<Address> {
    if log.topic0() != Some(&NewInstrument::SIGNATURE_HASH) {
        return None;
    }
    NewInstrument::decode_log(&log.inner)
        .ok()
        .map(|ev| ev.data.instrument)
}

pub fn parse_log(kind: ContractKind, log: &Log) -> Result<ParsedEvent, ParseError> {
    let topic = *log.topic0().ok_or(ParseError::MissingTopic)?;
    match kind {
        ContractKind::Gate => parse_gate(topic, log),
        ContractKind::Config => parse_config(topic, log),
        ContractKind::Instrument => parse_instrument(topic, log),
    }
}

fn parse_gate(topic: B256, log: &Log) -> Result<ParsedEvent, ParseError> {
    match topic {
        t if t == NewInstrument::SIGNATURE_HASH => {
            let ev = NewInstrument::decode_log(&log.inner)?.data;
            Ok(ParsedEvent::NewInstrument {
                index: ev.index,
                instrument: ev.instrument,
                base: ev.base,
                quote: ev.quote,
                symbol: ev.symbol,
                total: ev.total,
            })
        }
        t if t == Deposit::SIGNATURE_HASH => {
            let ev = Deposit::decode_log(&log.inner)?.data;
            Ok(ParsedEvent::Deposit {
                token: ev.token,
                trader: ev.trader,
                quantity: ev.quantity,
            })
        }
        t if t == Withdraw::SIGNATURE_HASH => {
            let ev = Withdraw::decode_log(&log.inner)?.data;
            Ok(ParsedEvent::Withdraw {
                token: ev.token,
                trader: ev.trader,
                quantity: ev.quantity,
            })
        }
        topic => Err(ParseError::UnknownTopic {
            kind: ContractKind::Gate,
            topic,
        }),
    }
}

fn parse_config(topic: B256, log: &Log) -> Result<ParsedEvent, ParseError> {
    match topic {
        t if t == SetQuoteParam::SIGNATURE_HASH => {
            let ev = SetQuoteParam::decode_log(&log.inner)?.data;
            Ok(ParsedEvent::SetQuoteParam {
                quote: ev.quote,
                min_margin_amount: ev.minMarginAmount,
                trading_fee_ratio: ev.tradingFeeRatio,
                protocol_fee_ratio: ev.protocolFeeRatio,
                tip: ev.tip,
            })
        }
        topic => Err(ParseError::UnknownTopic {
            kind: ContractKind::Config,
            topic,
        }),
    }
}

fn parse_instrument(topic: B256, log: &Log) -> Result<ParsedEvent, ParseError> {
    match topic {
        t if t == UpdatePair::SIGNATURE_HASH => {
            let ev = UpdatePair::decode_log(&log.inner)?.data;
            Ok(ParsedEvent::UpdatePair {
                expiry: ev.expiry,
                timestamp: ev.timestamp,
                status: ev.status,
                tick: ev.tick,
                sqrt_px96: U256::from(ev.sqrtPX96),
                liquidity: ev.liquidity,
                total_liquidity: ev.totalLiquidity,
                involved_fund: ev.involvedFund,
                open_interests: ev.openInterests,
                fee_index: ev.feeIndex,
                protocol_fee: ev.protocolFee,
                total_long: ev.totalLong,
                total_short: ev.totalShort,
                insurance_fund: ev.insuranceFund,
                mark: ev.mark,
            })
        }
        t if t == Trade::SIGNATURE_HASH => {
            let ev = Trade::decode_log(&log.inner)?.data;
            Ok(ParsedEvent::Trade {
                expiry: ev.expiry,
                trader: ev.trader,
                size: ev.size,
                amount: ev.amount,
                taken_size: ev.takenSize,
                taken_value: ev.takenValue,
                entry_notional: ev.entryNotional,
                fee_ratio: ev.feeRatio,
                tick: ev.tick,
                mark: ev.mark,
            })
        }
        t if t == Adjust::SIGNATURE_HASH => {
            let ev = Adjust::decode_log(&log.inner)?.data;
            Ok(ParsedEvent::Adjust {
                expiry: ev.expiry,
                trader: ev.trader,
                net: ev.net,
            })
        }
        t if t == Add::SIGNATURE_HASH => {
            let ev = Add::decode_log(&log.inner)?.data;
            Ok(ParsedEvent::Add {
                expiry: ev.expiry,
                trader: ev.trader,
                tick_lower: ev.tickLower,
                tick_upper: ev.tickUpper,
                liquidity: ev.liquidity,
                balance: ev.balance,
                sqrt_entry_px96: U256::from(ev.sqrtEntryPX96),
            })
        }
        t if t == Remove::SIGNATURE_HASH => {
            let ev = Remove::decode_log(&log.inner)?.data;
            Ok(ParsedEvent::Remove {
                expiry: ev.expiry,
                trader: ev.trader,
                tick_lower: ev.tickLower,
                tick_upper: ev.tickUpper,
                fee: ev.fee,
                pnl: ev.pnl,
                operator: ev.operator,
            })
        }
        t if t == Place::SIGNATURE_HASH => {
            let ev = Place::decode_log(&log.inner)?.data;
            Ok(ParsedEvent::Place {
                expiry: ev.expiry,
                trader: ev.trader,
                tick: ev.tick,
                nonce: ev.nonce,
                balance: ev.balance,
                size: ev.size,
            })
        }
        t if t == Cancel::SIGNATURE_HASH => {
            let ev = Cancel::decode_log(&log.inner)?.data;
            Ok(ParsedEvent::Cancel {
                expiry: ev.expiry,
                trader: ev.trader,
                tick: ev.tick,
                nonce: ev.nonce,
                fee: ev.fee,
                pnl: ev.pnl,
            })
        }
        t if t == Fill::SIGNATURE_HASH => {
            let ev = Fill::decode_log(&log.inner)?.data;
            Ok(ParsedEvent::Fill {
                expiry: ev.expiry,
                trader: ev.trader,
                tick: ev.tick,
                nonce: ev.nonce,
                fee: ev.fee,
                pnl: ev.pnl,
                operator: ev.operator,
            })
        }
        t if t == Liquidate::SIGNATURE_HASH => {
            let ev = Liquidate::decode_log(&log.inner)?.data;
            Ok(ParsedEvent::Liquidate {
                expiry: ev.expiry,
                trader: ev.trader,
                target: ev.target,
                amount: ev.amount,
                mark: ev.mark,
                size: ev.size,
            })
        }
        t if t == Settle::SIGNATURE_HASH => {
            let ev = Settle::decode_log(&log.inner)?.data;
            Ok(ParsedEvent::Settle {
                expiry: ev.expiry,
                trader: ev.trader,
                settlement: ev.settlement,
                balance: ev.balance,
                operator: ev.operator,
            })
        }
        t if t == UpdateCondition::SIGNATURE_HASH => {
            let ev = UpdateCondition::decode_log(&log.inner)?.data;
            Ok(ParsedEvent::UpdateCondition {
                expiry: ev.expiry,
                condition: ev.condition,
            })
        }
        t if t == UpdateFundingIndex::SIGNATURE_HASH => {
            let ev = UpdateFundingIndex::decode_log(&log.inner)?.data;
            Ok(ParsedEvent::UpdateFundingIndex {
                expiry: ev.expiry,
                long_funding_index: ev.longFundingIndex,
                short_funding_index: ev.shortFundingIndex,
            })
        }
        t if t == UpdateSocialLoss::SIGNATURE_HASH => {
            let ev = UpdateSocialLoss::decode_log(&log.inner)?.data;
            Ok(ParsedEvent::UpdateSocialLoss {
                expiry: ev.expiry,
                long_social_loss_index: ev.longSocialLossIndex,
                short_social_loss_index: ev.shortSocialLossIndex,
            })
        }
        t if t == DeleteContext::SIGNATURE_HASH => {
            let ev = DeleteContext::decode_log(&log.inner)?.data;
            Ok(ParsedEvent::DeleteContext { expiry: ev.expiry })
        }
        topic => Err(ParseError::UnknownTopic {
            kind: ContractKind::Instrument,
            topic,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, LogData};
    use alloy::sol_types::SolEvent;

    fn wrap(address: Address, data: LogData) -> Log {
        let mut log = Log::default();
        log.inner = alloy::primitives::Log { address, data };
        log.block_number = Some(100);
        log.transaction_index = Some(0);
        log.log_index = Some(0);
        log
    }

    #[test]
    fn parse_round_trips_through_stored_json() {
        let instrument = Address::with_last_byte(7);
        let ev = NewInstrument {
            index: B256::with_last_byte(1),
            instrument,
            base: Address::with_last_byte(2),
            quote: Address::with_last_byte(3),
            symbol: "ETH-USDB-PERP".to_string(),
            total: U256::from(1u64),
        };
        let log = wrap(Address::with_last_byte(9), ev.encode_log_data());

        let parsed = parse_log(ContractKind::Gate, &log).expect("parse gate log");
        assert_eq!(parsed.name(), "NewInstrument");
        assert_eq!(new_instrument_address(&log), Some(instrument));

        let json = serde_json::to_string(&parsed).expect("serialize parsed");
        let back: ParsedEvent = serde_json::from_str(&json).expect("deserialize parsed");
        assert_eq!(back, parsed);
    }

    #[test]
    fn unknown_topic_is_a_soft_error() {
        let ev = Deposit {
            token: Address::with_last_byte(1),
            trader: Address::with_last_byte(2),
            quantity: U256::from(5u64),
        };
        let log = wrap(Address::with_last_byte(9), ev.encode_log_data());
        let err = parse_log(ContractKind::Config, &log).expect_err("deposit is not a config event");
        assert!(matches!(err, ParseError::UnknownTopic { .. }));
    }

    #[test]
    fn negative_sizes_survive_decode() {
        let ev = Trade {
            expiry: u32::MAX,
            trader: Address::with_last_byte(4),
            size: I256::unchecked_from(-1_000_000),
            amount: U256::from(77u64),
            takenSize: I256::ZERO,
            takenValue: U256::ZERO,
            entryNotional: U256::from(9u64),
            feeRatio: 30,
            tick: -887_272,
            mark: U256::from(123u64),
        };
        let log = wrap(Address::with_last_byte(9), ev.encode_log_data());
        let parsed = parse_log(ContractKind::Instrument, &log).expect("parse trade");
        match parsed {
            ParsedEvent::Trade { size, tick, .. } => {
                assert_eq!(size, I256::unchecked_from(-1_000_000));
                assert_eq!(tick, -887_272);
            }
            other => panic!("unexpected parse result: {other:?}"),
        }
    }
}
