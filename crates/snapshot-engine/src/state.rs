use std::collections::BTreeMap;

use alloy::primitives::{Address, I256, U256};
use serde::{Deserialize, Serialize};

use indexer_core::abi::ParsedEvent;

use crate::pair::{PairState, PairStatus};
use crate::portfolio::{Order, Portfolio, Range, order_id, range_id};
use crate::SnapshotError;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuoteParam {
    pub min_margin_amount: u128,
    pub trading_fee_ratio: u16,
    pub protocol_fee_ratio: u16,
    pub tip: u128,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstrumentState {
    pub base: Address,
    pub quote: Address,
    pub symbol: String,
    pub pairs: BTreeMap<u32, PairState>,
    /// expiry -> trader -> portfolio
    pub portfolios: BTreeMap<u32, BTreeMap<Address, Portfolio>>,
}

impl InstrumentState {
    pub fn pair(&self, expiry: u32) -> Option<&PairState> {
        self.pairs.get(&expiry)
    }

    pub fn portfolio(&self, trader: Address, expiry: u32) -> Option<&Portfolio> {
        self.portfolios.get(&expiry)?.get(&trader)
    }

    fn pair_mut(&mut self, expiry: u32) -> &mut PairState {
        self.pairs
            .entry(expiry)
            .or_insert_with(|| PairState::dormant(expiry))
    }

    fn portfolio_mut(&mut self, trader: Address, expiry: u32) -> &mut Portfolio {
        self.portfolios
            .entry(expiry)
            .or_default()
            .entry(trader)
            .or_default()
    }
}

/// Deterministic application state: the fold of every parsed protocol event
/// in Position order. Maps are BTree-backed so the JSON serialization is
/// byte-stable, which is what makes replay-base independence testable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub instruments: BTreeMap<Address, InstrumentState>,
    /// token -> trader -> gate balance
    pub balances: BTreeMap<Address, BTreeMap<Address, U256>>,
    pub quote_params: BTreeMap<Address, QuoteParam>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instrument(&self, address: Address) -> Option<&InstrumentState> {
        self.instruments.get(&address)
    }

    /// Applies one parsed event emitted by `source`. Must be fed in Position
    /// order for a canonical state; the mutation itself does not inspect
    /// positions.
    pub fn apply(&mut self, source: Address, event: &ParsedEvent) {
        match event {
            ParsedEvent::NewInstrument {
                instrument,
                base,
                quote,
                symbol,
                ..
            } => {
                let entry = self.instruments.entry(*instrument).or_default();
                entry.base = *base;
                entry.quote = *quote;
                entry.symbol = symbol.clone();
            }
            ParsedEvent::Deposit {
                token,
                trader,
                quantity,
            } => {
                let balance = self
                    .balances
                    .entry(*token)
                    .or_default()
                    .entry(*trader)
                    .or_default();
                *balance = balance.saturating_add(*quantity);
            }
            ParsedEvent::Withdraw {
                token,
                trader,
                quantity,
            } => {
                if let Some(balances) = self.balances.get_mut(token)
                    && let Some(balance) = balances.get_mut(trader)
                {
                    *balance = balance.saturating_sub(*quantity);
                }
            }
            ParsedEvent::SetQuoteParam {
                quote,
                min_margin_amount,
                trading_fee_ratio,
                protocol_fee_ratio,
                tip,
            } => {
                self.quote_params.insert(
                    *quote,
                    QuoteParam {
                        min_margin_amount: *min_margin_amount,
                        trading_fee_ratio: *trading_fee_ratio,
                        protocol_fee_ratio: *protocol_fee_ratio,
                        tip: *tip,
                    },
                );
            }
            other => self.apply_instrument(source, other),
        }
    }

    fn apply_instrument(&mut self, source: Address, event: &ParsedEvent) {
        // Instrument logs can only precede their NewInstrument during a
        // partial replay; materialize a placeholder rather than dropping
        // state on the floor.
        let instrument = self.instruments.entry(source).or_default();
        match event {
            ParsedEvent::UpdatePair {
                expiry,
                timestamp,
                status,
                tick,
                sqrt_px96,
                liquidity,
                total_liquidity,
                involved_fund,
                open_interests,
                fee_index,
                protocol_fee,
                total_long,
                total_short,
                insurance_fund,
                ..
            } => {
                let pair = instrument.pair_mut(*expiry);
                pair.timestamp = *timestamp;
                pair.status = PairStatus::from_u8(*status);
                pair.tick = *tick;
                pair.sqrt_px96 = *sqrt_px96;
                pair.liquidity = *liquidity;
                pair.total_liquidity = *total_liquidity;
                pair.involved_fund = *involved_fund;
                pair.open_interests = *open_interests;
                pair.fee_index = *fee_index;
                pair.protocol_fee = *protocol_fee;
                pair.total_long = *total_long;
                pair.total_short = *total_short;
                pair.insurance_fund = *insurance_fund;
            }
            ParsedEvent::Trade {
                expiry,
                trader,
                size,
                entry_notional,
                ..
            } => {
                let (long_social, long_funding) = {
                    let pair = instrument.pair_mut(*expiry);
                    (pair.long_social_loss_index, pair.long_funding_index)
                };
                let portfolio = instrument.portfolio_mut(*trader, *expiry);
                portfolio.position.size += *size;
                portfolio.position.entry_notional = *entry_notional;
                portfolio.position.entry_social_loss_index = long_social;
                portfolio.position.entry_funding_index = long_funding;
            }
            ParsedEvent::Adjust { expiry, trader, net } => {
                let portfolio = instrument.portfolio_mut(*trader, *expiry);
                portfolio.position.balance += *net;
            }
            ParsedEvent::Add {
                expiry,
                trader,
                tick_lower,
                tick_upper,
                liquidity,
                balance,
                sqrt_entry_px96,
            } => {
                let portfolio = instrument.portfolio_mut(*trader, *expiry);
                portfolio.add_range(
                    range_id(*tick_lower, *tick_upper),
                    Range {
                        balance: *balance,
                        liquidity: *liquidity,
                        sqrt_entry_px96: *sqrt_entry_px96,
                        tick_lower: *tick_lower,
                        tick_upper: *tick_upper,
                    },
                );
            }
            ParsedEvent::Remove {
                expiry,
                trader,
                tick_lower,
                tick_upper,
                pnl,
                ..
            } => {
                let portfolio = instrument.portfolio_mut(*trader, *expiry);
                if portfolio
                    .take_range(range_id(*tick_lower, *tick_upper))
                    .is_some()
                {
                    portfolio.position.balance += *pnl;
                }
            }
            ParsedEvent::Place {
                expiry,
                trader,
                tick,
                nonce,
                balance,
                size,
            } => {
                let portfolio = instrument.portfolio_mut(*trader, *expiry);
                portfolio.add_order(
                    order_id(*tick, *nonce),
                    Order {
                        balance: *balance,
                        size: *size,
                        tick: *tick,
                        nonce: *nonce,
                    },
                );
            }
            ParsedEvent::Cancel {
                expiry,
                trader,
                tick,
                nonce,
                pnl,
                ..
            } => {
                let portfolio = instrument.portfolio_mut(*trader, *expiry);
                if portfolio.take_order(order_id(*tick, *nonce)).is_some() {
                    portfolio.position.balance += *pnl;
                }
            }
            ParsedEvent::Fill {
                expiry,
                trader,
                tick,
                nonce,
                pnl,
                ..
            } => {
                let portfolio = instrument.portfolio_mut(*trader, *expiry);
                if let Some(order) = portfolio.take_order(order_id(*tick, *nonce)) {
                    portfolio.position.size += order.size;
                    portfolio.position.balance += *pnl;
                }
            }
            ParsedEvent::Liquidate { expiry, target, .. } => {
                let portfolio = instrument.portfolio_mut(*target, *expiry);
                portfolio.position = Default::default();
            }
            ParsedEvent::Settle { expiry, trader, .. } => {
                if let Some(traders) = instrument.portfolios.get_mut(expiry) {
                    traders.remove(trader);
                    if traders.is_empty() {
                        instrument.portfolios.remove(expiry);
                    }
                }
            }
            ParsedEvent::UpdateCondition { expiry, condition } => {
                instrument.pair_mut(*expiry).status = PairStatus::from_u8(*condition);
            }
            ParsedEvent::UpdateFundingIndex {
                expiry,
                long_funding_index,
                short_funding_index,
            } => {
                let pair = instrument.pair_mut(*expiry);
                pair.long_funding_index = *long_funding_index;
                pair.short_funding_index = *short_funding_index;
            }
            ParsedEvent::UpdateSocialLoss {
                expiry,
                long_social_loss_index,
                short_social_loss_index,
            } => {
                let pair = instrument.pair_mut(*expiry);
                pair.long_social_loss_index = *long_social_loss_index;
                pair.short_social_loss_index = *short_social_loss_index;
            }
            ParsedEvent::DeleteContext { expiry } => {
                instrument.pairs.remove(expiry);
                instrument.portfolios.remove(expiry);
            }
            // Gate/Config events are handled in `apply`.
            _ => {}
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, SnapshotError> {
        #[derive(Serialize)]
        struct EnvelopeRef<'a> {
            version: u32,
            state: &'a Snapshot,
        }
        serde_json::to_vec(&EnvelopeRef {
            version: SNAPSHOT_VERSION,
            state: self,
        })
        .map_err(SnapshotError::Encode)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, SnapshotError> {
        #[derive(Deserialize)]
        struct Envelope {
            version: u32,
            state: Snapshot,
        }
        let envelope: Envelope = serde_json::from_slice(data).map_err(SnapshotError::Decode)?;
        if envelope.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion {
                version: envelope.version,
            });
        }
        Ok(envelope.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instrument_addr() -> Address {
        "0x145dd1d046ae0ba1b9e4bd72974452ac12d66644"
            .parse()
            .expect("static address")
    }

    fn sample_stream() -> Vec<(Address, ParsedEvent)> {
        let gate = Address::with_last_byte(1);
        let instrument = instrument_addr();
        let trader = Address::with_last_byte(3);
        vec![
            (
                gate,
                ParsedEvent::NewInstrument {
                    index: Default::default(),
                    instrument,
                    base: Address::with_last_byte(4),
                    quote: Address::with_last_byte(5),
                    symbol: "ETH-USDB-PERP".to_string(),
                    total: U256::from(1u64),
                },
            ),
            (
                instrument,
                ParsedEvent::UpdatePair {
                    expiry: u32::MAX,
                    timestamp: 1_700_000_000,
                    status: 1,
                    tick: 15_777,
                    sqrt_px96: U256::from(123_456_789u64),
                    liquidity: 1_000_000,
                    total_liquidity: 2_000_000,
                    involved_fund: 300,
                    open_interests: 400,
                    fee_index: 5,
                    protocol_fee: 6,
                    total_long: 700,
                    total_short: 800,
                    insurance_fund: 90,
                    mark: U256::from(1_800u64),
                },
            ),
            (
                instrument,
                ParsedEvent::Place {
                    expiry: u32::MAX,
                    trader,
                    tick: 15_000,
                    nonce: 1,
                    balance: 50,
                    size: I256::unchecked_from(10),
                },
            ),
            (
                instrument,
                ParsedEvent::Fill {
                    expiry: u32::MAX,
                    trader,
                    tick: 15_000,
                    nonce: 1,
                    fee: 1,
                    pnl: I256::unchecked_from(2),
                    operator: Address::ZERO,
                },
            ),
        ]
    }

    #[test]
    fn apply_is_deterministic() {
        let mut a = Snapshot::new();
        let mut b = Snapshot::new();
        for (source, event) in sample_stream() {
            a.apply(source, &event);
        }
        for (source, event) in sample_stream() {
            b.apply(source, &event);
        }
        assert_eq!(
            a.serialize().expect("serialize a"),
            b.serialize().expect("serialize b")
        );
    }

    #[test]
    fn serialization_round_trips() {
        let mut snapshot = Snapshot::new();
        for (source, event) in sample_stream() {
            snapshot.apply(source, &event);
        }
        let bytes = snapshot.serialize().expect("serialize");
        let back = Snapshot::deserialize(&bytes).expect("deserialize");
        assert_eq!(back, snapshot);
    }

    #[test]
    fn fill_consumes_order_into_position() {
        let mut snapshot = Snapshot::new();
        for (source, event) in sample_stream() {
            snapshot.apply(source, &event);
        }
        let trader = Address::with_last_byte(3);
        let portfolio = snapshot
            .instrument(instrument_addr())
            .expect("instrument")
            .portfolio(trader, u32::MAX)
            .expect("portfolio");
        assert_eq!(portfolio.onumber, 0);
        assert!(portfolio.orders.is_empty());
        assert_eq!(portfolio.position.size, I256::unchecked_from(10));
        assert_eq!(portfolio.position.balance, I256::unchecked_from(2));
    }

    #[test]
    fn pair_reflects_update_pair() {
        let mut snapshot = Snapshot::new();
        for (source, event) in sample_stream() {
            snapshot.apply(source, &event);
        }
        let pair = snapshot
            .instrument(instrument_addr())
            .expect("instrument")
            .pair(u32::MAX)
            .expect("pair");
        assert_eq!(pair.status, PairStatus::Trading);
        assert_eq!(pair.tick, 15_777);
        assert_eq!(pair.total_liquidity, 2_000_000);
    }
}
