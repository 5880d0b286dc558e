use std::collections::BTreeMap;

use alloy::primitives::{I256, U256};
use serde::Serialize;

use indexer_core::serde_helpers::{i256_decimal, u128_decimal, u256_decimal};

use crate::pair::PairState;
use crate::portfolio::{Order, Portfolio, Range, TradePosition};

/// Wire shape of `queryAMM`: the 18 AMM fields with big integers rendered
/// as decimal strings and `status` as an integer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AmmView {
    pub expiry: u32,
    pub timestamp: u32,
    pub status: u8,
    pub tick: i32,
    #[serde(with = "u256_decimal")]
    pub sqrt_px96: U256,
    #[serde(with = "u128_decimal")]
    pub liquidity: u128,
    #[serde(with = "u128_decimal")]
    pub total_liquidity: u128,
    #[serde(with = "u128_decimal")]
    pub involved_fund: u128,
    #[serde(with = "u128_decimal")]
    pub open_interests: u128,
    #[serde(with = "u128_decimal")]
    pub fee_index: u128,
    #[serde(with = "u128_decimal")]
    pub protocol_fee: u128,
    #[serde(with = "u128_decimal")]
    pub total_long: u128,
    #[serde(with = "u128_decimal")]
    pub total_short: u128,
    #[serde(with = "u128_decimal")]
    pub long_social_loss_index: u128,
    #[serde(with = "u128_decimal")]
    pub short_social_loss_index: u128,
    #[serde(with = "i256_decimal")]
    pub long_funding_index: I256,
    #[serde(with = "i256_decimal")]
    pub short_funding_index: I256,
    #[serde(with = "u128_decimal")]
    pub insurance_fund: u128,
}

impl From<&PairState> for AmmView {
    fn from(pair: &PairState) -> Self {
        Self {
            expiry: pair.expiry,
            timestamp: pair.timestamp,
            status: pair.status.as_u8(),
            tick: pair.tick,
            sqrt_px96: pair.sqrt_px96,
            liquidity: pair.liquidity,
            total_liquidity: pair.total_liquidity,
            involved_fund: pair.involved_fund,
            open_interests: pair.open_interests,
            fee_index: pair.fee_index,
            protocol_fee: pair.protocol_fee,
            total_long: pair.total_long,
            total_short: pair.total_short,
            long_social_loss_index: pair.long_social_loss_index,
            short_social_loss_index: pair.short_social_loss_index,
            long_funding_index: pair.long_funding_index,
            short_funding_index: pair.short_funding_index,
            insurance_fund: pair.insurance_fund,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionView {
    #[serde(with = "i256_decimal")]
    pub balance: I256,
    #[serde(with = "i256_decimal")]
    pub size: I256,
    #[serde(with = "u256_decimal")]
    pub entry_notional: U256,
    #[serde(with = "u128_decimal")]
    pub entry_social_loss_index: u128,
    #[serde(with = "i256_decimal")]
    pub entry_funding_index: I256,
}

impl From<&TradePosition> for PositionView {
    fn from(position: &TradePosition) -> Self {
        Self {
            balance: position.balance,
            size: position.size,
            entry_notional: position.entry_notional,
            entry_social_loss_index: position.entry_social_loss_index,
            entry_funding_index: position.entry_funding_index,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderView {
    #[serde(with = "u128_decimal")]
    pub balance: u128,
    #[serde(with = "i256_decimal")]
    pub size: I256,
    pub tick: i32,
    pub nonce: u32,
}

impl From<&Order> for OrderView {
    fn from(order: &Order) -> Self {
        Self {
            balance: order.balance,
            size: order.size,
            tick: order.tick,
            nonce: order.nonce,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeView {
    #[serde(with = "u128_decimal")]
    pub balance: u128,
    #[serde(with = "u128_decimal")]
    pub liquidity: u128,
    #[serde(with = "u256_decimal")]
    pub sqrt_entry_px96: U256,
    pub tick_lower: i32,
    pub tick_upper: i32,
}

impl From<&Range> for RangeView {
    fn from(range: &Range) -> Self {
        Self {
            balance: range.balance,
            liquidity: range.liquidity,
            sqrt_entry_px96: range.sqrt_entry_px96,
            tick_lower: range.tick_lower,
            tick_upper: range.tick_upper,
        }
    }
}

/// Wire shape of `queryAccount`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountView {
    pub onumber: u32,
    pub rnumber: u32,
    pub oids: Vec<u32>,
    pub rids: Vec<u32>,
    pub position: PositionView,
    pub orders: BTreeMap<u32, OrderView>,
    pub ranges: BTreeMap<u32, RangeView>,
}

impl From<&Portfolio> for AccountView {
    fn from(portfolio: &Portfolio) -> Self {
        Self {
            onumber: portfolio.onumber,
            rnumber: portfolio.rnumber,
            oids: portfolio.oids.clone(),
            rids: portfolio.rids.clone(),
            position: (&portfolio.position).into(),
            orders: portfolio
                .orders
                .iter()
                .map(|(oid, order)| (*oid, order.into()))
                .collect(),
            ranges: portfolio
                .ranges
                .iter()
                .map(|(rid, range)| (*rid, range.into()))
                .collect(),
        }
    }
}
