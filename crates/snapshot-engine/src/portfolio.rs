use std::collections::BTreeMap;

use alloy::primitives::{I256, U256};
use serde::{Deserialize, Serialize};

/// Stable order id: `(tick << 8) | nonce`, with the tick reinterpreted as
/// unsigned bits so negative ticks pack deterministically.
pub fn order_id(tick: i32, nonce: u32) -> u32 {
    ((tick as u32) << 8) | (nonce & 0xff)
}

/// Stable range id: `(tick_lower << 16) | tick_upper` over the low 16 bits
/// of each tick.
pub fn range_id(tick_lower: i32, tick_upper: i32) -> u32 {
    (((tick_lower as u32) & 0xffff) << 16) | ((tick_upper as u32) & 0xffff)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub balance: u128,
    pub size: I256,
    pub tick: i32,
    pub nonce: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub balance: u128,
    pub liquidity: u128,
    pub sqrt_entry_px96: U256,
    pub tick_lower: i32,
    pub tick_upper: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradePosition {
    pub balance: I256,
    pub size: I256,
    pub entry_notional: U256,
    pub entry_social_loss_index: u128,
    pub entry_funding_index: I256,
}

/// Per-(trader, expiry) account inside one instrument.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    pub onumber: u32,
    pub rnumber: u32,
    pub oids: Vec<u32>,
    pub rids: Vec<u32>,
    pub position: TradePosition,
    pub orders: BTreeMap<u32, Order>,
    pub ranges: BTreeMap<u32, Range>,
}

impl Portfolio {
    pub fn add_order(&mut self, oid: u32, order: Order) {
        if self.orders.insert(oid, order).is_none() {
            self.oids.push(oid);
            self.onumber = self.oids.len() as u32;
        }
    }

    pub fn take_order(&mut self, oid: u32) -> Option<Order> {
        let order = self.orders.remove(&oid)?;
        self.oids.retain(|known| *known != oid);
        self.onumber = self.oids.len() as u32;
        Some(order)
    }

    pub fn add_range(&mut self, rid: u32, range: Range) {
        if self.ranges.insert(rid, range).is_none() {
            self.rids.push(rid);
            self.rnumber = self.rids.len() as u32;
        }
    }

    pub fn take_range(&mut self, rid: u32) -> Option<Range> {
        let range = self.ranges.remove(&rid)?;
        self.rids.retain(|known| *known != rid);
        self.rnumber = self.rids.len() as u32;
        Some(range)
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty() && self.ranges.is_empty() && self.position == TradePosition::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_ids_pack_tick_and_nonce() {
        assert_eq!(order_id(1, 2), (1 << 8) | 2);
        assert_ne!(order_id(-5, 2), order_id(5, 2));
        // nonce wraps into its byte
        assert_eq!(order_id(3, 0x1_02), order_id(3, 0x02));
    }

    #[test]
    fn counters_track_collections() {
        let mut portfolio = Portfolio::default();
        let oid = order_id(10, 1);
        portfolio.add_order(
            oid,
            Order {
                balance: 100,
                size: I256::unchecked_from(5),
                tick: 10,
                nonce: 1,
            },
        );
        assert_eq!(portfolio.onumber, 1);
        assert_eq!(portfolio.oids, vec![oid]);
        assert!(portfolio.take_order(oid).is_some());
        assert_eq!(portfolio.onumber, 0);
        assert!(portfolio.take_order(oid).is_none());
    }
}
