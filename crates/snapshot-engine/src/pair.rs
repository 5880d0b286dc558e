use alloy::primitives::{I256, U256};
use serde::{Deserialize, Serialize};

/// AMM lifecycle condition, exposed over the API as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PairStatus {
    Dormant = 0,
    Trading = 1,
    Settling = 2,
    Settled = 3,
}

impl PairStatus {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Trading,
            2 => Self::Settling,
            3 => Self::Settled,
            _ => Self::Dormant,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Per-expiry AMM state of an instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairState {
    pub expiry: u32,
    pub timestamp: u32,
    pub status: PairStatus,
    pub tick: i32,
    pub sqrt_px96: U256,
    pub liquidity: u128,
    pub total_liquidity: u128,
    pub involved_fund: u128,
    pub open_interests: u128,
    pub fee_index: u128,
    pub protocol_fee: u128,
    pub total_long: u128,
    pub total_short: u128,
    pub long_social_loss_index: u128,
    pub short_social_loss_index: u128,
    pub long_funding_index: I256,
    pub short_funding_index: I256,
    pub insurance_fund: u128,
}

impl PairState {
    pub fn dormant(expiry: u32) -> Self {
        Self {
            expiry,
            timestamp: 0,
            status: PairStatus::Dormant,
            tick: 0,
            sqrt_px96: U256::ZERO,
            liquidity: 0,
            total_liquidity: 0,
            involved_fund: 0,
            open_interests: 0,
            fee_index: 0,
            protocol_fee: 0,
            total_long: 0,
            total_short: 0,
            long_social_loss_index: 0,
            short_social_loss_index: 0,
            long_funding_index: I256::ZERO,
            short_funding_index: I256::ZERO,
            insurance_fund: 0,
        }
    }
}
