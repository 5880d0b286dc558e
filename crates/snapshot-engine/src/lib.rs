mod pair;
mod portfolio;
mod state;
mod views;

pub use pair::{PairState, PairStatus};
pub use portfolio::{Order, Portfolio, Range, TradePosition, order_id, range_id};
pub use state::{InstrumentState, QuoteParam, SNAPSHOT_VERSION, Snapshot};
pub use views::{AccountView, AmmView};

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot encode error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("snapshot decode error: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("snapshot version unsupported: {version}")]
    UnsupportedVersion { version: u32 },
}
