mod driver;
mod reorg;
mod source;
mod storage;
mod types;

pub use driver::{DriverHandle, LiveState, SnapshotDriverConfig, get_snapshot, spawn_snapshot_driver};
pub use reorg::{ReorgDetectorConfig, spawn_reorg_detector};
pub use source::{SourceConfig, SourceHandle, spawn_source};
pub use storage::{BlockGuard, StorageConfig, StorageHandle, spawn_storage_processor};
pub use types::{ChainAddresses, ParsedLogEvent, contract_kind_for};
