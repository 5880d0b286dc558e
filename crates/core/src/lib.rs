pub mod abi;
pub mod block_cache;
pub mod fetcher;
pub mod rpc;
pub mod serde_helpers;
pub mod subscriber;
pub mod types;
