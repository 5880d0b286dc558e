use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::{Mutex, watch};
use tracing::debug;

use crate::rpc::{ChainRpc, RpcError};
use crate::types::BlockHeader;

const CACHE_CAPACITY: NonZeroUsize = match NonZeroUsize::new(100) {
    Some(n) => n,
    None => panic!("cache capacity must be non-zero"),
};

#[derive(Debug, Clone, thiserror::Error)]
#[error("block {number} fetch failed: {message}")]
pub struct BlockFetchError {
    pub number: u64,
    pub message: String,
}

type FetchOutcome = Option<Result<BlockHeader, BlockFetchError>>;

struct CacheInner {
    cache: LruCache<u64, BlockHeader>,
    // In-flight fetches live outside the LRU, so eviction can never drop a
    // key somebody is waiting on.
    pending: HashMap<u64, watch::Receiver<FetchOutcome>>,
}

/// Bounded LRU of block headers with per-key single-flight fetch: the first
/// caller for a number performs the RPC, later callers wait on its outcome.
pub struct BlockCache {
    rpc: Arc<ChainRpc>,
    inner: Mutex<CacheInner>,
}

impl BlockCache {
    pub fn new(rpc: Arc<ChainRpc>) -> Self {
        Self {
            rpc,
            inner: Mutex::new(CacheInner {
                cache: LruCache::new(CACHE_CAPACITY),
                pending: HashMap::new(),
            }),
        }
    }

    pub async fn get_block(&self, number: u64) -> Result<BlockHeader, BlockFetchError> {
        let tx = {
            let mut inner = self.inner.lock().await;
            if let Some(header) = inner.cache.get(&number) {
                return Ok(header.clone());
            }
            if let Some(rx) = inner.pending.get(&number) {
                let mut rx = rx.clone();
                drop(inner);
                return wait_for_outcome(&mut rx, number).await;
            }
            let (tx, rx) = watch::channel(None);
            inner.pending.insert(number, rx);
            tx
        };

        let outcome = self
            .rpc
            .block_header(number)
            .await
            .map_err(|err| fetch_error(number, &err));

        let mut inner = self.inner.lock().await;
        inner.pending.remove(&number);
        if let Ok(header) = &outcome {
            inner.cache.put(number, header.clone());
        }
        drop(inner);

        if tx.send(Some(outcome.clone())).is_err() {
            debug!(number, "no waiters for fetched block");
        }
        outcome
    }
}

async fn wait_for_outcome(
    rx: &mut watch::Receiver<FetchOutcome>,
    number: u64,
) -> Result<BlockHeader, BlockFetchError> {
    loop {
        if let Some(outcome) = rx.borrow().clone() {
            return outcome;
        }
        if rx.changed().await.is_err() {
            return Err(BlockFetchError {
                number,
                message: "fetch abandoned".to_string(),
            });
        }
    }
}

fn fetch_error(number: u64, err: &RpcError) -> BlockFetchError {
    BlockFetchError {
        number,
        message: err.to_string(),
    }
}
