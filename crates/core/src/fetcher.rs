use std::sync::Arc;

use alloy::primitives::{Address, B256};
use alloy_rpc_types_eth::{Filter, Log};
use futures_util::future::try_join_all;
use tokio::sync::{RwLock, Semaphore};

use crate::rpc::{ChainRpc, RpcError};

#[derive(Debug, Clone)]
pub struct LogSubscription {
    pub address: Address,
    pub topics: Vec<B256>,
}

/// Issues one `getLogs` per subscription over `[from, to]`, at most
/// `parallel` in flight. Results are concatenated in completion order; the
/// caller sorts by position.
pub struct LogFetcher {
    rpc: Arc<ChainRpc>,
    parallel: usize,
    subscriptions: RwLock<Vec<LogSubscription>>,
}

impl LogFetcher {
    pub fn new(rpc: Arc<ChainRpc>, parallel: usize) -> Self {
        Self {
            rpc,
            parallel: parallel.max(1),
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    /// Subscriptions are append-only for the life of the fetcher.
    pub async fn subscribe(&self, address: Address, topics: Vec<B256>) {
        let mut subs = self.subscriptions.write().await;
        if subs.iter().any(|sub| sub.address == address) {
            return;
        }
        subs.push(LogSubscription { address, topics });
    }

    pub async fn subscriptions(&self) -> Vec<LogSubscription> {
        self.subscriptions.read().await.clone()
    }

    pub async fn is_subscribed(&self, address: Address) -> bool {
        self.subscriptions
            .read()
            .await
            .iter()
            .any(|sub| sub.address == address)
    }

    pub async fn fetch(&self, from: u64, to: u64) -> Result<Vec<Log>, RpcError> {
        let subs = self.subscriptions().await;
        self.fetch_subscriptions(&subs, from, to).await
    }

    /// Range fetch restricted to a single address (instrument catch-up).
    pub async fn fetch_for(
        &self,
        address: Address,
        from: u64,
        to: u64,
    ) -> Result<Vec<Log>, RpcError> {
        let subs: Vec<LogSubscription> = self
            .subscriptions()
            .await
            .into_iter()
            .filter(|sub| sub.address == address)
            .collect();
        self.fetch_subscriptions(&subs, from, to).await
    }

    async fn fetch_subscriptions(
        &self,
        subs: &[LogSubscription],
        from: u64,
        to: u64,
    ) -> Result<Vec<Log>, RpcError> {
        let semaphore = Arc::new(Semaphore::new(self.parallel));
        let calls = subs.iter().map(|sub| {
            let semaphore = Arc::clone(&semaphore);
            let rpc = Arc::clone(&self.rpc);
            let filter = build_filter(sub, from, to);
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                rpc.get_logs(&filter).await
            }
        });
        let batches = try_join_all(calls).await?;
        Ok(batches.into_iter().flatten().collect())
    }
}

fn build_filter(sub: &LogSubscription, from: u64, to: u64) -> Filter {
    let mut filter = Filter::new().select(from..=to).address(sub.address);
    if !sub.topics.is_empty() {
        filter = filter.event_signature(sub.topics.clone());
    }
    filter
}
