use std::time::Duration;

use alloy::eips::BlockNumberOrTag;
use alloy_provider::{DynProvider, Provider, ProviderBuilder};
use alloy_rpc_types_eth::{Filter, Log};
use alloy_transport::TransportError;
use tracing::warn;
use url::Url;

use crate::types::BlockHeader;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TRANSIENT_RETRIES: usize = 5;
const TRANSIENT_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("connect error: {0}")]
    Connect(#[source] TransportError),
    #[error("connect to {0} timed out")]
    ConnectTimeout(Url),
    #[error("rpc error: {0}")]
    Transport(#[from] TransportError),
    #[error("chain id mismatch: expected {expected}, node reports {actual}")]
    ChainIdMismatch { expected: u64, actual: u64 },
    #[error("block {0} not found")]
    BlockNotFound(u64),
}

fn is_rate_limit_text(text: &str) -> bool {
    text.contains("limit exceeded") || text.contains("too many requests")
}

impl RpcError {
    /// Node-side rate limiting, visible either as an error response body or
    /// as an HTTP 429.
    pub fn is_throttled(&self) -> bool {
        match self {
            Self::Transport(TransportError::ErrorResp(payload)) => {
                is_rate_limit_text(&payload.message)
            }
            Self::Transport(TransportError::Transport(kind)) => match kind.as_http_error() {
                Some(http) => http.status == 429 || is_rate_limit_text(&http.body),
                None => false,
            },
            _ => false,
        }
    }

    fn is_transient(&self) -> bool {
        if self.is_throttled() {
            return true;
        }
        matches!(self, Self::Transport(TransportError::Transport(_)))
    }
}

/// HTTP chain adapter shared by the fetcher, block cache and reorg detector.
/// Transient transport failures are retried here; callers see only the final
/// outcome.
#[derive(Debug, Clone)]
pub struct ChainRpc {
    provider: DynProvider,
    chain_id: u64,
}

impl ChainRpc {
    /// Connects over whatever scheme the builder understands (http(s),
    /// ws(s), ipc) and verifies the node actually serves `chain_id`.
    pub async fn connect(url: &Url, chain_id: u64) -> Result<Self, RpcError> {
        let connecting = ProviderBuilder::new().connect(url.as_str());
        let provider = tokio::time::timeout(CONNECT_TIMEOUT, connecting)
            .await
            .map_err(|_| RpcError::ConnectTimeout(url.clone()))?
            .map_err(RpcError::Connect)?
            .erased();

        let rpc = Self { provider, chain_id };
        let actual = rpc
            .retry("eth_chainId", || rpc.provider.get_chain_id())
            .await?;
        if actual != chain_id {
            return Err(RpcError::ChainIdMismatch {
                expected: chain_id,
                actual,
            });
        }
        Ok(rpc)
    }

    /// Wraps an existing provider without the chain-id handshake.
    pub fn from_provider(provider: DynProvider, chain_id: u64) -> Self {
        Self { provider, chain_id }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn provider(&self) -> &DynProvider {
        &self.provider
    }

    pub async fn block_number(&self) -> Result<u64, RpcError> {
        self.retry("eth_blockNumber", || self.provider.get_block_number())
            .await
    }

    pub async fn block_header(&self, number: u64) -> Result<BlockHeader, RpcError> {
        let block = self
            .retry("eth_getBlockByNumber", || {
                self.provider
                    .get_block_by_number(BlockNumberOrTag::Number(number))
            })
            .await?;
        let block = block.ok_or(RpcError::BlockNotFound(number))?;
        Ok(BlockHeader {
            number: block.header.number,
            hash: block.header.hash,
            parent_hash: block.header.parent_hash,
            timestamp: block.header.timestamp,
        })
    }

    pub async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, RpcError> {
        self.retry("eth_getLogs", || self.provider.get_logs(filter))
            .await
    }

    async fn retry<T, F, Fut>(&self, op: &str, call: F) -> Result<T, RpcError>
    where
        F: Fn() -> Fut,
        Fut: IntoFuture<Output = Result<T, TransportError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let err = RpcError::from(err);
                    attempt += 1;
                    if attempt > TRANSIENT_RETRIES || !err.is_transient() {
                        return Err(err);
                    }
                    warn!(?err, op, attempt, "transient rpc failure, retrying");
                    tokio::time::sleep(TRANSIENT_BACKOFF).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_text_matching() {
        assert!(is_rate_limit_text("daily limit exceeded for key"));
        assert!(is_rate_limit_text("too many requests"));
        assert!(!is_rate_limit_text("execution reverted"));
    }
}
