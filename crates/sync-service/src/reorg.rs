use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::B256;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use event_db::{DbError, DbStore, EventStore};
use indexer_core::abi::parse_log;
use indexer_core::block_cache::BlockCache;
use indexer_core::fetcher::LogFetcher;
use indexer_core::rpc::RpcError;
use indexer_core::types::{Position, StoredEvent, log_id};

use crate::source::sort_logs;
use crate::storage::StorageHandle;
use crate::driver::DriverHandle;
use crate::types::{ChainAddresses, contract_kind_for};

const SAVE_RETRIES: usize = 3;
const SAVE_RETRY_GAP: Duration = Duration::from_millis(333);
const SCAN_LIMIT: usize = 1000;

#[derive(Debug, Clone)]
pub struct ReorgDetectorConfig {
    pub chain_id: u64,
    pub addresses: ChainAddresses,
    /// Width of the re-checked window.
    pub span: u64,
    /// Blocks behind the stored tip where the window ends.
    pub delay: u64,
    /// Minimum stored-block advance between reconciliations.
    pub interval: u64,
}

#[derive(Debug, thiserror::Error)]
enum ReconcileError {
    #[error("db error: {0}")]
    Db(#[from] DbError),
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
    #[error("block fetch error: {0}")]
    Block(#[from] indexer_core::block_cache::BlockFetchError),
}

/// Periodically re-fetches a sliding window of recent blocks and reconciles
/// it against stored events. Events that appeared upstream are back-written;
/// events that disappeared are never deleted, only logged. A divergence
/// triggers the coordinated block -> snapshot reorg -> storage reorg
/// sequence.
pub fn spawn_reorg_detector(
    cfg: ReorgDetectorConfig,
    db: Arc<DbStore>,
    events: Arc<EventStore>,
    fetcher: Arc<LogFetcher>,
    blocks: Arc<BlockCache>,
    storage: StorageHandle,
    driver: DriverHandle,
    reorged_tx: broadcast::Sender<u64>,
    mut synced_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
) {
    let chain_id = cfg.chain_id;
    let mut worker = DetectorWorker {
        cfg,
        db,
        events,
        fetcher,
        blocks,
        storage,
        driver,
        reorged_tx,
        last_checked: 0,
    };
    tokio::spawn(
        async move {
            // Reconciliation only makes sense over a complete store.
            while !*synced_rx.borrow() {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = synced_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
            info!("reorg detector armed");

            let mut stored_rx = worker.storage.stored_block_rx.clone();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = stored_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let stored_block = *stored_rx.borrow_and_update();
                        worker.maybe_reconcile(stored_block, &cancel).await;
                    }
                }
            }
            debug!("reorg detector stopped");
        }
        .instrument(info_span!("reorg_detector", chain_id)),
    );
}

struct DetectorWorker {
    cfg: ReorgDetectorConfig,
    db: Arc<DbStore>,
    events: Arc<EventStore>,
    fetcher: Arc<LogFetcher>,
    blocks: Arc<BlockCache>,
    storage: StorageHandle,
    driver: DriverHandle,
    reorged_tx: broadcast::Sender<u64>,
    last_checked: u64,
}

impl DetectorWorker {
    async fn maybe_reconcile(&mut self, stored_block: u64, cancel: &CancellationToken) {
        let latest_stored = match self.events.latest_stored_block() {
            Ok(Some(block)) => block,
            Ok(None) => return,
            Err(err) => {
                warn!(?err, "latest stored block lookup failed");
                return;
            }
        };
        let to = stored_block
            .saturating_sub(self.cfg.delay)
            .min(latest_stored.saturating_sub(1));
        let from = to.saturating_sub(self.cfg.span);
        if to == 0 || self.last_checked.saturating_add(self.cfg.interval) > from {
            return;
        }

        match self.reconcile(from, to, cancel).await {
            Ok(()) => {
                self.last_checked = from;
            }
            Err(err) => warn!(?err, from, to, "reconciliation pass failed"),
        }
    }

    async fn reconcile(
        &mut self,
        from: u64,
        to: u64,
        cancel: &CancellationToken,
    ) -> Result<(), ReconcileError> {
        debug!(from, to, "reconciling window");

        // Stored view of the window, keyed by log identity.
        let mut known: HashMap<B256, Position> = HashMap::new();
        let mut scan = self.events.find_all_ordered(
            Position::block_end(from.saturating_sub(1)),
            Position::block_end(to),
            None,
            SCAN_LIMIT,
        );
        loop {
            let batch = scan.next_batch()?;
            if batch.is_empty() {
                break;
            }
            for stored in batch {
                known.insert(stored.id, stored.position);
            }
        }

        let mut fetched = self.fetcher.fetch(from, to).await?;
        sort_logs(&mut fetched);

        let mut need_save: Vec<StoredEvent> = Vec::new();
        let mut reorged_block: Option<u64> = None;
        for log in &fetched {
            let Some(position) = Position::of_log(log) else {
                continue;
            };
            let id = log_id(self.cfg.chain_id, log);
            if known.remove(&id).is_some() {
                continue;
            }

            let kind = contract_kind_for(&self.cfg.addresses, log.address());
            let parsed = match parse_log(kind, log) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(?err, %position, "unparseable reconciled log skipped");
                    continue;
                }
            };
            let header = self.blocks.get_block(position.block_number).await?;

            need_save.push(StoredEvent {
                id,
                chain_id: self.cfg.chain_id,
                address: log.address(),
                position,
                block_hash: log.block_hash.unwrap_or_default(),
                tx_hash: log.transaction_hash.unwrap_or_default(),
                topics: log.topics().to_vec(),
                data: log.data().data.clone(),
                name: parsed.name().to_string(),
                args: serde_json::to_string(&parsed).map_err(DbError::from)?,
                timestamp: Some(header.timestamp),
                status: 0,
            });
            reorged_block = Some(match reorged_block {
                Some(block) => block.min(position.block_number),
                None => position.block_number,
            });
        }

        // Events missing upstream are never deleted, only reported.
        for (id, position) in &known {
            warn!(%id, %position, "stored event missing upstream, retained");
        }

        if !need_save.is_empty() {
            self.commit_with_retry(&need_save).await?;
            info!(count = need_save.len(), "reorged events back-written");
        }

        if let Some(reorg_block) = reorged_block {
            warn!(reorg_block, "reorg detected, coordinating rewind");
            // Request-handler generations past this block abort promptly.
            if self.reorged_tx.send(reorg_block).is_err() {
                debug!("no reorg notification listeners");
            }
            let guard = self.storage.block().await;
            if guard.is_none() {
                warn!("storage processor unavailable for blocking");
                return Ok(());
            }
            if !self.driver.reorg(reorg_block).await {
                warn!("snapshot driver reorg failed");
            }
            if cancel.is_cancelled() {
                return Ok(());
            }
            // Enqueue the reprocessing while still holding the guard, so it
            // runs ahead of any batches waiting behind the release.
            let pending = self.storage.begin_reorg(reorg_block).await;
            drop(guard);
            match pending {
                Some(ack) => {
                    if ack.await.is_err() {
                        warn!("storage reprocessing failed");
                    }
                }
                None => warn!("storage processor unavailable for reorg"),
            }
        }
        Ok(())
    }

    async fn commit_with_retry(&self, need_save: &[StoredEvent]) -> Result<(), ReconcileError> {
        let mut last_err: Option<DbError> = None;
        for attempt in 1..=SAVE_RETRIES {
            let result = self.db.begin_write().and_then(|txn| {
                for event in need_save {
                    self.events.create(event, &txn)?;
                }
                txn.commit()?;
                Ok(())
            });
            match result {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(?err, attempt, "reorged event commit failed");
                    if let Err(err) = self.events.reload() {
                        warn!(?err, "event index reload failed");
                    }
                    last_err = Some(err);
                    tokio::time::sleep(SAVE_RETRY_GAP).await;
                }
            }
        }
        match last_err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}
