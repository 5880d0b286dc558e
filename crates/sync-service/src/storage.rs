use std::sync::Arc;
use std::time::Duration;

use alloy_rpc_types_eth::Log;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use event_db::{DbError, DbStore, EventStore, InstrumentRow, InstrumentStore, WriteTransaction};
use indexer_core::abi::{ParsedEvent, parse_log};
use indexer_core::types::{Position, STATUS_PROCESSED, StoredEvent, log_id};

use crate::types::{ChainAddresses, ParsedLogEvent, contract_kind_for};

const BATCH_LIMIT: usize = 1000;
const BATCH_RETRY_BACKOFF: Duration = Duration::from_secs(1);
const REORG_SCAN_LIMIT: usize = 1000;

/// Cache row updated after every committed batch.
pub const STORAGE_CACHE: &str = "storage";

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub chain_id: u64,
    pub addresses: ChainAddresses,
}

enum CtrlMsg {
    Block {
        reply: oneshot::Sender<BlockGuard>,
    },
    Reorg {
        from_block: u64,
        ack: oneshot::Sender<()>,
    },
}

/// Held by the reorg detector while storage must stay quiet. Dropping the
/// guard releases the processor.
#[derive(Debug)]
pub struct BlockGuard {
    _release: oneshot::Sender<()>,
}

impl BlockGuard {
    pub fn release(self) {}
}

#[derive(Clone)]
pub struct StorageHandle {
    ctrl_tx: mpsc::Sender<CtrlMsg>,
    pub stored_block_rx: watch::Receiver<u64>,
    parsed_broadcast: broadcast::Sender<ParsedLogEvent>,
}

impl StorageHandle {
    /// Pauses the processor. Resolves only after any in-flight batch has
    /// committed; no new batch starts until the guard is dropped.
    pub async fn block(&self) -> Option<BlockGuard> {
        let (reply, rx) = oneshot::channel();
        self.ctrl_tx.send(CtrlMsg::Block { reply }).await.ok()?;
        rx.await.ok()
    }

    /// Re-emits every stored event with `Position > (from_block-1, max)`
    /// through the parsed-event fan-out, bypassing re-parse.
    pub async fn reorg(&self, from_block: u64) -> bool {
        match self.begin_reorg(from_block).await {
            Some(ack) => ack.await.is_ok(),
            None => false,
        }
    }

    /// Enqueues the reorg without waiting for it. Lets a caller holding a
    /// [`BlockGuard`] order the reprocessing ahead of any queued batches
    /// before releasing.
    pub async fn begin_reorg(&self, from_block: u64) -> Option<oneshot::Receiver<()>> {
        let (ack, rx) = oneshot::channel();
        self.ctrl_tx
            .send(CtrlMsg::Reorg { from_block, ack })
            .await
            .ok()?;
        Some(rx)
    }

    pub fn subscribe_parsed(&self) -> broadcast::Receiver<ParsedLogEvent> {
        self.parsed_broadcast.subscribe()
    }
}

/// Spawns the serial batch consumer. `parsed_tx` is the ordered fan-out to
/// the snapshot driver; the broadcast side feeds notification hooks.
pub fn spawn_storage_processor(
    cfg: StorageConfig,
    db: Arc<DbStore>,
    events: Arc<EventStore>,
    mut log_rx: mpsc::Receiver<Log>,
    parsed_tx: mpsc::Sender<ParsedLogEvent>,
    cancel: CancellationToken,
) -> StorageHandle {
    let (ctrl_tx, mut ctrl_rx) = mpsc::channel(16);
    let (stored_block_tx, stored_block_rx) = watch::channel(0u64);
    let (parsed_broadcast, _) = broadcast::channel(1024);

    let chain_id = cfg.chain_id;
    let instruments = db.instruments(cfg.chain_id);
    let worker = ProcessorWorker {
        cfg,
        db,
        events,
        instruments,
        parsed_tx,
        parsed_broadcast: parsed_broadcast.clone(),
        stored_block_tx,
    };

    tokio::spawn(
        async move {
            if let Some(latest) = worker.persisted_block() {
                worker.stored_block_tx.send_replace(latest);
            }
            let mut batch: Vec<Log> = Vec::with_capacity(BATCH_LIMIT);
            loop {
                // Control messages outrank new batches so a queued reorg
                // runs before post-release log traffic.
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    ctrl = ctrl_rx.recv() => match ctrl {
                        Some(CtrlMsg::Block { reply }) => {
                            let (release_tx, release_rx) = oneshot::channel();
                            if reply.send(BlockGuard { _release: release_tx }).is_err() {
                                continue;
                            }
                            info!("storage processor blocked");
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = release_rx => info!("storage processor released"),
                            }
                        }
                        Some(CtrlMsg::Reorg { from_block, ack }) => {
                            worker.reprocess_from(from_block, &cancel).await;
                            if ack.send(()).is_err() {
                                debug!("reorg requester gone");
                            }
                        }
                        None => break,
                    },
                    received = log_rx.recv_many(&mut batch, BATCH_LIMIT) => {
                        if received == 0 {
                            break;
                        }
                        worker.process_batch(&batch, &cancel).await;
                        batch.clear();
                    }
                }
            }
            debug!("storage processor stopped");
        }
        .instrument(info_span!("storage", chain_id)),
    );

    StorageHandle {
        ctrl_tx,
        stored_block_rx,
        parsed_broadcast,
    }
}

struct ProcessorWorker {
    cfg: StorageConfig,
    db: Arc<DbStore>,
    events: Arc<EventStore>,
    instruments: InstrumentStore,
    parsed_tx: mpsc::Sender<ParsedLogEvent>,
    parsed_broadcast: broadcast::Sender<ParsedLogEvent>,
    stored_block_tx: watch::Sender<u64>,
}

impl ProcessorWorker {
    fn persisted_block(&self) -> Option<u64> {
        self.db
            .caches(self.cfg.chain_id)
            .get(STORAGE_CACHE)
            .ok()
            .flatten()
            .and_then(|value| value.get("blockNumber").and_then(|v| v.as_u64()))
    }

    /// One transaction per batch; retried with backoff until it commits or
    /// the process stops.
    async fn process_batch(&self, batch: &[Log], cancel: &CancellationToken) {
        loop {
            match self.try_batch(batch) {
                Ok((emitted, latest)) => {
                    if let Some(latest) = latest
                        && *self.stored_block_tx.borrow() < latest
                    {
                        self.stored_block_tx.send_replace(latest);
                    }
                    self.fan_out(emitted).await;
                    return;
                }
                Err(err) => {
                    warn!(?err, "batch transaction failed, retrying");
                    if let Err(err) = self.events.reload() {
                        warn!(?err, "event index reload failed");
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(BATCH_RETRY_BACKOFF) => {}
                    }
                }
            }
        }
    }

    fn try_batch(&self, batch: &[Log]) -> Result<(Vec<ParsedLogEvent>, Option<u64>), DbError> {
        let txn = self.db.begin_write()?;
        let mut emitted = Vec::new();
        let mut latest = *self.stored_block_tx.borrow();
        let mut advanced = false;
        // find_one sees committed state only; duplicates within the batch
        // are caught here.
        let mut seen = std::collections::HashSet::new();

        for log in batch {
            let Some(position) = Position::of_log(log) else {
                warn!("log without position skipped");
                continue;
            };
            let id = log_id(self.cfg.chain_id, log);
            if !seen.insert(id) {
                continue;
            }
            let existing = self.events.find_one(id, position.block_number)?;
            if existing.is_some() {
                // Already ingested; the PROCESSED bit is settled elsewhere.
                continue;
            }

            let kind = contract_kind_for(&self.cfg.addresses, log.address());
            let parsed = match parse_log(kind, log) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(?err, %position, "unparseable log skipped");
                    continue;
                }
            };

            self.dispatch_handler(&id, position, &parsed, &txn, false)?;

            let stored = StoredEvent {
                id,
                chain_id: self.cfg.chain_id,
                address: log.address(),
                position,
                block_hash: log.block_hash.unwrap_or_default(),
                tx_hash: log.transaction_hash.unwrap_or_default(),
                topics: log.topics().to_vec(),
                data: log.data().data.clone(),
                name: parsed.name().to_string(),
                args: serde_json::to_string(&parsed)?,
                timestamp: None,
                status: STATUS_PROCESSED,
            };
            self.events.create(&stored, &txn)?;

            emitted.push(ParsedLogEvent {
                id,
                position,
                address: log.address(),
                event: parsed,
                processed: false,
            });
            if position.block_number > latest {
                latest = position.block_number;
                advanced = true;
            }
        }

        self.db
            .caches(self.cfg.chain_id)
            .set(STORAGE_CACHE, &json!({ "blockNumber": latest }), &txn)?;
        txn.commit()?;
        Ok((emitted, advanced.then_some(latest)))
    }

    /// Static name -> handler dispatch. The only built-in handler registers
    /// discovered instruments; everything else flows straight to the
    /// snapshot fan-out.
    fn dispatch_handler(
        &self,
        _id: &alloy::primitives::B256,
        position: Position,
        parsed: &ParsedEvent,
        txn: &WriteTransaction,
        _processed: bool,
    ) -> Result<(), DbError> {
        if let ParsedEvent::NewInstrument {
            instrument,
            base,
            quote,
            symbol,
            ..
        } = parsed
        {
            // Idempotent: re-inserting the same address overwrites in place.
            self.instruments.insert(
                &InstrumentRow {
                    address: *instrument,
                    base: *base,
                    quote: *quote,
                    symbol: symbol.clone(),
                    created_at_block: position.block_number,
                },
                txn,
            )?;
        }
        Ok(())
    }

    async fn fan_out(&self, emitted: Vec<ParsedLogEvent>) {
        for event in emitted {
            if self.parsed_broadcast.receiver_count() > 0
                && self.parsed_broadcast.send(event.clone()).is_err()
            {
                debug!("parsed-event broadcast lagged");
            }
            if self.parsed_tx.send(event).await.is_err() {
                debug!("snapshot driver gone, parsed event dropped");
            }
        }
    }

    /// Replays stored events with `block >= from_block` through the
    /// fan-out using the persisted parse results.
    async fn reprocess_from(&self, from_block: u64, cancel: &CancellationToken) {
        info!(from_block, "reprocessing stored events");
        let after = Position::block_end(from_block.saturating_sub(1));
        let mut scan = self
            .events
            .find_all_ordered(after, Position::MAX, None, REORG_SCAN_LIMIT);
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let batch = match scan.next_batch() {
                Ok(batch) => batch,
                Err(err) => {
                    warn!(?err, "reprocess scan failed");
                    return;
                }
            };
            if batch.is_empty() {
                return;
            }
            for stored in batch {
                let parsed: ParsedEvent = match serde_json::from_str(&stored.args) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        warn!(?err, %stored.position, "stored args undecodable, skipped");
                        continue;
                    }
                };
                let was_processed = stored.is_processed();
                match self.db.begin_write() {
                    Ok(txn) => {
                        let applied = self
                            .dispatch_handler(&stored.id, stored.position, &parsed, &txn, was_processed)
                            .and_then(|()| {
                                if !was_processed {
                                    let mut updated = stored.clone();
                                    updated.mark_processed();
                                    self.events.update(&updated, &txn)?;
                                }
                                Ok(())
                            });
                        match applied.and_then(|()| txn.commit().map_err(DbError::from)) {
                            Ok(()) => {}
                            Err(err) => {
                                warn!(?err, "reprocess transaction failed");
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        warn!(?err, "reprocess begin failed");
                        return;
                    }
                }
                self.fan_out(vec![ParsedLogEvent {
                    id: stored.id,
                    position: stored.position,
                    address: stored.address,
                    event: parsed,
                    processed: was_processed,
                }])
                .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, B256, U256};
    use alloy::sol_types::SolEvent;
    use event_db::DbStore;
    use indexer_core::abi;

    fn temp_db() -> Arc<DbStore> {
        let dir = std::env::temp_dir().join("indexer-storage-tests");
        std::fs::create_dir_all(&dir).expect("create temp dir");
        let unique = format!(
            "db-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0)
        );
        Arc::new(DbStore::open(dir.join(unique)).expect("open temp store"))
    }

    fn worker(db: Arc<DbStore>) -> (ProcessorWorker, mpsc::Receiver<ParsedLogEvent>) {
        let chain_id = 81457;
        let events = Arc::new(db.events(chain_id));
        events.init().expect("init events");
        let (parsed_tx, parsed_rx) = mpsc::channel(64);
        let (parsed_broadcast, _) = broadcast::channel(64);
        let (stored_block_tx, _) = watch::channel(0);
        let instruments = db.instruments(chain_id);
        (
            ProcessorWorker {
                cfg: StorageConfig {
                    chain_id,
                    addresses: ChainAddresses {
                        gate: Address::with_last_byte(1),
                        config: Address::with_last_byte(2),
                    },
                },
                db,
                events,
                instruments,
                parsed_tx,
                parsed_broadcast,
                stored_block_tx,
            },
            parsed_rx,
        )
    }

    fn gate_log(block: u64, log_index: u64) -> Log {
        let ev = abi::NewInstrument {
            index: B256::with_last_byte(9),
            instrument: Address::with_last_byte(7),
            base: Address::with_last_byte(3),
            quote: Address::with_last_byte(4),
            symbol: "ETH-USDB-PERP".to_string(),
            total: U256::from(1u64),
        };
        let mut log = Log::default();
        log.inner = alloy::primitives::Log {
            address: Address::with_last_byte(1),
            data: ev.encode_log_data(),
        };
        log.block_number = Some(block);
        log.block_hash = Some(B256::with_last_byte(5));
        log.transaction_hash = Some(B256::with_last_byte(6));
        log.transaction_index = Some(0);
        log.log_index = Some(log_index);
        log
    }

    #[tokio::test]
    async fn batch_is_idempotent_and_registers_instruments() {
        let db = temp_db();
        let (worker, _parsed_rx) = worker(Arc::clone(&db));
        let batch = vec![gate_log(100, 0)];

        let (emitted, latest) = worker.try_batch(&batch).expect("first batch");
        assert_eq!(emitted.len(), 1);
        assert_eq!(latest, Some(100));
        assert!(!emitted[0].processed);

        // Same batch again: the stored event is skipped outright.
        let (emitted, latest) = worker.try_batch(&batch).expect("second batch");
        assert!(emitted.is_empty());
        assert_eq!(latest, None);
        assert_eq!(worker.events.total_size(), 1);

        let row = worker
            .instruments
            .get(Address::with_last_byte(7))
            .expect("lookup")
            .expect("instrument registered");
        assert_eq!(row.created_at_block, 100);

        let stored = worker
            .events
            .find_one(log_id(81457, &batch[0]), 100)
            .expect("lookup")
            .expect("stored");
        assert!(stored.is_processed());
        assert_eq!(stored.name, "NewInstrument");
    }

    #[tokio::test]
    async fn reorg_reemits_only_from_block_in_order() {
        let db = temp_db();
        let (worker, mut parsed_rx) = worker(Arc::clone(&db));
        let batch = vec![gate_log(979, 0), gate_log(980, 0), gate_log(981, 1)];
        let (emitted, _) = worker.try_batch(&batch).expect("seed batch");
        assert_eq!(emitted.len(), 3);

        let cancel = CancellationToken::new();
        worker.reprocess_from(980, &cancel).await;

        let mut seen = Vec::new();
        while let Ok(event) = parsed_rx.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|event| event.processed));
        assert!(seen.iter().all(|event| event.position.block_number >= 980));
        assert!(seen.windows(2).all(|w| w[0].position < w[1].position));
    }
}
