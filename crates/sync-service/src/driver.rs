use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use event_db::{DbError, DbStore, EventStore, SnapshotStore};
use indexer_core::abi::ParsedEvent;
use indexer_core::types::Position;
use snapshot_engine::{Snapshot, SnapshotError};

use crate::types::ParsedLogEvent;

const REPLAY_BATCH: usize = 1000;
const PERSIST_RETRIES: usize = 3;
const PERSIST_RETRY_GAP: Duration = Duration::from_millis(333);

/// Cache row recording the last persisted snapshot block.
pub const SNAPSHOT_CACHE: &str = "snapshot";

#[derive(Debug, thiserror::Error)]
pub enum SnapshotGenError {
    #[error("db error: {0}")]
    Db(#[from] DbError),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("generation aborted")]
    Aborted,
}

#[derive(Debug, Clone)]
pub struct SnapshotDriverConfig {
    pub chain_id: u64,
    /// Persist the live snapshot every `interval` blocks.
    pub interval: u64,
    /// Snapshots more than `outdated` blocks behind are pruned.
    pub outdated: u64,
}

/// The live snapshot shared with the request handler. Only the driver
/// worker mutates it.
#[derive(Debug, Default)]
pub struct LiveState {
    pub snapshot: Option<Snapshot>,
    pub position: Position,
    pub reorging: bool,
}

enum DriverCtrl {
    Reorg {
        from_block: u64,
        ack: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct DriverHandle {
    live: Arc<RwLock<LiveState>>,
    ctrl_tx: mpsc::Sender<DriverCtrl>,
}

impl DriverHandle {
    pub fn live(&self) -> Arc<RwLock<LiveState>> {
        Arc::clone(&self.live)
    }

    /// Clears the live snapshot, deletes stored snapshots at or above
    /// `from_block` and regenerates up to `from_block - 1`. Resolves when
    /// the new snapshot is live.
    pub async fn reorg(&self, from_block: u64) -> bool {
        let (ack, rx) = oneshot::channel();
        if self
            .ctrl_tx
            .send(DriverCtrl::Reorg { from_block, ack })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.is_ok()
    }
}

/// Shared replay: materializes the snapshot at `to`, starting from `from`
/// or from the nearest stored snapshot at or before `to`.
pub async fn get_snapshot(
    events: &EventStore,
    snapshots: &SnapshotStore,
    to: Position,
    from: Option<(Snapshot, Position)>,
    cancel: Option<&CancellationToken>,
) -> Result<(Snapshot, Position), SnapshotGenError> {
    let (mut snapshot, mut position) = match from {
        Some(base) => base,
        None => match snapshots.nearest_at_or_before(to)? {
            Some((base_position, bytes)) => (Snapshot::deserialize(&bytes)?, base_position),
            None => (Snapshot::new(), Position::ZERO),
        },
    };

    let mut scan = events.find_all_ordered(position, to, None, REPLAY_BATCH);
    loop {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(SnapshotGenError::Aborted);
        }
        let batch = scan.next_batch()?;
        if batch.is_empty() {
            break;
        }
        for stored in batch {
            let parsed: ParsedEvent = match serde_json::from_str(&stored.args) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(?err, %stored.position, "stored args undecodable, skipped in replay");
                    continue;
                }
            };
            snapshot.apply(stored.address, &parsed);
            position = stored.position;
        }
        tokio::task::yield_now().await;
    }
    Ok((snapshot, position))
}

/// Spawns the live-snapshot worker consuming the processor's ordered
/// parsed-event stream.
pub fn spawn_snapshot_driver(
    cfg: SnapshotDriverConfig,
    db: Arc<DbStore>,
    events: Arc<EventStore>,
    mut parsed_rx: mpsc::Receiver<ParsedLogEvent>,
    cancel: CancellationToken,
) -> DriverHandle {
    let live = Arc::new(RwLock::new(LiveState::default()));
    let (ctrl_tx, mut ctrl_rx) = mpsc::channel(16);

    let chain_id = cfg.chain_id;
    let mut worker = DriverWorker {
        cfg,
        snapshots: db.snapshots(chain_id),
        db,
        events,
        live: Arc::clone(&live),
        last_persisted: 0,
    };

    tokio::spawn(
        async move {
            worker.init(&cancel).await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        // Pending reorg requests must resolve before stop.
                        while let Ok(DriverCtrl::Reorg { from_block, ack }) = ctrl_rx.try_recv() {
                            worker.do_reorg(from_block, &cancel).await;
                            let _ = ack.send(());
                        }
                        break;
                    }
                    ctrl = ctrl_rx.recv() => match ctrl {
                        Some(DriverCtrl::Reorg { from_block, ack }) => {
                            worker.do_reorg(from_block, &cancel).await;
                            if ack.send(()).is_err() {
                                debug!("reorg requester gone");
                            }
                        }
                        None => break,
                    },
                    event = parsed_rx.recv() => match event {
                        Some(event) => worker.on_event(event).await,
                        None => break,
                    },
                }
            }
            debug!("snapshot driver stopped");
        }
        .instrument(info_span!("snapshot_driver", chain_id)),
    );

    DriverHandle { live, ctrl_tx }
}

struct DriverWorker {
    cfg: SnapshotDriverConfig,
    db: Arc<DbStore>,
    events: Arc<EventStore>,
    snapshots: SnapshotStore,
    live: Arc<RwLock<LiveState>>,
    last_persisted: u64,
}

impl DriverWorker {
    async fn init(&mut self, cancel: &CancellationToken) {
        self.last_persisted = self
            .db
            .caches(self.cfg.chain_id)
            .get(SNAPSHOT_CACHE)
            .ok()
            .flatten()
            .and_then(|value| value.get("blockNumber").and_then(|v| v.as_u64()))
            .unwrap_or(0);

        let to = match self.events.latest_position() {
            Ok(Some(position)) => position,
            Ok(None) => Position::ZERO,
            Err(err) => {
                warn!(?err, "latest position lookup failed");
                Position::ZERO
            }
        };
        match get_snapshot(&self.events, &self.snapshots, to, None, Some(cancel)).await {
            Ok((snapshot, position)) => {
                info!(%position, "live snapshot materialized");
                let persist_due =
                    position.block_number.saturating_sub(self.last_persisted) >= self.cfg.interval;
                {
                    let mut live = self.live.write().await;
                    live.snapshot = Some(snapshot);
                    live.position = position;
                }
                if persist_due {
                    self.persist(position.block_number).await;
                }
            }
            Err(SnapshotGenError::Aborted) => {}
            Err(err) => {
                warn!(?err, "initial snapshot materialization failed");
            }
        }
    }

    async fn on_event(&mut self, event: ParsedLogEvent) {
        let out_of_order;
        {
            let mut live = self.live.write().await;
            let Some(snapshot) = live.snapshot.as_mut() else {
                return;
            };
            // The apply itself is position-insensitive by contract; an
            // out-of-order log still lands in the live state, but any
            // snapshot persisted at or above its block is now stale.
            snapshot.apply(event.address, &event.event);
            out_of_order = event.position < live.position;
            if !out_of_order {
                live.position = event.position;
            }
        }

        if out_of_order {
            warn!(%event.position, "out-of-order apply, invalidating stored snapshots");
            self.invalidate_from(event.position.block_number).await;
            return;
        }

        if event
            .position
            .block_number
            .saturating_sub(self.last_persisted)
            >= self.cfg.interval
        {
            self.persist(event.position.block_number).await;
        }
    }

    async fn invalidate_from(&self, from_block: u64) {
        let result = self.db.begin_write().and_then(|txn| {
            let removed = self.snapshots.destroy_from(from_block, &txn)?;
            txn.commit()?;
            Ok(removed)
        });
        match result {
            Ok(removed) if removed > 0 => {
                info!(from_block, removed, "stale snapshots destroyed")
            }
            Ok(_) => {}
            Err(err) => warn!(?err, "snapshot invalidation failed"),
        }
    }

    /// One transaction: prune the outdated set (keeping its newest member
    /// as a replay base), save the current live snapshot, advance the
    /// cache row.
    async fn persist(&mut self, head_block: u64) {
        let serialized = {
            let live = self.live.read().await;
            let Some(snapshot) = live.snapshot.as_ref() else {
                return;
            };
            match snapshot.serialize() {
                Ok(bytes) => (bytes, live.position),
                Err(err) => {
                    warn!(?err, "live snapshot serialization failed");
                    return;
                }
            }
        };
        let (bytes, position) = serialized;

        for attempt in 1..=PERSIST_RETRIES {
            match self.try_persist(head_block, position, &bytes) {
                Ok(()) => {
                    self.last_persisted = position.block_number;
                    info!(%position, "snapshot persisted");
                    return;
                }
                Err(err) => {
                    warn!(?err, attempt, "snapshot persist failed");
                    tokio::time::sleep(PERSIST_RETRY_GAP).await;
                }
            }
        }
    }

    fn try_persist(
        &self,
        head_block: u64,
        position: Position,
        bytes: &[u8],
    ) -> Result<(), DbError> {
        let txn = self.db.begin_write()?;
        let cutoff = head_block.saturating_sub(self.cfg.outdated);
        let outdated: Vec<Position> = self
            .snapshots
            .list()?
            .into_iter()
            .filter(|stored| stored.block_number <= cutoff)
            .collect();
        // Keep at least one: the newest outdated snapshot stays usable as a
        // historical replay base.
        let keep = outdated.iter().max().copied();
        for stale in outdated {
            if Some(stale) == keep {
                continue;
            }
            self.snapshots.destroy_at(stale, &txn)?;
        }
        self.snapshots.save(position, bytes, &txn)?;
        self.db.caches(self.cfg.chain_id).set(
            SNAPSHOT_CACHE,
            &json!({ "blockNumber": position.block_number }),
            &txn,
        )?;
        txn.commit()?;
        Ok(())
    }

    async fn do_reorg(&mut self, from_block: u64, cancel: &CancellationToken) {
        info!(from_block, "snapshot reorg started");
        {
            let mut live = self.live.write().await;
            live.reorging = true;
            live.snapshot = None;
            live.position = Position::ZERO;
        }

        for attempt in 1..=PERSIST_RETRIES {
            let result = self.db.begin_write().and_then(|txn| {
                let removed = self.snapshots.destroy_from(from_block, &txn)?;
                txn.commit()?;
                Ok(removed)
            });
            match result {
                Ok(removed) => {
                    info!(from_block, removed, "reorged snapshots destroyed");
                    break;
                }
                Err(err) => {
                    warn!(?err, attempt, "reorg snapshot deletion failed");
                    tokio::time::sleep(PERSIST_RETRY_GAP).await;
                }
            }
        }

        let to = Position::block_end(from_block.saturating_sub(1));
        match get_snapshot(&self.events, &self.snapshots, to, None, Some(cancel)).await {
            Ok((snapshot, position)) => {
                let mut live = self.live.write().await;
                live.snapshot = Some(snapshot);
                live.position = position;
                live.reorging = false;
                info!(%position, "snapshot reorg complete");
            }
            Err(err) => {
                warn!(?err, "snapshot regeneration failed");
                let mut live = self.live.write().await;
                live.snapshot = None;
                live.reorging = false;
            }
        }
        self.last_persisted = self.last_persisted.min(from_block.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Address, B256, Bytes, U256};
    use event_db::DbStore;
    use indexer_core::types::{STATUS_PROCESSED, StoredEvent};

    fn temp_db() -> Arc<DbStore> {
        let dir = std::env::temp_dir().join("indexer-driver-tests");
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

    fn stored_update_pair(chain_id: u64, block: u64, tick: i32) -> StoredEvent {
        let parsed = ParsedEvent::UpdatePair {
            expiry: u32::MAX,
            timestamp: 1_700_000_000,
            status: 1,
            tick,
            sqrt_px96: U256::from(1u64),
            liquidity: 1,
            total_liquidity: 2,
            involved_fund: 3,
            open_interests: 4,
            fee_index: 5,
            protocol_fee: 6,
            total_long: 7,
            total_short: 8,
            insurance_fund: 9,
            mark: U256::from(10u64),
        };
        let mut seed = [0u8; 32];
        seed[..8].copy_from_slice(&block.to_be_bytes());
        StoredEvent {
            id: B256::from(seed),
            chain_id,
            address: Address::with_last_byte(7),
            position: Position::new(block, 0, 0),
            block_hash: B256::with_last_byte(1),
            tx_hash: B256::with_last_byte(2),
            topics: vec![],
            data: Bytes::new(),
            name: parsed.name().to_string(),
            args: serde_json::to_string(&parsed).expect("serialize args"),
            timestamp: None,
            status: STATUS_PROCESSED,
        }
    }

    fn seed_events(db: &DbStore, chain_id: u64, blocks: &[(u64, i32)]) -> Arc<event_db::EventStore> {
        let events = Arc::new(db.events(chain_id));
        events.init().expect("init");
        for (block, tick) in blocks {
            let txn = db.begin_write().expect("begin");
            events
                .create(&stored_update_pair(chain_id, *block, *tick), &txn)
                .expect("create");
            txn.commit().expect("commit");
        }
        events
    }

    #[tokio::test]
    async fn replay_is_base_independent() {
        let db = temp_db();
        let chain_id = 81457;
        let events = seed_events(&db, chain_id, &[(100, 1), (200, 2), (300, 3)]);
        let snapshots = db.snapshots(chain_id);

        // Base 1: from scratch.
        let (from_zero, pos_zero) = get_snapshot(
            &events,
            &snapshots,
            Position::block_end(300),
            None,
            None,
        )
        .await
        .expect("replay from zero");
        assert_eq!(pos_zero, Position::new(300, 0, 0));

        // Base 2: a stored snapshot at block 200.
        let (mid, mid_pos) = get_snapshot(
            &events,
            &snapshots,
            Position::block_end(200),
            None,
            None,
        )
        .await
        .expect("replay to 200");
        let txn = db.begin_write().expect("begin");
        snapshots
            .save(mid_pos, &mid.serialize().expect("serialize"), &txn)
            .expect("save");
        txn.commit().expect("commit");

        let (from_stored, pos_stored) = get_snapshot(
            &events,
            &snapshots,
            Position::block_end(300),
            None,
            None,
        )
        .await
        .expect("replay from stored");
        assert_eq!(pos_stored, pos_zero);
        assert_eq!(
            from_stored.serialize().expect("serialize"),
            from_zero.serialize().expect("serialize")
        );
    }

    #[tokio::test]
    async fn reorg_clears_snapshots_and_rewinds_live() {
        let db = temp_db();
        let chain_id = 81457;
        let events = seed_events(&db, chain_id, &[(100, 1), (950, 2), (990, 3), (1000, 4)]);
        let snapshots = db.snapshots(chain_id);

        // Stored snapshot at 950 and at 1000.
        for to in [950u64, 1000] {
            let (snap, pos) = get_snapshot(
                &events,
                &snapshots,
                Position::block_end(to),
                None,
                None,
            )
            .await
            .expect("replay");
            let txn = db.begin_write().expect("begin");
            snapshots
                .save(pos, &snap.serialize().expect("serialize"), &txn)
                .expect("save");
            txn.commit().expect("commit");
        }

        let mut worker = DriverWorker {
            cfg: SnapshotDriverConfig {
                chain_id,
                interval: 1800,
                outdated: 43_200,
            },
            snapshots: db.snapshots(chain_id),
            db: Arc::clone(&db),
            events,
            live: Arc::new(RwLock::new(LiveState::default())),
            last_persisted: 1000,
        };
        let cancel = CancellationToken::new();
        worker.do_reorg(980, &cancel).await;

        let remaining = db.snapshots(chain_id).list().expect("list");
        assert!(remaining.iter().all(|pos| pos.block_number < 980));

        let live = worker.live.read().await;
        assert!(!live.reorging);
        assert!(live.snapshot.is_some());
        assert!(live.position <= Position::block_end(979));
        assert_eq!(live.position, Position::new(950, 0, 0));
    }

    #[tokio::test]
    async fn out_of_order_apply_invalidates_but_does_not_rewind() {
        let db = temp_db();
        let chain_id = 81457;
        let events = seed_events(&db, chain_id, &[(100, 1)]);
        let snapshots = db.snapshots(chain_id);
        let txn = db.begin_write().expect("begin");
        snapshots
            .save(Position::new(500, 0, 0), b"snap", &txn)
            .expect("save");
        txn.commit().expect("commit");

        let live = Arc::new(RwLock::new(LiveState {
            snapshot: Some(Snapshot::new()),
            position: Position::new(600, 0, 0),
            reorging: false,
        }));
        let mut worker = DriverWorker {
            cfg: SnapshotDriverConfig {
                chain_id,
                interval: 1800,
                outdated: 43_200,
            },
            snapshots: db.snapshots(chain_id),
            db: Arc::clone(&db),
            events,
            live: Arc::clone(&live),
            last_persisted: 0,
        };

        let parsed = ParsedEvent::DeleteContext { expiry: 1 };
        worker
            .on_event(ParsedLogEvent {
                id: B256::ZERO,
                position: Position::new(400, 0, 0),
                address: Address::with_last_byte(7),
                event: parsed,
                processed: false,
            })
            .await;

        // The snapshot at 500 >= 400 is invalidated, live position holds.
        assert!(db.snapshots(chain_id).list().expect("list").is_empty());
        assert_eq!(live.read().await.position, Position::new(600, 0, 0));
    }
}
