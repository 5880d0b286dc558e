use std::cmp::min;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use alloy_rpc_types_eth::Log;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use event_db::{DbError, EventStore};
use indexer_core::abi::{instrument_topics, new_instrument_address};
use indexer_core::fetcher::LogFetcher;
use indexer_core::rpc::{ChainRpc, RpcError};
use indexer_core::subscriber::{SubscriberEvent, SubscriberHandle};
use indexer_core::types::Position;

use crate::types::ChainAddresses;

const DISCOVERY_RETRIES: usize = 30;
const DISCOVERY_RETRY_GAP: Duration = Duration::from_millis(333);
const HEAD_REQUERY_CAP: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
    #[error("db error: {0}")]
    Db(#[from] DbError),
    #[error("downstream channel closed")]
    DownstreamClosed,
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub chain_id: u64,
    pub addresses: ChainAddresses,
    pub initial_block: u64,
    /// Confirmation window: a log at block `b` is held while
    /// `b > head - confirmation`.
    pub confirmation: u64,
    pub batch_size: u64,
    /// Downstream channel capacity; the sync loop suspends on a full
    /// channel until the consumer drains it.
    pub threshold: usize,
    /// Fetch-mode sync cadence (ignored in subscribe mode).
    pub poll_interval: Duration,
}

/// Progress signals exposed to the rest of the pipeline.
#[derive(Debug, Clone)]
pub struct SourceHandle {
    pub head_rx: watch::Receiver<u64>,
    pub synced_rx: watch::Receiver<bool>,
}

/// Spawns the unified log source. Returns the downstream channel of
/// confirmed logs in Position order.
pub fn spawn_source(
    cfg: SourceConfig,
    rpc: Arc<ChainRpc>,
    fetcher: Arc<LogFetcher>,
    subscriber: Option<(SubscriberHandle, mpsc::Receiver<SubscriberEvent>)>,
    events: Arc<EventStore>,
    cancel: CancellationToken,
) -> (SourceHandle, mpsc::Receiver<Log>) {
    let (log_tx, log_rx) = mpsc::channel(cfg.threshold.max(1));
    let (head_tx, head_rx) = watch::channel(0u64);
    let (synced_tx, synced_rx) = watch::channel(false);
    let (refetch_tx, refetch_rx) = mpsc::channel(16);

    let (subscriber, sub_events, _sub_keepalive) = match subscriber {
        Some((handle, rx)) => (Some(handle), rx, None),
        None => {
            // Fetch mode: a receiver that never yields keeps the select
            // uniform.
            let (tx, rx) = mpsc::channel(1);
            (None, rx, Some(tx))
        }
    };

    let chain_id = cfg.chain_id;
    let worker = Worker {
        cfg,
        rpc,
        fetcher,
        subscriber,
        sub_events,
        _sub_keepalive,
        events,
        log_tx,
        head_tx,
        synced_tx,
        refetch_tx,
        refetch_rx,
        pending: Vec::new(),
        confirming: BTreeMap::new(),
        head: 0,
        sync_target: None,
        resync: false,
    };
    tokio::spawn(
        worker
            .run(cancel)
            .instrument(info_span!("source", chain_id)),
    );

    (SourceHandle { head_rx, synced_rx }, log_rx)
}

struct Worker {
    cfg: SourceConfig,
    rpc: Arc<ChainRpc>,
    fetcher: Arc<LogFetcher>,
    subscriber: Option<SubscriberHandle>,
    sub_events: mpsc::Receiver<SubscriberEvent>,
    _sub_keepalive: Option<mpsc::Sender<SubscriberEvent>>,
    events: Arc<EventStore>,
    log_tx: mpsc::Sender<Log>,
    head_tx: watch::Sender<u64>,
    synced_tx: watch::Sender<bool>,
    refetch_tx: mpsc::Sender<Vec<Log>>,
    refetch_rx: mpsc::Receiver<Vec<Log>>,
    /// Subscription logs received while syncing, above the sync target.
    pending: Vec<Log>,
    /// Logs inside the confirmation window, keyed by Position.
    confirming: BTreeMap<Position, Log>,
    head: u64,
    sync_target: Option<u64>,
    resync: bool,
}

impl Worker {
    async fn run(mut self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.cfg.poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Startup sync; subscribe mode re-syncs again on `Connected`.
        self.sync(&cancel).await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.sub_events.recv() => match event {
                    Some(event) => {
                        if self.handle_steady_event(event).await.is_err() {
                            break;
                        }
                        if self.resync {
                            self.resync = false;
                            self.sync(&cancel).await;
                        }
                    }
                    None => {
                        warn!("subscriber event stream closed");
                        break;
                    }
                },
                batch = self.refetch_rx.recv() => {
                    if let Some(mut logs) = batch {
                        sort_logs(&mut logs);
                        if self.emit_confirmed(logs, self.head).await.is_err() {
                            break;
                        }
                    }
                }
                _ = tick.tick(), if self.subscriber.is_none() => {
                    self.sync(&cancel).await;
                }
            }
        }
        debug!("source worker stopped");
    }

    async fn sync(&mut self, cancel: &CancellationToken) {
        match self.sync_pass(cancel).await {
            Ok(()) => {
                if !*self.synced_tx.borrow() && self.synced_tx.send(true).is_ok() {
                    info!(head = self.head, "initial sync complete");
                }
            }
            Err(SourceError::DownstreamClosed) => {
                debug!("downstream closed during sync");
            }
            Err(err) => {
                // The pass is abandoned here and re-triggered by the next
                // connect/timer/loss event.
                warn!(?err, "sync pass failed");
            }
        }
        self.sync_target = None;
    }

    async fn sync_pass(&mut self, cancel: &CancellationToken) -> Result<(), SourceError> {
        let mut target = self.rpc.block_number().await?;
        self.update_head(target);
        self.sync_target = Some(target);

        // Anything below the target will be re-fetched authoritatively.
        self.pending
            .retain(|log| log.block_number.is_some_and(|block| block >= target));

        let mut current = self
            .events
            .latest_stored_block()?
            .map_or(self.cfg.initial_block, |stored| {
                stored.max(self.cfg.initial_block)
            });
        let mut requeries = 0usize;

        while current <= target {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let end = min(current.saturating_add(self.cfg.batch_size), target);
            let mut logs = self.fetcher.fetch(current, end).await?;
            sort_logs(&mut logs);

            let discovered = self.discover_instruments(&mut logs, current, end).await?;
            if discovered {
                target = self.rpc.block_number().await?;
                self.sync_target = Some(target);
                self.update_head(target);
            }

            self.emit_confirmed(logs, target).await?;
            self.drain_subscriber_events(target).await?;

            current = end + 1;
            if current > target {
                if let Some(future_block) = self
                    .pending
                    .iter()
                    .filter_map(|log| log.block_number)
                    .filter(|block| *block > target)
                    .min()
                {
                    target = future_block;
                    self.sync_target = Some(target);
                    continue;
                }
                let head_now = self.rpc.block_number().await?;
                if head_now != target && requeries < HEAD_REQUERY_CAP {
                    requeries += 1;
                    target = head_now;
                    self.sync_target = Some(target);
                    self.update_head(target);
                } else {
                    break;
                }
            }
        }

        // Flush subscription logs that arrived during the pass.
        let mut pending = std::mem::take(&mut self.pending);
        sort_logs(&mut pending);
        self.emit_confirmed(pending, target).await?;
        self.promote(self.head.max(target)).await?;
        Ok(())
    }

    /// Scans a fetched batch for `NewInstrument` Gate logs; registers each
    /// fresh instrument and merges its own logs for the same range.
    async fn discover_instruments(
        &mut self,
        logs: &mut Vec<Log>,
        from: u64,
        to: u64,
    ) -> Result<bool, SourceError> {
        let mut found = Vec::new();
        for log in logs.iter() {
            if log.address() != self.cfg.addresses.gate {
                continue;
            }
            let Some(instrument) = new_instrument_address(log) else {
                continue;
            };
            if !self.fetcher.is_subscribed(instrument).await && !found.contains(&instrument) {
                found.push(instrument);
            }
        }

        for instrument in &found {
            self.register_instrument(*instrument).await;
            let mut extra = Vec::new();
            // The node serving getLogs may lag the one that produced the
            // discovery log.
            for attempt in 0..DISCOVERY_RETRIES {
                extra = self.fetcher.fetch_for(*instrument, from, to).await?;
                if !extra.is_empty() {
                    break;
                }
                if attempt + 1 < DISCOVERY_RETRIES {
                    tokio::time::sleep(DISCOVERY_RETRY_GAP).await;
                }
            }
            if extra.is_empty() {
                warn!(%instrument, from, to, "no logs for discovered instrument, skipping range");
                continue;
            }
            debug!(%instrument, count = extra.len(), "merged discovered instrument logs");
            logs.extend(extra);
        }

        if found.is_empty() {
            return Ok(false);
        }
        sort_logs(logs);
        Ok(true)
    }

    async fn register_instrument(&self, instrument: Address) {
        info!(%instrument, "new instrument discovered");
        self.fetcher
            .subscribe(instrument, instrument_topics())
            .await;
        if let Some(subscriber) = &self.subscriber {
            subscriber
                .subscribe_logs(instrument, instrument_topics())
                .await;
        }
    }

    /// Splits a Position-sorted batch across the confirmation boundary:
    /// logs above `target - confirmation` are held, the rest released.
    async fn emit_confirmed(&mut self, logs: Vec<Log>, target: u64) -> Result<(), SourceError> {
        let boundary = target.saturating_sub(self.cfg.confirmation);
        for log in logs {
            let Some(position) = Position::of_log(&log) else {
                warn!("log without position dropped");
                continue;
            };
            if position.block_number > boundary {
                self.confirming.insert(position, log);
            } else {
                self.confirming.remove(&position);
                self.send_downstream(log).await?;
            }
        }
        Ok(())
    }

    /// Releases confirming logs at or below `head - confirmation`, in
    /// Position order.
    async fn promote(&mut self, head: u64) -> Result<(), SourceError> {
        let boundary = head.saturating_sub(self.cfg.confirmation);
        loop {
            let ready = self
                .confirming
                .first_key_value()
                .is_some_and(|(position, _)| position.block_number <= boundary);
            if !ready {
                return Ok(());
            }
            if let Some((_, log)) = self.confirming.pop_first() {
                self.send_downstream(log).await?;
            }
        }
    }

    async fn send_downstream(&self, log: Log) -> Result<(), SourceError> {
        if self.log_tx.capacity() == 0 {
            debug!("downstream channel full, source suspended");
        }
        self.log_tx
            .send(log)
            .await
            .map_err(|_| SourceError::DownstreamClosed)
    }

    fn update_head(&mut self, head: u64) {
        if head > self.head {
            self.head = head;
            if self.head_tx.send(head).is_err() {
                debug!(head, "no head watchers");
            }
        }
    }

    /// Steady-state subscriber event handling. Err means the downstream
    /// channel is gone and the worker should stop.
    async fn handle_steady_event(&mut self, event: SubscriberEvent) -> Result<(), SourceError> {
        match event {
            SubscriberEvent::Connected => {
                info!("subscriber connected, scheduling full sync");
                self.resync = true;
                Ok(())
            }
            SubscriberEvent::Loss => {
                warn!("subscriber connection lost");
                Ok(())
            }
            SubscriberEvent::NewHead(header) => {
                self.update_head(header.number);
                self.promote(self.head).await
            }
            SubscriberEvent::Log(log) => self.handle_subscription_log(log, None).await,
        }
    }

    /// Drains subscriber events that arrived mid-sync: heads keep flowing,
    /// logs above the target are parked in `pending`.
    async fn drain_subscriber_events(&mut self, target: u64) -> Result<(), SourceError> {
        loop {
            match self.sub_events.try_recv() {
                Ok(SubscriberEvent::Connected) => {
                    // A reconnect mid-pass invalidates the current target.
                    self.resync = true;
                }
                Ok(SubscriberEvent::Loss) => warn!("subscriber connection lost during sync"),
                Ok(SubscriberEvent::NewHead(header)) => {
                    self.update_head(header.number);
                    self.promote(self.head).await?;
                }
                Ok(SubscriberEvent::Log(log)) => {
                    self.handle_subscription_log(log, Some(target)).await?;
                }
                Err(mpsc::error::TryRecvError::Empty)
                | Err(mpsc::error::TryRecvError::Disconnected) => return Ok(()),
            }
        }
    }

    async fn handle_subscription_log(
        &mut self,
        log: Log,
        sync_target: Option<u64>,
    ) -> Result<(), SourceError> {
        let Some(position) = Position::of_log(&log) else {
            warn!("subscription log without position dropped");
            return Ok(());
        };

        if log.removed {
            // A removal must cancel the matching unconfirmed log.
            if self.confirming.remove(&position).is_none() {
                warn!(%position, "removal for unknown log discarded");
            }
            return Ok(());
        }

        if log.address() == self.cfg.addresses.gate
            && let Some(instrument) = new_instrument_address(&log)
            && !self.fetcher.is_subscribed(instrument).await
        {
            self.register_instrument(instrument).await;
            self.schedule_instrument_refetch(instrument, position.block_number);
        }

        match sync_target {
            Some(target) if position.block_number > target => {
                self.pending.push(log);
                Ok(())
            }
            Some(target) => self.emit_confirmed(vec![log], target).await,
            None => {
                self.emit_confirmed(vec![log], self.head).await?;
                self.promote(self.head).await
            }
        }
    }

    /// Deferred single-instrument catch-up: fetch the instrument's logs from
    /// its discovery block to the current head and feed them back through
    /// the confirmation stage.
    fn schedule_instrument_refetch(&self, instrument: Address, from: u64) {
        let fetcher = Arc::clone(&self.fetcher);
        let refetch_tx = self.refetch_tx.clone();
        let to = self.head.max(from);
        tokio::spawn(
            async move {
                let mut logs = Vec::new();
                for attempt in 0..DISCOVERY_RETRIES {
                    match fetcher.fetch_for(instrument, from, to).await {
                        Ok(fetched) if !fetched.is_empty() => {
                            logs = fetched;
                            break;
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!(?err, %instrument, "instrument re-fetch failed");
                            return;
                        }
                    }
                    if attempt + 1 < DISCOVERY_RETRIES {
                        tokio::time::sleep(DISCOVERY_RETRY_GAP).await;
                    }
                }
                if logs.is_empty() {
                    warn!(%instrument, from, to, "instrument re-fetch yielded nothing");
                    return;
                }
                if refetch_tx.send(logs).await.is_err() {
                    debug!(%instrument, "source gone before re-fetch completed");
                }
            }
            .instrument(info_span!("instrument_refetch", %instrument)),
        );
    }
}

pub(crate) fn sort_logs(logs: &mut [Log]) {
    logs.sort_by_key(|log| {
        (
            log.block_number.unwrap_or_default(),
            log.transaction_index.unwrap_or_default(),
            log.log_index.unwrap_or_default(),
        )
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_at(block: u64, tx: u64, index: u64) -> Log {
        let mut log = Log::default();
        log.block_number = Some(block);
        log.transaction_index = Some(tx);
        log.log_index = Some(index);
        log
    }

    fn test_worker(confirmation: u64, capacity: usize) -> (Worker, mpsc::Receiver<Log>) {
        let (log_tx, log_rx) = mpsc::channel(capacity);
        let (head_tx, _head_rx) = watch::channel(0);
        let (synced_tx, _synced_rx) = watch::channel(false);
        let (refetch_tx, refetch_rx) = mpsc::channel(4);
        let (sub_tx, sub_events) = mpsc::channel(4);

        let db = event_db_temp();
        let events = Arc::new(db.events(81457));
        events.init().expect("init events");

        let worker = Worker {
            cfg: SourceConfig {
                chain_id: 81457,
                addresses: ChainAddresses {
                    gate: Address::with_last_byte(1),
                    config: Address::with_last_byte(2),
                },
                initial_block: 0,
                confirmation,
                batch_size: 1000,
                threshold: capacity,
                poll_interval: Duration::from_secs(10),
            },
            rpc: test_rpc(),
            fetcher: Arc::new(LogFetcher::new(test_rpc(), 10)),
            subscriber: None,
            sub_events,
            _sub_keepalive: Some(sub_tx),
            events,
            log_tx,
            head_tx,
            synced_tx,
            refetch_tx,
            refetch_rx,
            pending: Vec::new(),
            confirming: BTreeMap::new(),
            head: 0,
            sync_target: None,
            resync: false,
        };
        (worker, log_rx)
    }

    fn event_db_temp() -> event_db::DbStore {
        let dir = std::env::temp_dir().join("indexer-source-tests");
        std::fs::create_dir_all(&dir).expect("create temp dir");
        let unique = format!(
            "db-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0)
        );
        event_db::DbStore::open(dir.join(unique)).expect("open temp store")
    }

    fn test_rpc() -> Arc<ChainRpc> {
        use alloy::providers::{Provider, ProviderBuilder};
        let provider = ProviderBuilder::new()
            .connect_http("http://localhost:1".parse().expect("static url"))
            .erased();
        Arc::new(ChainRpc::from_provider(provider, 81457))
    }

    #[tokio::test]
    async fn confirmation_window_splits_at_boundary() {
        let (mut worker, mut log_rx) = test_worker(2, 16);
        let logs = vec![
            log_at(100, 0, 0),
            log_at(101, 0, 0),
            log_at(102, 0, 0),
            log_at(103, 0, 0),
        ];
        worker.emit_confirmed(logs, 103).await.expect("emit");

        // head 103, C=2: boundary is 101
        let mut released = Vec::new();
        while let Ok(log) = log_rx.try_recv() {
            released.push(log.block_number.expect("block"));
        }
        assert_eq!(released, vec![100, 101]);
        assert_eq!(worker.confirming.len(), 2);

        // promoting at head 104 releases exactly block 102
        worker.promote(104).await.expect("promote");
        let mut promoted = Vec::new();
        while let Ok(log) = log_rx.try_recv() {
            promoted.push(log.block_number.expect("block"));
        }
        assert_eq!(promoted, vec![102]);
        assert_eq!(worker.confirming.len(), 1);
    }

    #[tokio::test]
    async fn removed_log_dequeues_confirming_entry() {
        let (mut worker, _log_rx) = test_worker(2, 16);
        worker
            .emit_confirmed(vec![log_at(103, 1, 4)], 103)
            .await
            .expect("emit");
        assert_eq!(worker.confirming.len(), 1);

        let mut removal = log_at(103, 1, 4);
        removal.removed = true;
        worker
            .handle_subscription_log(removal, None)
            .await
            .expect("handle removal");
        assert!(worker.confirming.is_empty());
    }

    #[tokio::test]
    async fn sync_target_parks_future_logs_in_pending() {
        let (mut worker, _log_rx) = test_worker(2, 16);
        worker
            .handle_subscription_log(log_at(250, 0, 0), Some(200))
            .await
            .expect("handle log");
        assert_eq!(worker.pending.len(), 1);
        assert!(worker.confirming.is_empty());
    }

    #[tokio::test]
    async fn downstream_backpressure_suspends_sender() {
        let (mut worker, mut log_rx) = test_worker(0, 10);
        let logs: Vec<Log> = (1..=10u64).map(|b| log_at(b, 0, 0)).collect();
        worker.emit_confirmed(logs, 100).await.expect("fill channel");

        // Channel at capacity: the next emit suspends.
        let send = worker.emit_confirmed(vec![log_at(11, 0, 0)], 100);
        tokio::pin!(send);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), &mut send)
                .await
                .is_err()
        );

        // One consumer drain cycle resumes it.
        let _ = log_rx.recv().await;
        tokio::time::timeout(Duration::from_millis(200), send)
            .await
            .expect("resumed after drain")
            .expect("send succeeded");
    }

    #[test]
    fn sort_is_position_lexicographic() {
        let mut logs = vec![log_at(5, 1, 0), log_at(5, 0, 3), log_at(4, 9, 9)];
        sort_logs(&mut logs);
        let order: Vec<u64> = logs.iter().map(|l| l.block_number.expect("block")).collect();
        assert_eq!(order, vec![4, 5, 5]);
        assert_eq!(logs[1].transaction_index, Some(0));
    }
}
