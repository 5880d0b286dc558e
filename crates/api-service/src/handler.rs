use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::Address;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use event_db::{DbStore, EventStore};
use indexer_core::types::Position;
use snapshot_engine::{AccountView, AmmView, Snapshot};
use sync_service::{LiveState, get_snapshot};

use crate::jsonrpc::RpcError;

/// Wire format of a snapshot id: `"{chainId}-{block}"` or
/// `"{chainId}-{block}-{tx}-{log}"`.
pub fn format_snapshot_id(chain_id: u64, block: u64, tail: Option<(u32, u32)>) -> String {
    match tail {
        Some((tx, log)) => format!("{chain_id}-{block}-{tx}-{log}"),
        None => format!("{chain_id}-{block}"),
    }
}

pub fn parse_snapshot_id(id: &str) -> Option<(u64, u64, Option<(u32, u32)>)> {
    let parts: Vec<&str> = id.split('-').collect();
    match parts.as_slice() {
        [chain, block] => Some((chain.parse().ok()?, block.parse().ok()?, None)),
        [chain, block, tx, log] => Some((
            chain.parse().ok()?,
            block.parse().ok()?,
            Some((tx.parse().ok()?, log.parse().ok()?)),
        )),
        _ => None,
    }
}

#[derive(Debug)]
pub struct Generated {
    pub snapshot: Snapshot,
    pub position: Position,
}

#[derive(Default)]
struct GenState {
    generating: HashMap<String, CancellationToken>,
    generated: HashMap<String, Arc<Generated>>,
}

/// Dispatch target for every API method. Holds the generated-snapshot
/// lifecycle; the live snapshot belongs to the driver and is only read here.
pub struct RequestHandler {
    chain_id: u64,
    live: Arc<RwLock<LiveState>>,
    db: Arc<DbStore>,
    events: Arc<EventStore>,
    state: Mutex<GenState>,
    shutdown: CancellationToken,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct GenerateParams {
    block_number: u64,
    transaction_index: Option<u32>,
    log_index: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct QueryAccountParams {
    id: Option<String>,
    address: Address,
    instrument: Address,
    expiry: u32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct QueryAmmParams {
    id: Option<String>,
    instrument: Address,
    expiry: u32,
}

impl RequestHandler {
    pub fn new(
        chain_id: u64,
        live: Arc<RwLock<LiveState>>,
        db: Arc<DbStore>,
        events: Arc<EventStore>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            chain_id,
            live,
            db,
            events,
            state: Mutex::new(GenState::default()),
            shutdown,
        }
    }

    pub async fn generate_snapshot(self: Arc<Self>, params: Value) -> Result<Value, RpcError> {
        let params: GenerateParams = serde_json::from_value(params)
            .map_err(|err| RpcError::invalid(format!("invalid params: {err}")))?;
        let tail = match (params.transaction_index, params.log_index) {
            (Some(tx), Some(log)) => Some((tx, log)),
            (None, None) => None,
            _ => {
                return Err(RpcError::invalid(
                    "transactionIndex and logIndex must be given together",
                ));
            }
        };
        let snap_id = format_snapshot_id(self.chain_id, params.block_number, tail);

        {
            let mut state = self.state.lock().await;
            if state.generated.contains_key(&snap_id) {
                return Ok(json!(snap_id));
            }
            if state.generating.contains_key(&snap_id) {
                return Err(RpcError::generating());
            }
            let aborter = self.shutdown.child_token();
            state.generating.insert(snap_id.clone(), aborter.clone());
            Self::spawn_generation(
                Arc::clone(&self),
                snap_id.clone(),
                params.block_number,
                tail,
                aborter,
            );
        }
        Ok(json!(snap_id))
    }

    fn spawn_generation(
        handler: Arc<Self>,
        snap_id: String,
        block: u64,
        tail: Option<(u32, u32)>,
        aborter: CancellationToken,
    ) {
        let span = info_span!("generate_snapshot", id = %snap_id);
        tokio::spawn(
            async move {
                let to = match tail {
                    Some((tx, log)) => Position::new(block, tx, log),
                    None => Position::block_end(block),
                };
                let snapshots = handler.db.snapshots(handler.chain_id);
                let result =
                    get_snapshot(&handler.events, &snapshots, to, None, Some(&aborter)).await;

                let mut state = handler.state.lock().await;
                state.generating.remove(&snap_id);
                match result {
                    Ok((snapshot, position)) => {
                        info!(%position, "snapshot generated");
                        let generated = Arc::new(Generated { snapshot, position });
                        let actual_id = format_snapshot_id(
                            handler.chain_id,
                            position.block_number,
                            Some((position.transaction_index, position.log_index)),
                        );
                        if actual_id != snap_id {
                            state.generated.insert(actual_id, Arc::clone(&generated));
                        }
                        state.generated.insert(snap_id, generated);
                    }
                    Err(err) => warn!(?err, "snapshot generation failed"),
                }
            }
            .instrument(span),
        );
    }

    pub async fn clear_snapshot(&self, params: Value) -> Result<Value, RpcError> {
        let id = params
            .as_str()
            .ok_or_else(|| RpcError::invalid("snapshot id must be a string"))?;
        let mut state = self.state.lock().await;
        Ok(json!(state.generated.remove(id).is_some()))
    }

    pub async fn list_snapshots(&self) -> Result<Value, RpcError> {
        let state = self.state.lock().await;
        let mut out = serde_json::Map::new();
        for id in state.generated.keys() {
            let Some((chain_id, block, tail)) = parse_snapshot_id(id) else {
                continue;
            };
            let mut entry = serde_json::Map::new();
            entry.insert("chainId".to_string(), json!(chain_id));
            entry.insert("blockNumber".to_string(), json!(block));
            if let Some((tx, log)) = tail {
                entry.insert("transactionIndex".to_string(), json!(tx));
                entry.insert("logIndex".to_string(), json!(log));
            }
            out.insert(id.clone(), Value::Object(entry));
        }
        Ok(Value::Object(out))
    }

    pub async fn query_account(&self, params: Value) -> Result<Value, RpcError> {
        let params: QueryAccountParams = serde_json::from_value(params)
            .map_err(|err| RpcError::invalid(format!("invalid params: {err}")))?;
        self.with_snapshot(params.id.as_deref(), |snapshot| {
            let portfolio = snapshot
                .instrument(params.instrument)
                .ok_or_else(|| RpcError::not_found("instrument not found"))?
                .portfolio(params.address, params.expiry)
                .ok_or_else(|| RpcError::not_found("account not found"))?;
            serde_json::to_value(AccountView::from(portfolio))
                .map_err(|err| RpcError::new(crate::jsonrpc::INTERNAL_ERROR, err.to_string()))
        })
        .await
    }

    pub async fn query_amm(&self, params: Value) -> Result<Value, RpcError> {
        let params: QueryAmmParams = serde_json::from_value(params)
            .map_err(|err| RpcError::invalid(format!("invalid params: {err}")))?;
        self.with_snapshot(params.id.as_deref(), |snapshot| {
            let pair = snapshot
                .instrument(params.instrument)
                .ok_or_else(|| RpcError::not_found("instrument not found"))?
                .pair(params.expiry)
                .ok_or_else(|| RpcError::not_found("pair not found"))?;
            serde_json::to_value(AmmView::from(pair))
                .map_err(|err| RpcError::new(crate::jsonrpc::INTERNAL_ERROR, err.to_string()))
        })
        .await
    }

    /// Runs `read` against the live snapshot (no id) or a generated one.
    async fn with_snapshot<T>(
        &self,
        id: Option<&str>,
        read: impl FnOnce(&Snapshot) -> Result<T, RpcError>,
    ) -> Result<T, RpcError> {
        match id {
            None => {
                let live = self.live.read().await;
                if live.reorging {
                    return Err(RpcError::reorging());
                }
                match live.snapshot.as_ref() {
                    Some(snapshot) => read(snapshot),
                    None => Err(RpcError::unavailable()),
                }
            }
            Some(id) => {
                let generated = {
                    let state = self.state.lock().await;
                    if let Some(generated) = state.generated.get(id) {
                        Arc::clone(generated)
                    } else if state.generating.contains_key(id) {
                        return Err(RpcError::generating());
                    } else {
                        return Err(RpcError::not_found("snapshot not found"));
                    }
                };
                read(&generated.snapshot)
            }
        }
    }

    /// Reorg propagation: abort generations at or above the reorg block and
    /// evict invalidated generated snapshots.
    pub async fn on_reorged(&self, reorg_block: u64) {
        let mut state = self.state.lock().await;
        for (id, aborter) in &state.generating {
            if let Some((_, block, _)) = parse_snapshot_id(id)
                && block >= reorg_block
            {
                debug!(id, "aborting generation past reorg block");
                aborter.cancel();
            }
        }
        state.generated.retain(|id, _| {
            parse_snapshot_id(id).is_some_and(|(_, block, _)| block < reorg_block)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::U256;
    use indexer_core::abi::ParsedEvent;

    fn temp_handler() -> Arc<RequestHandler> {
        let dir = std::env::temp_dir().join("indexer-api-tests");
        std::fs::create_dir_all(&dir).expect("create temp dir");
        let unique = format!(
            "db-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0)
        );
        let db = Arc::new(DbStore::open(dir.join(unique)).expect("open temp store"));
        let events = Arc::new(db.events(81457));
        events.init().expect("init events");
        Arc::new(RequestHandler::new(
            81457,
            Arc::new(RwLock::new(LiveState::default())),
            db,
            events,
            CancellationToken::new(),
        ))
    }

    #[test]
    fn snapshot_id_wire_format() {
        assert_eq!(
            format_snapshot_id(81457, 2_737_538, Some((10, 23))),
            "81457-2737538-10-23"
        );
        assert_eq!(format_snapshot_id(81457, 100, None), "81457-100");
        assert_eq!(
            parse_snapshot_id("81457-2737538-10-23"),
            Some((81457, 2_737_538, Some((10, 23))))
        );
        assert_eq!(parse_snapshot_id("81457-100"), Some((81457, 100, None)));
        assert_eq!(parse_snapshot_id("81457"), None);
        assert_eq!(parse_snapshot_id("81457-x-1-2"), None);
    }

    #[tokio::test]
    async fn generate_requires_paired_indices() {
        let handler = temp_handler();
        let err = Arc::clone(&handler)
            .generate_snapshot(json!({"blockNumber": 100, "transactionIndex": 1}))
            .await
            .expect_err("unpaired indices");
        assert_eq!(err.code, crate::jsonrpc::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn generate_returns_wire_id() {
        let handler = temp_handler();
        let id = Arc::clone(&handler)
            .generate_snapshot(json!({
                "blockNumber": 2_737_538u64,
                "transactionIndex": 10,
                "logIndex": 23,
            }))
            .await
            .expect("start generation");
        assert_eq!(id, json!("81457-2737538-10-23"));
    }

    #[tokio::test]
    async fn live_queries_report_domain_states() {
        let handler = temp_handler();
        // Empty live state: unavailable.
        let err = handler
            .query_amm(json!({
                "instrument": "0x145dd1d046ae0ba1b9e4bd72974452ac12d66644",
                "expiry": 4294967295u32,
            }))
            .await
            .expect_err("no live snapshot");
        assert_eq!(err.code, crate::jsonrpc::UNAVAILABLE);

        {
            let live = handler.live.clone();
            let mut live = live.write().await;
            live.reorging = true;
        }
        let err = handler
            .query_amm(json!({
                "instrument": "0x145dd1d046ae0ba1b9e4bd72974452ac12d66644",
                "expiry": 4294967295u32,
            }))
            .await
            .expect_err("reorging");
        assert_eq!(err.code, crate::jsonrpc::REORGING);
    }

    #[tokio::test]
    async fn baseline_amm_query_over_live_snapshot() {
        let handler = temp_handler();
        let instrument: Address = "0x145dd1d046ae0ba1b9e4bd72974452ac12d66644"
            .parse()
            .expect("static address");
        {
            let mut snapshot = Snapshot::new();
            snapshot.apply(
                instrument,
                &ParsedEvent::UpdatePair {
                    expiry: u32::MAX,
                    timestamp: 1_700_000_000,
                    status: 1,
                    tick: 15_777,
                    sqrt_px96: U256::from(79_228_162_514u64),
                    liquidity: 11,
                    total_liquidity: 22,
                    involved_fund: 33,
                    open_interests: 44,
                    fee_index: 55,
                    protocol_fee: 66,
                    total_long: 77,
                    total_short: 88,
                    insurance_fund: 99,
                    mark: U256::from(1_800u64),
                },
            );
            let live = handler.live.clone();
            let mut live = live.write().await;
            live.snapshot = Some(snapshot);
            live.position = Position::new(100, 0, 0);
        }

        let amm = handler
            .query_amm(json!({
                "instrument": instrument,
                "expiry": 4294967295u32,
            }))
            .await
            .expect("query amm");
        assert_eq!(amm["status"], 1);
        assert_eq!(amm["tick"], 15_777);
        assert_eq!(amm["totalLiquidity"], "22");
        assert_eq!(amm.as_object().expect("object").len(), 18);
    }

    #[tokio::test]
    async fn reorg_evicts_generated_at_or_above_block() {
        let handler = temp_handler();
        {
            let mut state = handler.state.lock().await;
            for block in [950u64, 980, 1000] {
                state.generated.insert(
                    format_snapshot_id(81457, block, None),
                    Arc::new(Generated {
                        snapshot: Snapshot::new(),
                        position: Position::new(block, 0, 0),
                    }),
                );
            }
        }
        handler.on_reorged(980).await;
        let listed = handler.list_snapshots().await.expect("list");
        let ids: Vec<&String> = listed.as_object().expect("object").keys().collect();
        assert_eq!(ids, vec!["81457-950"]);
    }
}
