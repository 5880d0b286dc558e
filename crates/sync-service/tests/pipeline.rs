use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256, U256};
use alloy::sol_types::SolEvent;
use alloy_rpc_types_eth::Log;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use event_db::DbStore;
use indexer_core::abi;
use sync_service::{
    ChainAddresses, SnapshotDriverConfig, StorageConfig, spawn_snapshot_driver,
    spawn_storage_processor,
};

const CHAIN_ID: u64 = 81457;

fn temp_db() -> Arc<DbStore> {
    let dir = std::env::temp_dir().join("indexer-pipeline-tests");
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

fn gate() -> Address {
    Address::with_last_byte(1)
}

fn instrument() -> Address {
    Address::with_last_byte(7)
}

fn chain_log(address: Address, data: alloy::primitives::LogData, block: u64, index: u64) -> Log {
    let mut log = Log::default();
    log.inner = alloy::primitives::Log { address, data };
    log.block_number = Some(block);
    log.block_hash = Some(B256::with_last_byte(0xaa));
    log.transaction_hash = Some(B256::repeat_byte(block as u8).into());
    log.transaction_index = Some(0);
    log.log_index = Some(index);
    log
}

fn new_instrument_log(block: u64) -> Log {
    let ev = abi::NewInstrument {
        index: B256::with_last_byte(1),
        instrument: instrument(),
        base: Address::with_last_byte(3),
        quote: Address::with_last_byte(4),
        symbol: "ETH-USDB-PERP".to_string(),
        total: U256::from(1u64),
    };
    chain_log(gate(), ev.encode_log_data(), block, 0)
}

fn update_pair_log(block: u64, tick: i32) -> Log {
    let ev = abi::UpdatePair {
        expiry: u32::MAX,
        timestamp: 1_700_000_000,
        status: 1,
        tick,
        sqrtPX96: alloy::primitives::aliases::U160::from(1u64),
        liquidity: 10,
        totalLiquidity: 20,
        involvedFund: 30,
        openInterests: 40,
        feeIndex: 50,
        protocolFee: 60,
        totalLong: 70,
        totalShort: 80,
        insuranceFund: 90,
        mark: U256::from(1_800u64),
    };
    chain_log(instrument(), ev.encode_log_data(), block, 0)
}

#[tokio::test]
async fn logs_flow_through_storage_into_live_snapshot() {
    let db = temp_db();
    let events = Arc::new(db.events(CHAIN_ID));
    events.init().expect("init events");

    let (log_tx, log_rx) = mpsc::channel(128);
    let (parsed_tx, parsed_rx) = mpsc::channel(128);
    let cancel = CancellationToken::new();

    let storage = spawn_storage_processor(
        StorageConfig {
            chain_id: CHAIN_ID,
            addresses: ChainAddresses {
                gate: gate(),
                config: Address::with_last_byte(2),
            },
        },
        Arc::clone(&db),
        Arc::clone(&events),
        log_rx,
        parsed_tx,
        cancel.child_token(),
    );
    let driver = spawn_snapshot_driver(
        SnapshotDriverConfig {
            chain_id: CHAIN_ID,
            interval: 1800,
            outdated: 43_200,
        },
        Arc::clone(&db),
        Arc::clone(&events),
        parsed_rx,
        cancel.child_token(),
    );

    log_tx
        .send(new_instrument_log(100))
        .await
        .expect("send discovery log");
    log_tx
        .send(update_pair_log(101, 15_777))
        .await
        .expect("send pair log");

    let live = driver.live();
    let mut settled = false;
    for _ in 0..200 {
        if live.read().await.position.block_number == 101 {
            settled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(settled, "pipeline did not settle in time");

    {
        let live = live.read().await;
        let snapshot = live.snapshot.as_ref().expect("live snapshot");
        let pair = snapshot
            .instrument(instrument())
            .expect("instrument state")
            .pair(u32::MAX)
            .expect("pair state");
        assert_eq!(pair.tick, 15_777);
        assert_eq!(pair.total_liquidity, 20);
    }

    // Both events landed in the store, in order, and the instrument row
    // exists.
    assert_eq!(events.total_size(), 2);
    assert!(
        db.instruments(CHAIN_ID)
            .get(instrument())
            .expect("lookup")
            .is_some()
    );
    assert_eq!(*storage.stored_block_rx.borrow(), 101);

    cancel.cancel();
}

#[tokio::test]
async fn storage_block_holds_new_batches() {
    let db = temp_db();
    let events = Arc::new(db.events(CHAIN_ID));
    events.init().expect("init events");

    let (log_tx, log_rx) = mpsc::channel(128);
    let (parsed_tx, mut parsed_rx) = mpsc::channel(128);
    let cancel = CancellationToken::new();

    let storage = spawn_storage_processor(
        StorageConfig {
            chain_id: CHAIN_ID,
            addresses: ChainAddresses {
                gate: gate(),
                config: Address::with_last_byte(2),
            },
        },
        Arc::clone(&db),
        Arc::clone(&events),
        log_rx,
        parsed_tx,
        cancel.child_token(),
    );

    let guard = storage.block().await.expect("block processor");
    log_tx
        .send(new_instrument_log(100))
        .await
        .expect("send log");

    // While blocked, nothing reaches the fan-out.
    assert!(
        tokio::time::timeout(Duration::from_millis(200), parsed_rx.recv())
            .await
            .is_err()
    );

    guard.release();
    let event = tokio::time::timeout(Duration::from_secs(2), parsed_rx.recv())
        .await
        .expect("released in time")
        .expect("event emitted");
    assert_eq!(event.position.block_number, 100);

    cancel.cancel();
}
