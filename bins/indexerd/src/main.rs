use std::fs::OpenOptions;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use eyre::{Result, WrapErr, eyre};
use structopt::StructOpt;
use structopt::clap::AppSettings;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::metadata::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use api_service::{ApiConfig, RequestHandler};
use config::ServiceConfig;
use indexer_core::abi::{config_topics, gate_topics, instrument_topics};
use indexer_core::block_cache::BlockCache;
use indexer_core::fetcher::LogFetcher;
use indexer_core::rpc::ChainRpc;
use indexer_core::subscriber::{SubscriberSettings, spawn_subscriber};
use sync_service::{
    ChainAddresses, ReorgDetectorConfig, SnapshotDriverConfig, SourceConfig, StorageConfig,
    spawn_reorg_detector, spawn_snapshot_driver, spawn_source, spawn_storage_processor,
};

#[derive(StructOpt)]
#[structopt(name = "indexerd", about = "self-hosted derivatives protocol indexer")]
enum Command {
    /// Runs the ingestion pipeline and the JSON-RPC API.
    #[structopt(setting = AppSettings::DisableHelpFlags)]
    Start(StartOptions),
}

#[derive(StructOpt)]
struct StartOptions {
    /// Network name (falls back to API_NETWORK).
    #[structopt(short = "n", long)]
    network: Option<String>,
    #[structopt(short = "p", long, default_value = "43210")]
    port: u16,
    #[structopt(short = "h", long, default_value = "0.0.0.0")]
    host: IpAddr,
    /// Console log level.
    #[structopt(short = "l", long, default_value = "info")]
    log_level: String,
    /// Fetch-mode only: no push subscription session.
    #[structopt(long)]
    disable_websocket: bool,
    /// Serve queries from the existing store without ingesting.
    #[structopt(long)]
    readonly: bool,
    /// Confirmation window in blocks.
    #[structopt(short = "m", long, default_value = "2")]
    confirmation: u64,
    /// Override for the first indexed block.
    #[structopt(short = "f", long)]
    from_block: Option<u64>,
    /// Snapshot persistence interval in blocks.
    #[structopt(short = "i", long, default_value = "1800")]
    interval: u64,
    /// Snapshot retention horizon in blocks.
    #[structopt(short = "o", long, default_value = "43200")]
    outdated: u64,
    #[structopt(long)]
    debug_log: Option<PathBuf>,
    #[structopt(long)]
    debug_level: Option<String>,
}

const DEFAULT_DEBUG_LEVEL: &str = "info,sync_service=debug,api_service=debug,indexer_core=debug";

/// Console layer filtered by `-l` (env overridable), plus an optional
/// logfmt file layer when `--debug-log` is given. Returns the non-blocking
/// writer guards, which must stay alive for the process lifetime.
fn init_tracing(opt: &StartOptions) -> Result<Vec<tracing_appender::non_blocking::WorkerGuard>> {
    let mut guards = Vec::with_capacity(2);

    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    guards.push(stdout_guard);
    let console_default = opt.log_level.parse().unwrap_or(LevelFilter::INFO);
    let console = tracing_subscriber::fmt::layer()
        .with_ansi(true)
        .with_writer(stdout_writer)
        .with_filter(
            EnvFilter::builder()
                .with_default_directive(console_default.into())
                .from_env_lossy(),
        );

    let file_layer = match &opt.debug_log {
        Some(path) => {
            let file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(path)
                .wrap_err("open debug log for writing")?;
            let (file_writer, file_guard) = tracing_appender::non_blocking(file);
            guards.push(file_guard);

            let directives = opt.debug_level.as_deref().unwrap_or(DEFAULT_DEBUG_LEVEL);
            let filter = EnvFilter::builder().parse(directives).unwrap_or_else(|error| {
                eprintln!("bad debug log filter ({error}), falling back to defaults");
                EnvFilter::new(DEFAULT_DEBUG_LEVEL)
            });
            let layer = tracing_logfmt::builder()
                .with_span_path(true)
                .with_span_name(false)
                .with_target(false)
                .with_level(false)
                .with_timestamp(true)
                .layer()
                .with_writer(file_writer)
                .with_filter(filter);
            Some(layer)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console)
        .init();
    Ok(guards)
}

#[tokio::main]
async fn main() -> Result<()> {
    let Command::Start(opt) = Command::from_args();

    let _log_guards = init_tracing(&opt)?;

    let network = match opt.network.clone() {
        Some(network) => network,
        None => std::env::var("API_NETWORK")
            .map_err(|_| eyre!("network not given and API_NETWORK unset"))?,
    };
    let mut cfg = ServiceConfig::from_env(&network).wrap_err("resolve configuration")?;
    cfg.host = opt.host;
    cfg.port = opt.port;
    cfg.readonly = opt.readonly;
    cfg.disable_websocket = opt.disable_websocket;
    cfg.ingest.confirmation = opt.confirmation;
    cfg.ingest.from_block = opt.from_block.or(cfg.ingest.from_block);
    cfg.snapshot.interval = opt.interval;
    cfg.snapshot.outdated = opt.outdated;

    run(cfg).await
}

async fn run(cfg: ServiceConfig) -> Result<()> {
    let chain_id = cfg.network.chain_id;
    let addresses = ChainAddresses {
        gate: cfg.network.gate,
        config: cfg.network.config,
    };
    info!(
        chain_id,
        network = cfg.network.name,
        readonly = cfg.readonly,
        "starting indexer"
    );

    let db = Arc::new(event_db::DbStore::open(cfg.db_dir.clone()).wrap_err("open event db")?);
    let events = Arc::new(db.events(chain_id));
    events.init().wrap_err("init event store")?;

    let cancel = CancellationToken::new();
    let live;
    let mut storage_handle = None;
    let mut reorged_rx = None;
    // Keeps the readonly driver's input open so its worker idles.
    let mut _readonly_parsed_tx = None;

    if cfg.readonly {
        // Queries only: materialize the live snapshot from the store once.
        let (parsed_tx, parsed_rx) = mpsc::channel(1);
        _readonly_parsed_tx = Some(parsed_tx);
        let driver = spawn_snapshot_driver(
            SnapshotDriverConfig {
                chain_id,
                interval: cfg.snapshot.interval,
                outdated: cfg.snapshot.outdated,
            },
            Arc::clone(&db),
            Arc::clone(&events),
            parsed_rx,
            cancel.child_token(),
        );
        live = driver.live();
    } else {
        let rpc = Arc::new(
            ChainRpc::connect(&cfg.rpc_url, chain_id)
                .await
                .wrap_err("connect chain rpc")?,
        );
        let fetcher = Arc::new(LogFetcher::new(Arc::clone(&rpc), cfg.ingest.parallel));
        let blocks = Arc::new(BlockCache::new(Arc::clone(&rpc)));

        fetcher.subscribe(addresses.gate, gate_topics()).await;
        fetcher.subscribe(addresses.config, config_topics()).await;
        for instrument in db.instruments(chain_id).list().wrap_err("list instruments")? {
            fetcher
                .subscribe(instrument.address, instrument_topics())
                .await;
        }

        let subscriber = match (&cfg.wss_url, cfg.disable_websocket) {
            (Some(wss_url), false) => {
                let (event_tx, event_rx) = mpsc::channel(4096);
                let handle = spawn_subscriber(
                    wss_url.clone(),
                    SubscriberSettings {
                        keep_alive_interval: cfg.subscriber.keep_alive_interval,
                        keep_alive_timeout: cfg.subscriber.keep_alive_timeout,
                        reconnect_delay: cfg.subscriber.reconnect_delay,
                        request_timeout: cfg.subscriber.request_timeout,
                    },
                    event_tx,
                    cancel.child_token(),
                );
                handle.subscribe_logs(addresses.gate, gate_topics()).await;
                handle
                    .subscribe_logs(addresses.config, config_topics())
                    .await;
                for instrument in db.instruments(chain_id).list().wrap_err("list instruments")? {
                    handle
                        .subscribe_logs(instrument.address, instrument_topics())
                        .await;
                }
                Some((handle, event_rx))
            }
            _ => None,
        };

        let (source, log_rx) = spawn_source(
            SourceConfig {
                chain_id,
                addresses,
                initial_block: cfg.initial_block(),
                confirmation: cfg.ingest.confirmation,
                batch_size: cfg.ingest.batch_size,
                threshold: cfg.ingest.threshold,
                poll_interval: std::time::Duration::from_secs(10),
            },
            Arc::clone(&rpc),
            Arc::clone(&fetcher),
            subscriber,
            Arc::clone(&events),
            cancel.child_token(),
        );

        let (parsed_tx, parsed_rx) = mpsc::channel(1024);
        let storage = spawn_storage_processor(
            StorageConfig {
                chain_id,
                addresses,
            },
            Arc::clone(&db),
            Arc::clone(&events),
            log_rx,
            parsed_tx,
            cancel.child_token(),
        );

        let driver = spawn_snapshot_driver(
            SnapshotDriverConfig {
                chain_id,
                interval: cfg.snapshot.interval,
                outdated: cfg.snapshot.outdated,
            },
            Arc::clone(&db),
            Arc::clone(&events),
            parsed_rx,
            cancel.child_token(),
        );
        live = driver.live();

        let (reorged_tx, rx) = broadcast::channel(16);
        reorged_rx = Some(rx);
        spawn_reorg_detector(
            ReorgDetectorConfig {
                chain_id,
                addresses,
                span: cfg.reorg.span,
                delay: cfg.reorg.delay,
                interval: cfg.reorg.interval,
            },
            Arc::clone(&db),
            Arc::clone(&events),
            fetcher,
            blocks,
            storage.clone(),
            driver,
            reorged_tx,
            source.synced_rx.clone(),
            cancel.child_token(),
        );
        storage_handle = Some(storage);
    }

    let handler = Arc::new(RequestHandler::new(
        chain_id,
        live,
        Arc::clone(&db),
        Arc::clone(&events),
        cancel.child_token(),
    ));

    let api = tokio::spawn(api_service::serve(
        ApiConfig::new(cfg.host, cfg.port),
        handler,
        storage_handle,
        reorged_rx,
        cancel.clone(),
    ));

    tokio::signal::ctrl_c().await.wrap_err("wait for ctrl-c")?;
    info!("shutdown requested");
    cancel.cancel();
    api.await.wrap_err("join api server")?.wrap_err("api server failed")?;
    Ok(())
}
