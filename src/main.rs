//! Wishfund Engine
//!
//! Run modes:
//!   cargo run                    - Show usage
//!   cargo run -- serve           - Start REST API with monitor and sweeper
//!   cargo run -- config          - Print the resolved configuration

use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use wishfund::api;
use wishfund::chain::{ChainClient, EsploraClient, MemoryChain, RetryingChainClient};
use wishfund::common::{init_from_config, ChainBackend, WishfundConfig};
use wishfund::lifecycle::{
    event_channel, ClaimSweeper, ContractLifecycle, LifecycleSettings, SystemClock,
    TextCarrierScanner,
};
use wishfund::monitor::TransactionMonitor;
use wishfund::psbt::{FundingProvider, StaticFundingProvider};
use wishfund::storage::open_store;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return;
    }

    match args[1].as_str() {
        "serve" => run_server(&args[2..]).await,
        "config" => match WishfundConfig::from_env() {
            Ok(config) => config.print_summary(),
            Err(e) => {
                eprintln!("Configuration error: {}", e);
                std::process::exit(1);
            }
        },
        _ => print_usage(),
    }
}

fn print_usage() {
    println!("Wishfund Engine - Settlement Verification and Contract Lifecycle");
    println!();
    println!("Usage:");
    println!("  wishfund serve [--port <port>]    Start REST API, monitor and sweeper");
    println!("  wishfund config                   Print the resolved configuration");
    println!();
    println!("Environment Variables:");
    println!("  WISHFUND_NETWORK          mainnet | testnet | signet | regtest | devnet");
    println!("  WISHFUND_CHAIN_BACKEND    esplora | memory (memory on devnet)");
    println!("  WISHFUND_BITCOIN_API      Esplora endpoint (defaults per network)");
    println!("  WISHFUND_DB_PATH          SQLite file; in-memory store when unset");
    println!("  WISHFUND_API_PORT         REST API port (default: 3001)");
    println!("  WISHFUND_CLAIM_TTL_SECS   Claim lifetime (default: 3600)");
    println!("  WISHFUND_FUNDING_MODE     escrow | commitment");
    println!("  WISHFUND_LOG_LEVEL        trace | debug | info | warn | error");
}

async fn run_server(args: &[String]) {
    let mut config = match WishfundConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    // Parse arguments
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--port" if i + 1 < args.len() => {
                config.api_port = args[i + 1].parse().unwrap_or(config.api_port);
                i += 2;
            }
            _ => i += 1,
        }
    }

    if let Err(e) = init_from_config(&config) {
        eprintln!("Failed to initialize logging: {}", e);
    }
    config.print_summary();

    let (chain, funding): (Arc<dyn ChainClient>, Arc<dyn FundingProvider>) = match config.chain_backend {
        ChainBackend::Memory => {
            let chain: Arc<dyn ChainClient> = Arc::new(MemoryChain::new());
            let funding: Arc<dyn FundingProvider> = Arc::new(StaticFundingProvider::new());
            (chain, funding)
        }
        ChainBackend::Esplora => {
            let esplora = match EsploraClient::new(&config.bitcoin_api, config.request_timeout()) {
                Ok(client) => Arc::new(client),
                Err(e) => {
                    eprintln!("Failed to create Esplora client: {}", e);
                    std::process::exit(1);
                }
            };
            let inner: Arc<dyn ChainClient> = esplora.clone();
            let chain: Arc<dyn ChainClient> =
                Arc::new(RetryingChainClient::new(inner, config.retry.clone(), config.request_timeout()));
            let funding: Arc<dyn FundingProvider> = esplora;
            (chain, funding)
        }
    };

    let store = match open_store(config.db_path.as_deref()) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Failed to open store: {}", e);
            std::process::exit(1);
        }
    };

    let (events_tx, events_rx) = event_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let clock = Arc::new(SystemClock);

    let monitor = Arc::new(TransactionMonitor::new(chain.clone(), events_tx.clone(), config.reorg_watch_blocks));
    let sweeper = Arc::new(ClaimSweeper::new(store.clone(), clock.clone(), events_tx));
    let service = Arc::new(ContractLifecycle::new(
        store,
        chain,
        monitor.clone(),
        funding,
        Arc::new(TextCarrierScanner),
        clock,
        LifecycleSettings::from_config(&config),
    ));

    let mut tasks = vec![
        tokio::spawn(monitor.run(Duration::from_secs(config.poll_interval_secs), shutdown_rx.clone())),
        tokio::spawn(sweeper.run(Duration::from_secs(config.sweep_interval_secs), shutdown_rx.clone())),
        tokio::spawn(service.clone().run_events(events_rx, shutdown_rx)),
    ];

    let server = api::start_server(service, config.api_port);
    tokio::select! {
        result = server => {
            if let Err(e) = result {
                eprintln!("API server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown requested");
        }
    }

    let _ = shutdown_tx.send(true);
    for task in tasks.drain(..) {
        let _ = task.await;
    }
}
