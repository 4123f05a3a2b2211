use std::{env, fs::File, path::Path, sync::Arc};

use tracing_subscriber::EnvFilter;

use interbank_ledger::{
    bank::Bank,
    config::BankConfig,
    dlq::StdErrDLQ,
    domain::SettlementPeer,
    engine::Engine,
    ingestion::CsvReader,
    ledger::LedgerStore,
    output_repository::CsvOutput,
    peer::LocalPeer,
};

#[tokio::main] // using Tokio runtime for async
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout carries the report, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = BankConfig::from_env()?;

    let mut args = env::args();
    let file_path = args.nth(1).ok_or("No command line argument was provided")?;
    let file = File::open(Path::new(&file_path))?;

    // Every configured peer runs in-process on its own ledger
    let mut peers: Vec<Arc<dyn SettlementPeer>> = Vec::new();
    let mut peer_ledgers = Vec::new();
    for peer in &config.peers {
        let ledger = Arc::new(LedgerStore::new());
        peers.push(Arc::new(LocalPeer::new(peer.code.clone(), ledger.clone())));
        peer_ledgers.push((peer.code.clone(), ledger));
    }

    let bank_code = config.bank_code.clone();
    let bank = Bank::new(config, peers).await?;

    let ingestion = CsvReader::new(file, bank_code)?;
    let output = CsvOutput::stdout();
    let dlq = StdErrDLQ::default();

    // Initialize engine with injected components
    let mut engine = peer_ledgers
        .into_iter()
        .fold(Engine::new(ingestion, output, dlq, bank), |engine, (code, ledger)| {
            engine.with_peer_ledger(code, ledger)
        });

    engine.process().await?;
    engine.bank().verify().await?;
    engine.flush().await?;

    Ok(())
}
