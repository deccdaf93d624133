//! `quorum` command line driver.

mod script;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use ed25519_dalek::{Signer, SigningKey};
use quorum_engine::ledger::{Ledger, LedgerReceipt, LedgerSubmission};
use quorum_engine::logging::init_logging;
use quorum_engine::mpc::TransactionCoordinator;
use quorum_engine::store::StoreMode;
use quorum_engine::verify::attestation_message;
use quorum_engine::{Collaborators, Engine, EngineConfig, KeyId, OperationType, SignerId, TxId};
use serde_json::json;
use tracing::info;

#[derive(Parser)]
#[command(name = "quorum", version = "0.1", about = "Threshold wallet and attestation engine")]
struct Cli {
    /// JSON engine config; missing fields take defaults
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, help = "Store mode: memory | sealed")]
    store: Option<String>,

    #[arg(long)]
    log_dir: Option<String>,

    /// Write the log file as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the built-in supply-chain walkthrough
    Scenario,
    /// Execute a JSON list of operations in order
    Run {
        #[arg(short, long)]
        script: PathBuf,
    },
}

/// Ledger stand-in that logs each submission and confirms it immediately.
struct LoggingLedger;

#[async_trait]
impl Ledger for LoggingLedger {
    async fn submit(&self, submission: &LedgerSubmission) -> Result<LedgerReceipt, String> {
        info!(
            wallet = %submission.wallet_id,
            nonce = submission.nonce,
            op = %submission.operation_type,
            to = %submission.to,
            value = submission.value,
            "Ledger submission"
        );
        Ok(LedgerReceipt {
            reference: format!("local-{}-{}", submission.wallet_id, submission.nonce),
        })
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(mode) = cli.store.as_deref() {
        config.store_mode = match mode {
            "memory" => StoreMode::Memory,
            "sealed" => StoreMode::Sealed,
            other => bail!("unknown store mode: {other}"),
        };
    }
    if let Some(dir) = &cli.log_dir {
        config.log_dir = dir.clone();
    }
    if cli.json_logs {
        config.log_json = true;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let _guard = init_logging(&config)?;

    let engine = Engine::start(config, Collaborators::with_ledger(Arc::new(LoggingLedger)))?;

    match cli.command {
        Commands::Scenario => run_scenario(engine).await,
        Commands::Run { script } => {
            let raw = std::fs::read_to_string(&script)
                .with_context(|| format!("reading script {}", script.display()))?;
            let steps: Vec<script::Step> = serde_json::from_str(&raw)
                .with_context(|| format!("parsing script {}", script.display()))?;
            script::run(engine, steps).await
        }
    }
}

fn signer(name: &str) -> SignerId {
    SignerId::from(name)
}

/// Wallet A/B/C (2-of-3) mints a batch, then two of three inspectors attest it.
async fn run_scenario(engine: Engine) -> anyhow::Result<()> {
    let wallet = engine
        .wallets
        .create_wallet(vec![signer("A"), signer("B"), signer("C")], 2)?;
    let tx_id = engine.coordinator.propose_transaction(
        &wallet,
        &signer("A"),
        "warehouse-7",
        5,
        OperationType::Mint,
        b"batch-42".to_vec(),
    )?;
    let executed = engine.coordinator.sign_transaction(&tx_id, &signer("B"))?;
    println!("{}", serde_json::to_string_pretty(&executed)?);

    let inspector_key = SigningKey::from_bytes(&[42u8; 32]);
    let key_id = KeyId::from("inspection");
    engine.keys.create_key(
        key_id.clone(),
        inspector_key.verifying_key().to_bytes().to_vec(),
        2,
        vec![signer("P1"), signer("P2"), signer("P3")],
        "product-authenticity",
    )?;
    for party in ["P1", "P2"] {
        let party = signer(party);
        let proof = inspector_key.sign(&attestation_message(&key_id, "batch-42", &party));
        let verified = engine
            .verification
            .attest(&key_id, "batch-42", &party, &proof.to_bytes())?;
        println!("{}", json!({ "attested_by": party, "verified": verified }));
    }

    let coordinator = engine.coordinator.clone();
    settle(&coordinator, &tx_id).await;
    engine.shutdown().await;

    let final_state = coordinator.get_transaction(&tx_id)?;
    println!(
        "{}",
        json!({ "tx_id": final_state.tx_id, "submission": final_state.submission })
    );
    Ok(())
}

/// Wait briefly for the dispatcher to move the transaction out of `Queued`.
pub(crate) async fn settle(coordinator: &TransactionCoordinator, tx_id: &TxId) {
    for _ in 0..50 {
        match coordinator.get_transaction(tx_id) {
            Ok(tx) if !tx.awaiting_submission() => return,
            Ok(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            Err(_) => return,
        }
    }
}
