//! JSON operation scripts for `quorum run`.
//!
//! A script is an array of steps tagged by `op`. Wallets and transactions are
//! referred to by aliases chosen in the script; keys use their real ids. A key
//! created with `seed` remembers its signing key so `attest` steps may omit
//! the proof.

use std::collections::HashMap;

use anyhow::{Context, anyhow, bail};
use chrono::{Duration, Utc};
use ed25519_dalek::{Signer, SigningKey};
use quorum_engine::verify::attestation_message;
use quorum_engine::{Engine, KeyId, OperationType, QuorumError, SignerId, TxId, WalletId};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;

use crate::settle;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Step {
    CreateWallet {
        alias: String,
        signers: Vec<SignerId>,
        threshold: u32,
    },
    CreateKey {
        key_id: KeyId,
        /// Hex public key. Ignored when `seed` is given.
        public_key: Option<String>,
        /// Every byte of the 32-byte Ed25519 seed.
        seed: Option<u8>,
        threshold: u32,
        parties: Vec<SignerId>,
        #[serde(default)]
        purpose: String,
    },
    Propose {
        alias: String,
        wallet: String,
        proposer: SignerId,
        to: String,
        value: u64,
        operation: OperationType,
        /// Hex payload.
        #[serde(default)]
        payload: String,
    },
    Sign {
        tx: String,
        signer: SignerId,
    },
    Reject {
        tx: String,
        signer: SignerId,
    },
    /// Expire everything older than the configured TTL as of now + `advance_secs`.
    Expire {
        #[serde(default)]
        advance_secs: i64,
    },
    Attest {
        key_id: KeyId,
        subject: String,
        signer: SignerId,
        /// Hex proof; derived from the key's seed when omitted.
        proof: Option<String>,
    },
    Status {
        wallet: Option<String>,
        tx: Option<String>,
    },
}

impl Step {
    fn name(&self) -> &'static str {
        match self {
            Step::CreateWallet { .. } => "create-wallet",
            Step::CreateKey { .. } => "create-key",
            Step::Propose { .. } => "propose",
            Step::Sign { .. } => "sign",
            Step::Reject { .. } => "reject",
            Step::Expire { .. } => "expire",
            Step::Attest { .. } => "attest",
            Step::Status { .. } => "status",
        }
    }
}

#[derive(Default)]
struct Aliases {
    wallets: HashMap<String, WalletId>,
    txs: HashMap<String, TxId>,
    seeds: HashMap<KeyId, SigningKey>,
}

impl Aliases {
    fn wallet(&self, alias: &str) -> anyhow::Result<&WalletId> {
        self.wallets
            .get(alias)
            .ok_or_else(|| anyhow!("unknown wallet alias '{alias}'"))
    }

    fn tx(&self, alias: &str) -> anyhow::Result<&TxId> {
        self.txs
            .get(alias)
            .ok_or_else(|| anyhow!("unknown transaction alias '{alias}'"))
    }
}

/// Run every step, printing one JSON line per outcome. Caller errors are
/// reported and the script continues; anything else aborts it.
pub async fn run(engine: Engine, steps: Vec<Step>) -> anyhow::Result<()> {
    let mut aliases = Aliases::default();
    let mut executed = Vec::new();

    for (index, step) in steps.into_iter().enumerate() {
        let op = step.name();
        match apply(&engine, &mut aliases, step) {
            Ok((result, newly_executed)) => {
                executed.extend(newly_executed);
                println!("{}", json!({ "step": index, "op": op, "ok": true, "result": result }));
            }
            Err(e) => {
                let caller_error = e
                    .downcast_ref::<QuorumError>()
                    .is_none_or(QuorumError::is_caller_error);
                println!("{}", json!({ "step": index, "op": op, "ok": false, "error": e.to_string() }));
                if !caller_error {
                    engine.shutdown().await;
                    return Err(e.context(format!("step {index} ({op}) failed")));
                }
                warn!(step = index, op, "Script step failed: {e}");
            }
        }
    }

    let coordinator = engine.coordinator.clone();
    for tx_id in &executed {
        settle(&coordinator, tx_id).await;
    }
    engine.shutdown().await;

    for tx_id in &executed {
        let tx = coordinator.get_transaction(tx_id)?;
        println!(
            "{}",
            json!({ "tx_id": tx.tx_id, "nonce": tx.executed_nonce, "submission": tx.submission })
        );
    }
    Ok(())
}

/// Returns the step's JSON result and any transaction it executed.
fn apply(engine: &Engine, aliases: &mut Aliases, step: Step) -> anyhow::Result<(Value, Vec<TxId>)> {
    let mut executed = Vec::new();

    let result = match step {
        Step::CreateWallet {
            alias,
            signers,
            threshold,
        } => {
            let wallet_id = engine.wallets.create_wallet(signers, threshold)?;
            aliases.wallets.insert(alias, wallet_id.clone());
            json!({ "wallet_id": wallet_id })
        }
        Step::CreateKey {
            key_id,
            public_key,
            seed,
            threshold,
            parties,
            purpose,
        } => {
            let public_key = match (seed, public_key) {
                (Some(byte), _) => {
                    let signing = SigningKey::from_bytes(&[byte; 32]);
                    let bytes = signing.verifying_key().to_bytes().to_vec();
                    aliases.seeds.insert(key_id.clone(), signing);
                    bytes
                }
                (None, Some(hex_key)) => hex::decode(&hex_key).context("public_key is not hex")?,
                (None, None) => bail!("create-key needs either public_key or seed"),
            };
            let key = engine
                .keys
                .create_key(key_id, public_key, threshold, parties, &purpose)?;
            serde_json::to_value(key)?
        }
        Step::Propose {
            alias,
            wallet,
            proposer,
            to,
            value,
            operation,
            payload,
        } => {
            let wallet_id = aliases.wallet(&wallet)?.clone();
            let payload = hex::decode(&payload).context("payload is not hex")?;
            let tx_id = engine
                .coordinator
                .propose_transaction(&wallet_id, &proposer, &to, value, operation, payload)?;
            let tx = engine.coordinator.get_transaction(&tx_id)?;
            if tx.executed_nonce.is_some() {
                executed.push(tx_id.clone());
            }
            aliases.txs.insert(alias, tx_id);
            serde_json::to_value(tx)?
        }
        Step::Sign { tx, signer } => {
            let tx_id = aliases.tx(&tx)?;
            let tx = engine.coordinator.sign_transaction(tx_id, &signer)?;
            if tx.executed_nonce.is_some() {
                executed.push(tx.tx_id.clone());
            }
            serde_json::to_value(tx)?
        }
        Step::Reject { tx, signer } => {
            let tx_id = aliases.tx(&tx)?;
            serde_json::to_value(engine.coordinator.reject_transaction(tx_id, &signer)?)?
        }
        Step::Expire { advance_secs } => {
            let expired = engine
                .coordinator
                .expire_stale(Utc::now() + Duration::seconds(advance_secs))?;
            json!({ "expired": expired })
        }
        Step::Attest {
            key_id,
            subject,
            signer,
            proof,
        } => {
            let proof = match (proof, aliases.seeds.get(&key_id)) {
                (Some(hex_proof), _) => hex::decode(&hex_proof).context("proof is not hex")?,
                (None, Some(signing)) => signing
                    .sign(&attestation_message(&key_id, &subject, &signer))
                    .to_bytes()
                    .to_vec(),
                (None, None) => bail!("attest needs a proof for key {key_id}"),
            };
            let verified = engine.verification.attest(&key_id, &subject, &signer, &proof)?;
            json!({ "verified": verified })
        }
        Step::Status { wallet, tx } => {
            let mut status = serde_json::Map::new();
            if let Some(alias) = wallet {
                let wallet_id = aliases.wallet(&alias)?;
                let pending = engine
                    .coordinator
                    .list_pending(wallet_id)?
                    .iter()
                    .map(|tx| tx.map(|tx| tx.tx_id))
                    .collect::<Result<Vec<_>, _>>()?;
                status.insert("wallet".into(), serde_json::to_value(engine.wallets.get_wallet(wallet_id)?)?);
                status.insert("pending".into(), json!(pending));
            }
            if let Some(alias) = tx {
                let tx_id = aliases.tx(&alias)?;
                status.insert("transaction".into(), serde_json::to_value(engine.coordinator.get_transaction(tx_id)?)?);
            }
            Value::Object(status)
        }
    };
    Ok((result, executed))
}
