//! Pluggable signature verification for attestations.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::types::{KeyId, SignerId};

/// Validates a proof against a key's public bytes. `Err` carries the reason.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, public_key: &[u8], message: &[u8], proof: &[u8]) -> Result<(), String>;
}

/// Plain Ed25519 over the attestation digest.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, public_key: &[u8], message: &[u8], proof: &[u8]) -> Result<(), String> {
        let key_bytes: &[u8; 32] = public_key
            .try_into()
            .map_err(|_| format!("public key must be 32 bytes, got {}", public_key.len()))?;
        let pubkey = VerifyingKey::from_bytes(key_bytes)
            .map_err(|e| format!("Invalid public key: {e:?}"))?;

        let signature = Signature::from_slice(proof)
            .map_err(|e| format!("Invalid signature format: {e:?}"))?;

        pubkey
            .verify(message, &signature)
            .map_err(|e| format!("Signature verification failed: {e:?}"))
    }
}

/// Digest an attesting party signs: BLAKE3 over length-prefixed key, subject and signer.
pub fn attestation_message(key_id: &KeyId, subject_id: &str, signer: &SignerId) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"quorum-engine/attestation/v1");
    for part in [key_id.as_str(), subject_id, signer.as_str()] {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    *hasher.finalize().as_bytes()
}
