use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{QuorumError, Result};
use crate::store::memory::MemoryBackend;
use crate::store::{Mutation, RawRecord, StoreBackend, Table};

const NONCE_LEN: usize = 12;

/// Backend that seals every record with AES-256-GCM before handing it to the
/// inner store. The key is generated per process and never leaves this struct,
/// so sealed rows only outlive the process inside a real enclave-backed store.
pub struct SealedBackend {
    inner: MemoryBackend,
    cipher: Aes256Gcm,
}

impl Default for SealedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SealedBackend {
    pub fn new() -> Self {
        let mut key = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(&mut key[..]);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..]));

        SealedBackend {
            inner: MemoryBackend::new(),
            cipher,
        }
    }

    /// Output layout: nonce (12 bytes) followed by ciphertext.
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| QuorumError::Crypto(format!("Encryption failed: {e:?}")))?;

        let mut sealed = nonce_bytes.to_vec();
        sealed.extend(ciphertext);
        Ok(sealed)
    }

    fn unseal(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(QuorumError::Crypto("Invalid sealed data".into()));
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| QuorumError::Crypto(format!("Decryption failed: {e:?}")))
    }

    /// Raw row as stored, for checking that nothing is kept in the clear.
    pub fn sealed_bytes(&self, table: Table, id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.get(table, id)?.map(|r| r.bytes))
    }
}

impl StoreBackend for SealedBackend {
    fn get(&self, table: Table, id: &str) -> Result<Option<RawRecord>> {
        match self.inner.get(table, id)? {
            Some(raw) => Ok(Some(RawRecord {
                version: raw.version,
                bytes: self.unseal(&raw.bytes)?,
            })),
            None => Ok(None),
        }
    }

    fn ids(&self, table: Table) -> Result<Vec<String>> {
        self.inner.ids(table)
    }

    fn apply(&self, batch: Vec<Mutation>) -> Result<()> {
        let sealed = batch
            .into_iter()
            .map(|m| match m {
                Mutation::Insert { table, id, bytes } => Ok(Mutation::Insert {
                    table,
                    id,
                    bytes: self.seal(&bytes)?,
                }),
                Mutation::Swap {
                    table,
                    id,
                    expected_version,
                    bytes,
                } => Ok(Mutation::Swap {
                    table,
                    id,
                    expected_version,
                    bytes: self.seal(&bytes)?,
                }),
            })
            .collect::<Result<Vec<_>>>()?;
        self.inner.apply(sealed)
    }
}
