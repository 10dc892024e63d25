use crate::error::CoreError;
use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use ed25519_dalek::VerifyingKey;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use x25519_dalek::{PublicKey, StaticSecret};

const HEAD_CONTEXT: &[u8] = b"haven:thread-head:v1";

/// Seam to the thread log engine. The queue asks it to encrypt a thread
/// head for a cafe; the inbox poller feeds it inbound mail.
#[async_trait]
pub trait Threads: Send + Sync {
    async fn handle_block(&self, ciphertext: &[u8]) -> Result<(), CoreError>;
    async fn receive_invite(&self, ciphertext: &[u8]) -> Result<(), CoreError>;
    async fn encrypt_head(
        &self,
        thread_id: &str,
        cafe_key: &VerifyingKey,
    ) -> Result<Vec<u8>, CoreError>;
}

/// Sealed box for a thread head: ephemeral x25519 against the cafe's key
/// (its ed25519 identity mapped to the montgomery curve), hkdf-sha256, then
/// XChaCha20-Poly1305. Layout: ephemeral pub (32) || nonce (24) || ciphertext.
pub fn seal_head(head: &[u8], cafe_key: &VerifyingKey) -> Result<Vec<u8>, CoreError> {
    let cafe_public = PublicKey::from(cafe_key.to_montgomery().to_bytes());
    let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let shared = secret.diffie_hellman(&cafe_public).to_bytes();
    let hkdf = Hkdf::<Sha256>::new(None, &shared);
    let mut key = [0u8; 32];
    hkdf.expand(HEAD_CONTEXT, &mut key)
        .map_err(|_| CoreError::Crypto)?;
    let mut nonce = [0u8; 24];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    let cipher = XChaCha20Poly1305::new_from_slice(&key).map_err(|_| CoreError::Crypto)?;
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), head)
        .map_err(|_| CoreError::Crypto)?;
    let ephemeral = PublicKey::from(&secret).to_bytes();
    let mut out = Vec::with_capacity(32 + 24 + ciphertext.len());
    out.extend_from_slice(&ephemeral);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

#[derive(Clone, Default)]
pub struct MemoryThreads {
    heads: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    blocks: Arc<Mutex<Vec<Vec<u8>>>>,
    invites: Arc<Mutex<Vec<Vec<u8>>>>,
    fail_blocks: Arc<AtomicU32>,
}

impl MemoryThreads {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_head(&self, thread_id: &str, head: Vec<u8>) {
        self.heads.lock().await.insert(thread_id.to_string(), head);
    }

    /// Fail the next `n` block ingestions with a crypto error.
    pub fn fail_next_blocks(&self, n: u32) {
        self.fail_blocks.store(n, Ordering::SeqCst);
    }

    pub async fn blocks(&self) -> Vec<Vec<u8>> {
        self.blocks.lock().await.clone()
    }

    pub async fn invites(&self) -> Vec<Vec<u8>> {
        self.invites.lock().await.clone()
    }
}

#[async_trait]
impl Threads for MemoryThreads {
    async fn handle_block(&self, ciphertext: &[u8]) -> Result<(), CoreError> {
        let pending = self.fail_blocks.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_blocks.store(pending - 1, Ordering::SeqCst);
            return Err(CoreError::Crypto);
        }
        self.blocks.lock().await.push(ciphertext.to_vec());
        Ok(())
    }

    async fn receive_invite(&self, ciphertext: &[u8]) -> Result<(), CoreError> {
        self.invites.lock().await.push(ciphertext.to_vec());
        Ok(())
    }

    async fn encrypt_head(
        &self,
        thread_id: &str,
        cafe_key: &VerifyingKey,
    ) -> Result<Vec<u8>, CoreError> {
        let heads = self.heads.lock().await;
        let head = heads.get(thread_id).ok_or(CoreError::NotFound)?;
        seal_head(head, cafe_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    #[test]
    fn sealed_head_has_framing() {
        let cafe = SigningKey::from_bytes(&[3u8; 32]);
        let sealed = seal_head(b"head-cid", &cafe.verifying_key()).unwrap();
        // ephemeral key, nonce, then at least the poly1305 tag
        assert!(sealed.len() >= 32 + 24 + 16);
    }

    #[test]
    fn sealed_heads_are_randomized() {
        let cafe = SigningKey::from_bytes(&[4u8; 32]);
        let a = seal_head(b"head-cid", &cafe.verifying_key()).unwrap();
        let b = seal_head(b"head-cid", &cafe.verifying_key()).unwrap();
        assert_ne!(a, b);
    }
}
