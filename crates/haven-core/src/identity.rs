use crate::error::CoreError;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use haven_store::Datastore;
use serde::{Deserialize, Serialize};

/// The node's long-term account keypair. The hex verifying key doubles as
/// the account address; cafes use the same addressing, so an address is
/// always enough to verify an envelope.
#[derive(Clone)]
pub struct LocalIdentity {
    signing: SigningKey,
    address: String,
}

#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    secret: Vec<u8>,
}

impl LocalIdentity {
    pub fn load_or_create(store: &mut Datastore) -> Result<Self, CoreError> {
        if let Some(bytes) = store.get("identity") {
            let stored: StoredIdentity =
                serde_json::from_slice(&bytes).map_err(|_| CoreError::Storage)?;
            let secret: [u8; 32] = stored
                .secret
                .as_slice()
                .try_into()
                .map_err(|_| CoreError::Storage)?;
            return Ok(Self::from_signing(SigningKey::from_bytes(&secret)));
        }
        let identity = Self::from_signing(SigningKey::generate(&mut rand::rngs::OsRng));
        let stored = StoredIdentity {
            secret: identity.signing.to_bytes().to_vec(),
        };
        let bytes = serde_json::to_vec(&stored).map_err(|_| CoreError::Storage)?;
        store.put("identity", &bytes).map_err(|_| CoreError::Storage)?;
        Ok(identity)
    }

    pub fn from_signing(signing: SigningKey) -> Self {
        let address = hex::encode(signing.verifying_key().to_bytes());
        Self { signing, address }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn sign(&self, bytes: &[u8]) -> Vec<u8> {
        self.signing.sign(bytes).to_bytes().to_vec()
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }
}

/// Resolve a peer address back to its verification key.
pub fn verifying_key_for(address: &str) -> Result<VerifyingKey, CoreError> {
    let bytes = hex::decode(address).map_err(|_| CoreError::Malformed(address.to_string()))?;
    let bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| CoreError::Malformed(address.to_string()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| CoreError::Malformed(address.to_string()))
}
