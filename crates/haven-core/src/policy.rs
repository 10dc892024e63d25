use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    /// Distinct targets per STORE / UNSTORE RPC.
    pub max_batch: usize,
    /// Concurrent RPC groups across all cafes.
    pub max_inflight: usize,
    /// Attempts before a request row goes FAILED.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub rpc_timeout_ms: u64,
    pub upload_timeout_ms: u64,
    /// Access tokens within this skew of expiry are refreshed up front.
    pub token_skew_ms: u64,
    pub nonce_ttl_ms: u64,
    /// Ingestion failures per mailbox message before quarantine.
    pub msg_max_attempts: u32,
    /// Network attempts before a deregistration falls back to local delete.
    pub deregister_attempts: u32,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_batch: 50,
            max_inflight: 5,
            max_attempts: 30,
            backoff_base_ms: 30_000,
            backoff_cap_ms: 3_600_000,
            rpc_timeout_ms: 30_000,
            upload_timeout_ms: 300_000,
            token_skew_ms: 30_000,
            nonce_ttl_ms: 300_000,
            msg_max_attempts: 3,
            deregister_attempts: 3,
        }
    }
}
