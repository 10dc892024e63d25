use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    pub storage_path: String,
    pub namespace: String,
    /// Dispatcher pass cadence. 0 disables the background dispatcher; the
    /// embedder then drives the queue with `flush` (mobile mode).
    pub dispatch_interval_ms: u64,
    /// Mailbox poll cadence. 0 disables the poller loop.
    pub polling_interval_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            storage_path: ".haven".to_string(),
            namespace: "default".to_string(),
            dispatch_interval_ms: 500,
            polling_interval_ms: 600_000,
        }
    }
}
