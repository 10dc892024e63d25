pub mod inbox_tests;
pub mod queue_tests;
pub mod session_tests;

use crate::config::CoreConfig;
use crate::objects::MemoryObjects;
use crate::policy::Policy;
use crate::threads::MemoryThreads;
use crate::time::ManualClock;
use crate::transport::MemoryCafe;
use crate::Node;
use haven_store::StaticKey;
use std::sync::Arc;
use uuid::Uuid;

pub fn temp_path(label: &str) -> String {
    format!(
        "{}/haven-{}-{}",
        std::env::temp_dir().display(),
        label,
        Uuid::new_v4()
    )
}

pub fn base_config(path: String) -> CoreConfig {
    CoreConfig {
        storage_path: path,
        namespace: "test".to_string(),
        // Background loops stay off; tests drive flush and check_mail.
        dispatch_interval_ms: 0,
        polling_interval_ms: 0,
    }
}

pub fn fast_policy() -> Policy {
    Policy {
        backoff_base_ms: 30_000,
        backoff_cap_ms: 3_600_000,
        rpc_timeout_ms: 2_000,
        upload_timeout_ms: 2_000,
        ..Policy::default()
    }
}

pub struct Harness {
    pub node: Arc<Node>,
    pub cafe: MemoryCafe,
    pub cafe_id: String,
    pub clock: Arc<ManualClock>,
    pub objects: Arc<MemoryObjects>,
    pub threads: Arc<MemoryThreads>,
}

pub async fn harness(label: &str) -> Harness {
    harness_with_policy(label, fast_policy()).await
}

pub async fn harness_with_policy(label: &str, policy: Policy) -> Harness {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let cafe = MemoryCafe::new(clock.clone());
    let cafe_id = cafe.add_cafe("token-1").await;
    let objects = Arc::new(MemoryObjects::new());
    let threads = Arc::new(MemoryThreads::new());
    let node = Node::init(
        base_config(temp_path(label)),
        policy,
        Arc::new(StaticKey(vec![7u8; 32])),
        clock.clone(),
        Arc::new(cafe.clone()),
        objects.clone(),
        threads.clone(),
    )
    .await
    .expect("node");
    Harness {
        node,
        cafe,
        cafe_id,
        clock,
        objects,
        threads,
    }
}

impl Harness {
    pub async fn register(&self) {
        self.node
            .cafe_register(&self.cafe_id, "token-1")
            .await
            .expect("register");
    }

    pub fn cafes(&self) -> Vec<String> {
        vec![self.cafe_id.clone()]
    }
}
