pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod identity;
pub mod inbox;
pub mod objects;
pub mod policy;
pub mod queue;
pub mod session;
pub mod threads;
pub mod time;
pub mod transport;

#[cfg(test)]
mod tests;

use client::CafeClient;
use config::CoreConfig;
use error::CoreError;
use event::{EventBus, EventReceiver};
use haven_store::{Datastore, KeyProvider};
use identity::LocalIdentity;
use inbox::InboxPoller;
use objects::ObjectSource;
use policy::Policy;
use queue::{CafeRequest, RequestKind, RequestQueue, RequestStore};
use session::{NonceStore, Session, SessionStore};
use std::sync::Arc;
use threads::Threads;
use time::Clock;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use transport::CafeTransport;

/// One personal-data node. Instantiable: every collaborator is injected,
/// and two nodes in one process share nothing but what they are given.
pub struct Node {
    config: CoreConfig,
    identity: LocalIdentity,
    client: Arc<CafeClient>,
    queue: Arc<RequestQueue>,
    inbox: Arc<InboxPoller>,
    events: EventBus,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    pub async fn init(
        config: CoreConfig,
        policy: Policy,
        key_provider: Arc<dyn KeyProvider>,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn CafeTransport>,
        objects: Arc<dyn ObjectSource>,
        threads: Arc<dyn Threads>,
    ) -> Result<Arc<Self>, CoreError> {
        let mut store = Datastore::open(
            &config.storage_path,
            &config.namespace,
            key_provider.as_ref(),
        )
        .map_err(|_| CoreError::Storage)?;
        let identity = LocalIdentity::load_or_create(&mut store)?;
        let store = Arc::new(Mutex::new(store));
        let events = EventBus::new(256);
        let cancel = CancellationToken::new();
        let client = Arc::new(CafeClient::new(
            transport.clone(),
            identity.clone(),
            SessionStore::new(store.clone()),
            NonceStore::new(store.clone()),
            policy.clone(),
            clock.clone(),
            events.clone(),
            cancel.clone(),
        ));
        let queue = RequestQueue::new(
            RequestStore::new(store.clone()),
            client.clone(),
            objects.clone(),
            threads.clone(),
            policy.clone(),
            clock.clone(),
            events.clone(),
            cancel.clone(),
        );
        let inbox = InboxPoller::new(
            client.clone(),
            threads,
            objects,
            transport,
            store,
            policy,
            events.clone(),
            cancel.clone(),
        );
        Ok(Arc::new(Self {
            config,
            identity,
            client,
            queue,
            inbox,
            events,
            cancel,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Spawn the background loops the config asks for. A zero interval
    /// leaves that loop to the embedder (`flush` / `check_mail`).
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        if self.config.dispatch_interval_ms > 0 {
            let queue = self.queue.clone();
            let interval = self.config.dispatch_interval_ms;
            tasks.push(tokio::spawn(async move {
                queue.run(interval).await;
            }));
        }
        if self.config.polling_interval_ms > 0 {
            let inbox = self.inbox.clone();
            let interval = self.config.polling_interval_ms;
            tasks.push(tokio::spawn(async move {
                inbox.run(interval).await;
            }));
        }
    }

    /// Cooperative shutdown: cancel every RPC, wait for the loops.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
    }

    pub fn address(&self) -> &str {
        self.identity.address()
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub async fn cafe_register(&self, cafe_id: &str, token: &str) -> Result<Session, CoreError> {
        self.client.register(cafe_id, token).await
    }

    pub async fn cafe_deregister(&self, cafe_id: &str) -> Result<(), CoreError> {
        self.client.deregister(cafe_id).await
    }

    pub async fn cafe_sessions(&self) -> Result<Vec<Session>, CoreError> {
        self.client.sessions().await
    }

    pub async fn cafe_session(&self, cafe_id: &str) -> Result<Option<Session>, CoreError> {
        self.client.session(cafe_id).await
    }

    pub async fn put_request(
        &self,
        kind: RequestKind,
        target_id: &str,
        cafe_ids: &[String],
    ) -> Result<(), CoreError> {
        self.queue.put(kind, target_id, cafe_ids).await
    }

    pub async fn store(&self, cid: &str, cafe_ids: &[String]) -> Result<(), CoreError> {
        self.put_request(RequestKind::Store, cid, cafe_ids).await
    }

    pub async fn unstore(&self, cid: &str, cafe_ids: &[String]) -> Result<(), CoreError> {
        self.put_request(RequestKind::Unstore, cid, cafe_ids).await
    }

    pub async fn store_thread(
        &self,
        thread_id: &str,
        cafe_ids: &[String],
    ) -> Result<(), CoreError> {
        self.put_request(RequestKind::StoreThread, thread_id, cafe_ids)
            .await
    }

    pub async fn unstore_thread(
        &self,
        thread_id: &str,
        cafe_ids: &[String],
    ) -> Result<(), CoreError> {
        self.put_request(RequestKind::UnstoreThread, thread_id, cafe_ids)
            .await
    }

    pub async fn publish_peer(&self, cafe_ids: &[String]) -> Result<(), CoreError> {
        let address = self.identity.address().to_string();
        self.put_request(RequestKind::PublishPeer, &address, cafe_ids)
            .await
    }

    /// Queue a block for delivery into a contact's mailbox at their cafe.
    pub async fn deliver_to_inbox(
        &self,
        recipient: &str,
        cid: &str,
        cafe_ids: &[String],
    ) -> Result<(), CoreError> {
        let target = format!("{}:{}", recipient, cid);
        self.put_request(RequestKind::Inbox, &target, cafe_ids).await
    }

    /// Drain the request queue once; the mobile-friendly alternative to
    /// the background dispatcher.
    pub async fn flush(&self) -> Result<(), CoreError> {
        self.queue.flush().await
    }

    pub async fn check_mail(&self) -> Result<(), CoreError> {
        self.inbox.check_now().await
    }

    pub async fn pending_requests(&self) -> Result<Vec<CafeRequest>, CoreError> {
        self.queue.pending().await
    }

    pub async fn failed_requests(&self) -> Result<Vec<CafeRequest>, CoreError> {
        self.queue.failed().await
    }

    pub async fn retry_request(&self, id: &str) -> Result<(), CoreError> {
        self.queue.retry(id).await
    }
}
