use crate::client::CafeClient;
use crate::error::CoreError;
use crate::event::{EventBus, NodeEvent};
use crate::identity::verifying_key_for;
use crate::objects::ObjectSource;
use crate::policy::Policy;
use crate::threads::Threads;
use crate::time::Clock;
use haven_store::Datastore;
use haven_wire::{DeliverMessage, MailKind};
use log::{debug, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    Store,
    Unstore,
    StoreThread,
    UnstoreThread,
    Inbox,
    PublishPeer,
}

impl RequestKind {
    /// Kinds that cancel each other out when enqueued for the same target.
    pub fn opposite(&self) -> Option<RequestKind> {
        match self {
            RequestKind::Store => Some(RequestKind::Unstore),
            RequestKind::Unstore => Some(RequestKind::Store),
            RequestKind::StoreThread => Some(RequestKind::UnstoreThread),
            RequestKind::UnstoreThread => Some(RequestKind::StoreThread),
            _ => None,
        }
    }

    fn batches(&self) -> bool {
        matches!(self, RequestKind::Store | RequestKind::Unstore)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    Pending,
    InFlight,
    Failed,
}

/// A durable intent to perform one cafe-directed action on one target.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CafeRequest {
    pub id: String,
    pub target_id: String,
    pub cafe_id: String,
    pub kind: RequestKind,
    pub created_at_ms: u64,
    pub attempts: u32,
    pub status: RequestStatus,
}

#[derive(Clone)]
pub struct RequestStore {
    store: Arc<Mutex<Datastore>>,
}

impl RequestStore {
    pub fn new(store: Arc<Mutex<Datastore>>) -> Self {
        Self { store }
    }

    pub async fn put(&self, request: &CafeRequest) -> Result<(), CoreError> {
        let bytes = serde_json::to_vec(request).map_err(|_| CoreError::Storage)?;
        let mut guard = self.store.lock().await;
        guard
            .put(&Self::key(&request.id), &bytes)
            .map_err(|_| CoreError::Storage)
    }

    pub async fn delete(&self, id: &str) -> Result<(), CoreError> {
        let mut guard = self.store.lock().await;
        guard.delete(&Self::key(id)).map_err(|_| CoreError::Storage)
    }

    /// All rows in id (creation) order.
    pub async fn list(&self) -> Result<Vec<CafeRequest>, CoreError> {
        let guard = self.store.lock().await;
        let mut rows = Vec::new();
        for (_, bytes) in guard.scan_prefix("request:") {
            let row = serde_json::from_slice(&bytes).map_err(|_| CoreError::Storage)?;
            rows.push(row);
        }
        Ok(rows)
    }

    pub async fn find_pending(
        &self,
        target_id: &str,
        cafe_id: &str,
        kind: RequestKind,
    ) -> Result<Option<CafeRequest>, CoreError> {
        let rows = self.list().await?;
        Ok(rows.into_iter().find(|r| {
            r.status == RequestStatus::Pending
                && r.target_id == target_id
                && r.cafe_id == cafe_id
                && r.kind == kind
        }))
    }

    fn key(id: &str) -> String {
        format!("request:{}", id)
    }
}

/// Durable producer/consumer between upstream components and the cafe
/// client. `put` is the only producer entry point; a single dispatcher
/// drains rows in bounded-parallel batches.
pub struct RequestQueue {
    store: RequestStore,
    client: Arc<CafeClient>,
    objects: Arc<dyn ObjectSource>,
    threads: Arc<dyn Threads>,
    policy: Policy,
    clock: Arc<dyn Clock>,
    events: EventBus,
    // Scheduled next-attempt times; rebuilt lazily from row state after a
    // restart, so it is a cache, never the source of truth.
    next_attempt: Mutex<HashMap<String, u64>>,
    pass_lock: Mutex<()>,
    inflight: Arc<Semaphore>,
    cancel: CancellationToken,
    seq: AtomicU64,
}

impl RequestQueue {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: RequestStore,
        client: Arc<CafeClient>,
        objects: Arc<dyn ObjectSource>,
        threads: Arc<dyn Threads>,
        policy: Policy,
        clock: Arc<dyn Clock>,
        events: EventBus,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let inflight = Arc::new(Semaphore::new(policy.max_inflight));
        Arc::new(Self {
            store,
            client,
            objects,
            threads,
            policy,
            clock,
            events,
            next_attempt: Mutex::new(HashMap::new()),
            pass_lock: Mutex::new(()),
            inflight,
            cancel,
            seq: AtomicU64::new(0),
        })
    }

    /// Upsert one row per cafe. Duplicates coalesce; a STORE meeting a
    /// pending UNSTORE (and vice versa, and the thread pair) cancels both
    /// sides. Durable before returning.
    pub async fn put(
        &self,
        kind: RequestKind,
        target_id: &str,
        cafe_ids: &[String],
    ) -> Result<(), CoreError> {
        if target_id.is_empty() {
            return Err(CoreError::Malformed("empty target".to_string()));
        }
        for cafe_id in cafe_ids {
            if let Some(opposite) = kind.opposite() {
                if let Some(row) = self
                    .store
                    .find_pending(target_id, cafe_id, opposite)
                    .await?
                {
                    self.store.delete(&row.id).await?;
                    self.next_attempt.lock().await.remove(&row.id);
                    continue;
                }
            }
            if self
                .store
                .find_pending(target_id, cafe_id, kind)
                .await?
                .is_some()
            {
                continue;
            }
            let row = CafeRequest {
                id: self.next_id(),
                target_id: target_id.to_string(),
                cafe_id: cafe_id.clone(),
                kind,
                created_at_ms: self.clock.now_ms(),
                attempts: 0,
                status: RequestStatus::Pending,
            };
            self.store.put(&row).await?;
        }
        Ok(())
    }

    /// Dispatcher loop; returns once the queue is stopped.
    pub async fn run(self: &Arc<Self>, interval_ms: u64) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(std::time::Duration::from_millis(interval_ms)) => {
                    if let Err(err) = self.flush().await {
                        warn!("dispatch pass failed: {}", err);
                    }
                }
            }
        }
    }

    /// One dispatch pass: pick up every due pending row, group, dispatch,
    /// settle. Passes are serialized; flush callers wait their turn.
    pub async fn flush(self: &Arc<Self>) -> Result<(), CoreError> {
        let _pass = self.pass_lock.lock().await;
        let rows = self.store.list().await?;
        // A row stuck IN_FLIGHT here survived a crash or an aborted pass;
        // put it back in play without charging an attempt.
        for row in rows.iter().filter(|r| r.status == RequestStatus::InFlight) {
            let mut revived = row.clone();
            revived.status = RequestStatus::Pending;
            self.store.put(&revived).await?;
        }
        let now = self.clock.now_ms();
        let rows = self.store.list().await?;
        let mut due: Vec<CafeRequest> = Vec::new();
        {
            let mut schedule = self.next_attempt.lock().await;
            for row in rows
                .into_iter()
                .filter(|r| r.status == RequestStatus::Pending)
            {
                if row.attempts == 0 {
                    due.push(row);
                    continue;
                }
                match schedule.get(&row.id) {
                    Some(at) if *at <= now => {
                        schedule.remove(&row.id);
                        due.push(row);
                    }
                    Some(_) => {}
                    None => {
                        schedule.insert(row.id.clone(), now + self.backoff_ms(row.attempts));
                    }
                }
            }
        }
        let mut by_cafe: HashMap<String, Vec<CafeRequest>> = HashMap::new();
        for row in due {
            by_cafe.entry(row.cafe_id.clone()).or_default().push(row);
        }
        let mut tasks = Vec::new();
        for (cafe_id, rows) in by_cafe {
            let queue = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                queue.dispatch_cafe(cafe_id, rows).await;
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn pending(&self) -> Result<Vec<CafeRequest>, CoreError> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|r| r.status != RequestStatus::Failed)
            .collect())
    }

    /// Terminal rows, kept so operators can see what is stuck.
    pub async fn failed(&self) -> Result<Vec<CafeRequest>, CoreError> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|r| r.status == RequestStatus::Failed)
            .collect())
    }

    /// Put a failed row back in play with a clean attempt count.
    pub async fn retry(&self, id: &str) -> Result<(), CoreError> {
        let rows = self.store.list().await?;
        let row = rows
            .into_iter()
            .find(|r| r.id == id)
            .ok_or(CoreError::NotFound)?;
        let revived = CafeRequest {
            attempts: 0,
            status: RequestStatus::Pending,
            ..row
        };
        self.store.put(&revived).await
    }

    // One cafe's share of the pass. Units run strictly one after another,
    // which is what keeps at most one RPC in flight per cafe.
    async fn dispatch_cafe(self: Arc<Self>, cafe_id: String, rows: Vec<CafeRequest>) {
        let mut grouped: HashMap<RequestKind, Vec<CafeRequest>> = HashMap::new();
        let mut order: Vec<RequestKind> = Vec::new();
        for row in rows {
            if !grouped.contains_key(&row.kind) {
                order.push(row.kind);
            }
            grouped.entry(row.kind).or_default().push(row);
        }
        for kind in order {
            let rows = match grouped.remove(&kind) {
                Some(rows) => rows,
                None => continue,
            };
            if kind.batches() {
                for batch in rows.chunks(self.policy.max_batch) {
                    self.dispatch_unit(&cafe_id, kind, batch.to_vec()).await;
                }
            } else {
                for row in rows {
                    self.dispatch_unit(&cafe_id, kind, vec![row]).await;
                }
            }
        }
    }

    async fn dispatch_unit(&self, cafe_id: &str, kind: RequestKind, rows: Vec<CafeRequest>) {
        if self.cancel.is_cancelled() {
            self.revert(&rows).await;
            return;
        }
        let permit = match self.inflight.acquire().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        for row in &rows {
            let mut inflight = row.clone();
            inflight.status = RequestStatus::InFlight;
            if self.store.put(&inflight).await.is_err() {
                return;
            }
        }
        let result = match kind {
            RequestKind::Store => self.unit_store(cafe_id, &rows).await,
            RequestKind::Unstore => self.unit_unstore(cafe_id, &rows).await,
            RequestKind::StoreThread => self.unit_store_thread(cafe_id, &rows[0]).await,
            RequestKind::UnstoreThread => self.unit_unstore_thread(cafe_id, &rows[0]).await,
            RequestKind::PublishPeer => self.unit_publish_peer(cafe_id, &rows[0]).await,
            RequestKind::Inbox => self.unit_inbox(cafe_id, &rows[0]).await,
        };
        drop(permit);
        if let Err(err) = result {
            warn!("dispatch unit for {} hit storage trouble: {}", cafe_id, err);
        }
    }

    async fn unit_store(&self, cafe_id: &str, rows: &[CafeRequest]) -> Result<(), CoreError> {
        let mut uploaded: Vec<CafeRequest> = Vec::new();
        for row in rows {
            let bytes = match self.objects.get(&row.target_id).await {
                Ok(bytes) => bytes,
                Err(CoreError::NotFound) => {
                    self.drop_malformed(row).await?;
                    continue;
                }
                Err(_) => {
                    self.bump(row.clone()).await?;
                    continue;
                }
            };
            match self.client.upload_object(cafe_id, &row.target_id, bytes).await {
                Ok(()) => uploaded.push(row.clone()),
                Err(CoreError::Stopped) => {
                    let mut remaining = uploaded;
                    remaining.push(row.clone());
                    self.revert(&remaining).await;
                    return Ok(());
                }
                Err(err) if err.is_unauthorized() => {
                    return self.fail_cafe(cafe_id).await;
                }
                Err(err) => {
                    debug!("upload of {} to {} failed: {}", row.target_id, cafe_id, err);
                    self.bump(row.clone()).await?;
                }
            }
        }
        if uploaded.is_empty() {
            return Ok(());
        }
        let cids: Vec<String> = uploaded.iter().map(|r| r.target_id.clone()).collect();
        match self.client.store(cafe_id, &cids).await {
            Ok(outcome) => {
                for row in uploaded {
                    if outcome.acked.contains(&row.target_id) {
                        self.complete(&row).await?;
                    } else {
                        self.bump(row).await?;
                    }
                }
                Ok(())
            }
            Err(CoreError::Stopped) => {
                self.revert(&uploaded).await;
                Ok(())
            }
            Err(err) if err.is_unauthorized() => self.fail_cafe(cafe_id).await,
            Err(err) => {
                debug!("store to {} failed: {}", cafe_id, err);
                for row in uploaded {
                    self.bump(row).await?;
                }
                Ok(())
            }
        }
    }

    async fn unit_unstore(&self, cafe_id: &str, rows: &[CafeRequest]) -> Result<(), CoreError> {
        let cids: Vec<String> = rows.iter().map(|r| r.target_id.clone()).collect();
        match self.client.unstore(cafe_id, &cids).await {
            Ok(acked) => {
                for row in rows {
                    if acked.contains(&row.target_id) {
                        self.complete(row).await?;
                    } else {
                        self.bump(row.clone()).await?;
                    }
                }
                Ok(())
            }
            Err(CoreError::Stopped) => {
                self.revert(rows).await;
                Ok(())
            }
            Err(err) if err.is_unauthorized() => self.fail_cafe(cafe_id).await,
            Err(err) => {
                debug!("unstore to {} failed: {}", cafe_id, err);
                for row in rows {
                    self.bump(row.clone()).await?;
                }
                Ok(())
            }
        }
    }

    async fn unit_store_thread(&self, cafe_id: &str, row: &CafeRequest) -> Result<(), CoreError> {
        let cafe_key = match verifying_key_for(cafe_id) {
            Ok(key) => key,
            Err(_) => return self.drop_malformed(row).await,
        };
        let ciphertext = match self.threads.encrypt_head(&row.target_id, &cafe_key).await {
            Ok(ciphertext) => ciphertext,
            Err(CoreError::NotFound) => return self.drop_malformed(row).await,
            Err(_) => return self.bump(row.clone()).await,
        };
        let result = self
            .client
            .store_thread(cafe_id, &row.target_id, ciphertext)
            .await;
        self.settle(cafe_id, row, result).await
    }

    async fn unit_unstore_thread(
        &self,
        cafe_id: &str,
        row: &CafeRequest,
    ) -> Result<(), CoreError> {
        let result = self.client.unstore_thread(cafe_id, &row.target_id).await;
        self.settle(cafe_id, row, result).await
    }

    async fn unit_publish_peer(&self, cafe_id: &str, row: &CafeRequest) -> Result<(), CoreError> {
        let peer = self.client.address().as_bytes().to_vec();
        let result = self.client.publish_peer(cafe_id, peer).await;
        self.settle(cafe_id, row, result).await
    }

    // Inbox targets are "recipient:block-cid": deliver the block into the
    // recipient's mailbox at their cafe. One-way; transport acceptance
    // completes the row.
    async fn unit_inbox(&self, cafe_id: &str, row: &CafeRequest) -> Result<(), CoreError> {
        let Some((recipient, cid)) = row.target_id.split_once(':') else {
            return self.drop_malformed(row).await;
        };
        let block = match self.objects.get(cid).await {
            Ok(block) => block,
            Err(CoreError::NotFound) => return self.drop_malformed(row).await,
            Err(_) => return self.bump(row.clone()).await,
        };
        let delivery = DeliverMessage {
            id: cid.to_string(),
            client: recipient.to_string(),
            kind: MailKind::Block,
            block,
        };
        let result = self.client.deliver_mail(cafe_id, delivery).await;
        self.settle(cafe_id, row, result).await
    }

    async fn settle(
        &self,
        cafe_id: &str,
        row: &CafeRequest,
        result: Result<(), CoreError>,
    ) -> Result<(), CoreError> {
        match result {
            Ok(()) => self.complete(row).await,
            Err(CoreError::Stopped) => {
                self.revert(std::slice::from_ref(row)).await;
                Ok(())
            }
            Err(err) if err.is_unauthorized() => self.fail_cafe(cafe_id).await,
            Err(err) => {
                debug!(
                    "{:?} for {} against {} failed: {}",
                    row.kind, row.target_id, cafe_id, err
                );
                self.bump(row.clone()).await
            }
        }
    }

    async fn complete(&self, row: &CafeRequest) -> Result<(), CoreError> {
        self.store.delete(&row.id).await?;
        self.next_attempt.lock().await.remove(&row.id);
        Ok(())
    }

    async fn bump(&self, mut row: CafeRequest) -> Result<(), CoreError> {
        row.attempts += 1;
        if row.attempts >= self.policy.max_attempts {
            row.status = RequestStatus::Failed;
            self.store.put(&row).await?;
            self.next_attempt.lock().await.remove(&row.id);
            self.events.publish(NodeEvent::RequestFailed {
                id: row.id,
                cafe_id: row.cafe_id,
                kind: row.kind,
            });
            return Ok(());
        }
        row.status = RequestStatus::Pending;
        let next = self.clock.now_ms() + self.backoff_ms(row.attempts);
        self.store.put(&row).await?;
        self.next_attempt.lock().await.insert(row.id, next);
        Ok(())
    }

    async fn revert(&self, rows: &[CafeRequest]) {
        for row in rows {
            let mut reverted = row.clone();
            reverted.status = RequestStatus::Pending;
            if let Err(err) = self.store.put(&reverted).await {
                warn!("could not revert request {}: {}", row.id, err);
            }
        }
    }

    /// The whole cafe is unauthorized: every live row for it is stuck
    /// until someone re-registers, so fail them now and say so.
    async fn fail_cafe(&self, cafe_id: &str) -> Result<(), CoreError> {
        let rows = self.store.list().await?;
        for row in rows
            .into_iter()
            .filter(|r| r.cafe_id == cafe_id && r.status != RequestStatus::Failed)
        {
            let mut failed = row.clone();
            failed.status = RequestStatus::Failed;
            self.store.put(&failed).await?;
            self.next_attempt.lock().await.remove(&row.id);
            self.events.publish(NodeEvent::RequestFailed {
                id: row.id,
                cafe_id: row.cafe_id,
                kind: row.kind,
            });
        }
        Ok(())
    }

    async fn drop_malformed(&self, row: &CafeRequest) -> Result<(), CoreError> {
        warn!(
            "dropping malformed {:?} request for {}",
            row.kind, row.target_id
        );
        self.complete(row).await
    }

    fn backoff_ms(&self, attempts: u32) -> u64 {
        let exponent = attempts.saturating_sub(1).min(16);
        let base = self
            .policy
            .backoff_base_ms
            .saturating_mul(1u64 << exponent);
        let capped = base.min(self.policy.backoff_cap_ms);
        // ±20 % jitter
        let span = capped / 5;
        let low = capped.saturating_sub(span);
        rand::thread_rng().gen_range(low..=capped.saturating_add(span))
    }

    fn next_id(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{:016x}{:06x}", self.clock.now_ms(), seq)
    }
}
