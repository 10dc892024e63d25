use crate::client::CafeClient;
use crate::error::CoreError;
use crate::event::{EventBus, NodeEvent};
use crate::objects::ObjectSource;
use crate::policy::Policy;
use crate::threads::Threads;
use crate::transport::CafeTransport;
use haven_store::Datastore;
use haven_wire::MailKind;
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Pulls held mail from every session-held cafe, hands it to the thread
/// engine and acks deletion. Runs on an interval and on YOU_HAVE_MAIL
/// pushes; a poll already in progress short-circuits a concurrent trigger.
pub struct InboxPoller {
    client: Arc<CafeClient>,
    threads: Arc<dyn Threads>,
    objects: Arc<dyn ObjectSource>,
    transport: Arc<dyn CafeTransport>,
    store: Arc<Mutex<Datastore>>,
    policy: Policy,
    events: EventBus,
    busy: Mutex<HashSet<String>>,
    attempts: Mutex<HashMap<String, u32>>,
    cancel: CancellationToken,
}

impl InboxPoller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<CafeClient>,
        threads: Arc<dyn Threads>,
        objects: Arc<dyn ObjectSource>,
        transport: Arc<dyn CafeTransport>,
        store: Arc<Mutex<Datastore>>,
        policy: Policy,
        events: EventBus,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            threads,
            objects,
            transport,
            store,
            policy,
            events,
            busy: Mutex::new(HashSet::new()),
            attempts: Mutex::new(HashMap::new()),
            cancel,
        })
    }

    pub async fn run(self: &Arc<Self>, interval_ms: u64) {
        let mut mail = self.transport.subscribe_mail();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(std::time::Duration::from_millis(interval_ms)) => {
                    if let Err(err) = self.check_now().await {
                        debug!("inbox sweep failed: {}", err);
                    }
                }
                pushed = mail.recv() => {
                    if let Ok(cafe_id) = pushed {
                        if let Err(err) = self.check_cafe(&cafe_id).await {
                            debug!("inbox check for {} failed: {}", cafe_id, err);
                        }
                    }
                }
            }
        }
    }

    /// Sweep every cafe we hold a session with.
    pub async fn check_now(&self) -> Result<(), CoreError> {
        let sessions = self.client.sessions().await?;
        for session in sessions {
            if let Err(err) = self.check_cafe(&session.cafe_id).await {
                debug!("inbox check for {} failed: {}", session.cafe_id, err);
            }
        }
        Ok(())
    }

    pub async fn check_cafe(&self, cafe_id: &str) -> Result<(), CoreError> {
        {
            let mut busy = self.busy.lock().await;
            if !busy.insert(cafe_id.to_string()) {
                return Ok(());
            }
        }
        let result = self.check_cafe_inner(cafe_id).await;
        self.busy.lock().await.remove(cafe_id);
        result
    }

    async fn check_cafe_inner(&self, cafe_id: &str) -> Result<(), CoreError> {
        let since_ms = self.watermark(cafe_id).await;
        let messages = self.client.check_messages(cafe_id, since_ms).await?;
        if messages.is_empty() {
            return Ok(());
        }
        let mut ingested: Vec<String> = Vec::new();
        let mut left_behind = false;
        let mut high_water = since_ms;
        for message in messages {
            let handled = match message.kind {
                MailKind::Block => self.threads.handle_block(&message.block).await,
                MailKind::Invite => self.threads.receive_invite(&message.block).await,
            };
            match handled {
                Ok(()) => {
                    if let Err(err) = self.objects.pin(&message.id).await {
                        debug!("pin of {} failed: {}", message.id, err);
                    }
                    self.attempts.lock().await.remove(&message.id);
                    ingested.push(message.id);
                    high_water = high_water.max(message.date_ms);
                }
                Err(err) => {
                    let mut attempts = self.attempts.lock().await;
                    let count = attempts.entry(message.id.clone()).or_insert(0);
                    *count += 1;
                    if *count >= self.policy.msg_max_attempts {
                        // A message that keeps poisoning ingestion gets
                        // deleted with the batch so it cannot wedge the
                        // mailbox behind it.
                        warn!("quarantining mailbox message {}: {}", message.id, err);
                        attempts.remove(&message.id);
                        drop(attempts);
                        self.events.publish(NodeEvent::MessageQuarantined {
                            id: message.id.clone(),
                            cafe_id: cafe_id.to_string(),
                        });
                        ingested.push(message.id);
                        high_water = high_water.max(message.date_ms);
                    } else {
                        debug!(
                            "ingestion of {} failed (attempt {}): {}",
                            message.id, count, err
                        );
                        left_behind = true;
                    }
                }
            }
        }
        if ingested.is_empty() {
            return Ok(());
        }
        self.client.delete_messages(cafe_id, &ingested).await?;
        // A message left on the server must stay visible to the next poll,
        // so the watermark only advances once the mailbox drained clean.
        if !left_behind {
            self.set_watermark(cafe_id, high_water).await?;
        }
        Ok(())
    }

    async fn watermark(&self, cafe_id: &str) -> u64 {
        let guard = self.store.lock().await;
        guard
            .get(&Self::key(cafe_id))
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or(0)
    }

    async fn set_watermark(&self, cafe_id: &str, value: u64) -> Result<(), CoreError> {
        let bytes = serde_json::to_vec(&value).map_err(|_| CoreError::Storage)?;
        let mut guard = self.store.lock().await;
        guard
            .put(&Self::key(cafe_id), &bytes)
            .map_err(|_| CoreError::Storage)
    }

    fn key(cafe_id: &str) -> String {
        format!("inbox:last:{}", cafe_id)
    }
}
