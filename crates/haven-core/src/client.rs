use crate::error::CoreError;
use crate::event::{EventBus, NodeEvent};
use crate::identity::{verifying_key_for, LocalIdentity};
use crate::policy::Policy;
use crate::session::{NonceRow, NonceStore, Session, SessionStore};
use crate::time::Clock;
use crate::transport::CafeTransport;
use haven_wire::{
    Challenge, CheckMessages, DeleteMessages, DeliverMessage, Deregistration, Envelope, MailMessage,
    Object, Payload, PublishPeer, RefreshSession, Registration, RequestIds, Store, StoreThread,
    Unstore, UnstoreThread, WireError,
};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Outcome of one STORE exchange: what the cafe acked and what it still
/// wants uploaded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreOutcome {
    pub acked: Vec<String>,
    pub missing: Vec<String>,
}

/// Stateless RPC facade over one transport. Reads sessions from the store;
/// the refresh path is the only writer besides registration.
pub struct CafeClient {
    transport: Arc<dyn CafeTransport>,
    identity: LocalIdentity,
    sessions: SessionStore,
    nonces: NonceStore,
    policy: Policy,
    clock: Arc<dyn Clock>,
    request_ids: RequestIds,
    refresh_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    events: EventBus,
    cancel: CancellationToken,
}

impl CafeClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn CafeTransport>,
        identity: LocalIdentity,
        sessions: SessionStore,
        nonces: NonceStore,
        policy: Policy,
        clock: Arc<dyn Clock>,
        events: EventBus,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            identity,
            sessions,
            nonces,
            policy,
            clock,
            request_ids: RequestIds::new(),
            refresh_locks: Mutex::new(HashMap::new()),
            events,
            cancel,
        }
    }

    pub fn address(&self) -> &str {
        self.identity.address()
    }

    pub async fn session(&self, cafe_id: &str) -> Result<Option<Session>, CoreError> {
        self.sessions.get(cafe_id).await
    }

    pub async fn sessions(&self) -> Result<Vec<Session>, CoreError> {
        self.sessions.list().await
    }

    /// One-time registration handshake: challenge, sign nonce||address,
    /// exchange the registration token for a session.
    pub async fn register(&self, cafe_id: &str, token: &str) -> Result<Session, CoreError> {
        let now = self.clock.now_ms();
        self.nonces
            .purge_expired(now, self.policy.nonce_ttl_ms)
            .await?;
        let address = self.identity.address().to_string();
        let response = self
            .rpc(
                cafe_id,
                Payload::Challenge(Challenge {
                    address: address.clone(),
                }),
                self.policy.rpc_timeout_ms,
            )
            .await?;
        let Payload::Nonce(nonce) = response else {
            return Err(CoreError::Malformed("expected nonce".to_string()));
        };
        self.nonces
            .add(&NonceRow {
                value: nonce.value.clone(),
                address: address.clone(),
                date_ms: now,
            })
            .await?;
        let mut signed = nonce.value.as_bytes().to_vec();
        signed.extend_from_slice(address.as_bytes());
        let sig = self.identity.sign(&signed);
        let response = self
            .rpc(
                cafe_id,
                Payload::Registration(Registration {
                    address,
                    value: nonce.value.clone(),
                    sig,
                    token: token.to_string(),
                }),
                self.policy.rpc_timeout_ms,
            )
            .await?;
        let Payload::Session(grant) = response else {
            return Err(CoreError::Malformed("expected session".to_string()));
        };
        self.nonces.consume(&nonce.value).await?;
        let session = Session {
            cafe_id: cafe_id.to_string(),
            access: grant.access,
            refresh: grant.refresh,
            expiry_ms: grant.expiry_ms,
        };
        self.sessions.put(&session).await?;
        Ok(session)
    }

    /// Tell the cafe goodbye, then delete the session either way. A cafe
    /// that is gone for good must not wedge local state.
    pub async fn deregister(&self, cafe_id: &str) -> Result<(), CoreError> {
        let Some(session) = self.sessions.get(cafe_id).await? else {
            return Err(CoreError::NotFound);
        };
        for attempt in 0..self.policy.deregister_attempts {
            match self
                .rpc(
                    cafe_id,
                    Payload::Deregistration(Deregistration {
                        access: session.access.clone(),
                    }),
                    self.policy.rpc_timeout_ms,
                )
                .await
            {
                Ok(Payload::DeregistrationAck(_)) => break,
                Ok(_) => break,
                Err(err) if err.is_retryable() => {
                    debug!(
                        "deregistration attempt {} against {} failed: {}",
                        attempt + 1,
                        cafe_id,
                        err
                    );
                }
                Err(_) => break,
            }
        }
        self.sessions.delete(cafe_id).await
    }

    /// Refresh the session if it is within the skew of expiry. Single
    /// flight per cafe; concurrent callers wait and reuse the result.
    pub async fn ensure_fresh(&self, cafe_id: &str) -> Result<Session, CoreError> {
        let lock = self.refresh_lock(cafe_id).await;
        let _guard = lock.lock().await;
        let session = self
            .sessions
            .get(cafe_id)
            .await?
            .ok_or(CoreError::Unauthorized)?;
        if !session.is_expired(self.clock.now_ms(), self.policy.token_skew_ms) {
            return Ok(session);
        }
        self.refresh_locked(cafe_id, session).await
    }

    /// Refresh after a 401, unless another caller already rotated the
    /// tokens out from under us.
    async fn force_refresh(&self, cafe_id: &str, stale_access: &str) -> Result<Session, CoreError> {
        let lock = self.refresh_lock(cafe_id).await;
        let _guard = lock.lock().await;
        let session = self
            .sessions
            .get(cafe_id)
            .await?
            .ok_or(CoreError::Unauthorized)?;
        if session.access != stale_access {
            return Ok(session);
        }
        self.refresh_locked(cafe_id, session).await
    }

    async fn refresh_locked(
        &self,
        cafe_id: &str,
        session: Session,
    ) -> Result<Session, CoreError> {
        let response = self
            .rpc(
                cafe_id,
                Payload::RefreshSession(RefreshSession {
                    access: session.access,
                    refresh: session.refresh,
                }),
                self.policy.rpc_timeout_ms,
            )
            .await;
        match response {
            Ok(Payload::Session(grant)) => {
                let refreshed = Session {
                    cafe_id: cafe_id.to_string(),
                    access: grant.access,
                    refresh: grant.refresh,
                    expiry_ms: grant.expiry_ms,
                };
                self.sessions.put(&refreshed).await?;
                Ok(refreshed)
            }
            Ok(_) => Err(CoreError::Malformed("expected session".to_string())),
            Err(err) if err.is_unauthorized() => {
                warn!("session for {} rejected on refresh, tearing down", cafe_id);
                self.sessions.delete(cafe_id).await?;
                self.events.publish(NodeEvent::SessionRevoked {
                    cafe_id: cafe_id.to_string(),
                });
                Err(CoreError::Unauthorized)
            }
            Err(err) => Err(err),
        }
    }

    /// Authenticated exchange: fresh token up front, then exactly one
    /// refresh-and-retry if the cafe still answers 401.
    async fn call(
        &self,
        cafe_id: &str,
        timeout_ms: u64,
        build: impl Fn(String) -> Payload,
    ) -> Result<Payload, CoreError> {
        let session = self.ensure_fresh(cafe_id).await?;
        let used_access = session.access.clone();
        match self.rpc(cafe_id, build(session.access), timeout_ms).await {
            Err(err) if err.is_unauthorized() => {
                let refreshed = self.force_refresh(cafe_id, &used_access).await?;
                match self.rpc(cafe_id, build(refreshed.access), timeout_ms).await {
                    Err(err) if err.is_unauthorized() => Err(CoreError::Unauthorized),
                    other => other,
                }
            }
            other => other,
        }
    }

    pub async fn upload_object(
        &self,
        cafe_id: &str,
        cid: &str,
        data: Vec<u8>,
    ) -> Result<(), CoreError> {
        self.call(cafe_id, self.policy.upload_timeout_ms, |token| {
            Payload::Object(Object {
                token,
                cid: cid.to_string(),
                data: data.clone(),
            })
        })
        .await
        .map(|_| ())
    }

    pub async fn store(&self, cafe_id: &str, cids: &[String]) -> Result<StoreOutcome, CoreError> {
        let response = self
            .call(cafe_id, self.policy.rpc_timeout_ms, |token| {
                Payload::Store(Store {
                    token,
                    cids: cids.to_vec(),
                })
            })
            .await?;
        match response {
            Payload::StoreAck(ack) => Ok(StoreOutcome {
                acked: ack.cids,
                missing: Vec::new(),
            }),
            Payload::ObjectList(list) => {
                let acked = cids
                    .iter()
                    .filter(|cid| !list.cids.contains(*cid))
                    .cloned()
                    .collect();
                Ok(StoreOutcome {
                    acked,
                    missing: list.cids,
                })
            }
            _ => Err(CoreError::Malformed("unexpected store response".to_string())),
        }
    }

    pub async fn unstore(&self, cafe_id: &str, cids: &[String]) -> Result<Vec<String>, CoreError> {
        let response = self
            .call(cafe_id, self.policy.rpc_timeout_ms, |token| {
                Payload::Unstore(Unstore {
                    token,
                    cids: cids.to_vec(),
                })
            })
            .await?;
        match response {
            Payload::UnstoreAck(ack) => Ok(ack.cids),
            _ => Err(CoreError::Malformed(
                "unexpected unstore response".to_string(),
            )),
        }
    }

    pub async fn store_thread(
        &self,
        cafe_id: &str,
        thread_id: &str,
        ciphertext: Vec<u8>,
    ) -> Result<(), CoreError> {
        let response = self
            .call(cafe_id, self.policy.rpc_timeout_ms, |token| {
                Payload::StoreThread(StoreThread {
                    token,
                    id: thread_id.to_string(),
                    ciphertext: ciphertext.clone(),
                })
            })
            .await?;
        match response {
            Payload::StoreThreadAck(_) => Ok(()),
            _ => Err(CoreError::Malformed(
                "unexpected store thread response".to_string(),
            )),
        }
    }

    pub async fn unstore_thread(&self, cafe_id: &str, thread_id: &str) -> Result<(), CoreError> {
        let response = self
            .call(cafe_id, self.policy.rpc_timeout_ms, |token| {
                Payload::UnstoreThread(UnstoreThread {
                    token,
                    id: thread_id.to_string(),
                })
            })
            .await?;
        match response {
            Payload::UnstoreThreadAck(_) => Ok(()),
            _ => Err(CoreError::Malformed(
                "unexpected unstore thread response".to_string(),
            )),
        }
    }

    pub async fn publish_peer(&self, cafe_id: &str, peer: Vec<u8>) -> Result<(), CoreError> {
        let response = self
            .call(cafe_id, self.policy.rpc_timeout_ms, |token| {
                Payload::PublishPeer(PublishPeer {
                    token,
                    peer: peer.clone(),
                })
            })
            .await?;
        match response {
            Payload::PublishPeerAck(_) => Ok(()),
            _ => Err(CoreError::Malformed(
                "unexpected publish response".to_string(),
            )),
        }
    }

    pub async fn check_messages(
        &self,
        cafe_id: &str,
        since_ms: u64,
    ) -> Result<Vec<MailMessage>, CoreError> {
        let response = self
            .call(cafe_id, self.policy.rpc_timeout_ms, |token| {
                Payload::CheckMessages(CheckMessages { token, since_ms })
            })
            .await?;
        match response {
            Payload::Messages(messages) => Ok(messages.messages),
            _ => Err(CoreError::Malformed(
                "unexpected messages response".to_string(),
            )),
        }
    }

    pub async fn delete_messages(
        &self,
        cafe_id: &str,
        ids: &[String],
    ) -> Result<bool, CoreError> {
        let response = self
            .call(cafe_id, self.policy.rpc_timeout_ms, |token| {
                Payload::DeleteMessages(DeleteMessages {
                    token,
                    ids: ids.to_vec(),
                })
            })
            .await?;
        match response {
            Payload::DeleteMessagesAck(ack) => Ok(ack.more),
            _ => Err(CoreError::Malformed(
                "unexpected delete response".to_string(),
            )),
        }
    }

    /// One-way drop into a contact's mailbox at their cafe. No response;
    /// idempotent server handling covers redelivery.
    pub async fn deliver_mail(
        &self,
        cafe_id: &str,
        delivery: DeliverMessage,
    ) -> Result<(), CoreError> {
        let envelope = Envelope::seal(
            &Payload::DeliverMessage(delivery),
            None,
            false,
            self.identity.signing_key(),
        )?;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(CoreError::Stopped),
            result = self.transport.deliver(cafe_id, envelope) => result,
        }
    }

    async fn rpc(
        &self,
        cafe_id: &str,
        payload: Payload,
        timeout_ms: u64,
    ) -> Result<Payload, CoreError> {
        let request_id = self.request_ids.next();
        let envelope = Envelope::seal(
            &payload,
            Some(request_id),
            false,
            self.identity.signing_key(),
        )?;
        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(CoreError::Stopped),
            result = tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                self.transport.request(cafe_id, envelope),
            ) => match result {
                Ok(inner) => inner?,
                Err(_) => return Err(CoreError::Transport("rpc deadline exceeded".to_string())),
            },
        };
        let cafe_key = verifying_key_for(cafe_id)?;
        let opened = match response.open(&cafe_key) {
            Ok(opened) => opened,
            Err(WireError::BadSignature) => {
                warn!("envelope from {} failed verification", cafe_id);
                return Err(CoreError::Unauthorized);
            }
            Err(err) => return Err(CoreError::Wire(err)),
        };
        if !response.is_response_to(request_id) {
            return Err(CoreError::Malformed("response id mismatch".to_string()));
        }
        if let Payload::Error(body) = opened {
            return Err(CoreError::Cafe {
                code: body.code,
                message: body.message,
            });
        }
        Ok(opened)
    }

    async fn refresh_lock(&self, cafe_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.refresh_locks.lock().await;
        locks
            .entry(cafe_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
