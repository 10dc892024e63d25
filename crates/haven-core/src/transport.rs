use crate::error::CoreError;
use crate::identity::verifying_key_for;
use crate::time::Clock;
use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use haven_wire::{
    DeleteMessagesAck, DeregistrationAck, Envelope, ErrorBody, MailKind, MailMessage, Messages,
    Nonce, ObjectList, Payload, PublishPeerAck, SessionGrant, StoreAck, StoreThreadAck,
    UnstoreAck, UnstoreThreadAck, CODE_UNAUTHORIZED,
};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

/// One authenticated exchange with a cafe, or a one-way delivery into a
/// peer's mailbox. Implementations own framing and connection management;
/// the core only sees envelopes.
#[async_trait]
pub trait CafeTransport: Send + Sync {
    async fn request(&self, cafe_id: &str, envelope: Envelope) -> Result<Envelope, CoreError>;
    async fn deliver(&self, cafe_id: &str, envelope: Envelope) -> Result<(), CoreError>;
    /// Unsolicited mail pushes; the payload is the cafe id that has mail.
    fn subscribe_mail(&self) -> broadcast::Receiver<String>;
}

const SESSION_TTL_MS: u64 = 3_600_000;

struct SessionRec {
    client: String,
    refresh: String,
    expiry_ms: u64,
}

#[derive(Default)]
struct CafeState {
    reg_token: String,
    nonces: HashMap<String, String>,
    sessions: HashMap<String, SessionRec>,
    objects: HashMap<String, Vec<u8>>,
    threads: HashMap<String, Vec<u8>>,
    peers: HashMap<String, Vec<u8>>,
    mailboxes: HashMap<String, Vec<MailMessage>>,
    fail_requests: u32,
    drop_uploads: u32,
    codes: Vec<u32>,
}

/// In-process cafe fleet speaking the full wire protocol. Backs the tests
/// and the daemon's local scaffolding; fault knobs cover the transient,
/// missing-object and expired-token paths.
#[derive(Clone)]
pub struct MemoryCafe {
    keys: Arc<Mutex<HashMap<String, SigningKey>>>,
    cafes: Arc<Mutex<HashMap<String, CafeState>>>,
    mail_tx: broadcast::Sender<String>,
    clock: Arc<dyn Clock>,
}

impl MemoryCafe {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (mail_tx, _) = broadcast::channel(64);
        Self {
            keys: Arc::new(Mutex::new(HashMap::new())),
            cafes: Arc::new(Mutex::new(HashMap::new())),
            mail_tx,
            clock,
        }
    }

    /// Spin up a cafe expecting `reg_token` at registration; returns its id.
    pub async fn add_cafe(&self, reg_token: &str) -> String {
        let mut secret = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        let key = SigningKey::from_bytes(&secret);
        let cafe_id = hex::encode(key.verifying_key().to_bytes());
        self.keys.lock().await.insert(cafe_id.clone(), key);
        let state = CafeState {
            reg_token: reg_token.to_string(),
            ..CafeState::default()
        };
        self.cafes.lock().await.insert(cafe_id.clone(), state);
        cafe_id
    }

    pub async fn seed_mail(
        &self,
        cafe_id: &str,
        client: &str,
        kind: MailKind,
        block: Vec<u8>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let message = MailMessage {
            id: id.clone(),
            date_ms: self.clock.now_ms(),
            kind,
            block,
        };
        let mut cafes = self.cafes.lock().await;
        if let Some(state) = cafes.get_mut(cafe_id) {
            state
                .mailboxes
                .entry(client.to_string())
                .or_default()
                .push(message);
        }
        id
    }

    pub fn notify_mail(&self, cafe_id: &str) {
        let _ = self.mail_tx.send(cafe_id.to_string());
    }

    /// Next `n` requests to this cafe fail at the transport layer.
    pub async fn set_fail_requests(&self, cafe_id: &str, n: u32) {
        if let Some(state) = self.cafes.lock().await.get_mut(cafe_id) {
            state.fail_requests = n;
        }
    }

    /// Next `n` object uploads are silently discarded, so the following
    /// STORE answers with the missing-object list.
    pub async fn set_drop_uploads(&self, cafe_id: &str, n: u32) {
        if let Some(state) = self.cafes.lock().await.get_mut(cafe_id) {
            state.drop_uploads = n;
        }
    }

    /// Age every session out so the next authenticated call sees a 401.
    pub async fn expire_sessions(&self, cafe_id: &str) {
        if let Some(state) = self.cafes.lock().await.get_mut(cafe_id) {
            for session in state.sessions.values_mut() {
                session.expiry_ms = 0;
            }
        }
    }

    /// Drop every session; refreshes fail too, clients must re-register.
    pub async fn revoke(&self, cafe_id: &str) {
        if let Some(state) = self.cafes.lock().await.get_mut(cafe_id) {
            state.sessions.clear();
        }
    }

    pub async fn stored_cids(&self, cafe_id: &str) -> Vec<String> {
        let cafes = self.cafes.lock().await;
        let mut cids: Vec<String> = cafes
            .get(cafe_id)
            .map(|s| s.objects.keys().cloned().collect())
            .unwrap_or_default();
        cids.sort();
        cids
    }

    pub async fn has_thread(&self, cafe_id: &str, thread_id: &str) -> bool {
        let cafes = self.cafes.lock().await;
        cafes
            .get(cafe_id)
            .map(|s| s.threads.contains_key(thread_id))
            .unwrap_or(false)
    }

    pub async fn published_peer(&self, cafe_id: &str, client: &str) -> Option<Vec<u8>> {
        let cafes = self.cafes.lock().await;
        cafes.get(cafe_id).and_then(|s| s.peers.get(client).cloned())
    }

    pub async fn mailbox_len(&self, cafe_id: &str, client: &str) -> usize {
        let cafes = self.cafes.lock().await;
        cafes
            .get(cafe_id)
            .and_then(|s| s.mailboxes.get(client))
            .map(|m| m.len())
            .unwrap_or(0)
    }

    pub async fn session_count(&self, cafe_id: &str) -> usize {
        let cafes = self.cafes.lock().await;
        cafes.get(cafe_id).map(|s| s.sessions.len()).unwrap_or(0)
    }

    /// Message type codes this cafe has served, in arrival order.
    pub async fn codes(&self, cafe_id: &str) -> Vec<u32> {
        let cafes = self.cafes.lock().await;
        cafes.get(cafe_id).map(|s| s.codes.clone()).unwrap_or_default()
    }

    async fn respond(
        &self,
        cafe_id: &str,
        payload: Payload,
        request_id: Option<i32>,
    ) -> Result<Envelope, CoreError> {
        let keys = self.keys.lock().await;
        let key = keys.get(cafe_id).ok_or(CoreError::NotFound)?;
        Envelope::seal(&payload, request_id, true, key).map_err(CoreError::from)
    }

    fn authed_client(state: &CafeState, token: &str, now: u64) -> Result<String, ErrorBody> {
        match state.sessions.get(token) {
            Some(session) if session.expiry_ms > now => Ok(session.client.clone()),
            _ => Err(ErrorBody {
                code: CODE_UNAUTHORIZED,
                message: "access token invalid or expired".to_string(),
            }),
        }
    }

    fn grant(state: &mut CafeState, client: &str, now: u64) -> SessionGrant {
        let access = Uuid::new_v4().to_string();
        let refresh = Uuid::new_v4().to_string();
        let expiry_ms = now + SESSION_TTL_MS;
        state.sessions.insert(
            access.clone(),
            SessionRec {
                client: client.to_string(),
                refresh: refresh.clone(),
                expiry_ms,
            },
        );
        SessionGrant {
            access,
            refresh,
            expiry_ms,
        }
    }

    fn handle(state: &mut CafeState, payload: Payload, now: u64) -> Payload {
        match payload {
            Payload::Challenge(body) => {
                let value = Uuid::new_v4().to_string();
                state.nonces.insert(value.clone(), body.address);
                Payload::Nonce(Nonce { value })
            }
            Payload::Registration(body) => {
                if body.validate().is_err() {
                    return error(400, "bad registration");
                }
                let Some(issued_for) = state.nonces.remove(&body.value) else {
                    return error(403, "unknown nonce");
                };
                if issued_for != body.address {
                    return error(403, "nonce address mismatch");
                }
                let Ok(key) = verifying_key_for(&body.address) else {
                    return error(400, "bad address");
                };
                let mut signed = body.value.as_bytes().to_vec();
                signed.extend_from_slice(body.address.as_bytes());
                let Ok(sig) = ed25519_dalek::Signature::from_slice(&body.sig) else {
                    return error(403, "bad challenge signature");
                };
                if ed25519_dalek::Verifier::verify(&key, &signed, &sig).is_err() {
                    return error(403, "bad challenge signature");
                }
                if body.token != state.reg_token {
                    return error(403, "registration token rejected");
                }
                Payload::Session(Self::grant(state, &body.address, now))
            }
            Payload::RefreshSession(body) => {
                let matches = state
                    .sessions
                    .get(&body.access)
                    .map(|s| s.refresh == body.refresh)
                    .unwrap_or(false);
                if !matches {
                    return error(CODE_UNAUTHORIZED, "refresh rejected");
                }
                let client = state
                    .sessions
                    .remove(&body.access)
                    .map(|s| s.client)
                    .unwrap_or_default();
                Payload::Session(Self::grant(state, &client, now))
            }
            Payload::Store(body) => {
                match Self::authed_client(state, &body.token, now) {
                    Ok(_) => {}
                    Err(err) => return Payload::Error(err),
                }
                let missing: Vec<String> = body
                    .cids
                    .iter()
                    .filter(|cid| !state.objects.contains_key(*cid))
                    .cloned()
                    .collect();
                if missing.is_empty() {
                    Payload::StoreAck(StoreAck { cids: body.cids })
                } else {
                    Payload::ObjectList(ObjectList { cids: missing })
                }
            }
            Payload::Object(body) => {
                match Self::authed_client(state, &body.token, now) {
                    Ok(_) => {}
                    Err(err) => return Payload::Error(err),
                }
                if state.drop_uploads > 0 {
                    state.drop_uploads -= 1;
                } else {
                    state.objects.insert(body.cid.clone(), body.data);
                }
                Payload::StoreAck(StoreAck {
                    cids: vec![body.cid],
                })
            }
            Payload::Unstore(body) => {
                match Self::authed_client(state, &body.token, now) {
                    Ok(_) => {}
                    Err(err) => return Payload::Error(err),
                }
                for cid in &body.cids {
                    state.objects.remove(cid);
                }
                Payload::UnstoreAck(UnstoreAck { cids: body.cids })
            }
            Payload::StoreThread(body) => {
                match Self::authed_client(state, &body.token, now) {
                    Ok(_) => {}
                    Err(err) => return Payload::Error(err),
                }
                if body.validate().is_err() {
                    return error(400, "bad thread");
                }
                state.threads.insert(body.id.clone(), body.ciphertext);
                Payload::StoreThreadAck(StoreThreadAck { id: body.id })
            }
            Payload::UnstoreThread(body) => {
                match Self::authed_client(state, &body.token, now) {
                    Ok(_) => {}
                    Err(err) => return Payload::Error(err),
                }
                state.threads.remove(&body.id);
                Payload::UnstoreThreadAck(UnstoreThreadAck { id: body.id })
            }
            Payload::PublishPeer(body) => {
                let client = match Self::authed_client(state, &body.token, now) {
                    Ok(client) => client,
                    Err(err) => return Payload::Error(err),
                };
                state.peers.insert(client, body.peer);
                Payload::PublishPeerAck(PublishPeerAck {})
            }
            Payload::CheckMessages(body) => {
                let client = match Self::authed_client(state, &body.token, now) {
                    Ok(client) => client,
                    Err(err) => return Payload::Error(err),
                };
                let messages = state
                    .mailboxes
                    .get(&client)
                    .map(|mailbox| {
                        // Inclusive bound: acked messages are deleted, so a
                        // same-instant arrival must not be skipped.
                        mailbox
                            .iter()
                            .filter(|m| m.date_ms >= body.since_ms)
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                Payload::Messages(Messages { messages })
            }
            Payload::DeleteMessages(body) => {
                let client = match Self::authed_client(state, &body.token, now) {
                    Ok(client) => client,
                    Err(err) => return Payload::Error(err),
                };
                let more = if let Some(mailbox) = state.mailboxes.get_mut(&client) {
                    mailbox.retain(|m| !body.ids.contains(&m.id));
                    !mailbox.is_empty()
                } else {
                    false
                };
                Payload::DeleteMessagesAck(DeleteMessagesAck { more })
            }
            Payload::Deregistration(body) => {
                state.sessions.remove(&body.access);
                Payload::DeregistrationAck(DeregistrationAck {})
            }
            _ => error(400, "unexpected message"),
        }
    }
}

fn error(code: u32, message: &str) -> Payload {
    Payload::Error(ErrorBody {
        code,
        message: message.to_string(),
    })
}

#[async_trait]
impl CafeTransport for MemoryCafe {
    async fn request(&self, cafe_id: &str, envelope: Envelope) -> Result<Envelope, CoreError> {
        let now = self.clock.now_ms();
        let request_id = envelope.message.request_id;
        let response = {
            let mut cafes = self.cafes.lock().await;
            let state = cafes
                .get_mut(cafe_id)
                .ok_or_else(|| CoreError::Transport("no route to cafe".to_string()))?;
            if state.fail_requests > 0 {
                state.fail_requests -= 1;
                return Err(CoreError::Transport("connection refused".to_string()));
            }
            state.codes.push(envelope.message.type_code);
            let message_type = envelope
                .message
                .message_type()
                .map_err(CoreError::from)?;
            let payload =
                haven_wire::Payload::decode(message_type, &envelope.message.payload)
                    .map_err(CoreError::from)?;
            // The declared sender: the challenge address before a session
            // exists, the session owner afterwards.
            let sender = match &payload {
                Payload::Challenge(body) => Some(body.address.clone()),
                Payload::Registration(body) => Some(body.address.clone()),
                Payload::Store(body) => Self::authed_client(state, &body.token, now).ok(),
                Payload::Object(body) => Self::authed_client(state, &body.token, now).ok(),
                Payload::Unstore(body) => Self::authed_client(state, &body.token, now).ok(),
                Payload::StoreThread(body) => Self::authed_client(state, &body.token, now).ok(),
                Payload::UnstoreThread(body) => {
                    Self::authed_client(state, &body.token, now).ok()
                }
                Payload::PublishPeer(body) => Self::authed_client(state, &body.token, now).ok(),
                Payload::CheckMessages(body) => {
                    Self::authed_client(state, &body.token, now).ok()
                }
                Payload::DeleteMessages(body) => {
                    Self::authed_client(state, &body.token, now).ok()
                }
                _ => None,
            };
            if let Some(sender) = sender {
                let key = verifying_key_for(&sender)?;
                if envelope.open(&key).is_err() {
                    error(403, "bad envelope signature")
                } else {
                    Self::handle(state, payload, now)
                }
            } else {
                Self::handle(state, payload, now)
            }
        };
        self.respond(cafe_id, response, request_id).await
    }

    async fn deliver(&self, cafe_id: &str, envelope: Envelope) -> Result<(), CoreError> {
        let now = self.clock.now_ms();
        let mut cafes = self.cafes.lock().await;
        let state = cafes
            .get_mut(cafe_id)
            .ok_or_else(|| CoreError::Transport("no route to cafe".to_string()))?;
        if state.fail_requests > 0 {
            state.fail_requests -= 1;
            return Err(CoreError::Transport("connection refused".to_string()));
        }
        state.codes.push(envelope.message.type_code);
        let message_type = envelope.message.message_type().map_err(CoreError::from)?;
        let payload = haven_wire::Payload::decode(message_type, &envelope.message.payload)
            .map_err(CoreError::from)?;
        let Payload::DeliverMessage(body) = payload else {
            return Err(CoreError::Malformed("expected mail delivery".to_string()));
        };
        body.validate().map_err(CoreError::from)?;
        state
            .mailboxes
            .entry(body.client.clone())
            .or_default()
            .push(MailMessage {
                id: body.id,
                date_ms: now,
                kind: body.kind,
                block: body.block,
            });
        drop(cafes);
        let _ = self.mail_tx.send(cafe_id.to_string());
        Ok(())
    }

    fn subscribe_mail(&self) -> broadcast::Receiver<String> {
        self.mail_tx.subscribe()
    }
}
