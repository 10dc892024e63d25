use crate::queue::RequestKind;
use tokio::sync::broadcast;

/// Operator-visible node events. Transient retry noise never lands here,
/// only outcomes someone has to act on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeEvent {
    RequestFailed {
        id: String,
        cafe_id: String,
        kind: RequestKind,
    },
    MessageQuarantined {
        id: String,
        cafe_id: String,
    },
    SessionRevoked {
        cafe_id: String,
    },
}

pub type EventReceiver = broadcast::Receiver<NodeEvent>;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<NodeEvent>,
}

impl EventBus {
    pub fn new(size: usize) -> Self {
        let (tx, _) = broadcast::channel(size);
        Self { tx }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: NodeEvent) {
        let _ = self.tx.send(event);
    }
}
