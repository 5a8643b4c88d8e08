use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::trace;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Started,
    Exited,
    Stopped,
    StartFailed,
    RestartScheduled,
    RestartFailed,
    Lost,
    Reattached,
    ReattachFailed,
    HealthChanged,
}

/// Something that happened to a managed process, mostly from background tasks
/// that have no caller to report to.
#[derive(Debug, Clone)]
pub struct SupervisorEvent {
    pub key: String,
    pub kind: EventKind,
    pub pid: u32,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SupervisorEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        EventBus { tx }
    }
}

impl EventBus {
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, key: &str, kind: EventKind, pid: u32, message: impl Into<String>) {
        let event = SupervisorEvent {
            key: key.to_string(),
            kind,
            pid,
            message: message.into(),
            timestamp: Utc::now(),
        };
        // No subscribers is fine.
        if self.tx.send(event).is_err() {
            trace!("dropped {kind:?} event for {key}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_subscriber() {
        let bus = EventBus::default();
        bus.emit("default/x", EventKind::Started, 1, "nobody listens");

        let mut rx = bus.subscribe();
        bus.emit("default/x", EventKind::Exited, 42, "exit code 1");
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::Exited);
        assert_eq!(ev.pid, 42);
        assert_eq!(ev.key, "default/x");
    }
}
