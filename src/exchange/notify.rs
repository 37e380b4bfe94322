//! Insertion signal fan-out to running exchanges.

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::core::EventId;

/// Subscriber list for novel-insert notifications.
///
/// Lives behind the same mutex as the log, so subscription and publication
/// are atomic with log reads and writes. Senders are unbounded and never
/// block, which keeps publication legal under that mutex. Disconnected
/// subscribers are dropped on the next publish.
#[derive(Debug, Default)]
pub(crate) struct InsertNotifier {
    subscribers: Vec<Sender<EventId>>,
}

impl InsertNotifier {
    pub(crate) fn new() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }

    pub(crate) fn subscribe(&mut self) -> Receiver<EventId> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    pub(crate) fn publish(&mut self, id: EventId) {
        self.subscribers.retain(|tx| tx.send(id).is_ok());
    }
}
