//! Event mux between the backend and the consensus task.
//!
//! Single producer side (the backend), any number of subscribers. Delivery
//! is FIFO per subscription; a dropped receiver unsubscribes itself on the
//! next post.

use ibft_types::{Block, Bytes};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Inputs consumed by the consensus task.
#[derive(Debug, Clone)]
pub enum ConsensusEvent {
    /// A local candidate block from the miner, entering as a request.
    Request { block: Block },
    /// An encoded consensus message, from a peer or looped back from our
    /// own broadcast.
    Message { payload: Bytes },
    /// The chain inserted a block; the current sequence is decided.
    FinalCommitted,
}

/// Fan-out mux for [`ConsensusEvent`]s.
#[derive(Debug, Default)]
pub struct EventMux {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ConsensusEvent>>>,
}

impl EventMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new subscription. Events posted after this call are delivered
    /// in order until the receiver is dropped.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConsensusEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().expect("event mux poisoned").push(tx);
        rx
    }

    /// Deliver an event to every live subscriber.
    pub fn post(&self, event: ConsensusEvent) {
        let mut subscribers = self.subscribers.lock().expect("event mux poisoned");
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscriptions (stale ones are pruned on post).
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("event mux poisoned").len()
    }
}
