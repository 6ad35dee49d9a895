//! Per-sender backlog of early messages.

use ibft_types::{Address, Message, MessageCode, View};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use tracing::debug;

/// How a message's view relates to the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// Processable now.
    Current,
    /// Ahead of the current state; keep parked.
    Future,
    /// Behind the current state; drop.
    Old,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct BacklogKey {
    sequence: u64,
    round: u64,
    priority: u8,
    arrival: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BacklogEntry {
    key: BacklogKey,
    view: View,
    message: Message,
}

impl PartialOrd for BacklogEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BacklogEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

/// Future messages parked per sender, bounded, ordered by
/// `(sequence, round, phase)`.
///
/// Replayed in priority order once the state machine advances; messages
/// whose view has fallen behind are dropped during replay.
#[derive(Debug, Default)]
pub struct Backlogs {
    queues: HashMap<Address, BinaryHeap<Reverse<BacklogEntry>>>,
    capacity: usize,
    arrivals: u64,
}

impl Backlogs {
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: HashMap::new(),
            capacity,
            arrivals: 0,
        }
    }

    /// Park a future message from `sender`. On overflow the lowest-priority
    /// (highest-key) entry loses its slot, whether that is the newcomer or
    /// something already parked.
    pub fn store(&mut self, sender: Address, view: View, message: Message) {
        self.arrivals += 1;
        let entry = BacklogEntry {
            key: BacklogKey {
                sequence: view.sequence,
                round: view.round,
                priority: message.code.priority(),
                arrival: self.arrivals,
            },
            view,
            message,
        };

        let queue = self.queues.entry(sender).or_default();
        if queue.len() >= self.capacity {
            // The heap is a min-heap on keys, so the lowest-priority entry
            // is its maximum key.
            let worst = queue.iter().min().map(|Reverse(parked)| parked.key.clone());
            match worst {
                Some(worst) if entry.key < worst => {
                    debug!(%sender, "backlog full, evicting lowest-priority message");
                    queue.retain(|Reverse(parked)| parked.key != worst);
                }
                _ => {
                    debug!(
                        %sender,
                        view = %entry.view,
                        code = %entry.message.code,
                        "backlog full, dropping message"
                    );
                    return;
                }
            }
        }
        queue.push(Reverse(entry));
    }

    /// Pop every message that is no longer in the future, in priority
    /// order. Old messages are dropped with a debug entry; draining stops
    /// per sender at the first still-future message.
    pub fn drain_ready(
        &mut self,
        mut classify: impl FnMut(MessageCode, View) -> MessageClass,
    ) -> Vec<Message> {
        let mut ready = Vec::new();
        for (sender, queue) in &mut self.queues {
            while let Some(Reverse(head)) = queue.peek() {
                match classify(head.message.code, head.view) {
                    MessageClass::Future => break,
                    MessageClass::Old => {
                        debug!(%sender, view = %head.view, code = %head.message.code,
                            "dropping stale backlog message");
                        queue.pop();
                    }
                    MessageClass::Current => {
                        let Reverse(entry) = queue.pop().expect("peeked entry");
                        ready.push(entry.message);
                    }
                }
            }
        }
        self.queues.retain(|_, queue| !queue.is_empty());
        ready
    }

    pub fn len(&self) -> usize {
        self.queues.values().map(BinaryHeap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}
