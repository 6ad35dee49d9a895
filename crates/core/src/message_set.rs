//! Per-view message accumulation.

use crate::errors::CoreError;
use ibft_types::{Address, BftError, Message, ValidatorSet, View};
use std::collections::BTreeMap;
use std::fmt;

/// Messages of one kind collected for a fixed `(view, validator set)`.
///
/// Keyed by sender: a duplicate sender replaces its prior message, so the
/// size is always the number of distinct senders. Only validator senders are
/// admitted. Iteration is in ascending address order, which is what makes
/// the committed-seal encoding deterministic.
#[derive(Debug, Clone)]
pub struct MessageSet {
    view: View,
    validators: ValidatorSet,
    messages: BTreeMap<Address, Message>,
}

impl MessageSet {
    pub fn new(view: View, validators: ValidatorSet) -> Self {
        Self {
            view,
            validators,
            messages: BTreeMap::new(),
        }
    }

    pub fn view(&self) -> View {
        self.view
    }

    /// Admit a message. Fails with `Unauthorized` for non-validator senders.
    pub fn add(&mut self, message: Message) -> Result<(), CoreError> {
        if !self.validators.contains(message.address) {
            return Err(CoreError::Protocol(BftError::Unauthorized));
        }
        self.messages.insert(message.address, message);
        Ok(())
    }

    /// Number of distinct senders.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, address: Address) -> Option<&Message> {
        self.messages.get(&address)
    }

    /// Messages in ascending sender order.
    pub fn values(&self) -> impl Iterator<Item = &Message> {
        self.messages.values()
    }
}

impl fmt::Display for MessageSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} messages at {}", self.messages.len(), self.view)
    }
}
