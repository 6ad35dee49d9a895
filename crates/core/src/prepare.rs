//! Prepare phase: quorum on the accepted proposal.

use crate::core::{Core, State};
use crate::errors::CoreError;
use ibft_types::{Message, MessageCode, Subject};
use tracing::trace;

impl Core {
    pub(crate) fn send_prepare(&mut self) {
        let Some(subject) = self.current.subject() else {
            return;
        };
        let message = Message::new(
            MessageCode::Prepare,
            alloy_rlp::encode(subject).into(),
            self.backend.address(),
        );
        self.broadcast(message);
    }

    pub(crate) fn handle_prepare(&mut self, message: &Message) -> Result<(), CoreError> {
        let subject: Subject = message.payload()?;
        self.check_message(MessageCode::Prepare, subject.view)?;
        self.verify_subject(&subject)?;

        self.current.prepares.add(message.clone())?;
        trace!(
            sender = %message.address,
            prepares = self.current.prepares.len(),
            "accepted prepare"
        );

        // The quorum transition fires on the first message crossing the
        // threshold; stragglers keep accumulating above.
        if self.current.prepares.len() >= self.validators.quorum() && self.state < State::Prepared
        {
            self.current.lock_hash();
            self.set_state(State::Prepared);
            self.send_commit();
        }
        Ok(())
    }

    /// A prepare or commit must target exactly the current subject.
    pub(crate) fn verify_subject(&self, subject: &Subject) -> Result<(), CoreError> {
        match self.current.subject() {
            Some(current) if current == *subject => Ok(()),
            _ => Err(CoreError::InconsistentSubject),
        }
    }
}
