//! Commit phase: seal quorum and finalization.

use crate::core::{Core, State};
use crate::errors::CoreError;
use ibft_types::{crypto, extra, BftError, Bytes, Message, MessageCode, Subject};
use tracing::{debug, info, trace, warn};

impl Core {
    pub(crate) fn send_commit(&mut self) {
        let Some(subject) = self.current.subject() else {
            return;
        };
        let message = Message::new(
            MessageCode::Commit,
            alloy_rlp::encode(subject).into(),
            self.backend.address(),
        );
        self.broadcast(message);
    }

    pub(crate) fn handle_commit(&mut self, message: &Message) -> Result<(), CoreError> {
        let subject: Subject = message.payload()?;
        self.check_message(MessageCode::Commit, subject.view)?;
        self.verify_subject(&subject)?;

        // The committed seal must be the sender's own signature over the
        // commit digest; anything else would poison the final certificate.
        let digest = extra::commit_digest(subject.digest);
        match crypto::recover_signer(digest, &message.committed_seal) {
            Ok(signer) if signer == message.address => {}
            _ => {
                debug!(sender = %message.address, "commit carries a bad committed seal");
                return Err(CoreError::Protocol(BftError::InvalidSignature));
            }
        }

        self.current.commits.add(message.clone())?;
        trace!(
            sender = %message.address,
            commits = self.current.commits.len(),
            "accepted commit"
        );

        if self.current.commits.len() >= self.validators.quorum() && self.state < State::Committed
        {
            self.current.lock_hash();
            self.commit();
        }
        Ok(())
    }

    /// Assemble the committed seals and hand the proposal to the backend.
    pub(crate) fn commit(&mut self) {
        self.set_state(State::Committed);

        let Some(proposal) = self.current.proposal().cloned() else {
            return;
        };
        // Deterministic certificate: the quorum of seals with the lowest
        // sender addresses (the accumulator iterates in address order).
        let seals: Vec<Bytes> = self
            .current
            .commits
            .values()
            .map(|m| m.committed_seal.clone())
            .take(self.validators.quorum())
            .collect();

        info!(hash = %proposal.hash(), seals = seals.len(), "committing proposal");
        if let Err(err) = self.backend.commit(proposal, seals) {
            warn!(%err, "backend failed to commit, changing round");
            self.current.unlock_hash();
            self.send_next_round_change();
        }
    }
}
